use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::Backoff;
use crate::scheduler::Schedule;

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Millisecond timestamp plus a random 128-bit suffix, so ids created in
    /// the same millisecond never collide.
    pub fn new() -> Self {
        Self(format!(
            "job_{}_{}",
            Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4().simple()
        ))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The five mutually exclusive states a job occupies within its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durations travel as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Per-job scheduling options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Higher runs sooner
    #[serde(default)]
    pub priority: i32,

    #[serde(default, with = "duration_ms")]
    pub delay: Duration,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_timeout", with = "duration_ms")]
    pub timeout: Duration,

    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: Duration::ZERO,
            max_attempts: default_max_attempts(),
            timeout: default_timeout(),
            backoff: Backoff::default(),
        }
    }
}

impl JobOptions {
    /// Largest accepted priority magnitude; the waiting score stays exact in
    /// an f64 up to this bound.
    pub const MAX_PRIORITY: i32 = 1 << 20;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// A job always gets at least one attempt.
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if !(-Self::MAX_PRIORITY..=Self::MAX_PRIORITY).contains(&self.priority) {
            return Err(Error::InvalidPriority(self.priority));
        }
        Ok(())
    }
}

/// A background job and its execution metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn new<Q, T>(queue: Q, job_type: T, payload: serde_json::Value) -> Self
    where
        Q: Into<String>,
        T: Into<String>,
    {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            options: JobOptions::default(),
            attempts: 0,
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// True once another failed attempt would exceed `max_attempts`
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.options.effective_max_attempts()
    }
}

/// A template that periodically materializes new jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringJob {
    pub queue: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
    pub schedule: Schedule,
    pub next_run_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringJob {
    /// Hash field the definition is stored under; one definition per
    /// (queue, type) pair.
    pub fn key(queue: &str, job_type: &str) -> String {
        format!("{}:{}", queue, job_type)
    }

    pub fn storage_key(&self) -> String {
        Self::key(&self.queue, &self.job_type)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffKind;
    use serde_json::json;

    #[test]
    fn job_ids_are_unique_and_prefixed() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert!(a.as_ref().starts_with("job_"));
    }

    #[test]
    fn options_default_to_documented_values() {
        let opts = JobOptions::default();
        assert_eq!(opts.priority, 0);
        assert_eq!(opts.delay, Duration::ZERO);
        assert_eq!(opts.max_attempts, 3);
        assert_eq!(opts.timeout, Duration::from_secs(30));
        assert_eq!(opts.backoff.kind, BackoffKind::Exponential);
    }

    #[test]
    fn missing_option_fields_fall_back_to_defaults() {
        let opts: JobOptions = serde_json::from_value(json!({ "priority": 5 })).unwrap();
        assert_eq!(opts.priority, 5);
        assert_eq!(opts.max_attempts, 3);
        assert_eq!(opts.timeout, Duration::from_secs(30));
    }

    #[test]
    fn priority_outside_the_score_range_is_rejected() {
        assert!(JobOptions::new().priority(JobOptions::MAX_PRIORITY).validate().is_ok());
        assert!(JobOptions::new().priority(-JobOptions::MAX_PRIORITY).validate().is_ok());
        assert!(matches!(
            JobOptions::new().priority(2_000_000).validate(),
            Err(Error::InvalidPriority(2_000_000))
        ));
        assert!(JobOptions::new().priority(i32::MIN).validate().is_err());
    }

    #[test]
    fn job_serializes_type_and_millisecond_durations() {
        let job = Job::new("q", "email:send", json!({ "to": "a@x.com" }))
            .with_options(JobOptions::new().timeout(Duration::from_millis(1500)));
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["type"], "email:send");
        assert_eq!(value["options"]["timeout"], 1500);
        assert!(value.get("completedAt").is_none());

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn zero_max_attempts_still_allows_one_attempt() {
        let mut job = Job::new("q", "t", json!(null))
            .with_options(JobOptions::new().max_attempts(0));
        assert!(!job.attempts_exhausted());
        job.attempts = 1;
        assert!(job.attempts_exhausted());
    }
}
