use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::job::{duration_ms, JobOptions, RecurringJob};
use crate::queue::RECURRING_KEY;

/// Longest accepted interval
const MAX_INTERVAL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// When a recurring definition fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    /// Fixed interval, anchored at the previous run
    Every(#[serde(with = "duration_ms")] Duration),
    /// Cron expression with a leading seconds field
    Cron(String),
}

impl Schedule {
    pub fn every(interval: Duration) -> Self {
        Schedule::Every(interval)
    }

    pub fn cron<S: Into<String>>(expr: S) -> Result<Self> {
        let schedule = Schedule::Cron(expr.into());
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Every(interval) if interval.is_zero() => {
                Err(Error::InvalidSchedule("interval must be non-zero".to_string()))
            }
            Schedule::Every(interval) if *interval > MAX_INTERVAL => Err(Error::InvalidSchedule(
                format!("interval of {}ms exceeds 100 years", interval.as_millis()),
            )),
            Schedule::Every(_) => Ok(()),
            Schedule::Cron(expr) => parse_cron(expr).map(|_| ()),
        }
    }

    /// First run time strictly after `now`; an error if there is none.
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.upcoming(now)?
            .ok_or_else(|| Error::InvalidSchedule(format!("no upcoming run for '{}'", self)))
    }

    /// Next boundary after `now`, counting from the run that just fired.
    /// Boundaries missed while nothing was running are skipped, not replayed.
    /// `None` once a bounded cron expression has no runs left.
    pub fn advance(
        &self,
        previous: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        match self {
            Schedule::Every(interval) => {
                self.validate()?;
                if previous > now {
                    return Ok(Some(previous));
                }
                let step_ms = to_chrono(*interval)?.num_milliseconds().max(1);
                let behind_ms = (now - previous).num_milliseconds();
                let offset = (behind_ms / step_ms + 1)
                    .checked_mul(step_ms)
                    .and_then(chrono::Duration::try_milliseconds)
                    .ok_or_else(|| out_of_range(previous))?;
                shift(previous, offset).map(Some)
            }
            Schedule::Cron(_) => self.upcoming(now),
        }
    }

    fn upcoming(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            Schedule::Every(interval) => {
                self.validate()?;
                shift(now, to_chrono(*interval)?).map(Some)
            }
            Schedule::Cron(expr) => Ok(parse_cron(expr)?.after(&now).next()),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Every(interval) => write!(f, "every {}ms", interval.as_millis()),
            Schedule::Cron(expr) => f.write_str(expr),
        }
    }
}

impl FromStr for Schedule {
    type Err = Error;

    /// Accepts `every 30s` / `@every 5m` style intervals, otherwise a cron
    /// expression.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let interval = trimmed
            .strip_prefix("@every")
            .or_else(|| trimmed.strip_prefix("every"));
        match interval {
            Some(rest) => {
                let schedule = Schedule::Every(parse_interval(rest.trim())?);
                schedule.validate()?;
                Ok(schedule)
            }
            None => Schedule::cron(trimmed),
        }
    }
}

fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| Error::InvalidSchedule(e.to_string()))
}

fn shift(at: DateTime<Utc>, by: chrono::Duration) -> Result<DateTime<Utc>> {
    at.checked_add_signed(by).ok_or_else(|| out_of_range(at))
}

fn out_of_range(at: DateTime<Utc>) -> Error {
    Error::InvalidSchedule(format!("next run after {} is out of range", at))
}

/// Classic five-field expressions get a zero seconds field prepended.
fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let expr = expr.trim();
    let normalized = if !expr.starts_with('@') && expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::InvalidSchedule(format!("invalid cron expression '{}': {}", expr, e)))
}

fn parse_interval(s: &str) -> Result<Duration> {
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::InvalidSchedule(format!("missing unit in '{}'", s)))?;
    let (amount, unit) = s.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|_| Error::InvalidSchedule(format!("invalid interval '{}'", s)))?;
    let millis = match unit.trim() {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => {
            return Err(Error::InvalidSchedule(format!(
                "unknown interval unit '{}'",
                other
            )))
        }
    };
    amount
        .checked_mul(millis)
        .map(Duration::from_millis)
        .ok_or_else(|| Error::InvalidSchedule(format!("interval '{}' is too large", s)))
}

/// Materializes jobs from recurring definitions whose run time has come
pub(crate) struct RecurringScheduler {
    dispatcher: Arc<Dispatcher>,
}

impl RecurringScheduler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Creates or replaces the definition for (queue, job_type).
    pub async fn upsert(
        &self,
        queue: &str,
        job_type: &str,
        schedule: Schedule,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<RecurringJob> {
        options.validate()?;
        let now = Utc::now();
        let next_run_at = schedule.next_after(now)?;
        let recurring = RecurringJob {
            queue: queue.to_string(),
            job_type: job_type.to_string(),
            payload,
            options,
            schedule,
            next_run_at,
            updated_at: now,
        };
        self.save(&recurring).await?;
        self.dispatcher.declare_queue(queue);

        info!(
            queue,
            job_type,
            schedule = %recurring.schedule,
            next_run_at = %recurring.next_run_at,
            "Recurring job scheduled"
        );
        Ok(recurring)
    }

    pub async fn remove(&self, queue: &str, job_type: &str) -> Result<bool> {
        let removed = self
            .dispatcher
            .store()
            .hash_delete(RECURRING_KEY, &RecurringJob::key(queue, job_type))
            .await?;
        if removed {
            info!(queue, job_type, "Recurring job removed");
        }
        Ok(removed)
    }

    /// All stored definitions; undecodable ones are skipped.
    pub async fn list(&self) -> Result<Vec<RecurringJob>> {
        let all = self.dispatcher.store().hash_get_all(RECURRING_KEY).await?;
        let mut defs: Vec<RecurringJob> = all
            .into_iter()
            .filter_map(|(key, raw)| match serde_json::from_str(&raw) {
                Ok(def) => Some(def),
                Err(e) => {
                    error!(key = %key, error = %e, "Undecodable recurring job");
                    None
                }
            })
            .collect();
        defs.sort_by(|a, b| a.storage_key().cmp(&b.storage_key()));
        Ok(defs)
    }

    /// One pass; failures are logged per definition.
    pub async fn tick(&self) {
        if let Err(e) = self.process_due(Utc::now()).await {
            error!(error = %e, "Failed to process recurring jobs");
        }
    }

    /// Materializes every definition due at `now`; returns how many fired.
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired = 0;
        for mut recurring in self.list().await? {
            if !recurring.is_due(now) {
                continue;
            }
            match self.fire(&mut recurring, now).await {
                Ok(()) => fired += 1,
                Err(e) => error!(
                    key = %recurring.storage_key(),
                    error = %e,
                    "Failed to process recurring job"
                ),
            }
        }
        Ok(fired)
    }

    /// Enqueues one job and moves the definition to its next run. A
    /// definition with no run left is deleted after its final job.
    async fn fire(&self, recurring: &mut RecurringJob, now: DateTime<Utc>) -> Result<()> {
        let next_run_at = recurring.schedule.advance(recurring.next_run_at, now)?;

        let job_id = self
            .dispatcher
            .add_job(
                &recurring.queue,
                &recurring.job_type,
                recurring.payload.clone(),
                recurring.options.clone(),
            )
            .await?;

        match next_run_at {
            Some(next_run_at) => {
                recurring.next_run_at = next_run_at;
                recurring.updated_at = now;
                self.save(recurring).await?;
                debug!(
                    job_id = %job_id,
                    key = %recurring.storage_key(),
                    next_run_at = %recurring.next_run_at,
                    "Recurring job materialized"
                );
            }
            None => {
                self.dispatcher
                    .store()
                    .hash_delete(RECURRING_KEY, &recurring.storage_key())
                    .await?;
                info!(
                    job_id = %job_id,
                    key = %recurring.storage_key(),
                    "Recurring job finished its last run"
                );
            }
        }
        Ok(())
    }

    async fn save(&self, recurring: &RecurringJob) -> Result<()> {
        let raw = serde_json::to_string(recurring)?;
        self.dispatcher
            .store()
            .hash_set(RECURRING_KEY, &recurring.storage_key(), &raw)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn parses_intervals_and_cron() {
        assert_eq!(
            "every 30s".parse::<Schedule>().unwrap(),
            Schedule::Every(Duration::from_secs(30))
        );
        assert_eq!(
            "@every 2h".parse::<Schedule>().unwrap(),
            Schedule::Every(Duration::from_secs(7200))
        );
        assert!(matches!(
            "0 0 * * * *".parse::<Schedule>().unwrap(),
            Schedule::Cron(_)
        ));
        assert!("every 0s".parse::<Schedule>().is_err());
        assert!("every 5 fortnights".parse::<Schedule>().is_err());
        assert!("not a cron".parse::<Schedule>().is_err());
    }

    #[test]
    fn five_field_cron_is_accepted() {
        let schedule = Schedule::cron("30 * * * *").unwrap();
        assert_eq!(schedule.next_after(at(10, 0, 0)).unwrap(), at(10, 30, 0));
    }

    #[test]
    fn hourly_cron_fires_on_the_boundary() {
        let schedule = Schedule::cron("0 0 * * * *").unwrap();
        assert_eq!(schedule.next_after(at(10, 17, 3)).unwrap(), at(11, 0, 0));
        assert_eq!(schedule.advance(at(11, 0, 0), at(11, 4, 0)).unwrap(), Some(at(12, 0, 0)));
    }

    #[test]
    fn interval_advance_stays_on_its_grid() {
        let schedule = Schedule::every(Duration::from_secs(3600));
        // late pass, same boundary
        assert_eq!(schedule.advance(at(10, 0, 0), at(10, 5, 0)).unwrap(), Some(at(11, 0, 0)));
        // several boundaries missed: skip to the next one, no replay
        assert_eq!(schedule.advance(at(10, 0, 0), at(13, 30, 0)).unwrap(), Some(at(14, 0, 0)));
        // exactly on a boundary moves past it
        assert_eq!(schedule.advance(at(10, 0, 0), at(11, 0, 0)).unwrap(), Some(at(12, 0, 0)));
    }

    #[test]
    fn oversized_intervals_are_rejected() {
        assert!("every 100000000d".parse::<Schedule>().is_err());
        assert!("every 18446744073709551615d".parse::<Schedule>().is_err());
        assert!(Schedule::every(Duration::from_secs(u64::MAX / 2)).validate().is_err());
        assert!(Schedule::every(MAX_INTERVAL).validate().is_ok());
    }

    #[test]
    fn runs_past_the_last_representable_instant_are_errors() {
        let end = DateTime::<Utc>::MAX_UTC;
        let hourly = Schedule::every(Duration::from_secs(3600));
        assert!(hourly.next_after(end).is_err());
        assert!(hourly.advance(end - chrono::Duration::minutes(30), end).is_err());
    }

    #[test]
    fn bounded_cron_runs_out() {
        let schedule = Schedule::cron("0 0 0 1 1 * 2020-2021").unwrap();
        let last = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(schedule.advance(at(0, 0, 0), at(0, 0, 0)).unwrap(), None);
        assert_eq!(schedule.advance(last, last).unwrap(), None);
        assert!(schedule.next_after(last).is_err());
    }

    #[test]
    fn schedule_serializes_compactly() {
        let value = serde_json::to_value(Schedule::every(Duration::from_secs(1))).unwrap();
        assert_eq!(value, json!({ "every": 1000 }));
    }

    #[tokio::test]
    async fn one_job_per_boundary() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(MemoryStore::new()), ["q"]));
        let scheduler = RecurringScheduler::new(Arc::clone(&dispatcher));
        let def = scheduler
            .upsert("q", "cleanup", Schedule::every(Duration::from_secs(3600)), json!({}), JobOptions::default())
            .await
            .unwrap();
        let first = def.next_run_at;

        // not yet due
        assert_eq!(scheduler.process_due(first - chrono::Duration::seconds(1)).await.unwrap(), 0);
        // due: fires once, even if the pass runs twice within the same hour
        assert_eq!(scheduler.process_due(first + chrono::Duration::minutes(5)).await.unwrap(), 1);
        assert_eq!(scheduler.process_due(first + chrono::Duration::minutes(10)).await.unwrap(), 0);
        // next boundary
        assert_eq!(scheduler.process_due(first + chrono::Duration::minutes(65)).await.unwrap(), 1);

        assert_eq!(dispatcher.queue_stats("q").await.waiting, 2);
        let stored = scheduler.list().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].next_run_at, first + chrono::Duration::hours(2));
    }

    #[tokio::test]
    async fn huge_interval_is_rejected_without_storing() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(MemoryStore::new()), ["q"]));
        let scheduler = RecurringScheduler::new(dispatcher);
        let huge = Schedule::Every(Duration::from_millis(100_000_000 * 86_400_000));

        let err = scheduler
            .upsert("q", "t", huge, json!({}), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule(_)));
        assert!(scheduler.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_cron_fires_once_then_is_removed() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(MemoryStore::new()), ["q"]));
        let scheduler = RecurringScheduler::new(Arc::clone(&dispatcher));
        let last = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        scheduler
            .save(&RecurringJob {
                queue: "q".to_string(),
                job_type: "new-year".to_string(),
                payload: json!({}),
                options: JobOptions::default(),
                schedule: Schedule::cron("0 0 0 1 1 * 2020-2021").unwrap(),
                next_run_at: last,
                updated_at: last,
            })
            .await
            .unwrap();

        let later = Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap();
        let mut fired = Vec::new();
        for _ in 0..5 {
            fired.push(scheduler.process_due(later).await.unwrap());
        }

        assert_eq!(fired, vec![1, 0, 0, 0, 0]);
        assert_eq!(dispatcher.queue_stats("q").await.waiting, 1);
        assert!(scheduler.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_queue_and_type() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(MemoryStore::new()), ["q"]));
        let scheduler = RecurringScheduler::new(dispatcher);
        let every = Schedule::every(Duration::from_secs(60));

        scheduler.upsert("q", "a", every.clone(), json!(1), JobOptions::default()).await.unwrap();
        scheduler.upsert("q", "a", every.clone(), json!(2), JobOptions::default()).await.unwrap();
        scheduler.upsert("q", "b", every, json!(3), JobOptions::default()).await.unwrap();

        let defs = scheduler.list().await.unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].payload, json!(2));

        assert!(scheduler.remove("q", "a").await.unwrap());
        assert!(!scheduler.remove("q", "a").await.unwrap());
        assert_eq!(scheduler.list().await.unwrap().len(), 1);
    }
}
