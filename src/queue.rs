use serde::{Deserialize, Serialize};

use crate::job::JobState;

/// Hash holding every recurring definition, keyed `{queue}:{type}`
pub(crate) const RECURRING_KEY: &str = "recurring:jobs";

/// Store key names for one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    name: String,
    jobs: String,
    waiting: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
    meta: String,
}

impl QueueKeys {
    pub fn new(name: &str) -> Self {
        let key = |suffix: &str| format!("queue:{}:{}", name, suffix);
        Self {
            name: name.to_string(),
            jobs: key("jobs"),
            waiting: key("waiting"),
            delayed: key("delayed"),
            active: key("active"),
            completed: key("completed"),
            failed: key("failed"),
            meta: key("meta"),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hash of serialized job bodies
    pub fn jobs(&self) -> &str {
        &self.jobs
    }

    /// Hash of per-queue counters
    pub fn meta(&self) -> &str {
        &self.meta
    }

    pub fn set(&self, state: JobState) -> &str {
        match state {
            JobState::Waiting => &self.waiting,
            JobState::Delayed => &self.delayed,
            JobState::Active => &self.active,
            JobState::Completed => &self.completed,
            JobState::Failed => &self.failed,
        }
    }
}

/// Point-in-time counts for a queue, always derived from the state sets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    /// Set when the counts could not be read from the store
    pub paused: bool,
}

impl QueueStats {
    pub(crate) fn unavailable() -> Self {
        Self {
            paused: true,
            ..Self::default()
        }
    }

    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Delayed => self.delayed,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}
