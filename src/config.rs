//! Processor configuration.
//!
//! Loaded from an optional TOML file layered under `BGPROC__*` environment
//! variables, e.g. `BGPROC__DRAIN_TIMEOUT_MS=5000`.

use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable prefix for configuration overrides
const ENV_PREFIX: &str = "BGPROC";

/// Separator for nested keys in environment variables
const ENV_SEPARATOR: &str = "__";

fn default_queues() -> Vec<String> {
    ["default", "high-priority", "low-priority", "maintenance"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

fn default_error_backoff_ms() -> u64 {
    1_000
}

fn default_promote_interval_ms() -> u64 {
    5_000
}

fn default_promote_batch() -> usize {
    100
}

fn default_recurring_interval_ms() -> u64 {
    5 * 60 * 1_000
}

fn default_sweep_interval_ms() -> u64 {
    60 * 60 * 1_000
}

fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_sweep_batch() -> usize {
    500
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_drain_poll_interval_ms() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Queues that get a worker on start; others are added on first use
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Max time a worker blocks waiting for a job
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Pause after a store error inside a worker loop
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    #[serde(default = "default_promote_interval_ms")]
    pub promote_interval_ms: u64,

    /// Max delayed jobs promoted per queue per pass
    #[serde(default = "default_promote_batch")]
    pub promote_batch: usize,

    #[serde(default = "default_recurring_interval_ms")]
    pub recurring_interval_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// How long completed and failed jobs are kept
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: usize,

    /// Upper bound on how long `stop()` waits for active jobs
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            poll_timeout_ms: default_poll_timeout_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            promote_interval_ms: default_promote_interval_ms(),
            promote_batch: default_promote_batch(),
            recurring_interval_ms: default_recurring_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            retention_secs: default_retention_secs(),
            sweep_batch: default_sweep_batch(),
            drain_timeout_ms: default_drain_timeout_ms(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
        }
    }
}

impl ProcessorConfig {
    /// Loads `path` (if it exists) and then environment overrides.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.as_ref())
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .list_separator(",")
                    .with_list_parse_key("queues")
                    .try_parsing(true),
            )
            .build()?;

        let settings: ProcessorConfig = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parses a TOML document, e.g. an embedded default.
    pub fn from_toml(source: &str) -> Result<Self> {
        let settings: ProcessorConfig = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(Error::Config("queue names must not be empty".to_string()));
        }
        let intervals = [
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("promote_interval_ms", self.promote_interval_ms),
            ("recurring_interval_ms", self.recurring_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("drain_poll_interval_ms", self.drain_poll_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{} must be greater than zero", name)));
        }
        if self.promote_batch == 0 || self.sweep_batch == 0 {
            return Err(Error::Config("batch sizes must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn promote_interval(&self) -> Duration {
        Duration::from_millis(self.promote_interval_ms)
    }

    pub fn recurring_interval(&self) -> Duration {
        Duration::from_millis(self.recurring_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}
