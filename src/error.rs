use thiserror::Error;

use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    /// The store rejected a write. For `add_job` the job must be treated as
    /// lost; retrying the call is up to the caller.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid priority {0}: must be within -1048576..=1048576")]
    InvalidPriority(i32),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<::config::ConfigError> for Error {
    fn from(err: ::config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
