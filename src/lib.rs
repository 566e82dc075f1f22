//! Background job processing over a key-value store with sorted sets.
//!
//! Jobs live in named queues. Each queue has a worker that pops the
//! highest-priority waiting job, runs its registered handler under a timeout
//! and retries failures with fixed or exponential backoff. Periodic tasks
//! promote delayed jobs, materialize recurring jobs and sweep old results.

mod background_job;
pub mod config;
mod dispatcher;
pub mod error;
mod job;
mod jobqueue;
mod periodic;
mod promoter;
mod queue;
mod registry;
mod retry;
mod scheduler;
pub mod storage;
mod sweeper;
mod worker;

pub use background_job::BackgroundJob;
pub use self::config::ProcessorConfig;
pub use error::{Error, Result};
pub use job::{Job, JobId, JobOptions, JobState, RecurringJob};
pub use jobqueue::JobQueue;
pub use queue::{QueueKeys, QueueStats};
pub use registry::{HandlerRegistry, JobError, JobResult};
pub use retry::{Backoff, BackoffKind};
pub use scheduler::Schedule;
pub use storage::{MemoryStore, Store, StoreError};

#[cfg(feature = "redis")]
pub use storage::RedisStore;
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
