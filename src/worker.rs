use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{now_millis, Dispatcher};
use crate::job::{Job, JobId, JobState};
use crate::queue::QueueKeys;
use crate::registry::{HandlerRegistry, JobError};
use crate::retry::{self, RetryDecision};
use crate::storage;

/// Processes jobs from a single queue, one at a time
pub(crate) struct Worker {
    dispatcher: Arc<Dispatcher>,
    handlers: Arc<HandlerRegistry>,
    keys: QueueKeys,
    poll_timeout: Duration,
    error_backoff: Duration,
}

impl Worker {
    pub fn new(dispatcher: Arc<Dispatcher>, handlers: Arc<HandlerRegistry>, queue: &str) -> Self {
        Self {
            dispatcher,
            handlers,
            keys: QueueKeys::new(queue),
            poll_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }

    /// How long one pop may block; bounds how quickly `run` notices shutdown
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Run until shutdown is signaled. Shutdown is checked between jobs, so
    /// a job already popped always runs to completion.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(queue = %self.keys.name(), "Worker started");

        while !shutdown.is_cancelled() {
            if let Err(e) = self.poll_and_process().await {
                error!(queue = %self.keys.name(), error = %e, "Worker error");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(self.error_backoff) => {}
                }
            }
        }

        info!(queue = %self.keys.name(), "Worker shutting down");
    }

    /// Waits up to the poll timeout for the next job and processes it.
    /// Returns whether a job was handled.
    pub async fn poll_and_process(&self) -> storage::Result<bool> {
        let store = self.dispatcher.store();
        let Some((_, raw_id)) = store
            .sorted_set_pop_min(self.keys.set(JobState::Waiting), self.poll_timeout)
            .await?
        else {
            return Ok(false);
        };
        let id = JobId(raw_id);

        let mut job = match store.hash_get(self.keys.jobs(), id.as_ref()).await? {
            Some(raw) => match serde_json::from_str::<Job>(&raw) {
                Ok(job) => job,
                Err(e) => {
                    error!(job_id = %id, queue = %self.keys.name(), error = %e, "Dropping undecodable job");
                    return Ok(true);
                }
            },
            None => {
                warn!(job_id = %id, queue = %self.keys.name(), "Dropping job with no stored body");
                return Ok(true);
            }
        };

        store
            .sorted_set_add(self.keys.set(JobState::Active), now_millis(), id.as_ref())
            .await?;
        job.attempts += 1;
        job.processed_at = Some(Utc::now());
        self.dispatcher.save_job(&self.keys, &job).await?;

        debug!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "Processing job");

        let started = Instant::now();
        let outcome = self.handlers.execute(&job).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                job.completed_at = Some(Utc::now());
                job.result = Some(result);
                self.settle(&job, JobState::Completed, now_millis()).await?;
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    queue = %self.keys.name(),
                    attempts = job.attempts,
                    duration_ms,
                    "Job completed successfully"
                );
            }
            Err(e) => self.handle_failure(&mut job, e, duration_ms).await?,
        }

        self.dispatcher.refresh_stats(self.keys.name()).await;
        Ok(true)
    }

    async fn handle_failure(
        &self,
        job: &mut Job,
        error: JobError,
        duration_ms: u64,
    ) -> storage::Result<()> {
        job.error = Some(error.to_string());
        let decision = retry::decide(
            &job.options.backoff,
            job.attempts,
            job.options.effective_max_attempts(),
            error.is_retryable(),
        );

        match decision {
            RetryDecision::Requeue => {
                self.dispatcher.save_job(&self.keys, job).await?;
                self.dispatcher
                    .store()
                    .sorted_set_remove(self.keys.set(JobState::Active), job.id.as_ref())
                    .await?;
                self.dispatcher
                    .push_waiting(&self.keys, &job.id, job.options.priority)
                    .await?;
            }
            RetryDecision::Delay(delay) => {
                let due = now_millis() + delay.as_millis() as f64;
                self.settle(job, JobState::Delayed, due).await?;
            }
            RetryDecision::Fail => {
                job.failed_at = Some(Utc::now());
                self.settle(job, JobState::Failed, now_millis()).await?;
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    queue = %self.keys.name(),
                    attempts = job.attempts,
                    error = %error,
                    duration_ms,
                    "Job failed permanently"
                );
                return Ok(());
            }
        }

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            queue = %self.keys.name(),
            attempts = job.attempts,
            max_attempts = job.options.effective_max_attempts(),
            error = %error,
            "Job failed, scheduled for retry"
        );
        Ok(())
    }

    /// Body first, then the set move, so a reader that finds the id in its
    /// new set also sees the matching body.
    async fn settle(&self, job: &Job, to: JobState, score: f64) -> storage::Result<()> {
        self.dispatcher.save_job(&self.keys, job).await?;
        self.dispatcher
            .move_job(&self.keys, &job.id, JobState::Active, to, score)
            .await
    }
}
