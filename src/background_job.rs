use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::job::{JobId, JobOptions, RecurringJob};
use crate::scheduler::{RecurringScheduler, Schedule};

/// Typed handle for one job type, returned by `JobQueue::register_handler`.
///
/// Carries a target queue and default options so call sites only supply the
/// arguments:
///
/// ```ignore
/// let send_email = queue
///     .register_handler("email:send", send_email)
///     .on_queue("high-priority")
///     .with_options(JobOptions::new().max_attempts(5));
///
/// send_email.enqueue(Email { to: "a@x.com".into() }).await?;
/// ```
pub struct BackgroundJob<T> {
    job_type: String,
    queue: String,
    options: JobOptions,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<RecurringScheduler>,
    _phantom: PhantomData<fn(T)>,
}

impl<T> Clone for BackgroundJob<T> {
    fn clone(&self) -> Self {
        Self {
            job_type: self.job_type.clone(),
            queue: self.queue.clone(),
            options: self.options.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            scheduler: Arc::clone(&self.scheduler),
            _phantom: PhantomData,
        }
    }
}

impl<T: Serialize> BackgroundJob<T> {
    pub(crate) fn new(
        job_type: &str,
        dispatcher: Arc<Dispatcher>,
        scheduler: Arc<RecurringScheduler>,
    ) -> Self {
        Self {
            job_type: job_type.to_string(),
            queue: "default".to_string(),
            options: JobOptions::default(),
            dispatcher,
            scheduler,
            _phantom: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.job_type
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn on_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn enqueue(&self, args: T) -> Result<JobId> {
        self.add(args, self.options.clone()).await
    }

    pub async fn schedule(&self, args: T, delay: Duration) -> Result<JobId> {
        self.add(args, self.options.clone().delay(delay)).await
    }

    pub async fn recurring(&self, schedule: Schedule, args: T) -> Result<RecurringJob> {
        let payload = serde_json::to_value(&args)?;
        self.scheduler
            .upsert(
                &self.queue,
                &self.job_type,
                schedule,
                payload,
                self.options.clone(),
            )
            .await
    }

    async fn add(&self, args: T, options: JobOptions) -> Result<JobId> {
        let payload = serde_json::to_value(&args)?;
        self.dispatcher
            .add_job(&self.queue, &self.job_type, payload, options)
            .await
    }
}
