use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::background_job::BackgroundJob;
use crate::config::ProcessorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::job::{Job, JobId, JobOptions, RecurringJob};
use crate::periodic::run_periodic;
use crate::promoter::DelayPromoter;
use crate::queue::QueueStats;
use crate::registry::{boxed_handler, HandlerRegistry};
use crate::scheduler::{RecurringScheduler, Schedule};
use crate::storage::Store;
use crate::sweeper::RetentionSweeper;
use crate::worker::Worker;

/// Main job queue that coordinates workers and the periodic tasks.
///
/// Cheap to clone; all clones share the same workers and lifecycle.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

struct Inner {
    config: ProcessorConfig,
    dispatcher: Arc<Dispatcher>,
    handlers: Arc<HandlerRegistry>,
    scheduler: Arc<RecurringScheduler>,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

impl JobQueue {
    /// Create a job queue over `store` with the default configuration.
    ///
    /// Nothing runs until `start()`. Register handlers first:
    ///
    /// ```ignore
    /// let queue = JobQueue::new(Arc::new(MemoryStore::new()));
    /// let email = queue.register_handler("email:send", send_email);
    /// queue.start();
    /// email.enqueue(Email { to: "a@x.com".into() }).await?;
    /// ```
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_config(store, ProcessorConfig::default())
    }

    pub fn with_config(store: Arc<dyn Store>, config: ProcessorConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(store, config.queues.clone()));
        let scheduler = Arc::new(RecurringScheduler::new(Arc::clone(&dispatcher)));

        JobQueue {
            inner: Arc::new(Inner {
                config,
                dispatcher,
                handlers: Arc::new(HandlerRegistry::new()),
                scheduler,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Opens (and migrates) a SQLite database at `database_url`.
    #[cfg(feature = "sqlite")]
    pub async fn sqlite(database_url: &str, config: ProcessorConfig) -> Result<Self> {
        let store = crate::storage::SqliteStore::new(database_url)
            .await
            .map_err(crate::storage::StoreError::from)?;
        Ok(Self::with_config(Arc::new(store), config))
    }

    #[cfg(feature = "redis")]
    pub async fn redis(url: &str, config: ProcessorConfig) -> Result<Self> {
        let store = crate::storage::RedisStore::new(url).await?;
        Ok(Self::with_config(Arc::new(store), config))
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(self.inner.dispatcher.store())
    }

    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.inner.handlers)
    }

    /// Register the handler for `job_type`, replacing any previous one.
    ///
    /// The returned handle targets the `default` queue until `on_queue` is
    /// called on it.
    pub fn register_handler<T, R, E, F, Fut>(&self, job_type: &str, handler: F) -> BackgroundJob<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: std::fmt::Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        self.inner.handlers.register(job_type, boxed_handler(handler));
        BackgroundJob::new(
            job_type,
            Arc::clone(&self.inner.dispatcher),
            Arc::clone(&self.inner.scheduler),
        )
    }

    pub async fn add_job<P: Serialize>(
        &self,
        queue: &str,
        job_type: &str,
        payload: P,
        options: JobOptions,
    ) -> Result<JobId> {
        let payload = serde_json::to_value(payload)?;
        self.inner
            .dispatcher
            .add_job(queue, job_type, payload, options)
            .await
    }

    /// Same as `add_job` with `delay` overriding `options.delay`.
    pub async fn schedule_delayed_job<P: Serialize>(
        &self,
        queue: &str,
        job_type: &str,
        payload: P,
        delay: Duration,
        options: JobOptions,
    ) -> Result<JobId> {
        self.add_job(queue, job_type, payload, options.delay(delay)).await
    }

    /// Create or replace the recurring definition for (`queue`, `job_type`).
    pub async fn schedule_recurring_job<P: Serialize>(
        &self,
        queue: &str,
        job_type: &str,
        schedule: Schedule,
        payload: P,
        options: JobOptions,
    ) -> Result<RecurringJob> {
        let payload = serde_json::to_value(payload)?;
        self.inner
            .scheduler
            .upsert(queue, job_type, schedule, payload, options)
            .await
    }

    pub async fn remove_recurring_job(&self, queue: &str, job_type: &str) -> Result<bool> {
        self.inner.scheduler.remove(queue, job_type).await
    }

    pub async fn recurring_jobs(&self) -> Result<Vec<RecurringJob>> {
        self.inner.scheduler.list().await
    }

    pub async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>> {
        self.inner.dispatcher.get_job(queue, id).await
    }

    /// Live counts; a store failure yields zeroed stats marked `paused`.
    pub async fn get_queue_stats(&self, queue: &str) -> QueueStats {
        self.inner.dispatcher.queue_stats(queue).await
    }

    /// Last snapshot taken after a state change, without touching the store.
    pub fn cached_queue_stats(&self, queue: &str) -> Option<QueueStats> {
        self.inner.dispatcher.cached_stats(queue)
    }

    pub fn queues(&self) -> Vec<String> {
        self.inner.dispatcher.queues()
    }

    /// Make a queue known without adding a job. If running, it gets a worker.
    pub fn declare_queue(&self, name: &str) -> bool {
        self.inner.dispatcher.declare_queue(name)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle().shutdown.is_some()
    }

    /// Token of the current run, if started
    pub fn shutdown_token(&self) -> Option<CancellationToken> {
        self.lifecycle().shutdown.clone()
    }

    /// Start one worker per known queue plus the delay promoter, the
    /// recurring scheduler and the retention sweeper.
    ///
    /// Calling this while already running only logs a warning.
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.shutdown.is_some() {
            warn!("Background processor already running");
            return;
        }

        let shutdown = CancellationToken::new();
        let config = &self.inner.config;
        let dispatcher = &self.inner.dispatcher;

        lifecycle.handles.push(tokio::spawn(supervise_workers(
            Arc::clone(dispatcher),
            Arc::clone(&self.inner.handlers),
            config.clone(),
            shutdown.clone(),
        )));

        let promoter =
            DelayPromoter::new(Arc::clone(dispatcher)).with_batch_size(config.promote_batch);
        let token = shutdown.clone();
        let interval = config.promote_interval();
        lifecycle.handles.push(tokio::spawn(async move {
            run_periodic("delay-promoter", interval, token, || promoter.tick()).await;
        }));

        let scheduler = Arc::clone(&self.inner.scheduler);
        let token = shutdown.clone();
        let interval = config.recurring_interval();
        lifecycle.handles.push(tokio::spawn(async move {
            run_periodic("recurring-scheduler", interval, token, || scheduler.tick()).await;
        }));

        let sweeper = RetentionSweeper::new(Arc::clone(dispatcher), config.retention())
            .with_batch_size(config.sweep_batch);
        let token = shutdown.clone();
        let interval = config.sweep_interval();
        lifecycle.handles.push(tokio::spawn(async move {
            run_periodic("retention-sweeper", interval, token, || sweeper.tick()).await;
        }));

        lifecycle.shutdown = Some(shutdown);
        info!(queues = ?dispatcher.queues(), "Background processor started");
    }

    /// Signal shutdown and wait for in-flight jobs to finish.
    ///
    /// Returns once no job is active or `drain_timeout` has elapsed. Tasks
    /// still running at the deadline are detached, not aborted.
    pub async fn stop(&self) {
        let (shutdown, handles) = {
            let mut lifecycle = self.lifecycle();
            match lifecycle.shutdown.take() {
                Some(token) => (token, std::mem::take(&mut lifecycle.handles)),
                None => {
                    debug!("Background processor not running");
                    return;
                }
            }
        };

        info!("Initiating shutdown");
        shutdown.cancel();

        let config = &self.inner.config;
        let deadline = Instant::now() + config.drain_timeout();
        loop {
            match self.inner.dispatcher.active_count().await {
                Ok(0) => break,
                Ok(active) => {
                    if Instant::now() >= deadline {
                        warn!(active, "Drain timeout reached with jobs still active");
                        break;
                    }
                    debug!(active, "Waiting for active jobs to finish");
                }
                Err(e) => {
                    error!(error = %e, "Failed to count active jobs during shutdown");
                    if Instant::now() >= deadline {
                        break;
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(config.drain_poll_interval().min(remaining)).await;
        }

        let mut detached = 0;
        for handle in handles {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Err(e)) if e.is_panic() => error!(error = %e, "Background task panicked"),
                Ok(_) => {}
                Err(_) => detached += 1,
            }
        }
        if detached > 0 {
            warn!(detached, "Background tasks still running after drain timeout");
        }

        info!("Shutdown complete");
    }

    /// Wait for Ctrl+C, then `stop()`.
    pub async fn wait_for_shutdown(&self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Shutdown signal received");
        self.stop().await;
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps one worker per known queue, spawning workers for queues declared
/// after start. On shutdown it waits for its workers to return.
async fn supervise_workers(
    dispatcher: Arc<Dispatcher>,
    handlers: Arc<HandlerRegistry>,
    config: ProcessorConfig,
    shutdown: CancellationToken,
) {
    let mut running = std::collections::HashSet::new();
    let mut workers = JoinSet::new();

    loop {
        let added = dispatcher.queue_added().notified();
        tokio::pin!(added);
        added.as_mut().enable();

        for queue in dispatcher.queues() {
            if running.insert(queue.clone()) {
                let worker = Worker::new(Arc::clone(&dispatcher), Arc::clone(&handlers), &queue)
                    .with_poll_timeout(config.poll_timeout())
                    .with_error_backoff(config.error_backoff());
                let token = shutdown.clone();
                workers.spawn(async move { worker.run(token).await });
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut added => {}
        }
    }

    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "Worker task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig {
            queues: vec!["default".to_string()],
            poll_timeout_ms: 20,
            promote_interval_ms: 20,
            drain_timeout_ms: 500,
            drain_poll_interval_ms: 10,
            ..ProcessorConfig::default()
        }
    }

    fn queue() -> JobQueue {
        JobQueue::with_config(Arc::new(MemoryStore::new()), fast_config())
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_resets() {
        let q = queue();
        assert!(!q.is_running());
        q.start();
        let token = q.shutdown_token().unwrap();
        q.start();
        assert!(q.is_running());
        assert!(!token.is_cancelled());

        q.stop().await;
        assert!(token.is_cancelled());
        assert!(!q.is_running());
        assert!(q.shutdown_token().is_none());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        queue().stop().await;
    }

    #[tokio::test]
    async fn queues_declared_while_running_get_a_worker() {
        let q = queue();
        let job = q
            .register_handler("echo", |v: serde_json::Value| async move { Ok::<_, String>(v) })
            .on_queue("late");
        q.start();

        let id = job.enqueue(json!({"n": 1})).await.unwrap();

        let mut done = false;
        for _ in 0..100 {
            if q.get_queue_stats("late").await.completed == 1 {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        q.stop().await;

        assert!(done);
        let stored = q.get_job("late", &id).await.unwrap().unwrap();
        assert_eq!(stored.result, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn clones_share_the_lifecycle() {
        let q = queue();
        let other = q.clone();
        q.start();
        assert!(other.is_running());
        other.stop().await;
        assert!(!q.is_running());
    }

    #[tokio::test]
    async fn recurring_definitions_can_be_listed_and_removed() {
        let q = queue();
        q.schedule_recurring_job(
            "maintenance",
            "report",
            Schedule::every(Duration::from_secs(3600)),
            json!({}),
            JobOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(q.recurring_jobs().await.unwrap().len(), 1);
        assert!(q.queues().contains(&"maintenance".to_string()));
        assert!(q.remove_recurring_job("maintenance", "report").await.unwrap());
        assert!(!q.remove_recurring_job("maintenance", "report").await.unwrap());
        assert!(q.recurring_jobs().await.unwrap().is_empty());
    }
}
