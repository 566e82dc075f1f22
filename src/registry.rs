use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinError;
use tracing::debug;

use crate::Job;

/// Why a single execution attempt failed
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("No handler registered for job type: {0}")]
    NoHandlerRegistered(String),

    #[error("Payload deserialization error: {0}")]
    Deserialization(serde_json::Error),

    #[error("Result serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("{0}")]
    Handler(String),

    #[error("Job timeout after {0:?}")]
    Timeout(Duration),

    #[error("Job handler panicked")]
    Panicked,
}

impl JobError {
    /// A missing handler will not appear between attempts, so retrying is
    /// pointless.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::NoHandlerRegistered(_))
    }
}

pub type JobResult = Result<serde_json::Value, JobError>;

pub(crate) type BoxedHandler = Arc<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = JobResult> + Send>> + Send + Sync,
>;

/// Wraps a typed async handler into the payload-in, JSON-out form the
/// registry dispatches on.
pub(crate) fn boxed_handler<T, R, E, F, Fut>(handler: F) -> BoxedHandler
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |payload: serde_json::Value| {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let args: T = serde_json::from_value(payload).map_err(JobError::Deserialization)?;
            let output = handler(args)
                .await
                .map_err(|e| JobError::Handler(e.to_string()))?;
            serde_json::to_value(output).map_err(JobError::Serialization)
        })
    })
}

/// Dispatch table from job type to handler; the last registration for a type
/// wins.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, BoxedHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, job_type: &str, handler: BoxedHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.insert(job_type.to_string(), handler).is_some() {
            debug!(job_type, "Replaced job handler");
        } else {
            debug!(job_type, "Job handler registered");
        }
    }

    /// Runs the job's handler in its own task, racing it against the job's
    /// timeout. A timed-out task is aborted, which only takes effect at its
    /// next await point.
    pub async fn execute(&self, job: &Job) -> JobResult {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers
                .get(&job.job_type)
                .cloned()
                .ok_or_else(|| JobError::NoHandlerRegistered(job.job_type.clone()))?
        };

        let future = handler(job.payload.clone());
        let mut handle = tokio::spawn(future);
        let timeout = job.options.timeout;

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                JobError::Panicked
            } else {
                JobError::Handler("Job handler cancelled".to_string())
            }
        };

        tokio::select! {
            res = &mut handle => res.map_err(join_to_error)?,
            _ = tokio::time::sleep(timeout) => {
                handle.abort();
                Err(JobError::Timeout(timeout))
            }
        }
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobOptions;
    use serde_json::json;

    fn job(job_type: &str, payload: serde_json::Value) -> Job {
        Job::new("q", job_type, payload)
    }

    #[tokio::test]
    async fn executes_registered_handler_and_returns_result() {
        let registry = HandlerRegistry::new();
        registry.register(
            "add",
            boxed_handler(|(a, b): (i64, i64)| async move { Ok::<_, String>(a + b) }),
        );

        let result = registry.execute(&job("add", json!([2, 3]))).await.unwrap();
        assert_eq!(result, json!(5));
    }

    #[tokio::test]
    async fn missing_handler_is_not_retryable() {
        let registry = HandlerRegistry::new();
        let err = registry.execute(&job("nope", json!(null))).await.unwrap_err();
        assert!(matches!(err, JobError::NoHandlerRegistered(ref t) if t == "nope"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn handler_errors_carry_their_message() {
        let registry = HandlerRegistry::new();
        registry.register(
            "boom",
            boxed_handler(|_: serde_json::Value| async { Err::<(), _>("smtp down") }),
        );

        let err = registry.execute(&job("boom", json!({}))).await.unwrap_err();
        assert_eq!(err.to_string(), "smtp down");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn slow_handlers_time_out() {
        let registry = HandlerRegistry::new();
        registry.register(
            "slow",
            boxed_handler(|_: serde_json::Value| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, String>(())
            }),
        );

        let job = job("slow", json!(null))
            .with_options(JobOptions::new().timeout(Duration::from_millis(20)));
        let err = registry.execute(&job).await.unwrap_err();
        assert!(matches!(err, JobError::Timeout(_)));
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = HandlerRegistry::new();
        registry.register("t", boxed_handler(|_: ()| async { Ok::<_, String>(1) }));
        registry.register("t", boxed_handler(|_: ()| async { Ok::<_, String>(2) }));

        assert_eq!(registry.execute(&job("t", json!(null))).await.unwrap(), json!(2));
        assert_eq!(registry.job_types(), vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn bad_payload_is_a_deserialization_error() {
        let registry = HandlerRegistry::new();
        registry.register("n", boxed_handler(|n: u32| async move { Ok::<_, String>(n) }));

        let err = registry.execute(&job("n", json!("nope"))).await.unwrap_err();
        assert!(matches!(err, JobError::Deserialization(_)));
    }
}
