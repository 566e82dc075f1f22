use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::dispatcher::{now_millis, Dispatcher};
use crate::job::JobState;
use crate::queue::QueueKeys;
use crate::storage;

/// Prunes completed and failed jobs older than the retention window
pub(crate) struct RetentionSweeper {
    dispatcher: Arc<Dispatcher>,
    retention: Duration,
    batch_size: usize,
}

impl RetentionSweeper {
    pub fn new(dispatcher: Arc<Dispatcher>, retention: Duration) -> Self {
        Self {
            dispatcher,
            retention,
            batch_size: 500,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn tick(&self) {
        let mut total = 0;
        for queue in self.dispatcher.queues() {
            match self.sweep_queue(&queue).await {
                Ok(removed) => total += removed,
                Err(e) => error!(queue = %queue, error = %e, "Cleanup task error"),
            }
        }
        if total > 0 {
            info!(removed = total, "Old jobs cleaned up");
        }
    }

    /// Removes expired ids and their bodies from one queue.
    pub async fn sweep_queue(&self, queue: &str) -> storage::Result<usize> {
        let keys = QueueKeys::new(queue);
        let store = self.dispatcher.store();
        let cutoff = now_millis() - self.retention.as_millis() as f64;

        let mut removed = 0;
        for state in [JobState::Completed, JobState::Failed] {
            loop {
                let expired = store
                    .sorted_set_range_by_score(keys.set(state), f64::MIN, cutoff, self.batch_size)
                    .await?;
                if expired.is_empty() {
                    break;
                }
                let batch = expired.len();
                for id in expired {
                    store.sorted_set_remove(keys.set(state), &id).await?;
                    store.hash_delete(keys.jobs(), &id).await?;
                    removed += 1;
                }
                if batch < self.batch_size {
                    break;
                }
            }
        }

        if removed > 0 {
            self.dispatcher.refresh_stats(queue).await;
            debug!(queue, removed, "Swept expired jobs");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    const DAY_MS: f64 = 86_400_000.0;

    #[tokio::test]
    async fn only_entries_past_retention_are_removed() {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(MemoryStore::new()), ["q"]));
        let store = dispatcher.store();
        let keys = QueueKeys::new("q");
        let now = now_millis();

        for (id, state, age_days) in [
            ("old-done", JobState::Completed, 8.0),
            ("new-done", JobState::Completed, 1.0),
            ("old-failed", JobState::Failed, 30.0),
            ("old-waiting", JobState::Waiting, 30.0),
        ] {
            store.hash_set(keys.jobs(), id, "{}").await.unwrap();
            store
                .sorted_set_add(keys.set(state), now - age_days * DAY_MS, id)
                .await
                .unwrap();
        }

        let sweeper = RetentionSweeper::new(Arc::clone(&dispatcher), Duration::from_secs(7 * 86_400))
            .with_batch_size(1);
        assert_eq!(sweeper.sweep_queue("q").await.unwrap(), 2);

        let stats = dispatcher.queue_stats("q").await;
        assert_eq!((stats.completed, stats.failed, stats.waiting), (1, 0, 1));
        assert!(store.hash_get(keys.jobs(), "old-done").await.unwrap().is_none());
        assert!(store.hash_get(keys.jobs(), "new-done").await.unwrap().is_some());
        assert!(store.hash_get(keys.jobs(), "old-waiting").await.unwrap().is_some());
    }
}
