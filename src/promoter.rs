use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::dispatcher::{now_millis, Dispatcher};
use crate::job::{Job, JobId, JobState};
use crate::queue::QueueKeys;
use crate::storage;

/// Moves delayed jobs whose due time has passed into waiting
pub(crate) struct DelayPromoter {
    dispatcher: Arc<Dispatcher>,
    batch_size: usize,
}

impl DelayPromoter {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            batch_size: 100,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// One pass over every known queue
    pub async fn tick(&self) {
        for queue in self.dispatcher.queues() {
            if let Err(e) = self.promote_queue(&queue).await {
                error!(queue = %queue, error = %e, "Delayed job processor error");
            }
        }
    }

    /// Promotes at most one batch of due jobs; returns how many moved.
    pub async fn promote_queue(&self, queue: &str) -> storage::Result<usize> {
        let keys = QueueKeys::new(queue);
        let store = self.dispatcher.store();
        let due = store
            .sorted_set_range_by_score(
                keys.set(JobState::Delayed),
                f64::MIN,
                now_millis(),
                self.batch_size,
            )
            .await?;

        let mut moved = 0;
        for raw_id in due {
            let id = JobId(raw_id);
            let priority = match store.hash_get(keys.jobs(), id.as_ref()).await? {
                Some(raw) => match serde_json::from_str::<Job>(&raw) {
                    Ok(job) => job.options.priority,
                    Err(e) => {
                        warn!(job_id = %id, queue, error = %e, "Undecodable delayed job, using priority 0");
                        0
                    }
                },
                None => {
                    warn!(job_id = %id, queue, "Removing delayed id with no stored body");
                    store.sorted_set_remove(keys.set(JobState::Delayed), id.as_ref()).await?;
                    continue;
                }
            };

            // Only the pass that actually removed the id may re-insert it.
            if store
                .sorted_set_remove(keys.set(JobState::Delayed), id.as_ref())
                .await?
            {
                self.dispatcher.push_waiting(&keys, &id, priority).await?;
                moved += 1;
            }
        }

        if moved > 0 {
            self.dispatcher.refresh_stats(queue).await;
            debug!(queue, count = moved, "Moved delayed jobs to waiting");
        }
        Ok(moved)
    }
}
