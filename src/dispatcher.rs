use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error};

use crate::error::Result;
use crate::job::{Job, JobId, JobOptions, JobState};
use crate::queue::{QueueKeys, QueueStats};
use crate::storage::{self, Store, StoreError};

/// Width of the insertion-sequence tie-breaker inside a waiting score
const SEQ_SPAN: u64 = 1 << 32;

/// Meta hash field holding the last sequence number issued for a queue
const SEQ_FIELD: &str = "seq";

/// Score of a waiting job: priority first (higher pops sooner), then
/// insertion sequence. Priorities are validated on insert; the clamp only
/// guards bodies written before that check existed.
pub(crate) fn waiting_score(priority: i32, seq: u64) -> f64 {
    let max = JobOptions::MAX_PRIORITY;
    let priority = priority.clamp(-max, max) as f64;
    -priority * SEQ_SPAN as f64 + (seq % SEQ_SPAN) as f64
}

pub(crate) fn now_millis() -> f64 {
    Utc::now().timestamp_millis() as f64
}

/// Writes jobs into the store and moves them between state sets. Shared by
/// the public API, the workers and the periodic tasks.
pub(crate) struct Dispatcher {
    store: Arc<dyn Store>,
    seq_lock: Mutex<()>,
    queues: RwLock<BTreeSet<String>>,
    queue_added: Notify,
    stats: RwLock<HashMap<String, QueueStats>>,
}

impl Dispatcher {
    pub fn new<I, S>(store: Arc<dyn Store>, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store,
            seq_lock: Mutex::new(()),
            queues: RwLock::new(queues.into_iter().map(Into::into).collect()),
            queue_added: Notify::new(),
            stats: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Makes a queue known; returns whether it was new.
    pub fn declare_queue(&self, name: &str) -> bool {
        {
            let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
            if queues.contains(name) {
                return false;
            }
        }
        let inserted = self
            .queues
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
        if inserted {
            debug!(queue = name, "Queue created");
            self.queue_added.notify_waiters();
        }
        inserted
    }

    pub fn queues(&self) -> Vec<String> {
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        queues.iter().cloned().collect()
    }

    pub(crate) fn queue_added(&self) -> &Notify {
        &self.queue_added
    }

    /// Next insertion sequence for a queue. The counter lives in the store,
    /// so a restarted process continues after the jobs it left waiting.
    async fn next_seq(&self, keys: &QueueKeys) -> storage::Result<u64> {
        let _guard = self.seq_lock.lock().await;
        let seq = match self.store.hash_get(keys.meta(), SEQ_FIELD).await? {
            Some(raw) => {
                let last: u64 = raw.parse().map_err(|_| {
                    StoreError::Backend(format!(
                        "invalid sequence '{}' in {}",
                        raw,
                        keys.meta()
                    ))
                })?;
                last.wrapping_add(1)
            }
            None => 0,
        };
        self.store
            .hash_set(keys.meta(), SEQ_FIELD, &seq.to_string())
            .await?;
        Ok(seq)
    }

    pub async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        if let Err(e) = options.validate() {
            error!(queue, job_type, error = %e, "Rejected job");
            return Err(e);
        }
        self.declare_queue(queue);
        let keys = QueueKeys::new(queue);
        let job = Job::new(queue, job_type, payload).with_options(options);

        let written = async {
            self.save_job(&keys, &job).await?;
            if job.options.delay.is_zero() {
                self.push_waiting(&keys, &job.id, job.options.priority).await
            } else {
                let due = now_millis() + job.options.delay.as_millis() as f64;
                self.store
                    .sorted_set_add(keys.set(JobState::Delayed), due, job.id.as_ref())
                    .await
            }
        }
        .await;

        if let Err(e) = written {
            error!(job_id = %job.id, queue, job_type, error = %e, "Failed to add job to queue");
            return Err(e.into());
        }

        self.refresh_stats(queue).await;
        debug!(
            job_id = %job.id,
            queue,
            job_type,
            priority = job.options.priority,
            delay_ms = job.options.delay.as_millis() as u64,
            "Job added to queue"
        );
        Ok(job.id)
    }

    pub async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>> {
        let keys = QueueKeys::new(queue);
        match self.store.hash_get(keys.jobs(), id.as_ref()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn save_job(&self, keys: &QueueKeys, job: &Job) -> storage::Result<()> {
        let raw = serde_json::to_string(job)
            .map_err(|e| storage::StoreError::Backend(e.to_string()))?;
        self.store.hash_set(keys.jobs(), job.id.as_ref(), &raw).await
    }

    pub(crate) async fn push_waiting(
        &self,
        keys: &QueueKeys,
        id: &JobId,
        priority: i32,
    ) -> storage::Result<()> {
        let score = waiting_score(priority, self.next_seq(keys).await?);
        self.store
            .sorted_set_add(keys.set(JobState::Waiting), score, id.as_ref())
            .await
    }

    /// Removes the id from `from` and inserts it into `to`.
    pub(crate) async fn move_job(
        &self,
        keys: &QueueKeys,
        id: &JobId,
        from: JobState,
        to: JobState,
        score: f64,
    ) -> storage::Result<()> {
        self.store.sorted_set_remove(keys.set(from), id.as_ref()).await?;
        self.store.sorted_set_add(keys.set(to), score, id.as_ref()).await
    }

    pub async fn count_stats(&self, queue: &str) -> storage::Result<QueueStats> {
        let keys = QueueKeys::new(queue);
        let count = |state| self.store.sorted_set_count(keys.set(state));
        let (waiting, active, completed, failed, delayed) = tokio::try_join!(
            count(JobState::Waiting),
            count(JobState::Active),
            count(JobState::Completed),
            count(JobState::Failed),
            count(JobState::Delayed),
        )?;
        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
            paused: false,
        })
    }

    /// Never fails: a store error yields zeroed counts marked `paused`.
    pub async fn queue_stats(&self, queue: &str) -> QueueStats {
        match self.count_stats(queue).await {
            Ok(stats) => stats,
            Err(e) => {
                error!(queue, error = %e, "Failed to get queue stats");
                QueueStats::unavailable()
            }
        }
    }

    pub(crate) async fn refresh_stats(&self, queue: &str) {
        match self.count_stats(queue).await {
            Ok(stats) => {
                let mut cache = self.stats.write().unwrap_or_else(|e| e.into_inner());
                cache.insert(queue.to_string(), stats);
            }
            Err(e) => debug!(queue, error = %e, "Failed to refresh queue stats"),
        }
    }

    pub fn cached_stats(&self, queue: &str) -> Option<QueueStats> {
        let cache = self.stats.read().unwrap_or_else(|e| e.into_inner());
        cache.get(queue).copied()
    }

    /// Sum of active-set sizes across all known queues
    pub(crate) async fn active_count(&self) -> storage::Result<u64> {
        let mut total = 0;
        for queue in self.queues() {
            total += self
                .store
                .sorted_set_count(QueueKeys::new(&queue).set(JobState::Active))
                .await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(MemoryStore::new()), ["default"])
    }

    #[tokio::test]
    async fn immediate_jobs_land_in_waiting() {
        let d = dispatcher();
        let id = d.add_job("q", "t", json!({}), JobOptions::default()).await.unwrap();

        let stats = d.queue_stats("q").await;
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.delayed, 0);
        let job = d.get_job("q", &id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert_eq!(job.queue, "q");
    }

    #[tokio::test]
    async fn delayed_jobs_land_in_delayed_with_due_score() {
        let d = dispatcher();
        let before = now_millis();
        let id = d
            .add_job("q", "t", json!({}), JobOptions::new().delay(Duration::from_secs(60)))
            .await
            .unwrap();

        let keys = QueueKeys::new("q");
        let due = d
            .store()
            .sorted_set_range_by_score(keys.set(JobState::Delayed), before + 59_000.0, f64::MAX, 10)
            .await
            .unwrap();
        assert_eq!(due, vec![id.0]);
        assert_eq!(d.queue_stats("q").await.waiting, 0);
    }

    #[tokio::test]
    async fn first_reference_declares_queue_and_caches_stats() {
        let d = dispatcher();
        assert!(!d.queues().contains(&"mail".to_string()));
        d.add_job("mail", "t", json!(null), JobOptions::default()).await.unwrap();

        assert!(d.queues().contains(&"mail".to_string()));
        assert_eq!(d.cached_stats("mail").map(|s| s.waiting), Some(1));
        assert!(!d.declare_queue("mail"));
    }

    #[tokio::test]
    async fn missing_jobs_are_none() {
        let d = dispatcher();
        assert!(d.get_job("q", &JobId::from("nope")).await.unwrap().is_none());
    }

    #[test]
    fn equal_priority_orders_by_sequence() {
        assert!(waiting_score(3, 10) < waiting_score(3, 11));
    }

    #[test]
    fn stored_out_of_range_priority_still_scores_finitely() {
        assert_eq!(waiting_score(i32::MAX, 0), waiting_score(JobOptions::MAX_PRIORITY, 0));
        assert!(waiting_score(i32::MIN, 0).is_finite());
    }

    #[tokio::test]
    async fn out_of_range_priority_is_rejected_before_any_write() {
        let d = dispatcher();
        let err = d
            .add_job("q", "t", json!({}), JobOptions::new().priority(2_000_000))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidPriority(2_000_000)));

        let keys = QueueKeys::new("q");
        assert!(d.store().hash_get_all(keys.jobs()).await.unwrap().is_empty());
        assert_eq!(d.queue_stats("q").await.total(), 0);
        assert!(!d.queues().contains(&"q".to_string()));
    }

    #[tokio::test]
    async fn boundary_priorities_keep_their_order() {
        let d = dispatcher();
        let max = JobOptions::MAX_PRIORITY;
        let below = d.add_job("q", "t", json!({}), JobOptions::new().priority(max - 1)).await.unwrap();
        let top = d.add_job("q", "t", json!({}), JobOptions::new().priority(max)).await.unwrap();

        let keys = QueueKeys::new("q");
        let waiting = keys.set(JobState::Waiting);
        let first = d.store().sorted_set_try_pop_min(waiting).await.unwrap().unwrap();
        let second = d.store().sorted_set_try_pop_min(waiting).await.unwrap().unwrap();
        assert_eq!((first.1, second.1), (top.0, below.0));
    }

    #[tokio::test]
    async fn sequence_survives_a_new_dispatcher_on_the_same_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let before = Dispatcher::new(Arc::clone(&store), ["q"]);
        let mut expected = Vec::new();
        for _ in 0..3 {
            expected.push(before.add_job("q", "t", json!({}), JobOptions::default()).await.unwrap().0);
        }
        drop(before);

        let after = Dispatcher::new(Arc::clone(&store), ["q"]);
        expected.push(after.add_job("q", "t", json!({}), JobOptions::default()).await.unwrap().0);

        let keys = QueueKeys::new("q");
        let mut popped = Vec::new();
        while let Some((_, id)) = store.sorted_set_try_pop_min(keys.set(JobState::Waiting)).await.unwrap() {
            popped.push(id);
        }
        assert_eq!(popped, expected);
    }

    proptest! {
        #[test]
        fn prop_higher_priority_always_scores_lower(
            high in -JobOptions::MAX_PRIORITY + 1..=JobOptions::MAX_PRIORITY,
            gap in 1i32..1000,
            s1 in 0u64..(1u64 << 32),
            s2 in 0u64..(1u64 << 32),
        ) {
            let low = (high - gap).max(-JobOptions::MAX_PRIORITY);
            prop_assume!(low < high);
            prop_assert!(waiting_score(high, s1) < waiting_score(low, s2));
        }
    }
}
