//! In-process store, used for tests and single-process deployments.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use tokio::sync::Notify;

use super::{Result, Store, StoreError};

#[derive(Default)]
struct SortedSet {
    ordered: BTreeSet<(OrderedFloat<f64>, String)>,
    scores: HashMap<String, OrderedFloat<f64>>,
}

impl SortedSet {
    fn insert(&mut self, score: f64, member: &str) {
        let score = OrderedFloat(score);
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.ordered.remove(&(score, member.to_string())),
            None => false,
        }
    }

    fn pop_min(&mut self) -> Option<(f64, String)> {
        let (score, member) = self.ordered.pop_first()?;
        self.scores.remove(&member);
        Some((score.0, member))
    }
}

#[derive(Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, SortedSet>,
}

/// Store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    added: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hash_set(&self, map: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.lock()?;
        state
            .hashes
            .entry(map.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, map: &str, field: &str) -> Result<Option<String>> {
        let state = self.lock()?;
        Ok(state.hashes.get(map).and_then(|h| h.get(field)).cloned())
    }

    async fn hash_get_all(&self, map: &str) -> Result<HashMap<String, String>> {
        let state = self.lock()?;
        Ok(state.hashes.get(map).cloned().unwrap_or_default())
    }

    async fn hash_delete(&self, map: &str, field: &str) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state
            .hashes
            .get_mut(map)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn sorted_set_add(&self, set: &str, score: f64, member: &str) -> Result<()> {
        {
            let mut state = self.lock()?;
            state.sets.entry(set.to_string()).or_default().insert(score, member);
        }
        self.added.notify_waiters();
        Ok(())
    }

    async fn sorted_set_remove(&self, set: &str, member: &str) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state
            .sets
            .get_mut(set)
            .map(|s| s.remove(member))
            .unwrap_or(false))
    }

    async fn sorted_set_try_pop_min(&self, set: &str) -> Result<Option<(f64, String)>> {
        let mut state = self.lock()?;
        Ok(state.sets.get_mut(set).and_then(SortedSet::pop_min))
    }

    async fn sorted_set_range_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let state = self.lock()?;
        let Some(sorted) = state.sets.get(set) else {
            return Ok(Vec::new());
        };
        Ok(sorted
            .ordered
            .iter()
            .skip_while(|(score, _)| score.0 < min)
            .take_while(|(score, _)| score.0 <= max)
            .take(limit)
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn sorted_set_count(&self, set: &str) -> Result<u64> {
        let state = self.lock()?;
        Ok(state.sets.get(set).map(|s| s.scores.len() as u64).unwrap_or(0))
    }

    /// Wakes as soon as any member is added instead of polling.
    async fn sorted_set_pop_min(
        &self,
        set: &str,
        timeout: Duration,
    ) -> Result<Option<(f64, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.sorted_set_try_pop_min(set).await? {
                return Ok(Some(hit));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn pop_min_returns_lowest_score_first() {
        let store = MemoryStore::new();
        store.sorted_set_add("s", 3.0, "c").await.unwrap();
        store.sorted_set_add("s", -1.0, "a").await.unwrap();
        store.sorted_set_add("s", 2.0, "b").await.unwrap();

        let popped = store.sorted_set_try_pop_min("s").await.unwrap();
        assert_eq!(popped, Some((-1.0, "a".to_string())));
        assert_eq!(store.sorted_set_count("s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn re_adding_a_member_updates_its_score() {
        let store = MemoryStore::new();
        store.sorted_set_add("s", 10.0, "x").await.unwrap();
        store.sorted_set_add("s", 1.0, "x").await.unwrap();

        assert_eq!(store.sorted_set_count("s").await.unwrap(), 1);
        let range = store.sorted_set_range_by_score("s", 0.0, 5.0, 10).await.unwrap();
        assert_eq!(range, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let store = MemoryStore::new();
        store.sorted_set_add("s", 1.0, "x").await.unwrap();
        assert!(store.sorted_set_remove("s", "x").await.unwrap());
        assert!(!store.sorted_set_remove("s", "x").await.unwrap());
        assert!(!store.sorted_set_remove("missing", "x").await.unwrap());
    }

    #[tokio::test]
    async fn range_by_score_respects_bounds_and_limit() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store
                .sorted_set_add("s", i as f64, &format!("m{i}"))
                .await
                .unwrap();
        }
        let range = store.sorted_set_range_by_score("s", 2.0, 6.0, 3).await.unwrap();
        assert_eq!(range, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn hash_round_trip() {
        let store = MemoryStore::new();
        store.hash_set("h", "a", "1").await.unwrap();
        store.hash_set("h", "b", "2").await.unwrap();

        assert_eq!(store.hash_get("h", "a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.hash_get_all("h").await.unwrap().len(), 2);
        assert!(store.hash_delete("h", "a").await.unwrap());
        assert_eq!(store.hash_get("h", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn blocking_pop_times_out_on_empty_set() {
        let store = MemoryStore::new();
        let started = std::time::Instant::now();
        let popped = store
            .sorted_set_pop_min("empty", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(popped.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn blocking_pop_wakes_on_insert() {
        let store = Arc::new(MemoryStore::new());
        let popper = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .sorted_set_pop_min("s", Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.sorted_set_add("s", 1.0, "late").await.unwrap();

        let popped = popper.await.unwrap();
        assert_eq!(popped, Some((1.0, "late".to_string())));
    }

    #[tokio::test]
    async fn concurrent_pops_never_share_a_member() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..200 {
            store.sorted_set_add("s", i as f64, &i.to_string()).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some((_, m)) = store.sorted_set_try_pop_min("s").await.unwrap() {
                    got.push(m);
                }
                got
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
    }
}
