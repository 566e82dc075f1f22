pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// How often the default blocking pop re-checks an empty set
const POP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Store backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Key-value store with hash maps and scored sorted sets.
///
/// `sorted_set_try_pop_min` must be a single indivisible operation: it is the
/// only thing preventing two workers from claiming the same job. Every other
/// operation may be a plain read or write.
#[async_trait]
pub trait Store: Send + Sync {
    async fn hash_set(&self, map: &str, field: &str, value: &str) -> Result<()>;
    async fn hash_get(&self, map: &str, field: &str) -> Result<Option<String>>;
    async fn hash_get_all(&self, map: &str) -> Result<HashMap<String, String>>;
    /// Returns whether the field existed
    async fn hash_delete(&self, map: &str, field: &str) -> Result<bool>;

    /// Inserts the member or updates its score
    async fn sorted_set_add(&self, set: &str, score: f64, member: &str) -> Result<()>;
    /// Returns whether the member was present
    async fn sorted_set_remove(&self, set: &str, member: &str) -> Result<bool>;
    /// Atomically removes and returns the lowest-scored member
    async fn sorted_set_try_pop_min(&self, set: &str) -> Result<Option<(f64, String)>>;
    /// Members with `min <= score <= max`, lowest score first
    async fn sorted_set_range_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>>;
    async fn sorted_set_count(&self, set: &str) -> Result<u64>;

    /// Pops the lowest-scored member, waiting up to `timeout` for one to
    /// appear.
    async fn sorted_set_pop_min(
        &self,
        set: &str,
        timeout: Duration,
    ) -> Result<Option<(f64, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(hit) = self.sorted_set_try_pop_min(set).await? {
                return Ok(Some(hit));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
