use std::collections::HashMap;

use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};

use super::{Result, Store};

/// Redis-backed store. ZPOPMIN is atomic server-side.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    pub async fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key_prefix: String::new(),
        })
    }

    /// Namespace every key, e.g. to share one Redis between environments
    pub fn with_key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, name: &str) -> String {
        if self.key_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}:{}", self.key_prefix, name)
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hash_set(&self, map: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(self.key(map), field, value).await?;
        Ok(())
    }

    async fn hash_get(&self, map: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(self.key(map), field).await?)
    }

    async fn hash_get_all(&self, map: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(self.key(map)).await?)
    }

    async fn hash_delete(&self, map: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(self.key(map), field).await?;
        Ok(removed > 0)
    }

    async fn sorted_set_add(&self, set: &str, score: f64, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(self.key(set), member, score).await?;
        Ok(())
    }

    async fn sorted_set_remove(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(self.key(set), member).await?;
        Ok(removed > 0)
    }

    // BZPOPMIN would stall the multiplexed connection, so blocking pops go
    // through the trait's polling default on top of ZPOPMIN.
    async fn sorted_set_try_pop_min(&self, set: &str) -> Result<Option<(f64, String)>> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(self.key(set), 1).await?;
        Ok(popped.into_iter().next().map(|(member, score)| (score, member)))
    }

    async fn sorted_set_range_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let count = limit.min(isize::MAX as usize) as isize;
        Ok(conn
            .zrangebyscore_limit(self.key(set), min, max, 0, count)
            .await?)
    }

    async fn sorted_set_count(&self, set: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(self.key(set)).await?)
    }
}
