use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::{Result, Store};

/// Store persisted in SQLite.
///
/// Hash maps and sorted sets each live in one table keyed by name; pop-min
/// is a single `DELETE ... RETURNING` statement, which SQLite executes under
/// its write lock.
pub struct SqliteStore {
    pub pool: SqlitePool,
}

impl SqliteStore {
    /// Connection settings are applied per pooled connection, so every
    /// connection gets WAL and the busy timeout.
    pub async fn new(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Every pooled connection to `sqlite::memory:` opens its own database,
    /// so the in-memory store is pinned to a single connection that is never
    /// recycled.
    pub async fn in_memory() -> std::result::Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> std::result::Result<Self, sqlx::Error> {
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_hashes (
                name TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (name, field)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_zsets (
                name TEXT NOT NULL,
                member TEXT NOT NULL,
                score REAL NOT NULL,
                PRIMARY KEY (name, member)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_kv_zsets_name_score ON kv_zsets(name, score, member)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn hash_set(&self, map: &str, field: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_hashes (name, field, value)
            VALUES (?, ?, ?)
            ON CONFLICT(name, field) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(map)
        .bind(field)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn hash_get(&self, map: &str, field: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM kv_hashes WHERE name = ? AND field = ?")
                .bind(map)
                .bind(field)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value)
    }

    async fn hash_get_all(&self, map: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT field, value FROM kv_hashes WHERE name = ?")
            .bind(map)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("field"), row.get("value")))
            .collect())
    }

    async fn hash_delete(&self, map: &str, field: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_hashes WHERE name = ? AND field = ?")
            .bind(map)
            .bind(field)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn sorted_set_add(&self, set: &str, score: f64, member: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_zsets (name, member, score)
            VALUES (?, ?, ?)
            ON CONFLICT(name, member) DO UPDATE SET score = excluded.score
            "#,
        )
        .bind(set)
        .bind(member)
        .bind(score)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn sorted_set_remove(&self, set: &str, member: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_zsets WHERE name = ? AND member = ?")
            .bind(set)
            .bind(member)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn sorted_set_try_pop_min(&self, set: &str) -> Result<Option<(f64, String)>> {
        let row = sqlx::query(
            r#"
            DELETE FROM kv_zsets
            WHERE rowid = (
                SELECT rowid FROM kv_zsets
                WHERE name = ?
                ORDER BY score ASC, member ASC
                LIMIT 1
            )
            RETURNING member, score
            "#,
        )
        .bind(set)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| (row.get("score"), row.get("member"))))
    }

    async fn sorted_set_range_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let members: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT member FROM kv_zsets
            WHERE name = ? AND score >= ? AND score <= ?
            ORDER BY score ASC, member ASC
            LIMIT ?
            "#,
        )
        .bind(set)
        .bind(min)
        .bind(max)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(members)
    }

    async fn sorted_set_count(&self, set: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_zsets WHERE name = ?")
            .bind(set)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}
