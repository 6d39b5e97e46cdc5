//! Relational session store.
//!
//! # Responsibilities
//! - One row per session attribute: (session_id, attribute_name, value)
//! - Lock-then-branch upsert inside one transaction per save
//! - Opportunistic expiry sweep on load
//!
//! # Design Decisions
//! - The sweep races concurrent loads of the same session by design: a
//!   session touched between the sweep's cutoff computation and its
//!   DELETE can lose rows. Accepted; the window is one statement wide
//!   and the casualty is an idle-for-exactly-timeout session.
//! - SQL text is precomputed per dialect at startup so the hot path
//!   only binds parameters

use std::collections::HashMap;

use bytes::Bytes;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};

use crate::config::schema::RelationalConfig;
use crate::store::{SessionStore, StoreError};

/// Statement text for one SQL dialect.
///
/// The row-lock clause is the only thing that differs: the embedded
/// database used in tests has no `FOR UPDATE`.
pub struct SessionSql {
    select_for_update: String,
    select_all: String,
    insert: String,
    update: String,
    delete_attribute: String,
    touch: String,
    sweep: String,
}

impl SessionSql {
    pub fn postgres(table: &str) -> Self {
        Self::build(table, " FOR UPDATE")
    }

    pub fn sqlite(table: &str) -> Self {
        Self::build(table, "")
    }

    /// Pick the dialect from the connection URL scheme.
    pub fn for_url(url: &str, table: &str) -> Self {
        if url.starts_with("postgres") {
            Self::postgres(table)
        } else {
            Self::sqlite(table)
        }
    }

    fn build(table: &str, lock_clause: &str) -> Self {
        Self {
            select_for_update: format!(
                "SELECT value FROM {table} WHERE session_id = $1 AND attribute_name = $2{lock_clause}"
            ),
            select_all: format!(
                "SELECT attribute_name, value FROM {table} WHERE session_id = $1"
            ),
            insert: format!(
                "INSERT INTO {table} (session_id, attribute_name, value, last_access) \
                 VALUES ($1, $2, $3, $4)"
            ),
            update: format!(
                "UPDATE {table} SET value = $1, last_access = $2 \
                 WHERE session_id = $3 AND attribute_name = $4"
            ),
            delete_attribute: format!(
                "DELETE FROM {table} WHERE session_id = $1 AND attribute_name = $2"
            ),
            touch: format!("UPDATE {table} SET last_access = $1 WHERE session_id = $2"),
            sweep: format!("DELETE FROM {table} WHERE last_access < $1"),
        }
    }
}

/// Session store backed by a relational table.
pub struct RelationalSessionStore {
    pool: AnyPool,
    sql: SessionSql,
    timeout_seconds: i64,
}

fn install_drivers() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(sqlx::any::install_default_drivers);
}

fn epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

impl RelationalSessionStore {
    /// Connect to the configured database.
    pub async fn connect(
        config: &RelationalConfig,
        timeout_seconds: i64,
    ) -> Result<Self, StoreError> {
        install_drivers();
        let pool = AnyPoolOptions::new().connect(&config.url).await?;
        let sql = SessionSql::for_url(&config.url, &config.table);
        Ok(Self::new(pool, sql, timeout_seconds))
    }

    pub fn new(pool: AnyPool, sql: SessionSql, timeout_seconds: i64) -> Self {
        Self {
            pool,
            sql,
            timeout_seconds,
        }
    }

    async fn sweep_expired(&self) -> Result<(), StoreError> {
        if self.timeout_seconds <= 0 {
            return Ok(());
        }
        let cutoff = epoch_seconds() - self.timeout_seconds;
        let swept = sqlx::query(&self.sql.sweep)
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if swept > 0 {
            tracing::debug!(rows = swept, "swept expired session rows");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionStore for RelationalSessionStore {
    async fn load(&self, session_id: &str) -> Result<HashMap<String, Bytes>, StoreError> {
        self.sweep_expired().await?;

        let rows = sqlx::query(&self.sql.select_all)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        let mut attributes = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("attribute_name")?;
            let value: Vec<u8> = row.try_get("value")?;
            attributes.insert(name, Bytes::from(value));
        }

        if !attributes.is_empty() {
            sqlx::query(&self.sql.touch)
                .bind(epoch_seconds())
                .bind(session_id)
                .execute(&self.pool)
                .await?;
        }
        tracing::debug!(session_id, attributes = attributes.len(), "session loaded");
        Ok(attributes)
    }

    async fn save(
        &self,
        session_id: &str,
        new: &[(String, Bytes)],
        removed: &[String],
    ) -> Result<(), StoreError> {
        let now = epoch_seconds();
        let mut tx = self.pool.begin().await?;

        for (name, value) in new {
            // Lock the row (where the dialect supports it) before deciding
            // between UPDATE and INSERT, so two nodes saving the same
            // attribute serialize instead of double-inserting.
            let existing = sqlx::query(&self.sql.select_for_update)
                .bind(session_id)
                .bind(name.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            if existing.is_some() {
                sqlx::query(&self.sql.update)
                    .bind(value.as_ref())
                    .bind(now)
                    .bind(session_id)
                    .bind(name.as_str())
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query(&self.sql.insert)
                    .bind(session_id)
                    .bind(name.as_str())
                    .bind(value.as_ref())
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for name in removed {
            sqlx::query(&self.sql.delete_attribute)
                .bind(session_id)
                .bind(name.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        tracing::debug!(
            session_id,
            written = new.len(),
            removed = removed.len(),
            "session saved"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store(timeout_seconds: i64) -> RelationalSessionStore {
        install_drivers();
        // A second connection would see a different empty in-memory
        // database, so the pool is pinned to one.
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE t_session (\
                 session_id TEXT NOT NULL, \
                 attribute_name TEXT NOT NULL, \
                 value BLOB NOT NULL, \
                 last_access BIGINT NOT NULL, \
                 PRIMARY KEY (session_id, attribute_name))",
        )
        .execute(&pool)
        .await
        .unwrap();
        RelationalSessionStore::new(pool, SessionSql::sqlite("t_session"), timeout_seconds)
    }

    #[tokio::test]
    async fn save_then_load_round_trip() {
        let store = memory_store(1800).await;
        store
            .save(
                "sid1",
                &[
                    ("a".to_string(), Bytes::from_static(b"1")),
                    ("b".to_string(), Bytes::from_static(b"2")),
                ],
                &[],
            )
            .await
            .unwrap();

        let attributes = store.load("sid1").await.unwrap();
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes["a"], Bytes::from_static(b"1"));
        assert_eq!(attributes["b"], Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn save_updates_existing_rows_in_place() {
        let store = memory_store(1800).await;
        store
            .save("sid1", &[("a".to_string(), Bytes::from_static(b"1"))], &[])
            .await
            .unwrap();
        store
            .save("sid1", &[("a".to_string(), Bytes::from_static(b"9"))], &[])
            .await
            .unwrap();

        let attributes = store.load("sid1").await.unwrap();
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes["a"], Bytes::from_static(b"9"));
    }

    #[tokio::test]
    async fn removed_attributes_are_deleted() {
        let store = memory_store(1800).await;
        store
            .save(
                "sid1",
                &[
                    ("a".to_string(), Bytes::from_static(b"1")),
                    ("b".to_string(), Bytes::from_static(b"2")),
                ],
                &[],
            )
            .await
            .unwrap();
        store
            .save("sid1", &[], &["a".to_string()])
            .await
            .unwrap();

        let attributes = store.load("sid1").await.unwrap();
        assert_eq!(attributes.len(), 1);
        assert!(attributes.contains_key("b"));
    }

    #[tokio::test]
    async fn sessions_are_isolated_by_id() {
        let store = memory_store(1800).await;
        store
            .save("sid1", &[("a".to_string(), Bytes::from_static(b"1"))], &[])
            .await
            .unwrap();
        store
            .save("sid2", &[("a".to_string(), Bytes::from_static(b"2"))], &[])
            .await
            .unwrap();

        assert_eq!(store.load("sid1").await.unwrap()["a"], Bytes::from_static(b"1"));
        assert_eq!(store.load("sid2").await.unwrap()["a"], Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn load_sweeps_rows_past_the_timeout() {
        let store = memory_store(60).await;
        let stale = epoch_seconds() - 120;
        sqlx::query(
            "INSERT INTO t_session (session_id, attribute_name, value, last_access) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind("old")
        .bind("a")
        .bind(&b"1"[..])
        .bind(stale)
        .execute(&store.pool)
        .await
        .unwrap();
        store
            .save("live", &[("a".to_string(), Bytes::from_static(b"1"))], &[])
            .await
            .unwrap();

        assert!(store.load("old").await.unwrap().is_empty());
        assert_eq!(store.load("live").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_timeout_never_sweeps() {
        let store = memory_store(0).await;
        let ancient = 1_000;
        sqlx::query(
            "INSERT INTO t_session (session_id, attribute_name, value, last_access) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind("old")
        .bind("a")
        .bind(&b"1"[..])
        .bind(ancient)
        .execute(&store.pool)
        .await
        .unwrap();

        assert_eq!(store.load("old").await.unwrap().len(), 1);
    }
}
