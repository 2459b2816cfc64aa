//! Derived Feature Store
//!
//! Feature frames land in a row-oriented recent table keyed by
//! `(session_id, window_start_ns)`, the idempotence key, and migrate
//! to a day-partitioned long-term table on a compaction pass. Duplicate
//! emission of a window is absorbed by the key, which is what makes the
//! pipeline's at-least-once input exactly-once downstream.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::features::FeatureFrame;

#[derive(Clone)]
pub struct DerivedStore {
    pool: SqlitePool,
}

impl DerivedStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS features_recent (
                session_id      TEXT NOT NULL,
                window_start_ns INTEGER NOT NULL,
                window_end_ns   INTEGER NOT NULL,
                data_type       TEXT NOT NULL,
                frame           TEXT NOT NULL,
                PRIMARY KEY (session_id, window_start_ns)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS features_longterm (
                session_id      TEXT NOT NULL,
                window_start_ns INTEGER NOT NULL,
                day             TEXT NOT NULL,
                data_type       TEXT NOT NULL,
                frame           TEXT NOT NULL,
                PRIMARY KEY (session_id, window_start_ns)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_longterm_day ON features_longterm (day, session_id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent insert; returns false when the window already existed
    pub async fn insert_frame(&self, frame: &FeatureFrame) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO features_recent \
             (session_id, window_start_ns, window_end_ns, data_type, frame) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&frame.session_id)
        .bind(frame.window_start_ns)
        .bind(frame.window_end_ns)
        .bind(frame.data_type.as_str())
        .bind(serde_json::to_string(frame)?)
        .execute(&self.pool)
        .await?;
        Ok(inserted.rows_affected() > 0)
    }

    /// Frames of a session ordered by window start
    pub async fn frames_for_session(&self, session_id: &str) -> Result<Vec<FeatureFrame>> {
        let rows = sqlx::query(
            "SELECT frame FROM features_recent WHERE session_id = ?1 ORDER BY window_start_ns ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("frame"))?))
            .collect()
    }

    pub async fn frame_count(&self, session_id: &str) -> Result<u64> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM features_recent WHERE session_id = ?1")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Move frames older than `before_ns` into the long-term table
    pub async fn compact_to_longterm(&self, before_ns: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let moved = sqlx::query(
            r#"
            INSERT OR IGNORE INTO features_longterm
                (session_id, window_start_ns, day, data_type, frame)
            SELECT session_id, window_start_ns,
                   strftime('%Y-%m-%d', window_start_ns / 1000000000, 'unixepoch'),
                   data_type, frame
            FROM features_recent WHERE window_start_ns < ?1
            "#,
        )
        .bind(before_ns)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM features_recent WHERE window_start_ns < ?1")
            .bind(before_ns)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(moved.rows_affected())
    }

    /// Raw-data purge support: drop a session's frames everywhere
    pub async fn purge_session(&self, session_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let recent = sqlx::query("DELETE FROM features_recent WHERE session_id = ?1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        let longterm = sqlx::query("DELETE FROM features_longterm WHERE session_id = ?1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(recent.rows_affected() + longterm.rows_affected())
    }
}
