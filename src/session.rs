//! Recording Sessions
//!
//! Session metadata lives in SQLite. The control plane creates sessions,
//! ingestion is the only writer of `samples_seen` and the quality
//! summary, and closure seals the row. Retention default is forever; the
//! PII purge path removes raw data for a subject while the ledger keeps
//! its own record.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::chunk::SessionShape;
use crate::error::{EngineError, Result};
use crate::util::now_ns;

/// Lifecycle status of a session row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "closed" => SessionStatus::Closed,
            _ => SessionStatus::Active,
        }
    }
}

/// One recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    /// Anonymized subject id; never the raw user id
    pub subject_anon: String,
    pub device_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paradigm: Option<String>,
    pub status: SessionStatus,
    pub started_ns: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_ns: Option<i64>,
    pub samples_seen: i64,
    /// Running mean of per-chunk overall quality
    pub quality_summary: f64,
    /// Shape fixed by the first ingested chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<SessionShape>,
    /// Bumped on every mutation; returned by the control plane
    pub version: i64,
}

/// SQLite-backed session metadata store
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub async fn connect(url: &str) -> Result<Self> {
        // In-memory databases are per-connection; a larger pool would
        // hand each query a different empty database.
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
            CREATE TABLE IF NOT EXISTS sessions (
                session_id      TEXT PRIMARY KEY,
                subject_anon    TEXT NOT NULL,
                device_ids      TEXT NOT NULL,
                paradigm        TEXT,
                status          TEXT NOT NULL,
                started_ns      INTEGER NOT NULL,
                ended_ns        INTEGER,
                samples_seen    INTEGER NOT NULL DEFAULT 0,
                quality_sum     REAL NOT NULL DEFAULT 0,
                quality_chunks  INTEGER NOT NULL DEFAULT 0,
                shape           TEXT,
                version         INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_subject ON sessions (subject_anon, started_ns DESC)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create a new active session and return its id
    pub async fn create(
        &self,
        subject_anon: &str,
        device_ids: &[String],
        paradigm: Option<&str>,
    ) -> Result<Session> {
        let session_id = Uuid::now_v7().to_string();
        self.create_with_id(&session_id, subject_anon, device_ids, paradigm)
            .await
    }

    /// Create a session under a caller-chosen id, for ingestion
    /// auto-create where the stream already carries its session id.
    pub async fn create_with_id(
        &self,
        session_id: &str,
        subject_anon: &str,
        device_ids: &[String],
        paradigm: Option<&str>,
    ) -> Result<Session> {
        let started_ns = now_ns();
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, subject_anon, device_ids, paradigm, status, started_ns)
            VALUES (?1, ?2, ?3, ?4, 'active', ?5)
            "#,
        )
        .bind(session_id)
        .bind(subject_anon)
        .bind(serde_json::to_string(device_ids)?)
        .bind(paradigm)
        .bind(started_ns)
        .execute(&self.pool)
        .await?;
        self.get(session_id).await
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        Self::row_to_session(&row)
    }

    pub async fn list_active(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE status = 'active' ORDER BY started_ns DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_session).collect()
    }

    /// Fix the session shape on the first chunk; later chunks only verify
    pub async fn set_shape(&self, session_id: &str, shape: &SessionShape) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE sessions SET shape = ?2, version = version + 1 \
             WHERE session_id = ?1 AND shape IS NULL",
        )
        .bind(session_id)
        .bind(serde_json::to_string(shape)?)
        .execute(&self.pool)
        .await?;
        let _ = updated;
        Ok(())
    }

    /// Ingestion-side counters: samples seen plus the quality running mean
    pub async fn record_chunk(
        &self,
        session_id: &str,
        samples: i64,
        quality_overall: f64,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE sessions SET
                samples_seen = samples_seen + ?2,
                quality_sum = quality_sum + ?3,
                quality_chunks = quality_chunks + 1,
                version = version + 1
            WHERE session_id = ?1 AND status = 'active'
            "#,
        )
        .bind(session_id)
        .bind(samples)
        .bind(quality_overall)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::SessionConflict {
                message: format!("session {session_id} is not active"),
            });
        }
        Ok(())
    }

    /// Close an active session. Closing twice is a conflict.
    pub async fn close(&self, session_id: &str) -> Result<Session> {
        let updated = sqlx::query(
            "UPDATE sessions SET status = 'closed', ended_ns = ?2, version = version + 1 \
             WHERE session_id = ?1 AND status = 'active'",
        )
        .bind(session_id)
        .bind(now_ns())
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            // Distinguish missing from already-closed for the caller
            let existing = self.get(session_id).await?;
            return Err(EngineError::SessionConflict {
                message: format!(
                    "session {session_id} is already {}",
                    match existing.status {
                        SessionStatus::Closed => "closed",
                        SessionStatus::Active => "active",
                    }
                ),
            });
        }
        self.get(session_id).await
    }

    /// Session ids belonging to an anonymized subject, for the purge path
    pub async fn sessions_for_subject(&self, subject_anon: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT session_id FROM sessions WHERE subject_anon = ?1")
            .bind(subject_anon)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("session_id")).collect())
    }

    /// Remove session rows for a purged subject
    pub async fn purge_subject(&self, subject_anon: &str) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM sessions WHERE subject_anon = ?1")
            .bind(subject_anon)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
        let device_ids: Vec<String> = serde_json::from_str(&row.get::<String, _>("device_ids"))?;
        let shape: Option<SessionShape> = match row.get::<Option<String>, _>("shape") {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        };
        let quality_sum: f64 = row.get("quality_sum");
        let quality_chunks: i64 = row.get("quality_chunks");
        Ok(Session {
            session_id: row.get("session_id"),
            subject_anon: row.get("subject_anon"),
            device_ids,
            paradigm: row.get("paradigm"),
            status: SessionStatus::parse(&row.get::<String, _>("status")),
            started_ns: row.get("started_ns"),
            ended_ns: row.get("ended_ns"),
            samples_seen: row.get("samples_seen"),
            quality_summary: if quality_chunks > 0 {
                quality_sum / quality_chunks as f64
            } else {
                0.0
            },
            shape,
            version: row.get("version"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::DataType;

    async fn store() -> SessionStore {
        SessionStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store().await;
        let session = store
            .create("anon-1", &["dev-a".to_string()], Some("motor-imagery"))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.samples_seen, 0);
        let fetched = store.get(&session.session_id).await.unwrap();
        assert_eq!(fetched.paradigm.as_deref(), Some("motor-imagery"));
        assert_eq!(fetched.device_ids, vec!["dev-a".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let store = store().await;
        match store.get("nope").await {
            Err(EngineError::SessionNotFound { session_id }) => assert_eq!(session_id, "nope"),
            other => panic!("expected SessionNotFound, got {:?}", other.map(|s| s.session_id)),
        }
    }

    #[tokio::test]
    async fn test_record_chunk_accumulates() {
        let store = store().await;
        let session = store.create("anon-1", &[], None).await.unwrap();
        store.record_chunk(&session.session_id, 500, 0.9).await.unwrap();
        store.record_chunk(&session.session_id, 500, 0.7).await.unwrap();
        let fetched = store.get(&session.session_id).await.unwrap();
        assert_eq!(fetched.samples_seen, 1000);
        assert!((fetched.quality_summary - 0.8).abs() < 1e-9);
        assert!(fetched.version > session.version);
    }

    #[tokio::test]
    async fn test_close_once_then_conflict() {
        let store = store().await;
        let session = store.create("anon-1", &[], None).await.unwrap();
        let closed = store.close(&session.session_id).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.ended_ns.is_some());
        assert!(matches!(
            store.close(&session.session_id).await,
            Err(EngineError::SessionConflict { .. })
        ));
        // A closed session no longer accepts chunks
        assert!(store
            .record_chunk(&session.session_id, 1, 0.5)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_shape_set_once() {
        let store = store().await;
        let session = store.create("anon-1", &[], None).await.unwrap();
        let shape = SessionShape {
            data_type: DataType::Eeg,
            sampling_rate_hz: 1000,
            channel_count: 8,
        };
        store.set_shape(&session.session_id, &shape).await.unwrap();
        let other = SessionShape {
            data_type: DataType::Emg,
            sampling_rate_hz: 500,
            channel_count: 4,
        };
        // Second write is a no-op; the first shape wins
        store.set_shape(&session.session_id, &other).await.unwrap();
        let fetched = store.get(&session.session_id).await.unwrap();
        assert_eq!(fetched.shape, Some(shape));
    }

    #[tokio::test]
    async fn test_purge_subject() {
        let store = store().await;
        let a = store.create("anon-a", &[], None).await.unwrap();
        let _b = store.create("anon-b", &[], None).await.unwrap();
        assert_eq!(
            store.sessions_for_subject("anon-a").await.unwrap(),
            vec![a.session_id.clone()]
        );
        assert_eq!(store.purge_subject("anon-a").await.unwrap(), 1);
        assert!(store.get(&a.session_id).await.is_err());
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }
}
