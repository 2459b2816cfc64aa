//! Ledger Stores
//!
//! Three materializations of one chain. The time-series chain store is
//! the ground truth for `prev_hash`/`seq`; the analytical store is the
//! append-only table queries run against; the document index serves
//! per-session and per-subject lookups. `verify` replays a range,
//! recomputing every hash and cross-checking the stores against each
//! other.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::Result;
use crate::ledger::{LedgerEvent, Signer, GENESIS_HASH};

// ============================================================================
// Verification outcome
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub first_bad_seq: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerifyOutcome {
    Ok { checked: u64 },
    Violation(Violation),
}

impl VerifyOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, VerifyOutcome::Ok { .. })
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
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

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<()> {
        // Time-series chain store: ground truth for chain state
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_chain (
                shard           INTEGER NOT NULL,
                seq             INTEGER NOT NULL,
                row_key         TEXT NOT NULL,
                event           TEXT NOT NULL,
                chain           BLOB NOT NULL,
                PRIMARY KEY (shard, seq)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Analytical store: append-only, day-partitioned
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_analytical (
                event_id        TEXT PRIMARY KEY,
                day             TEXT NOT NULL,
                ts_ns           INTEGER NOT NULL,
                shard           INTEGER NOT NULL,
                seq             INTEGER NOT NULL,
                event_type      TEXT NOT NULL,
                session_id      TEXT,
                user_id         TEXT,
                event           TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_analytical_cluster \
             ON ledger_analytical (day, event_type, session_id)",
        )
        .execute(&self.pool)
        .await?;

        // Document index: secondary lookups
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_doc_index (
                event_id        TEXT NOT NULL,
                session_id      TEXT,
                user_id         TEXT,
                ts_ns           INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_doc_session ON ledger_doc_index (session_id, ts_ns DESC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_doc_user ON ledger_doc_index (user_id, ts_ns DESC)",
        )
        .execute(&self.pool)
        .await?;

        // Processed intents, for idempotent replay
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_intents (
                intent_id       TEXT PRIMARY KEY,
                shard           INTEGER NOT NULL,
                seq             INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Cross-shard root chain
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_roots (
                root_seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_ns           INTEGER NOT NULL,
                tips            TEXT NOT NULL,
                prev_root       BLOB NOT NULL,
                root_hash       BLOB NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Row key in the time-series store: reverse-sequenced so the newest
    /// row sorts first within a shard prefix.
    pub fn row_key(shard: u32, seq: u64) -> String {
        format!("ledger/{}/{:020}", shard, u64::MAX - seq)
    }

    /// Atomically materialize one event into all three stores and mark
    /// its intent as processed.
    pub async fn append(&self, event: &LedgerEvent, intent_id: &Uuid) -> Result<()> {
        let event_json = serde_json::to_string(event)?;
        let day = day_of(event.ts_ns);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO ledger_chain (shard, seq, row_key, event, chain) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(event.shard)
        .bind(event.seq as i64)
        .bind(Self::row_key(event.shard, event.seq))
        .bind(&event_json)
        .bind(event.event_hash.as_slice())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO ledger_analytical \
             (event_id, day, ts_ns, shard, seq, event_type, session_id, user_id, event) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(event.event_id.to_string())
        .bind(&day)
        .bind(event.ts_ns)
        .bind(event.shard)
        .bind(event.seq as i64)
        .bind(event.event_type.as_str())
        .bind(&event.session_id)
        .bind(&event.user_id)
        .bind(&event_json)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO ledger_doc_index (event_id, session_id, user_id, ts_ns) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event.event_id.to_string())
        .bind(&event.session_id)
        .bind(&event.user_id)
        .bind(event.ts_ns)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO ledger_intents (intent_id, shard, seq) VALUES (?1, ?2, ?3)")
            .bind(intent_id.to_string())
            .bind(event.shard)
            .bind(event.seq as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Chain tip of a shard from the ground-truth store
    pub async fn tip(&self, shard: u32) -> Result<Option<(u64, [u8; 32])>> {
        let row = sqlx::query(
            "SELECT seq, chain FROM ledger_chain WHERE shard = ?1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(shard)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| {
            let seq: i64 = r.get("seq");
            let chain: Vec<u8> = r.get("chain");
            (seq as u64, to_hash(&chain))
        }))
    }

    /// Event at a given position, decoded from the chain store
    pub async fn chain_event(&self, shard: u32, seq: u64) -> Result<Option<LedgerEvent>> {
        let row = sqlx::query("SELECT event FROM ledger_chain WHERE shard = ?1 AND seq = ?2")
            .bind(shard)
            .bind(seq as i64)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(Some(serde_json::from_str(&r.get::<String, _>("event"))?)),
            None => Ok(None),
        }
    }

    /// Was this intent already materialized? Returns its position.
    pub async fn intent_position(&self, intent_id: &Uuid) -> Result<Option<(u32, u64)>> {
        let row = sqlx::query("SELECT shard, seq FROM ledger_intents WHERE intent_id = ?1")
            .bind(intent_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get::<i64, _>("shard") as u32, r.get::<i64, _>("seq") as u64)))
    }

    /// Events of one shard in `[from_seq, to_seq]`, read from the
    /// analytical store in sequence order.
    pub async fn analytical_range(
        &self,
        shard: u32,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<LedgerEvent>> {
        let rows = sqlx::query(
            "SELECT event FROM ledger_analytical \
             WHERE shard = ?1 AND seq >= ?2 AND seq <= ?3 ORDER BY seq ASC",
        )
        .bind(shard)
        .bind(from_seq as i64)
        .bind(to_seq as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("event"))?))
            .collect()
    }

    /// Per-session lookup through the document index
    pub async fn events_for_session(&self, session_id: &str) -> Result<Vec<LedgerEvent>> {
        let rows = sqlx::query(
            "SELECT a.event FROM ledger_doc_index d \
             JOIN ledger_analytical a ON a.event_id = d.event_id \
             WHERE d.session_id = ?1 ORDER BY d.ts_ns DESC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("event"))?))
            .collect()
    }

    /// Per-subject lookup through the document index
    pub async fn events_for_user(&self, user_id_anon: &str) -> Result<Vec<LedgerEvent>> {
        let rows = sqlx::query(
            "SELECT a.event FROM ledger_doc_index d \
             JOIN ledger_analytical a ON a.event_id = d.event_id \
             WHERE d.user_id = ?1 ORDER BY d.ts_ns DESC",
        )
        .bind(user_id_anon)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| Ok(serde_json::from_str(&r.get::<String, _>("event"))?))
            .collect()
    }

    /// Drop analytical partitions older than the retention horizon
    /// (default seven years). The chain store is never expired.
    pub async fn expire_analytical(&self, before_day: &str) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM ledger_analytical WHERE day < ?1")
            .bind(before_day)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }

    // ------------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------------

    /// Replay `[from_seq, to_seq]` of a shard: recompute every event
    /// hash, check chain linkage, cross-check the analytical store
    /// against the chain store, and verify signatures when a signer is
    /// available.
    pub async fn verify(
        &self,
        shard: u32,
        from_seq: u64,
        to_seq: u64,
        signer: Option<&dyn Signer>,
    ) -> Result<VerifyOutcome> {
        let events = self.analytical_range(shard, from_seq, to_seq).await?;

        let mut expected_prev = if from_seq == 0 {
            GENESIS_HASH
        } else {
            match self.chain_event(shard, from_seq - 1).await? {
                Some(prev) => prev.event_hash,
                None => {
                    return Ok(VerifyOutcome::Violation(Violation {
                        first_bad_seq: from_seq,
                        reason: "missing_predecessor".to_string(),
                    }))
                }
            }
        };

        let mut expected_seq = from_seq;
        let mut checked = 0u64;
        for event in &events {
            if event.seq != expected_seq {
                return Ok(VerifyOutcome::Violation(Violation {
                    first_bad_seq: expected_seq,
                    reason: "missing_event".to_string(),
                }));
            }
            if event.prev_hash != expected_prev {
                return Ok(VerifyOutcome::Violation(Violation {
                    first_bad_seq: event.seq,
                    reason: "chain_break".to_string(),
                }));
            }
            if event.computed_hash() != event.event_hash {
                return Ok(VerifyOutcome::Violation(Violation {
                    first_bad_seq: event.seq,
                    reason: "hash_mismatch".to_string(),
                }));
            }
            // Cross-store check against the ground truth
            match self.chain_event(shard, event.seq).await? {
                Some(truth) if truth.event_hash == event.event_hash => {}
                Some(_) => {
                    return Ok(VerifyOutcome::Violation(Violation {
                        first_bad_seq: event.seq,
                        reason: "store_divergence".to_string(),
                    }))
                }
                None => {
                    return Ok(VerifyOutcome::Violation(Violation {
                        first_bad_seq: event.seq,
                        reason: "missing_event".to_string(),
                    }))
                }
            }
            if let (Some(signer), Some(signature)) = (signer, &event.signature) {
                if !signer.verify(&event.event_hash, signature).await? {
                    return Ok(VerifyOutcome::Violation(Violation {
                        first_bad_seq: event.seq,
                        reason: "signature_invalid".to_string(),
                    }));
                }
            }
            expected_prev = event.event_hash;
            expected_seq = event.seq + 1;
            checked += 1;
        }

        Ok(VerifyOutcome::Ok { checked })
    }

    // ------------------------------------------------------------------------
    // Root chain
    // ------------------------------------------------------------------------

    /// Bind the current tip of every shard into the root chain
    pub async fn append_root(&self, ts_ns: i64, tips: &[(u32, u64, [u8; 32])]) -> Result<[u8; 32]> {
        use sha2::{Digest, Sha256};

        let prev_root: [u8; 32] = {
            let row = sqlx::query(
                "SELECT root_hash FROM ledger_roots ORDER BY root_seq DESC LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?;
            row.map(|r| to_hash(&r.get::<Vec<u8>, _>("root_hash")))
                .unwrap_or(GENESIS_HASH)
        };

        let mut hasher = Sha256::new();
        hasher.update(prev_root);
        for (shard, seq, hash) in tips {
            hasher.update(shard.to_le_bytes());
            hasher.update(seq.to_le_bytes());
            hasher.update(hash);
        }
        let root_hash: [u8; 32] = hasher.finalize().into();

        let tips_json = serde_json::to_string(
            &tips
                .iter()
                .map(|(shard, seq, hash)| {
                    serde_json::json!({
                        "shard": shard,
                        "seq": seq,
                        "hash": hex::encode(hash),
                    })
                })
                .collect::<Vec<_>>(),
        )?;

        sqlx::query(
            "INSERT INTO ledger_roots (ts_ns, tips, prev_root, root_hash) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(ts_ns)
        .bind(tips_json)
        .bind(prev_root.as_slice())
        .bind(root_hash.as_slice())
        .execute(&self.pool)
        .await?;
        Ok(root_hash)
    }
}

fn to_hash(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let n = bytes.len().min(32);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// UTC day partition key for a nanosecond timestamp
fn day_of(ts_ns: i64) -> String {
    use chrono::{TimeZone, Utc};
    Utc.timestamp_nanos(ts_ns).format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{hash_event, EventType};

    async fn store() -> LedgerStore {
        LedgerStore::connect("sqlite::memory:").await.unwrap()
    }

    fn build_event(seq: u64, prev_hash: [u8; 32]) -> (LedgerEvent, Uuid) {
        let event_id = Uuid::now_v7();
        let metadata = serde_json::json!({"n": seq});
        let ts_ns = 1_700_000_000_000_000_000 + seq as i64;
        let event_hash = hash_event(
            &event_id,
            ts_ns,
            EventType::DataIngested,
            Some("sess-1"),
            Some("dev-1"),
            Some("anon-1"),
            None,
            &metadata,
            &prev_hash,
        );
        (
            LedgerEvent {
                event_id,
                seq,
                shard: 0,
                ts_ns,
                event_type: EventType::DataIngested,
                session_id: Some("sess-1".to_string()),
                device_id: Some("dev-1".to_string()),
                user_id: Some("anon-1".to_string()),
                data_hash: None,
                metadata,
                prev_hash,
                event_hash,
                signature: None,
                signing_key_id: None,
            },
            Uuid::new_v4(),
        )
    }

    async fn fill(store: &LedgerStore, count: u64) -> Vec<LedgerEvent> {
        let mut prev = GENESIS_HASH;
        let mut events = Vec::new();
        for seq in 0..count {
            let (event, intent) = build_event(seq, prev);
            store.append(&event, &intent).await.unwrap();
            prev = event.event_hash;
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_append_and_tip() {
        let store = store().await;
        assert_eq!(store.tip(0).await.unwrap(), None);
        let events = fill(&store, 3).await;
        let (seq, hash) = store.tip(0).await.unwrap().unwrap();
        assert_eq!(seq, 2);
        assert_eq!(hash, events[2].event_hash);
    }

    #[tokio::test]
    async fn test_row_key_reverse_sorts() {
        let newer = LedgerStore::row_key(0, 100);
        let older = LedgerStore::row_key(0, 99);
        // Newest first in lexicographic order
        assert!(newer < older);
    }

    #[tokio::test]
    async fn test_verify_ok() {
        let store = store().await;
        fill(&store, 10).await;
        let outcome = store.verify(0, 0, 9, None).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Ok { checked: 10 });
    }

    #[tokio::test]
    async fn test_verify_subrange_uses_predecessor() {
        let store = store().await;
        fill(&store, 10).await;
        let outcome = store.verify(0, 4, 9, None).await.unwrap();
        assert_eq!(outcome, VerifyOutcome::Ok { checked: 6 });
    }

    #[tokio::test]
    async fn test_tampered_metadata_detected() {
        let store = store().await;
        let events = fill(&store, 10).await;

        // Mutate event 5 in the analytical store
        let mut tampered = events[5].clone();
        tampered.metadata = serde_json::json!({"n": 999});
        sqlx::query("UPDATE ledger_analytical SET event = ?1 WHERE seq = 5")
            .bind(serde_json::to_string(&tampered).unwrap())
            .execute(store.pool())
            .await
            .unwrap();

        match store.verify(0, 0, 9, None).await.unwrap() {
            VerifyOutcome::Violation(v) => {
                assert_eq!(v.first_bad_seq, 5);
                assert_eq!(v.reason, "hash_mismatch");
            }
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rehashed_tamper_still_detected() {
        // An attacker who also fixes event_hash breaks the link to seq 6
        let store = store().await;
        let events = fill(&store, 10).await;
        let mut tampered = events[5].clone();
        tampered.metadata = serde_json::json!({"n": 999});
        tampered.event_hash = tampered.computed_hash();
        sqlx::query("UPDATE ledger_analytical SET event = ?1 WHERE seq = 5")
            .bind(serde_json::to_string(&tampered).unwrap())
            .execute(store.pool())
            .await
            .unwrap();

        match store.verify(0, 0, 9, None).await.unwrap() {
            // Divergence from the chain store is caught at 5, or the
            // break surfaces at 6; either way the chain fails
            VerifyOutcome::Violation(v) => {
                assert!(v.first_bad_seq == 5 || v.first_bad_seq == 6);
            }
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_event_detected() {
        let store = store().await;
        fill(&store, 10).await;
        sqlx::query("DELETE FROM ledger_analytical WHERE seq = 3")
            .execute(store.pool())
            .await
            .unwrap();
        match store.verify(0, 0, 9, None).await.unwrap() {
            VerifyOutcome::Violation(v) => {
                assert_eq!(v.first_bad_seq, 3);
                assert_eq!(v.reason, "missing_event");
            }
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_signature_verification() {
        use crate::ledger::HmacSigner;

        let store = store().await;
        let signer = HmacSigner::new("k1", "secret");
        let (mut event, intent) = build_event(0, GENESIS_HASH);
        event.signature = Some(signer.sign(&event.event_hash).await.unwrap());
        event.signing_key_id = Some("k1".to_string());
        store.append(&event, &intent).await.unwrap();

        let ok = store.verify(0, 0, 0, Some(&signer)).await.unwrap();
        assert!(ok.is_ok());

        let wrong = HmacSigner::new("k2", "other-secret");
        match store.verify(0, 0, 0, Some(&wrong)).await.unwrap() {
            VerifyOutcome::Violation(v) => assert_eq!(v.reason, "signature_invalid"),
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_intent_idempotency_position() {
        let store = store().await;
        let (event, intent) = build_event(0, GENESIS_HASH);
        assert_eq!(store.intent_position(&intent).await.unwrap(), None);
        store.append(&event, &intent).await.unwrap();
        assert_eq!(store.intent_position(&intent).await.unwrap(), Some((0, 0)));
    }

    #[tokio::test]
    async fn test_document_index_lookups() {
        let store = store().await;
        fill(&store, 5).await;
        let by_session = store.events_for_session("sess-1").await.unwrap();
        assert_eq!(by_session.len(), 5);
        let by_user = store.events_for_user("anon-1").await.unwrap();
        assert_eq!(by_user.len(), 5);
        assert!(store.events_for_session("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_root_chain_links() {
        let store = store().await;
        let events = fill(&store, 3).await;
        let tip = events[2].event_hash;
        let r1 = store.append_root(1, &[(0, 2, tip)]).await.unwrap();
        let r2 = store.append_root(2, &[(0, 2, tip)]).await.unwrap();
        // Same tips, different prev_root: the chain advances
        assert_ne!(r1, r2);
    }
}
