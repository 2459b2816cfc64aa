//! Neural Ledger
//!
//! Tamper-evident audit trail: every data-affecting event becomes a
//! hash-chained record, optionally signed, materialized into a
//! time-series chain store, an append-only analytical store and a
//! document index. A single writer per shard owns `prev_hash` and `seq`;
//! everyone else reads.

pub mod signer;
pub mod store;
pub mod writer;

pub use signer::{HmacSigner, KmsSigner, Signer};
pub use store::{LedgerStore, VerifyOutcome, Violation};
pub use writer::{LedgerHandle, LedgerWriter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// All-zero hash preceding the genesis event of a shard
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

// ============================================================================
// Event model
// ============================================================================

/// Every auditable event class the engine emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionCreated,
    SessionClosed,
    DeviceConnected,
    DeviceDisconnected,
    DataIngested,
    FeaturesComputed,
    AnomalyDetected,
    AccessGranted,
    AccessDenied,
    KeyRotated,
    BatchUploaded,
    PurgeExecuted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionCreated => "session_created",
            EventType::SessionClosed => "session_closed",
            EventType::DeviceConnected => "device_connected",
            EventType::DeviceDisconnected => "device_disconnected",
            EventType::DataIngested => "data_ingested",
            EventType::FeaturesComputed => "features_computed",
            EventType::AnomalyDetected => "anomaly_detected",
            EventType::AccessGranted => "access_granted",
            EventType::AccessDenied => "access_denied",
            EventType::KeyRotated => "key_rotated",
            EventType::BatchUploaded => "batch_uploaded",
            EventType::PurgeExecuted => "purge_executed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            EventType::SessionCreated,
            EventType::SessionClosed,
            EventType::DeviceConnected,
            EventType::DeviceDisconnected,
            EventType::DataIngested,
            EventType::FeaturesComputed,
            EventType::AnomalyDetected,
            EventType::AccessGranted,
            EventType::AccessDenied,
            EventType::KeyRotated,
            EventType::BatchUploaded,
            EventType::PurgeExecuted,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
    }
}

/// What a component asks the ledger to record. Idempotent by
/// `intent_id`: replaying a persisted intent is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerIntent {
    pub intent_id: Uuid,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Anonymized subject, never a raw user id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_hash: Option<[u8; 32]>,
    pub metadata: serde_json::Value,
}

impl LedgerIntent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            intent_id: Uuid::new_v4(),
            event_type,
            session_id: None,
            device_id: None,
            user_id: None,
            data_hash: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn user(mut self, user_id_anon: impl Into<String>) -> Self {
        self.user_id = Some(user_id_anon.into());
        self
    }

    pub fn data(mut self, data_hash: [u8; 32]) -> Self {
        self.data_hash = Some(data_hash);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One persisted, chained event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub event_id: Uuid,
    pub seq: u64,
    pub shard: u32,
    pub ts_ns: i64,
    pub event_type: EventType,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub user_id: Option<String>,
    pub data_hash: Option<[u8; 32]>,
    pub metadata: serde_json::Value,
    pub prev_hash: [u8; 32],
    pub event_hash: [u8; 32],
    pub signature: Option<Vec<u8>>,
    pub signing_key_id: Option<String>,
}

impl LedgerEvent {
    /// Recompute this event's hash from its canonical bytes
    pub fn computed_hash(&self) -> [u8; 32] {
        hash_event(
            &self.event_id,
            self.ts_ns,
            self.event_type,
            self.session_id.as_deref(),
            self.device_id.as_deref(),
            self.user_id.as_deref(),
            self.data_hash.as_ref(),
            &self.metadata,
            &self.prev_hash,
        )
    }
}

// ============================================================================
// Canonical encoding
// ============================================================================

/// Canonical byte layout, fixed field order:
/// `event_id (16B) | ts_ns (8B LE) | event_type | session_id | device_id |
///  user_id | data_hash (32B, zero when absent) | metadata (sorted-keys
///  canonical JSON) | prev_hash (32B)`.
/// Variable-length strings are uvarint-length-prefixed UTF-8; absent
/// string fields encode as empty.
#[allow(clippy::too_many_arguments)]
pub fn canonical_bytes(
    event_id: &Uuid,
    ts_ns: i64,
    event_type: EventType,
    session_id: Option<&str>,
    device_id: Option<&str>,
    user_id: Option<&str>,
    data_hash: Option<&[u8; 32]>,
    metadata: &serde_json::Value,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(160);
    out.extend_from_slice(event_id.as_bytes());
    out.extend_from_slice(&ts_ns.to_le_bytes());
    put_str(&mut out, event_type.as_str());
    put_str(&mut out, session_id.unwrap_or(""));
    put_str(&mut out, device_id.unwrap_or(""));
    put_str(&mut out, user_id.unwrap_or(""));
    out.extend_from_slice(data_hash.unwrap_or(&GENESIS_HASH));
    let json = canonical_json(metadata);
    put_str(&mut out, &json);
    out
}

#[allow(clippy::too_many_arguments)]
pub fn hash_event(
    event_id: &Uuid,
    ts_ns: i64,
    event_type: EventType,
    session_id: Option<&str>,
    device_id: Option<&str>,
    user_id: Option<&str>,
    data_hash: Option<&[u8; 32]>,
    metadata: &serde_json::Value,
    prev_hash: &[u8; 32],
) -> [u8; 32] {
    let mut bytes = canonical_bytes(
        event_id, ts_ns, event_type, session_id, device_id, user_id, data_hash, metadata,
    );
    bytes.extend_from_slice(prev_hash);
    Sha256::digest(&bytes).into()
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    let mut len = s.len() as u64;
    loop {
        let byte = (len & 0x7f) as u8;
        len >>= 7;
        if len == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out.extend_from_slice(s.as_bytes());
}

/// Render JSON with recursively sorted object keys and no whitespace.
/// Numeric values keep serde_json's shortest-round-trip rendering, which
/// is stable for a given value.
pub fn canonical_json(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
