//! Ledger Shard Writer
//!
//! One writer task per shard owns that shard's `prev_hash`/`seq` pair.
//! Components hand it `LedgerIntent`s through a `LedgerHandle`; the
//! writer assigns the sequence number, hashes, optionally signs, fans
//! out to the stores and announces the append. An integrity failure
//! locks the shard down: every further append is refused until a human
//! clears it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sha2::Digest;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::ledger::{
    hash_event, EventType, LedgerEvent, LedgerIntent, LedgerStore, Signer, GENESIS_HASH,
};
use crate::util::now_ns;

const INTENT_QUEUE_DEPTH: usize = 4096;
const APPEND_CHANNEL_DEPTH: usize = 1024;

struct Request {
    intent: LedgerIntent,
    reply: oneshot::Sender<Result<LedgerEvent>>,
}

/// Cheap-to-clone front door to the shard writers
#[derive(Clone)]
pub struct LedgerHandle {
    shards: Arc<Vec<mpsc::Sender<Request>>>,
    lockdown: Arc<Vec<Arc<AtomicBool>>>,
    appended: broadcast::Sender<LedgerEvent>,
    append_timeout: Duration,
}

impl LedgerHandle {
    /// Shard a session lands on; events without a session use shard 0
    pub fn shard_for(&self, session_id: Option<&str>) -> u32 {
        let Some(session_id) = session_id else {
            return 0;
        };
        let digest = sha2::Sha256::digest(session_id.as_bytes());
        let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        n % self.shards.len() as u32
    }

    /// Record an intent and wait for its persisted event.
    ///
    /// The append itself is never cancelled once the writer picked the
    /// intent up: abandoning a reserved sequence number would hole the
    /// chain. If the deadline expires while the write is in flight, the
    /// caller gets a transient error and a compensating
    /// `anomaly_detected{reason:"ledger_intent_aborted"}` is recorded.
    pub async fn record(&self, intent: LedgerIntent) -> Result<LedgerEvent> {
        let shard = self.shard_for(intent.session_id.as_deref());
        if self.lockdown[shard as usize].load(Ordering::SeqCst) {
            return Err(EngineError::integrity(format!(
                "ledger shard {shard} is locked down"
            )));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shards[shard as usize]
            .send(Request {
                intent: intent.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::transient("ledger writer unavailable"))?;

        match tokio::time::timeout(self.append_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::transient("ledger writer dropped the intent")),
            Err(_) => {
                // The write continues; compensate instead of cancelling
                let compensation = LedgerIntent::new(EventType::AnomalyDetected).metadata(
                    serde_json::json!({
                        "reason": "ledger_intent_aborted",
                        "intent_id": intent.intent_id.to_string(),
                    }),
                );
                let handle = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.record_nowait(compensation).await {
                        warn!("failed to record intent-abort compensation: {e}");
                    }
                });
                Err(EngineError::transient(format!(
                    "ledger append exceeded {} ms",
                    self.append_timeout.as_millis()
                )))
            }
        }
    }

    /// Fire-and-forget variant used where the caller cannot wait
    pub async fn record_nowait(&self, intent: LedgerIntent) -> Result<()> {
        let shard = self.shard_for(intent.session_id.as_deref());
        if self.lockdown[shard as usize].load(Ordering::SeqCst) {
            return Err(EngineError::integrity(format!(
                "ledger shard {shard} is locked down"
            )));
        }
        let (reply_tx, _reply_rx) = oneshot::channel();
        self.shards[shard as usize]
            .send(Request {
                intent,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::transient("ledger writer unavailable"))
    }

    /// Follow persisted events
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.appended.subscribe()
    }

    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Whether any shard refuses writes
    pub fn in_lockdown(&self) -> bool {
        self.lockdown.iter().any(|l| l.load(Ordering::SeqCst))
    }

    /// Block writes on a shard after an externally detected violation
    pub fn trigger_lockdown(&self, shard: u32) {
        if let Some(flag) = self.lockdown.get(shard as usize) {
            flag.store(true, Ordering::SeqCst);
            error!(shard, "P0: ledger shard locked down");
        }
    }

    /// Human adjudication path: re-admit writes on a shard
    pub fn clear_lockdown(&self, shard: u32) {
        if let Some(flag) = self.lockdown.get(shard as usize) {
            flag.store(false, Ordering::SeqCst);
            info!(shard, "ledger lockdown cleared");
        }
    }
}

/// Owns the writer tasks and the periodic root chain
pub struct LedgerWriter {
    handle: LedgerHandle,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl LedgerWriter {
    /// Spawn one writer per shard plus the root-chain binder. Cold start
    /// verifies each shard's tip before accepting writes.
    pub async fn spawn(
        store: LedgerStore,
        signer: Option<Arc<dyn Signer>>,
        shard_count: u32,
        append_timeout: Duration,
        root_interval: Duration,
    ) -> Result<Self> {
        let shard_count = shard_count.max(1);
        let (appended_tx, _) = broadcast::channel(APPEND_CHANNEL_DEPTH);

        let mut senders = Vec::with_capacity(shard_count as usize);
        let mut lockdown_flags = Vec::with_capacity(shard_count as usize);
        let mut tasks = Vec::new();

        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel(INTENT_QUEUE_DEPTH);
            let lockdown = Arc::new(AtomicBool::new(false));

            let state = ShardState::recover(&store, shard, &lockdown).await?;
            let task = tokio::spawn(shard_writer(
                shard,
                state,
                rx,
                store.clone(),
                signer.clone(),
                lockdown.clone(),
                appended_tx.clone(),
            ));
            senders.push(tx);
            lockdown_flags.push(lockdown);
            tasks.push(task);
        }

        // Root chain: bind every shard tip on a timer
        {
            let store = store.clone();
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(root_interval);
                ticker.tick().await; // immediate tick carries no new tips
                loop {
                    ticker.tick().await;
                    let mut tips = Vec::new();
                    for shard in 0..shard_count {
                        match store.tip(shard).await {
                            Ok(Some((seq, hash))) => tips.push((shard, seq, hash)),
                            Ok(None) => {}
                            Err(e) => warn!(shard, "root chain tip read failed: {e}"),
                        }
                    }
                    if !tips.is_empty() {
                        if let Err(e) = store.append_root(now_ns(), &tips).await {
                            warn!("root chain append failed: {e}");
                        }
                    }
                }
            });
            tasks.push(task);
        }

        Ok(Self {
            handle: LedgerHandle {
                shards: Arc::new(senders),
                lockdown: Arc::new(lockdown_flags),
                appended: appended_tx,
                append_timeout,
            },
            tasks,
        })
    }

    pub fn handle(&self) -> LedgerHandle {
        self.handle.clone()
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for LedgerWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Shard writer internals
// ============================================================================

struct ShardState {
    next_seq: u64,
    prev_hash: [u8; 32],
}

impl ShardState {
    /// Load the tip and verify the last record before accepting writes
    async fn recover(
        store: &LedgerStore,
        shard: u32,
        lockdown: &Arc<AtomicBool>,
    ) -> Result<Self> {
        match store.tip(shard).await? {
            None => Ok(Self {
                next_seq: 0,
                prev_hash: GENESIS_HASH,
            }),
            Some((seq, tip_hash)) => {
                let event = store.chain_event(shard, seq).await?.ok_or_else(|| {
                    EngineError::integrity(format!("shard {shard} tip row missing at seq {seq}"))
                })?;
                if event.computed_hash() != tip_hash {
                    // The shard starts locked; adjudication decides how
                    // the chain continues.
                    lockdown.store(true, Ordering::SeqCst);
                    error!(shard, seq, "P0: ledger tip failed cold-start verification");
                }
                Ok(Self {
                    next_seq: seq + 1,
                    prev_hash: tip_hash,
                })
            }
        }
    }
}

async fn shard_writer(
    shard: u32,
    mut state: ShardState,
    mut rx: mpsc::Receiver<Request>,
    store: LedgerStore,
    signer: Option<Arc<dyn Signer>>,
    lockdown: Arc<AtomicBool>,
    appended: broadcast::Sender<LedgerEvent>,
) {
    while let Some(Request { intent, reply }) = rx.recv().await {
        if lockdown.load(Ordering::SeqCst) {
            let _ = reply.send(Err(EngineError::integrity(format!(
                "ledger shard {shard} is locked down"
            ))));
            continue;
        }
        let result = append_one(shard, &mut state, &store, signer.as_deref(), intent).await;
        match &result {
            Ok(event) => {
                let _ = appended.send(event.clone());
            }
            Err(e) if e.is_fatal() => {
                lockdown.store(true, Ordering::SeqCst);
                error!(shard, "P0: ledger shard entering lockdown: {e}");
            }
            Err(e) => warn!(shard, "ledger append failed: {e}"),
        }
        let _ = reply.send(result);
    }
}

async fn append_one(
    shard: u32,
    state: &mut ShardState,
    store: &LedgerStore,
    signer: Option<&dyn Signer>,
    intent: LedgerIntent,
) -> Result<LedgerEvent> {
    // Idempotency: a replayed intent returns its original event
    if let Some((existing_shard, seq)) = store.intent_position(&intent.intent_id).await? {
        if let Some(event) = store.chain_event(existing_shard, seq).await? {
            return Ok(event);
        }
    }

    let event_id = Uuid::now_v7();
    let ts_ns = now_ns();
    let event_hash = hash_event(
        &event_id,
        ts_ns,
        intent.event_type,
        intent.session_id.as_deref(),
        intent.device_id.as_deref(),
        intent.user_id.as_deref(),
        intent.data_hash.as_ref(),
        &intent.metadata,
        &state.prev_hash,
    );

    let (signature, signing_key_id) = match signer {
        Some(signer) => (
            Some(signer.sign(&event_hash).await?),
            Some(signer.key_id().to_string()),
        ),
        None => (None, None),
    };

    let event = LedgerEvent {
        event_id,
        seq: state.next_seq,
        shard,
        ts_ns,
        event_type: intent.event_type,
        session_id: intent.session_id,
        device_id: intent.device_id,
        user_id: intent.user_id,
        data_hash: intent.data_hash,
        metadata: intent.metadata,
        prev_hash: state.prev_hash,
        event_hash,
        signature,
        signing_key_id,
    };

    store.append(&event, &intent.intent_id).await?;
    state.next_seq += 1;
    state.prev_hash = event_hash;
    Ok(event)
}
