//! Ingestion Service
//!
//! The write path for every chunk: validate, anonymize, quality-score,
//! route to a stable partition, publish onto the durable log and record
//! the `data_ingested` ledger event. Backpressure is a bounded buffer
//! with quality-weighted shedding; publish failures retry with full
//! jitter before landing on the dead-letter topic.

pub mod batch;
pub mod buffer;

pub use batch::{BatchStore, BatchUpload};
pub use buffer::{AdmissionController, BufferGauge, ShedPolicy};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::anonymize::Anonymizer;
use crate::chunk::{SampleChunk, SessionShape};
use crate::codec;
use crate::config::IngestConfig;
use crate::error::{EngineError, Result};
use crate::features::{assess_window, QualityReport};
use crate::ledger::{EventType, LedgerHandle, LedgerIntent};
use crate::log::{signal_topic, DurableLog, DEAD_LETTER_TOPIC};
use crate::session::SessionStore;
use crate::util::{full_jitter_delay, time_bucket};

// ============================================================================
// Metrics
// ============================================================================

/// Ingestion counters surfaced by the control plane
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub published: AtomicU64,
    pub dropped_checksum: AtomicU64,
    pub dropped_validation: AtomicU64,
    pub dropped_oversize: AtomicU64,
    pub shed: AtomicU64,
    pub duplicates: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub late_chunks: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub dropped_checksum: u64,
    pub dropped_validation: u64,
    pub dropped_oversize: u64,
    pub shed: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub late_chunks: u64,
    pub buffer_occupancy: usize,
    pub admission_rate: f64,
}

impl IngestMetrics {
    fn snapshot(&self, buffer_occupancy: usize, admission_rate: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            dropped_checksum: self.dropped_checksum.load(Ordering::Relaxed),
            dropped_validation: self.dropped_validation.load(Ordering::Relaxed),
            dropped_oversize: self.dropped_oversize.load(Ordering::Relaxed),
            shed: self.shed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            late_chunks: self.late_chunks.load(Ordering::Relaxed),
            buffer_occupancy,
            admission_rate,
        }
    }
}

// ============================================================================
// Receipts & session tracking
// ============================================================================

/// What the caller gets back for an accepted chunk
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub session_id: String,
    pub chunk_seq: u64,
    pub samples_processed: usize,
    pub quality: f64,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_event_id: Option<String>,
}

#[derive(Debug, Default)]
struct SessionTrack {
    shape: Option<SessionShape>,
    last_seq: Option<u64>,
    packet_loss: u64,
}

// ============================================================================
// Service
// ============================================================================

pub struct IngestionService {
    config: IngestConfig,
    anonymizer: Anonymizer,
    sessions: SessionStore,
    log: Arc<dyn DurableLog>,
    ledger: LedgerHandle,
    gauge: BufferGauge,
    metrics: IngestMetrics,
    tracks: Mutex<HashMap<String, SessionTrack>>,
    shed_policy: Mutex<ShedPolicy>,
    admission: Mutex<(AdmissionController, f64)>,
}

impl IngestionService {
    pub fn new(
        config: IngestConfig,
        sessions: SessionStore,
        log: Arc<dyn DurableLog>,
        ledger: LedgerHandle,
    ) -> Arc<Self> {
        let anonymizer = Anonymizer::new(&config.anonymization_salt);
        let gauge = BufferGauge::new(config.buffer_capacity, config.buffer_high_watermark);
        Arc::new(Self {
            config,
            anonymizer,
            sessions,
            log,
            ledger,
            gauge,
            metrics: IngestMetrics::default(),
            tracks: Mutex::new(HashMap::new()),
            shed_policy: Mutex::new(ShedPolicy::new()),
            admission: Mutex::new((AdmissionController::new(), 1.0)),
        })
    }

    pub fn anonymizer(&self) -> &Anonymizer {
        &self.anonymizer
    }

    /// Record a ledger intent on behalf of an ingestion-adjacent caller
    pub async fn ledger_record(&self, intent: LedgerIntent) -> Result<crate::ledger::LedgerEvent> {
        self.ledger.record(intent).await
    }

    pub async fn ledger_record_nowait(&self, intent: LedgerIntent) -> Result<()> {
        self.ledger.record_nowait(intent).await
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        let rate = self.admission.lock().await.0.rate();
        self.metrics.snapshot(self.gauge.occupancy(), rate)
    }

    /// Feed one pipeline-lag observation into the AIMD controller
    pub async fn observe_lag(&self, lag_over_sla: f64, elapsed_s: f64) {
        self.admission.lock().await.0.update(lag_over_sla, elapsed_s);
    }

    /// Decode an encoded frame and run the full ingestion contract.
    /// Checksum and size failures are final for the chunk.
    pub async fn ingest_frame(&self, user_id: Option<&str>, frame: &[u8]) -> Result<IngestReceipt> {
        let chunk = match codec::decode_with_limit(frame, self.config.max_chunk_bytes) {
            Ok(chunk) => chunk,
            Err(e) => {
                match &e {
                    codec::CodecError::Checksum => {
                        self.metrics.dropped_checksum.fetch_add(1, Ordering::Relaxed);
                    }
                    codec::CodecError::ChunkTooLarge { .. } => {
                        self.metrics.dropped_oversize.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        self.metrics
                            .dropped_validation
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
                return Err(e.into());
            }
        };
        self.ingest_chunk(user_id, chunk).await
    }

    /// The per-chunk ingestion contract
    pub async fn ingest_chunk(
        &self,
        user_id: Option<&str>,
        chunk: SampleChunk,
    ) -> Result<IngestReceipt> {
        // 1. Structural validation
        if let Err(e) = chunk.validate() {
            self.metrics
                .dropped_validation
                .fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        // Unknown sessions are rejected unless auto-create is configured
        let session = match self.sessions.get(&chunk.session_id).await {
            Ok(session) => session,
            Err(EngineError::SessionNotFound { .. }) if self.config.auto_create_sessions => {
                let anon = self
                    .anonymizer
                    .anonymize(user_id.unwrap_or("unattributed"));
                self.sessions
                    .create_with_id(
                        &chunk.session_id,
                        &anon,
                        &[chunk.device_id.clone()],
                        None,
                    )
                    .await?
            }
            Err(e) => {
                self.metrics
                    .dropped_validation
                    .fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        // Session-shape consistency and duplicate/gap tracking
        {
            let mut tracks = self.tracks.lock().await;
            let track = tracks.entry(chunk.session_id.clone()).or_default();
            match &track.shape {
                Some(shape) => chunk.check_shape(shape)?,
                None => {
                    let shape = session.shape.unwrap_or_else(|| chunk.shape());
                    chunk.check_shape(&shape)?;
                    self.sessions.set_shape(&chunk.session_id, &shape).await?;
                    track.shape = Some(shape);
                }
            }
            if let Some(last) = track.last_seq {
                if chunk.chunk_seq <= last {
                    // Idempotent replay: at most one persisted copy
                    self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                    return Ok(IngestReceipt {
                        session_id: chunk.session_id.clone(),
                        chunk_seq: chunk.chunk_seq,
                        samples_processed: 0,
                        quality: 0.0,
                        duplicate: true,
                        ledger_event_id: None,
                    });
                }
                if chunk.chunk_seq > last + 1 {
                    track.packet_loss += chunk.chunk_seq - last - 1;
                }
            }
            track.last_seq = Some(chunk.chunk_seq);
        }

        // 2. Anonymize the caller; PII never travels further
        let user_anon = user_id.map(|u| self.anonymizer.anonymize(u));

        // 3. Quality pass
        let quality = self.quality_of(&chunk);

        // Backpressure: admission rate first, then watermark shedding
        {
            let mut admission = self.admission.lock().await;
            let (controller, accumulator) = &mut *admission;
            if !controller.admit(accumulator) {
                self.metrics.shed.fetch_add(1, Ordering::Relaxed);
                self.record_shed(&chunk, quality.overall).await;
                return Err(EngineError::resource("admission rate exceeded"));
            }
        }
        if self.gauge.over_watermark() {
            let mut policy = self.shed_policy.lock().await;
            let loss = {
                let tracks = self.tracks.lock().await;
                tracks
                    .get(&chunk.session_id)
                    .map(|t| t.packet_loss)
                    .unwrap_or(0)
            };
            policy.observe(&chunk.device_id, quality.overall as f64, loss);
            if policy.should_shed(&chunk.device_id) {
                self.metrics.shed.fetch_add(1, Ordering::Relaxed);
                self.record_shed(&chunk, quality.overall).await;
                return Err(EngineError::resource(format!(
                    "buffer over watermark, shedding device {}",
                    chunk.device_id
                )));
            }
        }
        if !self.gauge.acquire() {
            self.metrics.shed.fetch_add(1, Ordering::Relaxed);
            self.record_shed(&chunk, quality.overall).await;
            return Err(EngineError::resource("ingest buffer full"));
        }

        // 4–5. Stable routing and durable publish
        let result = self.publish_chunk(&chunk).await;
        self.gauge.release();
        let (frame_hash, _offset) = result?;

        // 6. Ledger event
        let samples = chunk.samples_per_channel();
        let mut intent = LedgerIntent::new(EventType::DataIngested)
            .session(&chunk.session_id)
            .device(&chunk.device_id)
            .data(frame_hash)
            .metadata(serde_json::json!({
                "chunk_seq": chunk.chunk_seq,
                "quality": quality.overall,
                "data_type": chunk.data_type.as_str(),
            }));
        if let Some(anon) = &user_anon {
            intent = intent.user(anon);
        }
        let ledger_event = self.ledger.record(intent).await?;

        // Session counters move only through ingestion
        self.sessions
            .record_chunk(&chunk.session_id, samples as i64, quality.overall as f64)
            .await?;

        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        Ok(IngestReceipt {
            session_id: chunk.session_id,
            chunk_seq: chunk.chunk_seq,
            samples_processed: samples,
            quality: quality.overall as f64,
            duplicate: false,
            ledger_event_id: Some(ledger_event.event_id.to_string()),
        })
    }

    fn quality_of(&self, chunk: &SampleChunk) -> QualityReport {
        let rows: Vec<(u32, &[f32])> = chunk
            .channels
            .iter()
            .zip(&chunk.samples)
            .map(|(info, row)| (info.id, row.as_slice()))
            .collect();
        assess_window(&rows, chunk.sampling_rate_hz as f64)
    }

    /// Partition-stable routing: a device stays on one partition within
    /// a time bucket and rebalances across buckets.
    pub fn partition_for(&self, device_id: &str, ts_ns: i64) -> u32 {
        use sha2::{Digest, Sha256};
        let bucket = time_bucket(ts_ns, self.config.time_bucket);
        let mut hasher = Sha256::new();
        hasher.update(device_id.as_bytes());
        hasher.update(bucket.to_le_bytes());
        let digest = hasher.finalize();
        let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        n % self.config.partitions.max(1)
    }

    async fn publish_chunk(&self, chunk: &SampleChunk) -> Result<([u8; 32], u64)> {
        let frame = codec::encode_with_limit(chunk, self.config.max_chunk_bytes)?;
        let frame_hash = codec::data_hash(&frame);
        let topic = signal_topic(chunk.data_type);
        let partition = self.partition_for(&chunk.device_id, chunk.device_ts_ns);
        let bucket = time_bucket(chunk.device_ts_ns, self.config.time_bucket);
        let key = format!("{}:{}", chunk.device_id, bucket);

        let mut attempt = 0u32;
        loop {
            let publish = self.log.publish(
                &topic,
                partition,
                &key,
                codec::CODEC_VERSION,
                None,
                frame.clone(),
            );
            match tokio::time::timeout(self.config.publish_timeout, publish).await {
                Ok(Ok(offset)) => return Ok((frame_hash, offset)),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                outcome => {
                    attempt += 1;
                    let reason = match outcome {
                        Ok(Err(e)) => e.to_string(),
                        _ => "publish deadline exceeded".to_string(),
                    };
                    if attempt >= self.config.publish_max_retries {
                        warn!(
                            topic,
                            partition, "publish failed after {attempt} tries: {reason}; dead-lettering"
                        );
                        self.dead_letter(&key, &frame).await?;
                        self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                        return Err(EngineError::transient(format!(
                            "chunk {} of session {} dead-lettered: {reason}",
                            chunk.chunk_seq, chunk.session_id
                        )));
                    }
                    let delay = full_jitter_delay(
                        self.config.publish_backoff_min,
                        self.config.publish_backoff_max,
                        attempt - 1,
                    );
                    debug!(topic, attempt, "publish retry in {delay:?}: {reason}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn dead_letter(&self, key: &str, frame: &[u8]) -> Result<()> {
        self.log
            .publish(
                DEAD_LETTER_TOPIC,
                0,
                key,
                codec::CODEC_VERSION,
                None,
                frame.to_vec(),
            )
            .await
            .map(|_| ())
    }

    async fn record_shed(&self, chunk: &SampleChunk, quality: f32) {
        let intent = LedgerIntent::new(EventType::AnomalyDetected)
            .session(&chunk.session_id)
            .device(&chunk.device_id)
            .metadata(serde_json::json!({
                "reason": "shed",
                "chunk_seq": chunk.chunk_seq,
                "quality": quality,
            }));
        if let Err(e) = self.ledger.record_nowait(intent).await {
            warn!("failed to record shed anomaly: {e}");
        }
    }
}
