//! Windowed Processing Pipeline
//!
//! Consumes the durable log per data type and partition, keys the
//! stream by session, assembles tumbling event-time windows and turns
//! each into a `FeatureFrame`. Frames fan out to the derived store
//! (idempotent on `(session_id, window_start_ns)`) and to
//! `features_computed` ledger events carrying metadata and the feature
//! hash only.
//!
//! Feature math runs on a CPU-sized blocking pool; per-session order is
//! preserved because each partition consumer awaits a window's frame
//! before feeding the next chunk.

pub mod store;
pub mod window;

pub use store::DerivedStore;
pub use window::{WindowAssembler, WindowData, WindowOutput};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::chunk::DataType;
use crate::codec;
use crate::config::PipelineConfig;
use crate::error::{EngineError, Result};
use crate::features::{compute_feature_frame, FeatureFrame};
use crate::ledger::{EventType, LedgerHandle, LedgerIntent};
use crate::log::{signal_topic, DurableLog, Record};

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub frames_emitted: AtomicU64,
    pub frames_duplicate: AtomicU64,
    pub late_chunks: AtomicU64,
    pub gaps: AtomicU64,
    pub decode_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub frames_emitted: u64,
    pub frames_duplicate: u64,
    pub late_chunks: u64,
    pub gaps: u64,
    pub decode_failures: u64,
}

impl PipelineMetrics {
    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            frames_duplicate: self.frames_duplicate.load(Ordering::Relaxed),
            late_chunks: self.late_chunks.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct ProcessingPipeline {
    config: PipelineConfig,
    log: Arc<dyn DurableLog>,
    derived: DerivedStore,
    ledger: LedgerHandle,
    assemblers: Mutex<HashMap<String, WindowAssembler>>,
    workers: Arc<Semaphore>,
    metrics: PipelineMetrics,
}

impl ProcessingPipeline {
    pub fn new(
        config: PipelineConfig,
        log: Arc<dyn DurableLog>,
        derived: DerivedStore,
        ledger: LedgerHandle,
    ) -> Arc<Self> {
        let workers = config.worker_threads;
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            workers
        };
        Arc::new(Self {
            config,
            log,
            derived,
            ledger,
            assemblers: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(workers)),
            metrics: PipelineMetrics::default(),
        })
    }

    pub fn metrics(&self) -> PipelineSnapshot {
        self.metrics.snapshot()
    }

    pub fn derived(&self) -> &DerivedStore {
        &self.derived
    }

    /// Spawn one consumer task per (data type, partition)
    pub fn spawn_consumers(
        self: &Arc<Self>,
        partitions: u32,
        data_types: &[DataType],
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();
        for &data_type in data_types {
            for partition in 0..partitions {
                let pipeline = self.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = pipeline.consume(data_type, partition).await {
                        warn!(
                            data_type = data_type.as_str(),
                            partition, "pipeline consumer stopped: {e}"
                        );
                    }
                }));
            }
        }
        info!(
            partitions,
            data_types = data_types.len(),
            "pipeline consumers started"
        );
        tasks
    }

    async fn consume(self: Arc<Self>, data_type: DataType, partition: u32) -> Result<()> {
        let topic = signal_topic(data_type);
        let mut stream = self.log.subscribe(&topic, partition, 0).await?;
        while let Some(record) = stream.next().await {
            if let Err(e) = self.process_record(&record).await {
                warn!(topic, partition, offset = record.offset, "record failed: {e}");
            }
        }
        Ok(())
    }

    /// Decode one log record and run it through windowing and feature
    /// extraction. Public so replay jobs and tests can drive it directly.
    pub async fn process_record(&self, record: &Record) -> Result<()> {
        if record.codec_version != codec::CODEC_VERSION {
            self.metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::validation(format!(
                "record carries codec version {}",
                record.codec_version
            )));
        }
        let chunk = match codec::decode(&record.payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let outputs = {
            let mut assemblers = self.assemblers.lock().await;
            let assembler = assemblers
                .entry(chunk.session_id.clone())
                .or_insert_with(|| {
                    WindowAssembler::new(
                        chunk.session_id.clone(),
                        self.config.window_ns(),
                        self.config.allowed_lateness_ns(),
                    )
                });
            assembler.push(&chunk)
        };

        for output in outputs {
            match output {
                WindowOutput::Window(window) => {
                    self.emit_window(window).await?;
                }
                WindowOutput::Gap { length_ns } => {
                    self.metrics.gaps.fetch_add(1, Ordering::Relaxed);
                    if !self.config.gap_fill {
                        let intent = LedgerIntent::new(EventType::AnomalyDetected)
                            .session(&chunk.session_id)
                            .device(&chunk.device_id)
                            .metadata(serde_json::json!({
                                "reason": "gap",
                                "length_ns": length_ns,
                            }));
                        self.ledger.record_nowait(intent).await.ok();
                    }
                }
                WindowOutput::Late { chunk_seq, behind_ns } => {
                    self.metrics.late_chunks.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        session_id = %chunk.session_id,
                        chunk_seq, behind_ns, "late chunk side-lined"
                    );
                }
            }
        }
        Ok(())
    }

    /// Compute features for one window and fan the frame out. Bounded by
    /// the worker pool and a deadline of 10 windows' worth of time.
    async fn emit_window(&self, window: WindowData) -> Result<()> {
        let deadline = self.config.window()
            * self.config.window_deadline_multiple.max(1);
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::transient("worker pool closed"))?;

        let frame = tokio::time::timeout(
            deadline,
            tokio::task::spawn_blocking(move || {
                let frame = compute_feature_frame(
                    &window.session_id,
                    window.data_type,
                    window.sampling_rate_hz,
                    window.window_start_ns,
                    window.window_end_ns,
                    &window.channels,
                    window.chunk_range,
                );
                drop(permit);
                frame
            }),
        )
        .await
        .map_err(|_| {
            EngineError::transient(format!(
                "feature window exceeded {} ms",
                deadline.as_millis()
            ))
        })?
        .map_err(|e| EngineError::transient(format!("feature worker: {e}")))?;

        self.sink_frame(frame).await
    }

    async fn sink_frame(&self, frame: FeatureFrame) -> Result<()> {
        let inserted = self.derived.insert_frame(&frame).await?;
        if !inserted {
            // Redelivered window: the idempotent sink already has it
            self.metrics.frames_duplicate.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let intent = LedgerIntent::new(EventType::FeaturesComputed)
            .session(&frame.session_id)
            .data(frame.features_hash())
            .metadata(serde_json::json!({
                "window_start_ns": frame.window_start_ns,
                "window_end_ns": frame.window_end_ns,
                "data_type": frame.data_type.as_str(),
                "channels": frame.channel_features.len(),
            }));
        self.ledger.record(intent).await?;
        self.metrics.frames_emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Observed consumer lag across a topic's partitions, in records.
    /// Feeds the ingestion AIMD controller.
    pub async fn observed_backlog(&self, data_type: DataType, partitions: u32) -> Result<u64> {
        let topic = signal_topic(data_type);
        let mut total = 0;
        for partition in 0..partitions {
            total += self.log.partition_len(&topic, partition).await?;
        }
        Ok(total)
    }
}
