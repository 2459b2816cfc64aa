//! Device Telemetry
//!
//! Per-device event buffers flushed through registered exporters, either
//! on a timer or when a buffer crosses its watermark. Exporters read
//! snapshots; nothing mutates an event after it is recorded.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::util::now_ns;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryCategory {
    Connection,
    DataFlow,
    SignalQuality,
    Performance,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub device_id: String,
    pub category: TelemetryCategory,
    pub ts_ns: i64,
    pub payload: serde_json::Value,
}

impl TelemetryEvent {
    pub fn new(
        device_id: impl Into<String>,
        category: TelemetryCategory,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            category,
            ts_ns: now_ns(),
            payload,
        }
    }
}

// ============================================================================
// Exporters
// ============================================================================

/// Destination for flushed telemetry batches
#[async_trait]
pub trait TelemetryExporter: Send + Sync {
    fn name(&self) -> &str;
    async fn export(&self, events: &[TelemetryEvent]) -> Result<()>;
}

/// Appends events as JSON lines to a local file
pub struct FileExporter {
    path: PathBuf,
}

impl FileExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TelemetryExporter for FileExporter {
    fn name(&self) -> &str {
        "file"
    }

    async fn export(&self, events: &[TelemetryEvent]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::transient(format!("telemetry dir: {e}")))?;
        }
        let mut lines = Vec::new();
        for event in events {
            lines.extend_from_slice(&serde_json::to_vec(event)?);
            lines.push(b'\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| EngineError::transient(format!("telemetry file: {e}")))?;
        file.write_all(&lines)
            .await
            .map_err(|e| EngineError::transient(format!("telemetry write: {e}")))?;
        Ok(())
    }
}

/// Ships batches to a collector endpoint
pub struct CloudExporter {
    endpoint: String,
    client: reqwest::Client,
}

impl CloudExporter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TelemetryExporter for CloudExporter {
    fn name(&self) -> &str {
        "cloud"
    }

    async fn export(&self, events: &[TelemetryEvent]) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&events)
            .send()
            .await
            .map_err(|e| EngineError::transient(format!("telemetry upload: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::transient(format!(
                "telemetry collector returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Collector
// ============================================================================

/// Buffers telemetry per device and flushes through every exporter
pub struct TelemetryCollector {
    capacity: usize,
    flush_watermark: f64,
    buffers: HashMap<String, VecDeque<TelemetryEvent>>,
    exporters: Vec<Box<dyn TelemetryExporter>>,
    dropped: u64,
}

impl TelemetryCollector {
    pub fn new(capacity: usize, flush_watermark: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            flush_watermark: flush_watermark.clamp(0.0, 1.0),
            buffers: HashMap::new(),
            exporters: Vec::new(),
            dropped: 0,
        }
    }

    pub fn register_exporter(&mut self, exporter: Box<dyn TelemetryExporter>) {
        debug!(exporter = exporter.name(), "telemetry exporter registered");
        self.exporters.push(exporter);
    }

    /// Record one event. Returns true when the device buffer crossed its
    /// watermark and wants a flush.
    pub fn record(&mut self, event: TelemetryEvent) -> bool {
        let buffer = self.buffers.entry(event.device_id.clone()).or_default();
        if buffer.len() >= self.capacity {
            // Ring behavior: oldest events give way
            buffer.pop_front();
            self.dropped += 1;
        }
        buffer.push_back(event);
        buffer.len() as f64 >= self.capacity as f64 * self.flush_watermark
    }

    pub fn buffered(&self) -> usize {
        self.buffers.values().map(|b| b.len()).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Drain every buffer and hand the batch to all exporters. A failing
    /// exporter does not block the others; its batch is simply lost there.
    pub async fn flush(&mut self) -> usize {
        let batch: Vec<TelemetryEvent> = self
            .buffers
            .values_mut()
            .flat_map(|b| b.drain(..))
            .collect();
        if batch.is_empty() {
            return 0;
        }
        for exporter in &self.exporters {
            if let Err(e) = exporter.export(&batch).await {
                warn!(exporter = exporter.name(), "telemetry export failed: {e}");
            }
        }
        batch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingExporter {
        exported: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TelemetryExporter for CountingExporter {
        fn name(&self) -> &str {
            "counting"
        }
        async fn export(&self, events: &[TelemetryEvent]) -> Result<()> {
            self.exported.fetch_add(events.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn event(device: &str) -> TelemetryEvent {
        TelemetryEvent::new(
            device,
            TelemetryCategory::DataFlow,
            serde_json::json!({"chunks": 1}),
        )
    }

    #[tokio::test]
    async fn test_watermark_triggers_flush_request() {
        let mut collector = TelemetryCollector::new(10, 0.8);
        for _ in 0..7 {
            assert!(!collector.record(event("dev-1")));
        }
        // Eighth event crosses 80 % of 10
        assert!(collector.record(event("dev-1")));
    }

    #[tokio::test]
    async fn test_ring_drops_oldest_beyond_capacity() {
        let mut collector = TelemetryCollector::new(5, 1.0);
        for _ in 0..9 {
            collector.record(event("dev-1"));
        }
        assert_eq!(collector.buffered(), 5);
        assert_eq!(collector.dropped(), 4);
    }

    #[tokio::test]
    async fn test_flush_drains_all_devices() {
        let exported = Arc::new(AtomicUsize::new(0));
        let mut collector = TelemetryCollector::new(100, 0.8);
        collector.register_exporter(Box::new(CountingExporter {
            exported: exported.clone(),
        }));
        for _ in 0..3 {
            collector.record(event("dev-1"));
            collector.record(event("dev-2"));
        }
        let flushed = collector.flush().await;
        assert_eq!(flushed, 6);
        assert_eq!(exported.load(Ordering::SeqCst), 6);
        assert_eq!(collector.buffered(), 0);
        // Second flush is a no-op
        assert_eq!(collector.flush().await, 0);
    }

    #[tokio::test]
    async fn test_file_exporter_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.jsonl");
        let exporter = FileExporter::new(&path);
        exporter.export(&[event("dev-1"), event("dev-2")]).await.unwrap();
        exporter.export(&[event("dev-3")]).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: TelemetryEvent = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(parsed.device_id, "dev-3");
    }
}
