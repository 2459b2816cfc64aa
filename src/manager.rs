//! Device Manager
//!
//! Owner of every attached device: lifecycle commands, the per-device
//! event pump into ingestion, the health monitor tick and the telemetry
//! flush loop. Cross-references run through device ids, never through
//! back-pointers; drivers know nothing about the manager.
//!
//! Every operation is idempotent with respect to the end state
//! (connecting a connected device succeeds without effect), and the
//! ledger records the issuance either way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::device::{
    BiosignalBoard, BiosignalDriver, CytonSerialDriver, DeviceDriver, DeviceInfo, DeviceState,
    DriverEvent, LslDriver, SyntheticConfig, SyntheticDriver,
};
use crate::discovery::{self, DiscoveredDevice, DiscoveryOptions, DiscoveryProtocol, ScanReport};
use crate::error::{EngineError, Result};
use crate::features::QualityReport;
use crate::health::{idle_snapshot, FlowCounters, HealthAlert, HealthMonitor, HealthSnapshot};
use crate::ingest::IngestionService;
use crate::ledger::{EventType, LedgerHandle, LedgerIntent};
use crate::session::{Session, SessionStore};
use crate::telemetry::{TelemetryCategory, TelemetryCollector, TelemetryEvent};
use crate::util::now_ns;

// ============================================================================
// Managed device
// ============================================================================

struct ManagedDevice {
    driver: Box<dyn DeviceDriver>,
    info: DeviceInfo,
    counters: Arc<std::sync::Mutex<FlowCounters>>,
    monitor: HealthMonitor,
    last_snapshot: Option<HealthSnapshot>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

type DeviceSlot = Arc<Mutex<ManagedDevice>>;

// ============================================================================
// Manager
// ============================================================================

pub struct DeviceManager {
    config: DeviceConfig,
    devices: Mutex<HashMap<String, DeviceSlot>>,
    current_session: Mutex<Option<String>>,
    sessions: SessionStore,
    ingestion: Arc<IngestionService>,
    ledger: LedgerHandle,
    telemetry: Mutex<TelemetryCollector>,
    alerts: Mutex<Vec<HealthAlert>>,
    last_scan: Mutex<ScanReport>,
    loops: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DeviceManager {
    pub fn new(
        config: DeviceConfig,
        sessions: SessionStore,
        ingestion: Arc<IngestionService>,
        ledger: LedgerHandle,
    ) -> Arc<Self> {
        let telemetry = TelemetryCollector::new(
            config.telemetry_capacity,
            config.telemetry_flush_watermark,
        );
        Arc::new(Self {
            config,
            devices: Mutex::new(HashMap::new()),
            current_session: Mutex::new(None),
            sessions,
            ingestion,
            ledger,
            telemetry: Mutex::new(telemetry),
            alerts: Mutex::new(Vec::new()),
            last_scan: Mutex::new(ScanReport::default()),
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn telemetry_collector(&self) -> &Mutex<TelemetryCollector> {
        &self.telemetry
    }

    /// Start the health monitor and telemetry flush loops
    pub async fn start_background_loops(self: &Arc<Self>) {
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            return;
        }

        let health_interval = self.config.health_check_interval;
        let manager = self.clone();
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_interval);
            loop {
                ticker.tick().await;
                manager.health_tick(health_interval.as_secs_f64()).await;
            }
        }));

        let manager = self.clone();
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let flushed = manager.telemetry.lock().await.flush().await;
                if flushed > 0 {
                    info!(flushed, "telemetry flushed on timer");
                }
            }
        }));
    }

    pub async fn shutdown(&self) {
        for task in self.loops.lock().await.drain(..) {
            task.abort();
        }
        let device_ids: Vec<String> = self.devices.lock().await.keys().cloned().collect();
        for device_id in device_ids {
            self.disconnect(&device_id).await.ok();
        }
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    /// Attach a driver under its own device id
    pub async fn add_device(&self, driver: Box<dyn DeviceDriver>) -> Result<DeviceInfo> {
        let info = driver.describe();
        let mut devices = self.devices.lock().await;
        if devices.contains_key(&info.device_id) {
            // Idempotent: already attached
            return Ok(info);
        }
        let monitor = HealthMonitor::new(
            &info.device_id,
            info.sampling_rate_hz as f64,
            self.config.health_alert_threshold,
        );
        devices.insert(
            info.device_id.clone(),
            Arc::new(Mutex::new(ManagedDevice {
                driver,
                info: info.clone(),
                counters: Arc::new(std::sync::Mutex::new(FlowCounters::default())),
                monitor,
                last_snapshot: None,
                pump: None,
            })),
        );
        info!(device_id = %info.device_id, "device attached");
        Ok(info)
    }

    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let slot = self.devices.lock().await.remove(device_id);
        match slot {
            Some(slot) => {
                let mut device = slot.lock().await;
                if let Some(pump) = device.pump.take() {
                    pump.abort();
                }
                device.driver.disconnect().await.ok();
                Ok(())
            }
            // Idempotent: already gone
            None => Ok(()),
        }
    }

    pub async fn list_devices(&self) -> Vec<DeviceInfo> {
        let devices = self.devices.lock().await;
        let mut infos = Vec::with_capacity(devices.len());
        for slot in devices.values() {
            infos.push(slot.lock().await.info.clone());
        }
        infos
    }

    pub async fn device_state(&self, device_id: &str) -> Result<DeviceState> {
        let slot = self.slot(device_id).await?;
        let state = slot.lock().await.driver.state();
        Ok(state)
    }

    async fn slot(&self, device_id: &str) -> Result<DeviceSlot> {
        self.devices
            .lock()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| EngineError::DeviceNotFound {
                device_id: device_id.to_string(),
            })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub async fn connect(&self, device_id: &str) -> Result<DeviceState> {
        let slot = self.slot(device_id).await?;
        let mut device = slot.lock().await;
        device.driver.connect().await?;
        let state = device.driver.state();
        drop(device);

        self.record_device_event(EventType::DeviceConnected, device_id)
            .await;
        self.telemetry_event(
            device_id,
            TelemetryCategory::Connection,
            serde_json::json!({"action": "connect", "state": state.as_str()}),
        )
        .await;
        Ok(state)
    }

    pub async fn disconnect(&self, device_id: &str) -> Result<DeviceState> {
        let slot = self.slot(device_id).await?;
        let mut device = slot.lock().await;
        if let Some(pump) = device.pump.take() {
            pump.abort();
        }
        device.driver.disconnect().await?;
        let state = device.driver.state();
        drop(device);

        self.record_device_event(EventType::DeviceDisconnected, device_id)
            .await;
        self.telemetry_event(
            device_id,
            TelemetryCategory::Connection,
            serde_json::json!({"action": "disconnect", "state": state.as_str()}),
        )
        .await;
        Ok(state)
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Create a session bound to the given devices. One session at a
    /// time; starting while one is active is a conflict.
    pub async fn start_session(
        &self,
        user_id: &str,
        device_ids: &[String],
        paradigm: Option<&str>,
    ) -> Result<Session> {
        let mut current = self.current_session.lock().await;
        if let Some(active) = current.as_ref() {
            return Err(EngineError::SessionConflict {
                message: format!("session {active} is already active"),
            });
        }
        let subject = self.ingestion.anonymizer().anonymize(user_id);
        let session = self.sessions.create(&subject, device_ids, paradigm).await?;
        *current = Some(session.session_id.clone());
        drop(current);

        let intent = LedgerIntent::new(EventType::SessionCreated)
            .session(&session.session_id)
            .user(&subject)
            .metadata(serde_json::json!({
                "devices": device_ids,
                "paradigm": paradigm,
            }));
        self.ledger.record(intent).await?;
        info!(session_id = %session.session_id, "session started");
        Ok(session)
    }

    pub async fn end_session(&self) -> Result<Session> {
        let mut current = self.current_session.lock().await;
        let session_id = current.take().ok_or_else(|| EngineError::SessionConflict {
            message: "no active session".to_string(),
        })?;
        drop(current);

        self.stop_streaming().await.ok();
        let session = self.sessions.close(&session_id).await?;

        let intent = LedgerIntent::new(EventType::SessionClosed)
            .session(&session.session_id)
            .user(&session.subject_anon)
            .metadata(serde_json::json!({
                "samples_seen": session.samples_seen,
                "quality_summary": session.quality_summary,
            }));
        self.ledger.record(intent).await?;
        info!(session_id = %session.session_id, "session ended");
        Ok(session)
    }

    pub async fn current_session(&self) -> Option<String> {
        self.current_session.lock().await.clone()
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    /// Start streaming every connected device into the given session
    pub async fn start_streaming(self: &Arc<Self>, session_id: &str) -> Result<usize> {
        // The session must exist and be active
        let session = self.sessions.get(session_id).await?;
        if session.ended_ns.is_some() {
            return Err(EngineError::SessionConflict {
                message: format!("session {session_id} is closed"),
            });
        }

        let slots: Vec<(String, DeviceSlot)> = {
            let devices = self.devices.lock().await;
            devices
                .iter()
                .map(|(id, slot)| (id.clone(), slot.clone()))
                .collect()
        };

        let mut started = 0;
        for (device_id, slot) in slots {
            let mut device = slot.lock().await;
            match device.driver.state() {
                DeviceState::Streaming => {
                    // Idempotent: already streaming
                    started += 1;
                    continue;
                }
                DeviceState::Connected => {}
                other => {
                    warn!(device_id = %device_id, state = other.as_str(), "not streamable");
                    continue;
                }
            }

            let (tx, rx) = mpsc::channel(256);
            device.driver.start_stream(tx).await?;
            let pump = tokio::spawn(Self::pump_events(
                self.clone(),
                device_id.clone(),
                session_id.to_string(),
                device.counters.clone(),
                rx,
            ));
            device.pump = Some(pump);
            started += 1;
        }
        Ok(started)
    }

    pub async fn stop_streaming(&self) -> Result<()> {
        let slots: Vec<DeviceSlot> = self.devices.lock().await.values().cloned().collect();
        for slot in slots {
            let mut device = slot.lock().await;
            if let Some(pump) = device.pump.take() {
                pump.abort();
            }
            if device.driver.state() == DeviceState::Streaming {
                device.driver.stop_stream().await.ok();
            }
        }
        Ok(())
    }

    /// Per-device event pump: driver events become ingestion calls,
    /// counters and telemetry.
    async fn pump_events(
        manager: Arc<Self>,
        device_id: String,
        session_id: String,
        counters: Arc<std::sync::Mutex<FlowCounters>>,
        mut rx: mpsc::Receiver<DriverEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                DriverEvent::Chunk(mut chunk) => {
                    chunk.session_id = session_id.clone();
                    chunk.ingest_ts_ns = now_ns();
                    let samples = chunk.samples_per_channel() as u64;
                    let bytes = samples * chunk.channel_count() as u64 * 4;
                    {
                        let mut c = counters.lock().expect("counter lock");
                        c.samples += samples;
                        c.bytes += bytes;
                        c.last_chunk_ts_ns = chunk.ingest_ts_ns;
                        c.last_latency_ns =
                            chunk.ingest_ts_ns.saturating_sub(chunk.device_ts_ns);
                    }
                    if let Err(e) = manager.ingestion.ingest_chunk(None, chunk).await {
                        // Rejection is final per chunk; the stream goes on
                        warn!(device_id = %device_id, "chunk rejected: {e}");
                    }
                }
                DriverEvent::Gap {
                    expected_seq,
                    got_seq,
                    ..
                } => {
                    counters.lock().expect("counter lock").gaps += 1;
                    manager
                        .telemetry_event(
                            &device_id,
                            TelemetryCategory::DataFlow,
                            serde_json::json!({
                                "event": "gap_sample",
                                "expected_seq": expected_seq,
                                "got_seq": got_seq,
                            }),
                        )
                        .await;
                }
                DriverEvent::Fault { kind, message, .. } => {
                    counters.lock().expect("counter lock").faults += 1;
                    manager
                        .telemetry_event(
                            &device_id,
                            TelemetryCategory::Error,
                            serde_json::json!({
                                "kind": format!("{kind:?}"),
                                "message": message,
                            }),
                        )
                        .await;
                }
                DriverEvent::StateChanged { state, .. } => {
                    manager
                        .telemetry_event(
                            &device_id,
                            TelemetryCategory::Connection,
                            serde_json::json!({"state": state.as_str()}),
                        )
                        .await;
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Probes
    // ------------------------------------------------------------------------

    pub async fn check_impedance(&self, device_id: &str) -> Result<HashMap<u32, f64>> {
        let slot = self.slot(device_id).await?;
        let mut device = slot.lock().await;
        let ohms = device.driver.check_impedance().await?;
        drop(device);
        self.telemetry_event(
            device_id,
            TelemetryCategory::SignalQuality,
            serde_json::json!({"probe": "impedance", "channels": ohms.len()}),
        )
        .await;
        Ok(ohms)
    }

    pub async fn get_signal_quality(
        &self,
        device_id: &str,
        duration: Duration,
    ) -> Result<QualityReport> {
        let slot = self.slot(device_id).await?;
        let mut device = slot.lock().await;
        let report = device.driver.probe_quality(duration).await?;
        drop(device);
        self.telemetry_event(
            device_id,
            TelemetryCategory::SignalQuality,
            serde_json::json!({"probe": "quality", "overall": report.overall}),
        )
        .await;
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// One-shot scan, caching the result for `list_discovered`
    pub async fn scan(&self, options: &DiscoveryOptions) -> ScanReport {
        let report = discovery::quick_scan(options).await;
        *self.last_scan.lock().await = report.clone();
        report
    }

    pub async fn list_discovered(&self) -> ScanReport {
        self.last_scan.lock().await.clone()
    }

    /// Build and attach a driver for a discovered endpoint
    pub async fn create_from_discovery(
        &self,
        discovered: &DiscoveredDevice,
        params: serde_json::Value,
    ) -> Result<DeviceInfo> {
        let driver: Box<dyn DeviceDriver> = match discovered.protocol {
            DiscoveryProtocol::Synthetic => Box::new(SyntheticDriver::new(SyntheticConfig {
                device_id: discovered.endpoint.clone(),
                ..SyntheticConfig::default()
            })),
            DiscoveryProtocol::Serial => {
                let baud = params["baud"].as_u64().unwrap_or(115_200) as u32;
                Box::new(CytonSerialDriver::new(&discovered.endpoint, baud))
            }
            DiscoveryProtocol::Lsl => {
                let relay = params["relay_addr"].as_str().ok_or_else(|| {
                    EngineError::validation("LSL devices need params.relay_addr")
                })?;
                Box::new(LslDriver::new(relay, &discovered.endpoint))
            }
            DiscoveryProtocol::Bluetooth | DiscoveryProtocol::Mdns => {
                let daemon = params["daemon_addr"].as_str().ok_or_else(|| {
                    EngineError::validation("SDK devices need params.daemon_addr")
                })?;
                let board = params["board_id"]
                    .as_i64()
                    .and_then(|id| BiosignalBoard::from_board_id(id as i32))
                    .ok_or_else(|| {
                        EngineError::validation("SDK devices need a known params.board_id")
                    })?;
                let serial = params["serial_port"].as_str().map(|s| s.to_string());
                Box::new(BiosignalDriver::new(board, daemon, serial))
            }
        };
        self.add_device(driver).await
    }

    // ------------------------------------------------------------------------
    // Health & telemetry
    // ------------------------------------------------------------------------

    /// One health evaluation pass over every device
    pub async fn health_tick(&self, elapsed_s: f64) {
        let slots: Vec<DeviceSlot> = self.devices.lock().await.values().cloned().collect();
        let now = now_ns();
        for slot in slots {
            let mut device = slot.lock().await;
            let state = device.driver.state();
            let counters = device.counters.lock().expect("counter lock").clone();
            let (snapshot, alert) = device.monitor.evaluate(state, &counters, elapsed_s, now);
            device.last_snapshot = Some(snapshot.clone());
            let device_id = device.info.device_id.clone();
            drop(device);

            if let Some(alert) = alert {
                warn!(
                    device_id = %alert.device_id,
                    status = alert.status.as_str(),
                    "health alert: {:?}",
                    alert.reasons
                );
                self.telemetry_event(
                    &device_id,
                    TelemetryCategory::Performance,
                    serde_json::json!({
                        "alert": alert.status.as_str(),
                        "reasons": alert.reasons.clone(),
                    }),
                )
                .await;
                self.alerts.lock().await.push(alert);
            }
        }
    }

    pub async fn health_snapshots(&self) -> Vec<HealthSnapshot> {
        let slots: Vec<DeviceSlot> = self.devices.lock().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in slots {
            let device = slot.lock().await;
            snapshots.push(match &device.last_snapshot {
                Some(snapshot) => snapshot.clone(),
                None => idle_snapshot(&device.info.device_id, device.driver.state()),
            });
        }
        snapshots
    }

    pub async fn health_alerts(&self) -> Vec<HealthAlert> {
        self.alerts.lock().await.clone()
    }

    async fn telemetry_event(
        &self,
        device_id: &str,
        category: TelemetryCategory,
        payload: serde_json::Value,
    ) {
        let wants_flush = self
            .telemetry
            .lock()
            .await
            .record(TelemetryEvent::new(device_id, category, payload));
        if wants_flush {
            let flushed = self.telemetry.lock().await.flush().await;
            info!(flushed, "telemetry flushed on watermark");
        }
    }

    async fn record_device_event(&self, event_type: EventType, device_id: &str) {
        let mut intent = LedgerIntent::new(event_type).device(device_id);
        if let Some(session_id) = self.current_session.lock().await.clone() {
            intent = intent.session(session_id);
        }
        if let Err(e) = self.ledger.record_nowait(intent).await {
            warn!(device_id, "ledger record failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::ledger::{LedgerStore, LedgerWriter};
    use crate::log::MemoryLog;

    struct Fixture {
        manager: Arc<DeviceManager>,
        sessions: SessionStore,
        ledger_store: LedgerStore,
        _writer: LedgerWriter,
    }

    async fn fixture() -> Fixture {
        let sessions = SessionStore::connect("sqlite::memory:").await.unwrap();
        let ledger_store = LedgerStore::connect("sqlite::memory:").await.unwrap();
        let writer = LedgerWriter::spawn(
            ledger_store.clone(),
            None,
            1,
            Duration::from_secs(5),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        let log = Arc::new(MemoryLog::new());
        let ingestion = IngestionService::new(
            IngestConfig::default(),
            sessions.clone(),
            log,
            writer.handle(),
        );
        let manager = DeviceManager::new(
            DeviceConfig::default(),
            sessions.clone(),
            ingestion,
            writer.handle(),
        );
        Fixture {
            manager,
            sessions,
            ledger_store,
            _writer: writer,
        }
    }

    fn synthetic(device_id: &str) -> Box<dyn DeviceDriver> {
        Box::new(SyntheticDriver::new(SyntheticConfig {
            device_id: device_id.to_string(),
            channels: 4,
            chunk_samples: 25,
            unpaced: true,
            ..SyntheticConfig::default()
        }))
    }

    #[tokio::test]
    async fn test_add_connect_idempotent() {
        let f = fixture().await;
        f.manager.add_device(synthetic("syn-1")).await.unwrap();
        f.manager.add_device(synthetic("syn-1")).await.unwrap();
        assert_eq!(f.manager.list_devices().await.len(), 1);

        let s1 = f.manager.connect("syn-1").await.unwrap();
        let s2 = f.manager.connect("syn-1").await.unwrap();
        assert_eq!(s1, DeviceState::Connected);
        assert_eq!(s2, DeviceState::Connected);

        // Both issuances were recorded
        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = f.ledger_store.analytical_range(0, 0, 10).await.unwrap();
        let connects = events
            .iter()
            .filter(|e| e.event_type == EventType::DeviceConnected)
            .count();
        assert_eq!(connects, 2);
    }

    #[tokio::test]
    async fn test_unknown_device_not_found() {
        let f = fixture().await;
        let err = f.manager.connect("ghost").await.unwrap_err();
        assert_eq!(err.code(), "ErrDeviceNotFound");
    }

    #[tokio::test]
    async fn test_session_lifecycle_and_conflict() {
        let f = fixture().await;
        let session = f
            .manager
            .start_session("patient-1", &[], Some("rest"))
            .await
            .unwrap();
        assert!(f.manager.current_session().await.is_some());

        let err = f
            .manager
            .start_session("patient-2", &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ErrSessionConflict");

        let closed = f.manager.end_session().await.unwrap();
        assert_eq!(closed.session_id, session.session_id);
        assert!(f.manager.current_session().await.is_none());

        // session_created and session_closed were ledgered
        let events = f
            .ledger_store
            .events_for_session(&session.session_id)
            .await
            .unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::SessionCreated));
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::SessionClosed));
        // The raw user id never reaches the ledger
        assert!(events
            .iter()
            .all(|e| e.user_id.as_deref() != Some("patient-1")));
    }

    #[tokio::test]
    async fn test_streaming_feeds_ingestion() {
        let f = fixture().await;
        f.manager.add_device(synthetic("syn-s")).await.unwrap();
        f.manager.connect("syn-s").await.unwrap();
        let session = f
            .manager
            .start_session("subject", &["syn-s".to_string()], None)
            .await
            .unwrap();
        let started = f.manager.start_streaming(&session.session_id).await.unwrap();
        assert_eq!(started, 1);

        // Wait for chunks to flow into the session counters
        let mut samples = 0;
        for _ in 0..100 {
            samples = f
                .sessions
                .get(&session.session_id)
                .await
                .unwrap()
                .samples_seen;
            if samples >= 100 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(samples >= 100, "only {samples} samples ingested");

        f.manager.stop_streaming().await.unwrap();
        f.manager.end_session().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_streaming_twice_is_idempotent() {
        let f = fixture().await;
        f.manager.add_device(synthetic("syn-2")).await.unwrap();
        f.manager.connect("syn-2").await.unwrap();
        let session = f.manager.start_session("u", &[], None).await.unwrap();
        assert_eq!(
            f.manager.start_streaming(&session.session_id).await.unwrap(),
            1
        );
        assert_eq!(
            f.manager.start_streaming(&session.session_id).await.unwrap(),
            1
        );
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_impedance_probe() {
        let f = fixture().await;
        f.manager.add_device(synthetic("syn-z")).await.unwrap();
        f.manager.connect("syn-z").await.unwrap();
        let ohms = f.manager.check_impedance("syn-z").await.unwrap();
        assert_eq!(ohms.len(), 4);
        assert!(ohms.values().all(|&v| v > 0.0));
    }

    #[tokio::test]
    async fn test_health_snapshots_for_idle_devices() {
        let f = fixture().await;
        f.manager.add_device(synthetic("syn-h")).await.unwrap();
        f.manager.connect("syn-h").await.unwrap();
        f.manager.health_tick(1.0).await;
        let snapshots = f.manager.health_snapshots().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].device_id, "syn-h");
        assert!(f.manager.health_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_from_discovery_synthetic() {
        let f = fixture().await;
        let discovered = DiscoveredDevice {
            discovery_id: "x".to_string(),
            device_type: crate::device::DeviceType::Synthetic,
            protocol: DiscoveryProtocol::Synthetic,
            endpoint: "synthetic-7".to_string(),
            rssi: None,
            friendly_name: "synthetic".to_string(),
        };
        let info = f
            .manager
            .create_from_discovery(&discovered, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(info.device_id, "synthetic-7");
        assert_eq!(f.manager.list_devices().await.len(), 1);
    }
}
