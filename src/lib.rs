//! # NeuraScale Neural Engine
//!
//! Real-time ingestion, processing and audit pipeline for brain-computer
//! interface signal streams.
//!
//! ## Features
//!
//! - **Device Abstraction**: one capability contract over synthetic,
//!   serial, biosignal-SDK and LSL device families
//! - **Discovery**: serial / bluetooth / mDNS / LSL bus scanning with
//!   per-protocol failure isolation
//! - **Ingestion**: validation, subject anonymization, quality scoring,
//!   partition-stable routing and durable publish with backpressure
//! - **Windowed Processing**: tumbling event-time windows into spectral,
//!   temporal, wavelet and connectivity features
//! - **Neural Ledger**: hash-chained, optionally signed audit events
//!   materialized across time-series, analytical and document stores
//! - **Control Plane**: REST API for sessions, devices, health,
//!   telemetry and ledger verification
//!
//! ## Architecture
//!
//! Drivers push sample chunks to the device manager; ingestion
//! validates and publishes them onto a durable per-data-type log; the
//! pipeline windows the stream and emits feature frames; every
//! data-affecting step lands in the ledger as a chained event.

pub mod anonymize;
pub mod auth;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod features;
pub mod health;
pub mod ingest;
pub mod ledger;
pub mod log;
pub mod manager;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod util;

pub use anonymize::Anonymizer;
pub use auth::{AuthRegistry, Permission, Principal};
pub use chunk::{ChannelInfo, ChannelKind, DataType, SampleChunk, SessionShape};
pub use codec::{decode, encode, CodecError, CODEC_VERSION};
pub use config::EngineConfig;
pub use device::{
    BiosignalBoard, BiosignalDriver, CytonSerialDriver, DeviceDriver, DeviceError, DeviceInfo,
    DeviceState, DeviceType, DriverEvent, LslDriver, SyntheticConfig, SyntheticDriver,
};
pub use discovery::{DiscoveredDevice, DiscoveryOptions, DiscoveryProtocol, ScanReport};
pub use error::{EngineError, Result};
pub use features::{FeatureFrame, QualityLevel, QualityReport};
pub use health::{HealthAlert, HealthSnapshot, HealthStatus};
pub use ingest::{BatchStore, IngestReceipt, IngestionService};
pub use ledger::{
    EventType, HmacSigner, KmsSigner, LedgerEvent, LedgerHandle, LedgerIntent, LedgerStore,
    LedgerWriter, Signer, VerifyOutcome, Violation,
};
pub use log::{DurableLog, MemoryLog, RedisLog};
pub use manager::DeviceManager;
pub use pipeline::{DerivedStore, ProcessingPipeline, WindowAssembler};
pub use server::{create_router, run_server, AppState};
pub use session::{Session, SessionStatus, SessionStore};
pub use telemetry::{TelemetryCollector, TelemetryEvent, TelemetryExporter};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::chunk::{DataType, SampleChunk};
    pub use crate::config::EngineConfig;
    pub use crate::device::{DeviceDriver, DeviceState, DriverEvent};
    pub use crate::error::{EngineError, Result};
    pub use crate::features::{FeatureFrame, QualityReport};
    pub use crate::ingest::IngestionService;
    pub use crate::ledger::{LedgerHandle, LedgerIntent, LedgerStore};
    pub use crate::manager::DeviceManager;
    pub use crate::pipeline::ProcessingPipeline;
    pub use crate::session::SessionStore;
}
