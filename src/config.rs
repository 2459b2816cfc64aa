//! Engine Configuration
//!
//! One typed configuration structure assembled at process start and never
//! mutated afterwards. Every option is enumerated here; nothing reads the
//! environment after startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, Result};

// ============================================================================
// Top-level configuration
// ============================================================================

/// Full engine configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ingest: IngestConfig,
    pub pipeline: PipelineConfig,
    pub ledger: LedgerConfig,
    pub devices: DeviceConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            pipeline: PipelineConfig::default(),
            ledger: LedgerConfig::default(),
            devices: DeviceConfig::default(),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Call `dotenvy::dotenv().ok()` before this in binaries.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            ingest: IngestConfig::from_env(),
            pipeline: PipelineConfig::from_env(),
            ledger: LedgerConfig::from_env(),
            devices: DeviceConfig::from_env(),
            storage: StorageConfig::from_env(),
            server: ServerConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Fail closed on nonsensical settings; never degrade silently.
    pub fn validate(&self) -> Result<()> {
        if self.ingest.max_chunk_bytes == 0 {
            return Err(EngineError::configuration("INGEST_MAX_CHUNK_BYTES must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.ingest.buffer_high_watermark) {
            return Err(EngineError::configuration(
                "INGEST_BUFFER_HIGH_WM must be within [0,1]",
            ));
        }
        if self.pipeline.window_ms == 0 {
            return Err(EngineError::configuration("WINDOW_MS must be > 0"));
        }
        if self.ledger.shard_count == 0 {
            return Err(EngineError::configuration("LEDGER_SHARD_COUNT must be >= 1"));
        }
        if self.ingest.anonymization_salt.is_empty() {
            return Err(EngineError::configuration(
                "ANONYMIZATION_SALT must not be empty",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Ingestion
// ============================================================================

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Maximum encoded chunk size in bytes
    pub max_chunk_bytes: usize,
    /// Bounded buffer capacity in chunks
    pub buffer_capacity: usize,
    /// Occupancy fraction above which producers see Busy and shedding starts
    pub buffer_high_watermark: f64,
    /// Salt mixed into anonymized subject ids, fixed for the process lifetime
    pub anonymization_salt: String,
    /// Create a session on first sight of an unknown session id
    pub auto_create_sessions: bool,
    /// Per-chunk publish deadline
    pub publish_timeout: Duration,
    /// Retry schedule toward the dead-letter topic
    pub publish_max_retries: u32,
    pub publish_backoff_min: Duration,
    pub publish_backoff_max: Duration,
    /// Routing time-bucket width
    pub time_bucket: Duration,
    /// Partitions per signal topic
    pub partitions: u32,
    /// Object-store prefix for batch uploads
    pub batch_prefix: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 1024 * 1024,
            buffer_capacity: 10_000,
            buffer_high_watermark: 0.8,
            anonymization_salt: "neurascale-dev-salt".to_string(),
            auto_create_sessions: false,
            publish_timeout: Duration::from_millis(500),
            publish_max_retries: 5,
            publish_backoff_min: Duration::from_secs(10),
            publish_backoff_max: Duration::from_secs(600),
            time_bucket: Duration::from_secs(300),
            partitions: 8,
            batch_prefix: PathBuf::from("./data/batches"),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_chunk_bytes: env_parse("INGEST_MAX_CHUNK_BYTES", defaults.max_chunk_bytes),
            buffer_capacity: env_parse("INGEST_BUFFER_CAPACITY", defaults.buffer_capacity),
            buffer_high_watermark: env_parse("INGEST_BUFFER_HIGH_WM", defaults.buffer_high_watermark),
            anonymization_salt: std::env::var("ANONYMIZATION_SALT")
                .unwrap_or(defaults.anonymization_salt),
            auto_create_sessions: env_flag("INGEST_AUTO_CREATE_SESSIONS", false),
            publish_timeout: Duration::from_millis(env_parse(
                "INGEST_PUBLISH_TIMEOUT_MS",
                defaults.publish_timeout.as_millis() as u64,
            )),
            publish_max_retries: env_parse("INGEST_PUBLISH_MAX_RETRIES", defaults.publish_max_retries),
            publish_backoff_min: defaults.publish_backoff_min,
            publish_backoff_max: defaults.publish_backoff_max,
            time_bucket: defaults.time_bucket,
            partitions: env_parse("INGEST_PARTITIONS", defaults.partitions),
            batch_prefix: std::env::var("INGEST_BATCH_PREFIX")
                .map(PathBuf::from)
                .unwrap_or(defaults.batch_prefix),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Tumbling window size in milliseconds
    pub window_ms: u64,
    /// Allowed lateness as a multiple of the window size
    pub lateness_windows: u32,
    /// Feature worker pool size; 0 means one per CPU
    pub worker_threads: usize,
    /// Deadline for computing one window, as a multiple of the window size
    pub window_deadline_multiple: u32,
    /// Emit gap anomalies instead of interpolating
    pub gap_fill: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_ms: 50,
            lateness_windows: 2,
            worker_threads: 0,
            window_deadline_multiple: 10,
            gap_fill: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            window_ms: env_parse("WINDOW_MS", defaults.window_ms),
            lateness_windows: env_parse("WINDOW_LATENESS", defaults.lateness_windows),
            worker_threads: env_parse("PIPELINE_WORKERS", defaults.worker_threads),
            window_deadline_multiple: defaults.window_deadline_multiple,
            gap_fill: env_flag("PIPELINE_GAP_FILL", false),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn window_ns(&self) -> i64 {
        self.window_ms as i64 * 1_000_000
    }

    pub fn allowed_lateness_ns(&self) -> i64 {
        self.window_ns() * self.lateness_windows as i64
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Number of independent chains; session ids hash to one of them
    pub shard_count: u32,
    /// KMS key version used to sign event hashes; None disables signing
    pub signing_key_id: Option<String>,
    /// KMS endpoint for remote signing
    pub kms_endpoint: Option<String>,
    /// Cross-shard root chain cadence
    pub root_interval: Duration,
    /// Per-append deadline
    pub append_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            shard_count: 1,
            signing_key_id: None,
            kms_endpoint: None,
            root_interval: Duration::from_secs(60),
            append_timeout: Duration::from_millis(250),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            shard_count: env_parse("LEDGER_SHARD_COUNT", defaults.shard_count),
            signing_key_id: std::env::var("LEDGER_SIGNING_KEY_ID").ok(),
            kms_endpoint: std::env::var("LEDGER_KMS_ENDPOINT").ok(),
            root_interval: Duration::from_millis(env_parse(
                "LEDGER_ROOT_INTERVAL_MS",
                defaults.root_interval.as_millis() as u64,
            )),
            append_timeout: Duration::from_millis(env_parse(
                "LEDGER_APPEND_TIMEOUT_MS",
                defaults.append_timeout.as_millis() as u64,
            )),
        }
    }
}

// ============================================================================
// Devices & discovery
// ============================================================================

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Health monitor tick interval
    pub health_check_interval: Duration,
    /// Consecutive degraded intervals before an alert fires
    pub health_alert_threshold: u32,
    /// mDNS discovery probe on/off
    pub mdns_enabled: bool,
    /// Synthetic device visible in discovery scans
    pub synthetic_enabled: bool,
    /// Discovery probe deadline
    pub discovery_timeout: Duration,
    /// Telemetry ring capacity per device
    pub telemetry_capacity: usize,
    /// Ring occupancy fraction that forces a flush
    pub telemetry_flush_watermark: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_millis(1000),
            health_alert_threshold: 3,
            mdns_enabled: true,
            synthetic_enabled: false,
            discovery_timeout: Duration::from_secs(5),
            telemetry_capacity: 10_000,
            telemetry_flush_watermark: 0.8,
        }
    }
}

impl DeviceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            health_check_interval: Duration::from_millis(env_parse(
                "HEALTH_CHECK_INTERVAL_MS",
                defaults.health_check_interval.as_millis() as u64,
            )),
            health_alert_threshold: env_parse(
                "HEALTH_ALERT_THRESHOLD",
                defaults.health_alert_threshold,
            ),
            mdns_enabled: env_flag("DISCOVERY_MDNS_ENABLED", defaults.mdns_enabled),
            synthetic_enabled: env_flag("DISCOVERY_SYNTHETIC_ENABLED", defaults.synthetic_enabled),
            discovery_timeout: Duration::from_millis(env_parse(
                "DISCOVERY_TIMEOUT_MS",
                defaults.discovery_timeout.as_millis() as u64,
            )),
            telemetry_capacity: env_parse("TELEMETRY_CAPACITY", defaults.telemetry_capacity),
            telemetry_flush_watermark: defaults.telemetry_flush_watermark,
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// SQLite database holding the ledger chain, analytical and index tables
    pub ledger_db: String,
    /// SQLite database holding sessions and derived features
    pub engine_db: String,
    /// Redis URL for the durable log; None selects the in-process log
    pub redis_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            // rwc: create the database file on first start
            ledger_db: "sqlite:data/ledger.db?mode=rwc".to_string(),
            engine_db: "sqlite:data/engine.db?mode=rwc".to_string(),
            redis_url: None,
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ledger_db: std::env::var("STORAGE_LEDGER_DB").unwrap_or(defaults.ledger_db),
            engine_db: std::env::var("STORAGE_ENGINE_DB").unwrap_or(defaults.engine_db),
            redis_url: std::env::var("STORAGE_REDIS_URL").ok(),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT", defaults.port),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Env helpers
// ============================================================================

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_watermark_range_enforced() {
        let mut config = EngineConfig::default();
        config.ingest.buffer_high_watermark = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = EngineConfig::default();
        config.pipeline.window_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lateness_is_twice_window_by_default() {
        let pipeline = PipelineConfig::default();
        assert_eq!(pipeline.allowed_lateness_ns(), 2 * pipeline.window_ns());
    }
}
