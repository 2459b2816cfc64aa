//! Device Abstraction Layer
//!
//! One capability-set contract covers every device family; concrete
//! behavior lives in tagged driver implementations rather than an
//! inheritance tree. Drivers push `DriverEvent`s into a sink channel and
//! never silently drop samples: a detected sequence gap becomes an
//! explicit event.

pub mod biosignal;
pub mod lsl;
pub mod serial;
pub mod synthetic;

pub use biosignal::{BiosignalBoard, BiosignalDriver};
pub use lsl::LslDriver;
pub use serial::CytonSerialDriver;
pub use synthetic::{SyntheticConfig, SyntheticDriver};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::chunk::{ChannelInfo, DataType, SampleChunk};
use crate::features::QualityReport;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceErrorKind {
    NotFound,
    PermissionDenied,
    AlreadyInUse,
    ProtocolError,
    AlreadyStreaming,
    HardwareError,
    Unsupported,
}

#[derive(Debug, Error)]
#[error("device error ({kind:?}): {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::NotFound, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::ProtocolError, message)
    }

    pub fn hardware(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::HardwareError, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::Unsupported, message)
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

// ============================================================================
// Device info
// ============================================================================

/// Device family tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Synthetic,
    Serial,
    BiosignalSdk,
    Lsl,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Synthetic => "synthetic",
            DeviceType::Serial => "serial",
            DeviceType::BiosignalSdk => "biosignal_sdk",
            DeviceType::Lsl => "lsl",
        }
    }
}

/// Static description returned by `describe()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_type: DeviceType,
    pub data_type: DataType,
    pub channels: Vec<ChannelInfo>,
    pub sampling_rate_hz: u32,
    pub supports_impedance_check: bool,
    pub supports_battery: bool,
}

// ============================================================================
// Lifecycle FSM
// ============================================================================

/// Device lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Discovered,
    Connecting,
    Connected,
    Streaming,
    Paused,
    Disconnecting,
    Closed,
    Errored,
}

impl DeviceState {
    /// Legal transitions of the lifecycle FSM. Any state may enter
    /// `Errored`; `Errored` re-enters through `Connecting`.
    pub fn can_transition(self, to: DeviceState) -> bool {
        use DeviceState::*;
        if to == Errored {
            return true;
        }
        matches!(
            (self, to),
            (Discovered, Connecting)
                | (Connecting, Connected)
                | (Connected, Streaming)
                | (Connected, Disconnecting)
                | (Streaming, Paused)
                | (Streaming, Disconnecting)
                | (Paused, Streaming)
                | (Paused, Disconnecting)
                | (Disconnecting, Closed)
                | (Errored, Connecting)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == DeviceState::Closed
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Discovered => "discovered",
            DeviceState::Connecting => "connecting",
            DeviceState::Connected => "connected",
            DeviceState::Streaming => "streaming",
            DeviceState::Paused => "paused",
            DeviceState::Disconnecting => "disconnecting",
            DeviceState::Closed => "closed",
            DeviceState::Errored => "errored",
        }
    }
}

/// Reconnect backoff: exponential, capped at 30 s, jittered ±20 %.
/// Re-entry into `Connecting` from `Errored` resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempt: 0,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            cap,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay, advancing the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt.min(16)));
        let capped = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(-0.2f64..=0.2);
        let nanos = capped.as_nanos() as f64 * (1.0 + jitter);
        Duration::from_nanos(nanos.max(0.0) as u64)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ============================================================================
// Driver contract
// ============================================================================

/// Events a driver pushes into its sink
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Chunk(SampleChunk),
    /// Sequence gap: samples were lost upstream
    Gap {
        device_id: String,
        expected_seq: u64,
        got_seq: u64,
    },
    StateChanged {
        device_id: String,
        state: DeviceState,
    },
    Fault {
        device_id: String,
        kind: DeviceErrorKind,
        message: String,
    },
}

/// The capability set every driver implements.
///
/// Connection parameters are given at construction; `connect` is
/// idempotent on an already-connected driver.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn connect(&mut self) -> DeviceResult<()>;

    async fn disconnect(&mut self) -> DeviceResult<()>;

    fn describe(&self) -> DeviceInfo;

    fn state(&self) -> DeviceState;

    /// Start pushing `DriverEvent`s into `sink`. Fails with
    /// `AlreadyStreaming` if a stream is active.
    async fn start_stream(&mut self, sink: mpsc::Sender<DriverEvent>) -> DeviceResult<()>;

    async fn stop_stream(&mut self) -> DeviceResult<()>;

    /// Electrode impedance per channel id, ohms
    async fn check_impedance(&mut self) -> DeviceResult<HashMap<u32, f64>> {
        Err(DeviceError::unsupported("impedance check not supported"))
    }

    /// Capture `duration` of signal and assess it
    async fn probe_quality(&mut self, duration: Duration) -> DeviceResult<QualityReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use DeviceState::*;
        let path = [
            Discovered,
            Connecting,
            Connected,
            Streaming,
            Paused,
            Streaming,
            Disconnecting,
            Closed,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition(pair[1]),
                "{:?} -> {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        use DeviceState::*;
        assert!(!Discovered.can_transition(Streaming));
        assert!(!Closed.can_transition(Connected));
        assert!(!Streaming.can_transition(Connected));
        assert!(!Connecting.can_transition(Paused));
    }

    #[test]
    fn test_any_state_may_error() {
        use DeviceState::*;
        for s in [
            Discovered,
            Connecting,
            Connected,
            Streaming,
            Paused,
            Disconnecting,
            Closed,
        ] {
            assert!(s.can_transition(Errored));
        }
        assert!(Errored.can_transition(Connecting));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));
        let mut last = Duration::ZERO;
        for _ in 0..6 {
            let d = backoff.next_delay();
            // jitter is bounded by ±20 %
            assert!(d >= last.mul_f64(0.5), "delay shrank too far");
            last = d;
        }
        for _ in 0..20 {
            let d = backoff.next_delay();
            assert!(d <= Duration::from_secs(30).mul_f64(1.2 + 1e-9));
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 5);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}
