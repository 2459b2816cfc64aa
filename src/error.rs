//! Error types for the Neural Engine
//!
//! One finite taxonomy covers the whole ingestion path. Retries and
//! backoff are driven by `is_transient()`, never by matching on message
//! strings, and every variant that relates to a session, device or chunk
//! carries the id so callers can correlate failures.

use thiserror::Error;

/// Result type alias used throughout the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error taxonomy
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input malformed, missing fields, out-of-range. Surfaced to the
    /// caller, never retried.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Network, broker unavailable, store 5xx. Retried with capped
    /// exponential backoff before being routed to the dead-letter topic.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// Chain hash mismatch, signature failure, corrupted chunk payload.
    /// Fatal for the affected shard; the service enters read-only mode.
    #[error("integrity violation: {message}")]
    Integrity { message: String },

    /// Buffer full, quota exceeded. Callers see `429` and shedding kicks in.
    #[error("resource exhausted: {message}")]
    Resource { message: String },

    /// Missing or insufficient permissions. Emits an `access_denied`
    /// ledger event; callers see `403`.
    #[error("permission denied: {message}")]
    Permission { message: String },

    /// Invalid configuration. Fails closed on startup.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Codec-level failures (checksum, version, size)
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),

    /// Device driver failures
    #[error(transparent)]
    Device(#[from] crate::device::DeviceError),

    /// Referenced session does not exist
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Operation conflicts with the current session state
    #[error("session conflict: {message}")]
    SessionConflict { message: String },

    /// Referenced device is not attached
    #[error("device not found: {device_id}")]
    DeviceNotFound { device_id: String },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for API responses and metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ErrValidation",
            Self::Transient { .. } => "ErrTransient",
            Self::Integrity { .. } => "ErrIntegrity",
            Self::Resource { .. } => "ErrResource",
            Self::Permission { .. } => "ErrPermission",
            Self::Configuration { .. } => "ErrConfiguration",
            Self::Codec(e) => e.code(),
            Self::Device(_) => "ErrDevice",
            Self::SessionNotFound { .. } => "ErrSessionNotFound",
            Self::SessionConflict { .. } => "ErrSessionConflict",
            Self::DeviceNotFound { .. } => "ErrDeviceNotFound",
        }
    }

    /// Whether a retry can plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether the affected shard must stop accepting writes
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::validation("row not found"),
            other => Self::transient(format!("store error: {other}")),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::validation(format!("json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(EngineError::validation("x").code(), "ErrValidation");
        assert_eq!(EngineError::resource("x").code(), "ErrResource");
        assert_eq!(
            EngineError::integrity("hash mismatch at seq 500").code(),
            "ErrIntegrity"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::transient("broker down").is_transient());
        assert!(!EngineError::validation("bad header").is_transient());
        assert!(EngineError::integrity("tamper").is_fatal());
    }

    #[test]
    fn test_sqlx_not_found_is_validation() {
        let err: EngineError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "ErrValidation");
    }
}
