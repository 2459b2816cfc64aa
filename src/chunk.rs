//! Sample Chunk Model
//!
//! The one immutable unit that crosses component boundaries: a C×N block of
//! float32 samples in canonical units (µV for neural signals, m/s² for
//! accelerometer data) plus the scalar header fields every component needs.
//!
//! Channel count, sampling rate and data type are fixed for the lifetime of
//! a session; a gap in `chunk_seq` means packet loss.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ============================================================================
// Data types & channels
// ============================================================================

/// Signal modality carried by a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Eeg,
    Ecog,
    Spikes,
    Lfp,
    Emg,
    Accelerometer,
}

impl DataType {
    pub const ALL: [DataType; 6] = [
        DataType::Eeg,
        DataType::Ecog,
        DataType::Spikes,
        DataType::Lfp,
        DataType::Emg,
        DataType::Accelerometer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Eeg => "eeg",
            DataType::Ecog => "ecog",
            DataType::Spikes => "spikes",
            DataType::Lfp => "lfp",
            DataType::Emg => "emg",
            DataType::Accelerometer => "accelerometer",
        }
    }

    /// Wire tag used by the binary codec
    pub fn wire_tag(&self) -> u8 {
        match self {
            DataType::Eeg => 0,
            DataType::Ecog => 1,
            DataType::Spikes => 2,
            DataType::Lfp => 3,
            DataType::Emg => 4,
            DataType::Accelerometer => 5,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.wire_tag() == tag)
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == s)
    }

    /// Canonical unit for this modality
    pub fn unit(&self) -> &'static str {
        match self {
            DataType::Accelerometer => "m/s^2",
            _ => "uV",
        }
    }
}

/// What a channel physically measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Neural,
    Accelerometer,
    Marker,
    Auxiliary,
}

/// One entry in a chunk's ordered channel list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: u32,
    pub label: String,
    pub kind: ChannelKind,
    pub unit: String,
    /// 10-20 style electrode position when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<[f32; 3]>,
}

impl ChannelInfo {
    pub fn neural(id: u32, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            kind: ChannelKind::Neural,
            unit: "uV".to_string(),
            position: None,
        }
    }
}

// ============================================================================
// SampleChunk
// ============================================================================

/// One windowed block of multi-channel samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleChunk {
    /// Opaque recording identifier, unique per session
    pub session_id: String,
    /// Stable identifier of the originating physical device
    pub device_id: String,
    pub data_type: DataType,
    pub sampling_rate_hz: u32,
    /// Ordered channel descriptors; length C
    pub channels: Vec<ChannelInfo>,
    /// C×N sample matrix, one inner vector per channel
    pub samples: Vec<Vec<f32>>,
    /// Monotonically increasing per session; gaps mean packet loss
    pub chunk_seq: u64,
    /// Device clock time of the first sample, ns since epoch
    pub device_ts_ns: i64,
    /// Server receive time, ns since epoch
    pub ingest_ts_ns: i64,
}

impl SampleChunk {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples.first().map(|c| c.len()).unwrap_or(0)
    }

    /// Time spanned by this chunk at its sampling rate
    pub fn duration_ns(&self) -> i64 {
        if self.sampling_rate_hz == 0 {
            return 0;
        }
        (self.samples_per_channel() as i64) * 1_000_000_000 / self.sampling_rate_hz as i64
    }

    /// End timestamp of the chunk, exclusive
    pub fn end_ts_ns(&self) -> i64 {
        self.device_ts_ns + self.duration_ns()
    }

    /// Structural validation of a single chunk, independent of session state
    pub fn validate(&self) -> Result<()> {
        if self.session_id.is_empty() {
            return Err(EngineError::validation("session_id must not be empty"));
        }
        if self.device_id.is_empty() {
            return Err(EngineError::validation("device_id must not be empty"));
        }
        if self.sampling_rate_hz == 0 {
            return Err(EngineError::validation(format!(
                "chunk {} of session {}: sampling_rate_hz must be positive",
                self.chunk_seq, self.session_id
            )));
        }
        if self.channels.is_empty() {
            return Err(EngineError::validation(format!(
                "chunk {} of session {}: channel list must not be empty",
                self.chunk_seq, self.session_id
            )));
        }
        if self.samples.len() != self.channels.len() {
            return Err(EngineError::validation(format!(
                "chunk {} of session {}: {} channel descriptors but {} sample rows",
                self.chunk_seq,
                self.session_id,
                self.channels.len(),
                self.samples.len()
            )));
        }
        let n = self.samples_per_channel();
        if n == 0 {
            return Err(EngineError::validation(format!(
                "chunk {} of session {}: empty sample rows",
                self.chunk_seq, self.session_id
            )));
        }
        if self.samples.iter().any(|row| row.len() != n) {
            return Err(EngineError::validation(format!(
                "chunk {} of session {}: ragged sample matrix",
                self.chunk_seq, self.session_id
            )));
        }
        if self.samples.iter().flatten().any(|v| !v.is_finite()) {
            return Err(EngineError::validation(format!(
                "chunk {} of session {}: non-finite sample value",
                self.chunk_seq, self.session_id
            )));
        }
        Ok(())
    }

    /// Check that this chunk is consistent with the shape the session
    /// established on its first chunk.
    pub fn check_shape(&self, shape: &SessionShape) -> Result<()> {
        if self.data_type != shape.data_type
            || self.sampling_rate_hz != shape.sampling_rate_hz
            || self.channel_count() != shape.channel_count
        {
            return Err(EngineError::validation(format!(
                "chunk {} of session {}: shape changed mid-session \
                 (got {:?}/{} Hz/{} ch, session is {:?}/{} Hz/{} ch)",
                self.chunk_seq,
                self.session_id,
                self.data_type,
                self.sampling_rate_hz,
                self.channel_count(),
                shape.data_type,
                shape.sampling_rate_hz,
                shape.channel_count,
            )));
        }
        Ok(())
    }

    pub fn shape(&self) -> SessionShape {
        SessionShape {
            data_type: self.data_type,
            sampling_rate_hz: self.sampling_rate_hz,
            channel_count: self.channel_count(),
        }
    }
}

/// The per-session invariants fixed by the first chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionShape {
    pub data_type: DataType,
    pub sampling_rate_hz: u32,
    pub channel_count: usize,
}

/// Build a well-formed chunk for tests
#[cfg(test)]
pub(crate) fn test_chunk(channels: usize, samples: usize) -> SampleChunk {
    SampleChunk {
        session_id: "sess-1".to_string(),
        device_id: "dev-1".to_string(),
        data_type: DataType::Eeg,
        sampling_rate_hz: 1000,
        channels: (0..channels as u32)
            .map(|i| ChannelInfo::neural(i, format!("CH{}", i)))
            .collect(),
        samples: vec![vec![0.5; samples]; channels],
        chunk_seq: 0,
        device_ts_ns: 1_700_000_000_000_000_000,
        ingest_ts_ns: 1_700_000_000_000_500_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_chunk_passes() {
        test_chunk(8, 50).validate().unwrap();
    }

    #[test]
    fn test_ragged_matrix_rejected() {
        let mut chunk = test_chunk(4, 50);
        chunk.samples[2].pop();
        assert!(chunk.validate().is_err());
    }

    #[test]
    fn test_zero_rate_rejected() {
        let mut chunk = test_chunk(4, 50);
        chunk.sampling_rate_hz = 0;
        assert!(chunk.validate().is_err());
    }

    #[test]
    fn test_nan_rejected() {
        let mut chunk = test_chunk(2, 10);
        chunk.samples[1][3] = f32::NAN;
        assert!(chunk.validate().is_err());
    }

    #[test]
    fn test_duration() {
        let chunk = test_chunk(4, 50);
        // 50 samples at 1 kHz is 50 ms
        assert_eq!(chunk.duration_ns(), 50_000_000);
        assert_eq!(chunk.end_ts_ns(), chunk.device_ts_ns + 50_000_000);
    }

    #[test]
    fn test_shape_mismatch_detected() {
        let chunk = test_chunk(8, 50);
        let mut other = test_chunk(8, 50);
        other.sampling_rate_hz = 500;
        assert!(other.check_shape(&chunk.shape()).is_err());
        assert!(chunk.check_shape(&chunk.shape()).is_ok());
    }

    #[test]
    fn test_data_type_wire_tags_round_trip() {
        for dt in DataType::ALL {
            assert_eq!(DataType::from_wire_tag(dt.wire_tag()), Some(dt));
            assert_eq!(DataType::parse(dt.as_str()), Some(dt));
        }
    }
}
