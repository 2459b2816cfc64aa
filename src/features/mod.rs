//! Signal Feature Library
//!
//! Pure functions over sample windows, shared by the ingestion quality
//! pass, the windowed processing pipeline and driver quality probes.
//! Everything computes in f64 and serializes as f32.

pub mod connectivity;
pub mod quality;
pub mod spectral;
pub mod spikes;
pub mod temporal;
pub mod wavelet;

pub use connectivity::{connectivity_features, ConnectivityFeatures};
pub use quality::{
    assess_channel, assess_window, ArtifactFlags, ChannelQuality, QualityLevel, QualityReport,
    QualityWeights,
};
pub use spectral::{spectral_features, welch_psd, BandPowers, SpectralFeatures};
pub use spikes::{spike_features, SpikeFeatures};
pub use temporal::{temporal_features, TemporalFeatures};
pub use wavelet::{wavelet_features, WaveletFeatures};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chunk::DataType;

/// Band used for the coherence estimate, Hz
const COHERENCE_BAND: (f64, f64) = (8.0, 12.0);

// ============================================================================
// Feature frame
// ============================================================================

/// Everything computed for one channel of one window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelFeatures {
    pub channel_id: u32,
    pub temporal: TemporalFeatures,
    pub spectral: SpectralFeatures,
    pub wavelet: WaveletFeatures,
    /// Present only for spike-modality windows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spikes: Option<SpikeFeatures>,
}

/// Immutable output of the windowed pipeline for one (session, window)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFrame {
    pub session_id: String,
    pub window_start_ns: i64,
    pub window_end_ns: i64,
    pub data_type: DataType,
    pub channel_features: Vec<ChannelFeatures>,
    pub cross_channel_features: ConnectivityFeatures,
    /// Inclusive chunk_seq range the window was assembled from
    pub derived_from_chunk_range: (u64, u64),
}

impl FeatureFrame {
    /// SHA-256 over the canonical JSON rendering, recorded in
    /// `features_computed` ledger events.
    pub fn features_hash(&self) -> [u8; 32] {
        let json = serde_json::to_vec(self).unwrap_or_default();
        Sha256::digest(&json).into()
    }
}

/// Compute a full feature frame from windowed channel data.
///
/// `channels` pairs each channel id with its samples for the window; all
/// rows have the same length. Spike features are only computed for the
/// spike modality, where the sampling rate makes them meaningful.
pub fn compute_feature_frame(
    session_id: &str,
    data_type: DataType,
    sampling_rate_hz: u32,
    window_start_ns: i64,
    window_end_ns: i64,
    channels: &[(u32, Vec<f32>)],
    chunk_range: (u64, u64),
) -> FeatureFrame {
    let fs = sampling_rate_hz as f64;

    let channel_features = channels
        .iter()
        .map(|(id, x)| ChannelFeatures {
            channel_id: *id,
            temporal: temporal_features(x),
            spectral: spectral_features(x, fs),
            wavelet: wavelet_features(x),
            spikes: match data_type {
                DataType::Spikes => Some(spike_features(x, fs)),
                _ => None,
            },
        })
        .collect();

    let rows: Vec<Vec<f32>> = channels.iter().map(|(_, x)| x.clone()).collect();
    let cross_channel_features = connectivity_features(&rows, fs, COHERENCE_BAND);

    FeatureFrame {
        session_id: session_id.to_string(),
        window_start_ns,
        window_end_ns,
        data_type,
        channel_features,
        cross_channel_features,
        derived_from_chunk_range: chunk_range,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(channels: usize, samples: usize) -> Vec<(u32, Vec<f32>)> {
        (0..channels as u32)
            .map(|id| {
                let x = (0..samples)
                    .map(|i| {
                        ((2.0 * std::f64::consts::PI * 10.0 * i as f64 / 1000.0).sin() * 20.0)
                            as f32
                            + id as f32
                    })
                    .collect();
                (id, x)
            })
            .collect()
    }

    #[test]
    fn test_frame_has_all_channels() {
        let frame = compute_feature_frame(
            "sess-1",
            DataType::Eeg,
            1000,
            0,
            50_000_000,
            &window(8, 50),
            (10, 12),
        );
        assert_eq!(frame.channel_features.len(), 8);
        assert_eq!(frame.derived_from_chunk_range, (10, 12));
        assert!(frame.channel_features.iter().all(|c| c.spikes.is_none()));
    }

    #[test]
    fn test_spike_modality_includes_spike_features() {
        let frame = compute_feature_frame(
            "sess-1",
            DataType::Spikes,
            30_000,
            0,
            50_000_000,
            &window(4, 1500),
            (0, 0),
        );
        assert!(frame.channel_features.iter().all(|c| c.spikes.is_some()));
    }

    #[test]
    fn test_features_hash_changes_with_content() {
        let a = compute_feature_frame("s", DataType::Eeg, 1000, 0, 50, &window(2, 64), (0, 0));
        let mut b = a.clone();
        b.window_start_ns = 1;
        assert_ne!(a.features_hash(), b.features_hash());
        assert_eq!(a.features_hash(), a.clone().features_hash());
    }

    #[test]
    fn test_frame_serializes() {
        let frame = compute_feature_frame("s", DataType::Eeg, 1000, 0, 50, &window(2, 64), (0, 1));
        let json = serde_json::to_string(&frame).unwrap();
        let back: FeatureFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }
}
