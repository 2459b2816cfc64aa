//! Signal Quality Assessment
//!
//! Per-channel SNR, line-noise ratio, artifact detection and the mapping
//! into the five quality levels. Used by ingestion on every chunk, by
//! drivers for impedance probes, and surfaced through the control plane.

use serde::{Deserialize, Serialize};

use crate::features::spectral::welch_psd;

// ============================================================================
// Types
// ============================================================================

/// Discrete quality levels reported to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Bad,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityLevel {
    /// Map a [0,1] score to a level
    pub fn from_score(score: f32) -> Self {
        if score >= 0.85 {
            QualityLevel::Excellent
        } else if score >= 0.7 {
            QualityLevel::Good
        } else if score >= 0.5 {
            QualityLevel::Fair
        } else if score >= 0.3 {
            QualityLevel::Poor
        } else {
            QualityLevel::Bad
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Excellent => "excellent",
            QualityLevel::Good => "good",
            QualityLevel::Fair => "fair",
            QualityLevel::Poor => "poor",
            QualityLevel::Bad => "bad",
        }
    }
}

/// Artifact classes flagged per channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFlags {
    pub eye: bool,
    pub muscle: bool,
    pub heart: bool,
    pub clip: bool,
    pub flatline: bool,
}

impl ArtifactFlags {
    pub fn any(&self) -> bool {
        self.eye || self.muscle || self.heart || self.clip || self.flatline
    }

    pub fn count(&self) -> u32 {
        [self.eye, self.muscle, self.heart, self.clip, self.flatline]
            .into_iter()
            .filter(|&f| f)
            .count() as u32
    }
}

/// Quality of a single channel within one assessment window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelQuality {
    pub channel_id: u32,
    pub snr_db: f32,
    /// Fraction of total power within the 50/60 Hz line bins
    pub line_noise_ratio: f32,
    pub artifacts: ArtifactFlags,
    /// Combined [0,1] score
    pub score: f32,
    pub quality_level: QualityLevel,
}

/// Full report over all channels of a chunk or probe window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub channels: Vec<ChannelQuality>,
    /// Mean of per-channel scores, [0,1]
    pub overall: f32,
}

impl QualityReport {
    pub fn empty() -> Self {
        Self {
            channels: Vec::new(),
            overall: 0.0,
        }
    }
}

/// Relative weight of each quality component
#[derive(Debug, Clone, Copy)]
pub struct QualityWeights {
    pub snr: f32,
    pub line_noise: f32,
    pub artifacts: f32,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            snr: 0.5,
            line_noise: 0.3,
            artifacts: 0.2,
        }
    }
}

// ============================================================================
// Detection thresholds
// ============================================================================

/// Channel is flat below this standard deviation, µV
const FLATLINE_STD_UV: f32 = 0.1;
/// Amplitude floor before clipping detection engages, µV
const CLIP_MIN_AMPLITUDE_UV: f32 = 200.0;
/// Fraction of samples pinned at the rail that flags clipping
const CLIP_FRACTION: f32 = 0.02;
/// Delta-band dominance that flags ocular artifacts
const EYE_DELTA_RATIO: f32 = 0.6;
/// Peak amplitude that accompanies ocular artifacts, µV
const EYE_AMPLITUDE_UV: f32 = 100.0;
/// Gamma-band dominance that flags muscle artifacts
const MUSCLE_GAMMA_RATIO: f32 = 0.45;
/// Kurtosis above which rhythmic transients flag cardiac contamination
const HEART_KURTOSIS: f32 = 8.0;

// ============================================================================
// Assessment
// ============================================================================

/// Assess one channel window sampled at `fs`
pub fn assess_channel(channel_id: u32, x: &[f32], fs: f64) -> ChannelQuality {
    assess_channel_weighted(channel_id, x, fs, QualityWeights::default())
}

pub fn assess_channel_weighted(
    channel_id: u32,
    x: &[f32],
    fs: f64,
    weights: QualityWeights,
) -> ChannelQuality {
    let artifacts = detect_artifacts(x, fs);
    let (snr_db, line_noise_ratio) = spectral_quality(x, fs);

    // SNR maps linearly onto [0,1] across the -5..+20 dB range
    let snr_component = ((snr_db + 5.0) / 25.0).clamp(0.0, 1.0);
    let line_component = (1.0 - line_noise_ratio * 5.0).clamp(0.0, 1.0);
    let artifact_component = (1.0 - artifacts.count() as f32 * 0.35).clamp(0.0, 1.0);

    let total = weights.snr + weights.line_noise + weights.artifacts;
    let mut score = (weights.snr * snr_component
        + weights.line_noise * line_component
        + weights.artifacts * artifact_component)
        / total;

    // Any artifact flag caps the channel at fair
    if artifacts.any() {
        score = score.min(0.69);
    }
    if artifacts.flatline {
        score = score.min(0.1);
    }

    ChannelQuality {
        channel_id,
        snr_db,
        line_noise_ratio,
        artifacts,
        score,
        quality_level: QualityLevel::from_score(score),
    }
}

/// Assess every channel of a window and aggregate
pub fn assess_window(channels: &[(u32, &[f32])], fs: f64) -> QualityReport {
    let per_channel: Vec<ChannelQuality> = channels
        .iter()
        .map(|(id, x)| assess_channel(*id, x, fs))
        .collect();
    let overall = if per_channel.is_empty() {
        0.0
    } else {
        per_channel.iter().map(|c| c.score).sum::<f32>() / per_channel.len() as f32
    };
    QualityReport {
        channels: per_channel,
        overall,
    }
}

/// SNR in dB (0.5–40 Hz signal band vs everything above, line bins
/// excluded) and the line-noise power fraction at 50 and 60 Hz.
fn spectral_quality(x: &[f32], fs: f64) -> (f32, f32) {
    if x.len() < 16 || fs <= 0.0 {
        return (0.0, 0.0);
    }
    let (freqs, psd) = welch_psd(x, fs, 256);

    let mut signal = 0.0f64;
    let mut noise = 0.0f64;
    let mut line = 0.0f64;
    let mut total = 0.0f64;
    for (f, p) in freqs.iter().zip(&psd).skip(1) {
        total += p;
        let in_line = (*f - 50.0).abs() <= 1.0 || (*f - 60.0).abs() <= 1.0;
        if in_line {
            line += p;
            continue;
        }
        if (0.5..40.0).contains(f) {
            signal += p;
        } else if *f >= 40.0 {
            noise += p;
        }
    }

    let snr_db = if noise > 0.0 && signal > 0.0 {
        10.0 * (signal / noise).log10()
    } else if signal > 0.0 {
        20.0
    } else {
        0.0
    };
    let line_ratio = if total > 0.0 { line / total } else { 0.0 };
    (snr_db as f32, line_ratio as f32)
}

fn detect_artifacts(x: &[f32], fs: f64) -> ArtifactFlags {
    let mut flags = ArtifactFlags::default();
    if x.len() < 4 {
        return flags;
    }

    let n = x.len() as f32;
    let mean = x.iter().sum::<f32>() / n;
    let var = x.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let std = var.sqrt();
    let max_abs = x.iter().fold(0.0f32, |a, &v| a.max(v.abs()));

    if std < FLATLINE_STD_UV {
        flags.flatline = true;
        return flags;
    }

    // Clipping: a visible fraction of samples pinned at the rail
    if max_abs > CLIP_MIN_AMPLITUDE_UV {
        let pinned = x.iter().filter(|&&v| v.abs() >= max_abs * 0.999).count();
        if pinned as f32 / n > CLIP_FRACTION {
            flags.clip = true;
        }
    }

    // Band dominance from the PSD
    if x.len() >= 16 && fs > 0.0 {
        let (freqs, psd) = welch_psd(x, fs, 256);
        let mut delta = 0.0;
        let mut gamma = 0.0;
        let mut total = 0.0;
        for (f, p) in freqs.iter().zip(&psd).skip(1) {
            total += p;
            if (0.5..4.0).contains(f) {
                delta += p;
            }
            if (30.0..100.0).contains(f) {
                gamma += p;
            }
        }
        if total > 0.0 {
            if (delta / total) as f32 > EYE_DELTA_RATIO && max_abs > EYE_AMPLITUDE_UV {
                flags.eye = true;
            }
            if (gamma / total) as f32 > MUSCLE_GAMMA_RATIO {
                flags.muscle = true;
            }
        }
    }

    // Cardiac contamination shows as heavy-tailed rhythmic transients
    if var > 0.0 {
        let m4 = x.iter().map(|&v| {
            let d = v - mean;
            d * d * d * d
        }).sum::<f32>() / n;
        let kurtosis = m4 / (var * var);
        if kurtosis > HEART_KURTOSIS && transient_rate(x, mean, std, fs) > 0.5 {
            flags.heart = true;
        }
    }

    flags
}

/// Rate of isolated large transients per second, used for the cardiac check
fn transient_rate(x: &[f32], mean: f32, std: f32, fs: f64) -> f32 {
    if fs <= 0.0 {
        return 0.0;
    }
    let threshold = 4.0 * std;
    let mut count = 0usize;
    let mut in_transient = false;
    for &v in x {
        if (v - mean).abs() > threshold {
            if !in_transient {
                count += 1;
                in_transient = true;
            }
        } else {
            in_transient = false;
        }
    }
    count as f32 / (x.len() as f32 / fs as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn clean_eeg(n: usize, fs: f64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..n)
            .map(|i| {
                let t = i as f64 / fs;
                let alpha = 30.0 * (2.0 * std::f64::consts::PI * 10.0 * t).sin();
                let beta = 8.0 * (2.0 * std::f64::consts::PI * 20.0 * t).sin();
                (alpha + beta) as f32 + rng.gen_range(-2.0f32..2.0)
            })
            .collect()
    }

    #[test]
    fn test_level_boundaries() {
        assert_eq!(QualityLevel::from_score(0.85), QualityLevel::Excellent);
        assert_eq!(QualityLevel::from_score(0.84), QualityLevel::Good);
        assert_eq!(QualityLevel::from_score(0.7), QualityLevel::Good);
        assert_eq!(QualityLevel::from_score(0.5), QualityLevel::Fair);
        assert_eq!(QualityLevel::from_score(0.3), QualityLevel::Poor);
        assert_eq!(QualityLevel::from_score(0.29), QualityLevel::Bad);
    }

    #[test]
    fn test_clean_signal_scores_well() {
        let x = clean_eeg(1000, 250.0);
        let q = assess_channel(0, &x, 250.0);
        assert!(!q.artifacts.any(), "{:?}", q.artifacts);
        assert!(q.score >= 0.7, "score {}", q.score);
        assert!(q.snr_db > 5.0, "snr {}", q.snr_db);
    }

    #[test]
    fn test_flatline_detected() {
        let q = assess_channel(3, &[0.01; 500], 250.0);
        assert!(q.artifacts.flatline);
        assert_eq!(q.quality_level, QualityLevel::Bad);
    }

    #[test]
    fn test_line_noise_detected() {
        let fs = 500.0;
        let x: Vec<f32> = (0..2000)
            .map(|i| {
                let t = i as f64 / fs;
                let signal = 10.0 * (2.0 * std::f64::consts::PI * 10.0 * t).sin();
                let mains = 80.0 * (2.0 * std::f64::consts::PI * 50.0 * t).sin();
                (signal + mains) as f32
            })
            .collect();
        let q = assess_channel(0, &x, fs);
        assert!(q.line_noise_ratio > 0.5, "ratio {}", q.line_noise_ratio);
        assert!(q.score < 0.7);
    }

    #[test]
    fn test_clipping_detected() {
        let mut x = clean_eeg(1000, 250.0);
        for v in x.iter_mut() {
            *v = (*v * 20.0).clamp(-400.0, 400.0);
        }
        let q = assess_channel(0, &x, 250.0);
        assert!(q.artifacts.clip);
        assert!(q.quality_level <= QualityLevel::Fair);
    }

    #[test]
    fn test_artifact_caps_at_fair() {
        // Even a high-SNR channel cannot exceed fair once flagged
        let mut x = clean_eeg(1000, 250.0);
        for v in x.iter_mut() {
            *v = (*v * 50.0).clamp(-300.0, 300.0);
        }
        let q = assess_channel(0, &x, 250.0);
        if q.artifacts.any() {
            assert!(q.quality_level <= QualityLevel::Fair);
            assert!(q.score <= 0.69);
        }
    }

    #[test]
    fn test_muscle_artifact_detected() {
        let mut rng = StdRng::seed_from_u64(11);
        // Broadband high-frequency dominance
        let x: Vec<f32> = (0..1000)
            .map(|i| {
                let t = i as f64 / 250.0;
                let gamma = 40.0 * (2.0 * std::f64::consts::PI * 55.0 * t).sin();
                gamma as f32 + rng.gen_range(-5.0f32..5.0)
            })
            .collect();
        let q = assess_channel(0, &x, 250.0);
        assert!(q.artifacts.muscle || q.line_noise_ratio > 0.2);
    }

    #[test]
    fn test_window_overall_is_mean() {
        let good = clean_eeg(500, 250.0);
        let flat = vec![0.0f32; 500];
        let report = assess_window(&[(0, good.as_slice()), (1, flat.as_slice())], 250.0);
        assert_eq!(report.channels.len(), 2);
        let mean = (report.channels[0].score + report.channels[1].score) / 2.0;
        assert!((report.overall - mean).abs() < 1e-6);
    }
}
