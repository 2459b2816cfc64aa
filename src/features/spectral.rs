//! Spectral Features
//!
//! Welch power spectral density and the derived band powers, spectral
//! entropy, peak frequency and 95 % spectral-edge frequency. PSDs are
//! normalized to µV²/Hz; entropies are in bits.

use std::sync::Mutex;

use once_cell::sync::Lazy;
use num_complex::Complex64;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

/// Frequency bands of interest, Hz
pub const BANDS: [(&str, f64, f64); 6] = [
    ("delta", 0.5, 4.0),
    ("theta", 4.0, 8.0),
    ("alpha", 8.0, 12.0),
    ("beta", 12.0, 30.0),
    ("gamma", 30.0, 100.0),
    ("high_gamma", 100.0, 200.0),
];

static PLANNER: Lazy<Mutex<FftPlanner<f64>>> = Lazy::new(|| Mutex::new(FftPlanner::new()));

/// Absolute power per canonical band, µV²
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BandPowers {
    pub delta: f32,
    pub theta: f32,
    pub alpha: f32,
    pub beta: f32,
    pub gamma: f32,
    pub high_gamma: f32,
}

impl BandPowers {
    pub fn total(&self) -> f32 {
        self.delta + self.theta + self.alpha + self.beta + self.gamma + self.high_gamma
    }
}

/// Spectral descriptors of a single channel window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectralFeatures {
    pub band_powers: BandPowers,
    /// Shannon entropy of the normalized PSD, bits
    pub spectral_entropy: f32,
    /// Frequency of the PSD maximum, Hz
    pub peak_frequency: f32,
    /// Frequency below which 95 % of total power lies, Hz
    pub spectral_edge_95: f32,
}

/// One-sided Welch PSD with Hann windowing and 50 % overlap.
///
/// `nperseg` is clamped to `min(x.len(), 256)` per the engine's windowing
/// convention. Returns (frequencies, psd) with psd in input-units²/Hz.
pub fn welch_psd(x: &[f32], fs: f64, nperseg: usize) -> (Vec<f64>, Vec<f64>) {
    let nperseg = nperseg.min(x.len()).max(2);
    let step = (nperseg / 2).max(1);
    let hann: Vec<f64> = (0..nperseg)
        .map(|i| {
            let w = (std::f64::consts::PI * i as f64 / (nperseg - 1) as f64).sin();
            w * w
        })
        .collect();
    let window_power: f64 = hann.iter().map(|w| w * w).sum();

    let fft = PLANNER.lock().unwrap().plan_fft_forward(nperseg);
    let n_bins = nperseg / 2 + 1;
    let mut psd = vec![0.0f64; n_bins];
    let mut segments = 0usize;

    let mut start = 0;
    while start + nperseg <= x.len() {
        let segment = &x[start..start + nperseg];
        let mean = segment.iter().map(|&v| v as f64).sum::<f64>() / nperseg as f64;
        let mut buf: Vec<Complex64> = segment
            .iter()
            .zip(&hann)
            .map(|(&v, &w)| Complex64::new((v as f64 - mean) * w, 0.0))
            .collect();
        fft.process(&mut buf);

        for (bin, value) in buf.iter().take(n_bins).enumerate() {
            // One-sided spectrum doubles interior bins
            let factor = if bin == 0 || (nperseg % 2 == 0 && bin == n_bins - 1) {
                1.0
            } else {
                2.0
            };
            psd[bin] += factor * value.norm_sqr() / (fs * window_power);
        }
        segments += 1;
        start += step;
    }

    if segments > 0 {
        for v in &mut psd {
            *v /= segments as f64;
        }
    }

    let freqs: Vec<f64> = (0..n_bins).map(|i| i as f64 * fs / nperseg as f64).collect();
    (freqs, psd)
}

/// Compute all spectral features for one channel window
pub fn spectral_features(x: &[f32], fs: f64) -> SpectralFeatures {
    if x.len() < 8 || fs <= 0.0 {
        return SpectralFeatures::default();
    }
    let (freqs, psd) = welch_psd(x, fs, 256);
    let df = freqs.get(1).copied().unwrap_or(1.0);

    let band_power = |lo: f64, hi: f64| -> f32 {
        freqs
            .iter()
            .zip(&psd)
            .filter(|(f, _)| **f >= lo && **f < hi)
            .map(|(_, p)| p * df)
            .sum::<f64>() as f32
    };

    let band_powers = BandPowers {
        delta: band_power(0.5, 4.0),
        theta: band_power(4.0, 8.0),
        alpha: band_power(8.0, 12.0),
        beta: band_power(12.0, 30.0),
        gamma: band_power(30.0, 100.0),
        high_gamma: band_power(100.0, 200.0),
    };

    // Skip the DC bin for entropy, peak and edge
    let total: f64 = psd.iter().skip(1).sum();
    let (mut entropy, mut peak_frequency, mut spectral_edge_95) = (0.0f64, 0.0f64, 0.0f64);
    if total > 0.0 {
        let mut peak_power = 0.0;
        let mut cumulative = 0.0;
        let mut edge_found = false;
        for (f, p) in freqs.iter().zip(&psd).skip(1) {
            let prob = p / total;
            if prob > 0.0 {
                entropy -= prob * prob.log2();
            }
            if *p > peak_power {
                peak_power = *p;
                peak_frequency = *f;
            }
            cumulative += p;
            if !edge_found && cumulative >= 0.95 * total {
                spectral_edge_95 = *f;
                edge_found = true;
            }
        }
    }

    SpectralFeatures {
        band_powers,
        spectral_entropy: entropy as f32,
        peak_frequency: peak_frequency as f32,
        spectral_edge_95: spectral_edge_95 as f32,
    }
}
