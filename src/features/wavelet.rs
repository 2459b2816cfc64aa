//! Wavelet Features
//!
//! Five-level db4 discrete wavelet decomposition with per-level energy and
//! coefficient entropy. Detail levels come first (d1..d5), the final
//! approximation last.

use serde::{Deserialize, Serialize};

/// db4 decomposition low-pass filter (8 taps)
const DB4_LO: [f64; 8] = [
    -0.010597401785069032,
    0.032883011666885174,
    0.030841381835560764,
    -0.187034811718881140,
    -0.027983769416859854,
    0.630880767929858900,
    0.714846570552915600,
    0.230377813308896500,
];

/// Number of decomposition levels
pub const WAVELET_LEVELS: usize = 5;

/// Energy and entropy of one decomposition level
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveletLevel {
    /// d1..d5 for details, a5 for the final approximation
    pub level: String,
    /// Sum of squared coefficients
    pub energy: f32,
    /// Shannon entropy of the normalized squared coefficients, bits
    pub entropy: f32,
}

/// Full per-channel wavelet summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveletFeatures {
    pub levels: Vec<WaveletLevel>,
    /// Fraction of total energy per level, in the same order
    pub relative_energy: Vec<f32>,
}

/// db4 decomposition to `WAVELET_LEVELS` levels
pub fn wavelet_features(x: &[f32]) -> WaveletFeatures {
    if x.len() < DB4_LO.len() * 2 {
        return WaveletFeatures::default();
    }

    let hi: Vec<f64> = DB4_LO
        .iter()
        .rev()
        .enumerate()
        .map(|(k, &c)| if k % 2 == 0 { c } else { -c })
        .collect();

    let mut approx: Vec<f64> = x.iter().map(|&v| v as f64).collect();
    let mut levels = Vec::with_capacity(WAVELET_LEVELS + 1);

    for level in 1..=WAVELET_LEVELS {
        let detail = convolve_decimate(&approx, &hi);
        let next = convolve_decimate(&approx, &DB4_LO);
        levels.push(summarize(format!("d{level}"), &detail));
        approx = next;
        if approx.len() < DB4_LO.len() {
            break;
        }
    }
    levels.push(summarize(format!("a{}", levels.len()), &approx));

    let total: f64 = levels.iter().map(|l| l.energy as f64).sum();
    let relative_energy = levels
        .iter()
        .map(|l| {
            if total > 0.0 {
                (l.energy as f64 / total) as f32
            } else {
                0.0
            }
        })
        .collect();

    WaveletFeatures {
        levels,
        relative_energy,
    }
}

/// Convolve with symmetric boundary extension, then downsample by two
fn convolve_decimate(x: &[f64], filter: &[f64]) -> Vec<f64> {
    let n = x.len();
    let out_len = (n + 1) / 2;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let center = 2 * i as isize + 1;
        let mut acc = 0.0;
        for (k, &c) in filter.iter().enumerate() {
            let mut idx = center - k as isize;
            // Symmetric half-sample reflection at both edges
            if idx < 0 {
                idx = -idx - 1;
            }
            if idx >= n as isize {
                idx = 2 * n as isize - idx - 1;
            }
            let idx = idx.clamp(0, n as isize - 1) as usize;
            acc += c * x[idx];
        }
        out.push(acc);
    }
    out
}

fn summarize(level: String, coeffs: &[f64]) -> WaveletLevel {
    let energy: f64 = coeffs.iter().map(|c| c * c).sum();
    let mut entropy = 0.0f64;
    if energy > 0.0 {
        for c in coeffs {
            let p = (c * c) / energy;
            if p > 0.0 {
                entropy -= p * p.log2();
            }
        }
    }
    WaveletLevel {
        level,
        energy: energy as f32,
        entropy: entropy as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_count() {
        let x: Vec<f32> = (0..512).map(|i| (i as f32 * 0.1).sin()).collect();
        let f = wavelet_features(&x);
        // 5 detail levels plus the approximation
        assert_eq!(f.levels.len(), 6);
        assert_eq!(f.levels[0].level, "d1");
        assert_eq!(f.levels[4].level, "d5");
        assert_eq!(f.levels[5].level, "a5");
    }

    #[test]
    fn test_relative_energy_sums_to_one() {
        let x: Vec<f32> = (0..400).map(|i| ((i % 17) as f32) - 8.0).collect();
        let f = wavelet_features(&x);
        let sum: f32 = f.relative_energy.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_slow_signal_energy_in_approximation() {
        // A very low-frequency signal should concentrate in a5, not d1
        let x: Vec<f32> = (0..512)
            .map(|i| (2.0 * std::f32::consts::PI * i as f32 / 512.0).sin() * 100.0)
            .collect();
        let f = wavelet_features(&x);
        assert!(f.levels[5].energy > f.levels[0].energy * 100.0);
    }

    #[test]
    fn test_fast_signal_energy_in_details() {
        // Alternating signal is pure high frequency: d1 dominates a5
        let x: Vec<f32> = (0..512).map(|i| if i % 2 == 0 { 50.0 } else { -50.0 }).collect();
        let f = wavelet_features(&x);
        assert!(f.levels[0].energy > f.levels[5].energy);
    }

    #[test]
    fn test_short_input_is_safe() {
        assert_eq!(wavelet_features(&[1.0; 4]), WaveletFeatures::default());
    }
}
