//! Spike Detection Features
//!
//! Threshold-crossing spike detection for high-rate extracellular
//! recordings: 300–5000 Hz band-pass, detection at 4σ of the filtered
//! trace, 1 ms refractory period. Emits per-channel spike rate, mean
//! amplitude and the coefficient of variation of inter-spike intervals.

use serde::{Deserialize, Serialize};

/// Band-pass corner frequencies, Hz
const SPIKE_BAND_LO: f64 = 300.0;
const SPIKE_BAND_HI: f64 = 5000.0;
/// Detection threshold in standard deviations of the filtered trace
const THRESHOLD_SIGMA: f64 = 4.0;
/// Refractory period
const REFRACTORY_S: f64 = 0.001;

/// Per-channel spike summary for one window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpikeFeatures {
    pub spike_count: u32,
    pub spike_rate_hz: f32,
    /// Mean absolute amplitude at threshold crossings, µV
    pub mean_amplitude: f32,
    /// Coefficient of variation of inter-spike intervals; 0 when fewer
    /// than three spikes were seen
    pub isi_cv: f32,
}

/// Detect threshold crossings in one channel window
pub fn spike_features(x: &[f32], fs: f64) -> SpikeFeatures {
    if x.len() < 8 || fs <= 0.0 {
        return SpikeFeatures::default();
    }

    let filtered = bandpass(x, fs, SPIKE_BAND_LO, SPIKE_BAND_HI);

    let n = filtered.len() as f64;
    let mean = filtered.iter().sum::<f64>() / n;
    let sigma = (filtered.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt();
    if sigma <= 0.0 {
        return SpikeFeatures::default();
    }
    let threshold = THRESHOLD_SIGMA * sigma;
    let refractory = (REFRACTORY_S * fs).ceil() as usize;

    let mut spike_indices = Vec::new();
    let mut amplitudes = Vec::new();
    let mut last_spike: Option<usize> = None;
    for (i, &v) in filtered.iter().enumerate() {
        if (v - mean).abs() >= threshold {
            if let Some(prev) = last_spike {
                if i - prev < refractory {
                    continue;
                }
            }
            spike_indices.push(i);
            amplitudes.push((v - mean).abs());
            last_spike = Some(i);
        }
    }

    let count = spike_indices.len() as u32;
    let duration_s = x.len() as f64 / fs;
    let rate = count as f64 / duration_s;
    let mean_amplitude = if amplitudes.is_empty() {
        0.0
    } else {
        amplitudes.iter().sum::<f64>() / amplitudes.len() as f64
    };

    let isi_cv = if spike_indices.len() >= 3 {
        let isis: Vec<f64> = spike_indices
            .windows(2)
            .map(|p| (p[1] - p[0]) as f64 / fs)
            .collect();
        let m = isis.iter().sum::<f64>() / isis.len() as f64;
        let var = isis.iter().map(|&i| (i - m) * (i - m)).sum::<f64>() / isis.len() as f64;
        if m > 0.0 {
            var.sqrt() / m
        } else {
            0.0
        }
    } else {
        0.0
    };

    SpikeFeatures {
        spike_count: count,
        spike_rate_hz: rate as f32,
        mean_amplitude: mean_amplitude as f32,
        isi_cv: isi_cv as f32,
    }
}

/// Second-order Butterworth band-pass built from cascaded high- and
/// low-pass biquads (bilinear transform). Corners are clamped below the
/// Nyquist frequency so low-rate signals degrade to a high-pass.
pub fn bandpass(x: &[f32], fs: f64, lo: f64, hi: f64) -> Vec<f64> {
    let nyquist = fs / 2.0;
    let hi = hi.min(nyquist * 0.9);
    let lo = lo.min(hi * 0.5);
    let hp = Biquad::highpass(lo, fs);
    let lp = Biquad::lowpass(hi, fs);
    let mut out: Vec<f64> = x.iter().map(|&v| v as f64).collect();
    hp.run(&mut out);
    lp.run(&mut out);
    out
}

/// Direct-form-I biquad section
struct Biquad {
    b: [f64; 3],
    a: [f64; 2],
}

impl Biquad {
    /// Butterworth low-pass (Q = 1/sqrt(2)) via bilinear transform
    fn lowpass(fc: f64, fs: f64) -> Self {
        let w0 = 2.0 * std::f64::consts::PI * fc / fs;
        let alpha = w0.sin() / std::f64::consts::SQRT_2;
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;
        Self {
            b: [
                (1.0 - cos_w0) / 2.0 / a0,
                (1.0 - cos_w0) / a0,
                (1.0 - cos_w0) / 2.0 / a0,
            ],
            a: [-2.0 * cos_w0 / a0, (1.0 - alpha) / a0],
        }
    }

    /// Butterworth high-pass (Q = 1/sqrt(2)) via bilinear transform
    fn highpass(fc: f64, fs: f64) -> Self {
        let w0 = 2.0 * std::f64::consts::PI * fc / fs;
        let alpha = w0.sin() / std::f64::consts::SQRT_2;
        let cos_w0 = w0.cos();
        let a0 = 1.0 + alpha;
        Self {
            b: [
                (1.0 + cos_w0) / 2.0 / a0,
                -(1.0 + cos_w0) / a0,
                (1.0 + cos_w0) / 2.0 / a0,
            ],
            a: [-2.0 * cos_w0 / a0, (1.0 - alpha) / a0],
        }
    }

    fn run(&self, x: &mut [f64]) {
        let (mut x1, mut x2, mut y1, mut y2) = (0.0, 0.0, 0.0, 0.0);
        for v in x.iter_mut() {
            let x0 = *v;
            let y0 = self.b[0] * x0 + self.b[1] * x1 + self.b[2] * x2
                - self.a[0] * y1
                - self.a[1] * y2;
            x2 = x1;
            x1 = x0;
            y2 = y1;
            y1 = y0;
            *v = y0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Gaussian-ish noise with injected spikes at known positions
    fn spiky_signal(fs: f64, duration_s: f64, spike_times_s: &[f64]) -> Vec<f32> {
        let n = (fs * duration_s) as usize;
        let mut rng = StdRng::seed_from_u64(99);
        let mut x: Vec<f32> = (0..n)
            .map(|_| {
                // Sum of uniforms approximates a Gaussian
                let s: f32 = (0..6).map(|_| rng.gen_range(-1.0f32..1.0)).sum();
                s * 2.0
            })
            .collect();
        for &t in spike_times_s {
            let idx = (t * fs) as usize;
            if idx + 3 < n {
                x[idx] += 120.0;
                x[idx + 1] -= 80.0;
            }
        }
        x
    }

    #[test]
    fn test_detects_injected_spikes() {
        let fs = 30_000.0;
        let spikes = [0.010, 0.025, 0.040, 0.070, 0.085];
        let x = spiky_signal(fs, 0.1, &spikes);
        let f = spike_features(&x, fs);
        assert!(
            (f.spike_count as i64 - spikes.len() as i64).abs() <= 1,
            "detected {}",
            f.spike_count
        );
        assert!(f.mean_amplitude > 10.0);
    }

    #[test]
    fn test_no_spikes_in_plain_noise() {
        let x = spiky_signal(30_000.0, 0.1, &[]);
        let f = spike_features(&x, 30_000.0);
        // 4 sigma keeps false positives rare in 3000 samples
        assert!(f.spike_count <= 2, "count {}", f.spike_count);
    }

    #[test]
    fn test_refractory_merges_adjacent_crossings() {
        let fs = 30_000.0;
        // One biphasic spike crosses threshold on several samples
        let x = spiky_signal(fs, 0.05, &[0.02]);
        let f = spike_features(&x, fs);
        assert!(f.spike_count <= 2, "count {}", f.spike_count);
    }

    #[test]
    fn test_regular_train_has_low_isi_cv() {
        let fs = 30_000.0;
        let spikes: Vec<f64> = (1..9).map(|i| i as f64 * 0.01).collect();
        let x = spiky_signal(fs, 0.1, &spikes);
        let f = spike_features(&x, fs);
        if f.spike_count >= 3 {
            assert!(f.isi_cv < 0.5, "cv {}", f.isi_cv);
        }
    }

    #[test]
    fn test_flat_input_is_safe() {
        assert_eq!(spike_features(&[0.0; 256], 30_000.0), SpikeFeatures::default());
    }

    #[test]
    fn test_bandpass_attenuates_dc() {
        let x = vec![50.0f32; 1024];
        let filtered = bandpass(&x, 30_000.0, 300.0, 5000.0);
        let tail_rms = (filtered[512..].iter().map(|v| v * v).sum::<f64>() / 512.0).sqrt();
        assert!(tail_rms < 1.0, "tail rms {}", tail_rms);
    }
}
