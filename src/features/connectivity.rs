//! Cross-Channel Connectivity
//!
//! Computed once per window across all channels: Pearson correlation
//! summary, band-limited spectral coherence, Hilbert-phase synchrony
//! (PLV and PLI) and network density.

use std::sync::Mutex;

use once_cell::sync::Lazy;
use num_complex::Complex64;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

/// Absolute-correlation cutoff for counting a pair as connected
const DENSITY_THRESHOLD: f64 = 0.5;

static PLANNER: Lazy<Mutex<FftPlanner<f64>>> = Lazy::new(|| Mutex::new(FftPlanner::new()));

/// Cross-channel summary for one window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityFeatures {
    /// Mean absolute off-diagonal Pearson correlation
    pub mean_correlation: f32,
    /// Maximum absolute off-diagonal Pearson correlation
    pub max_correlation: f32,
    /// Mean magnitude-squared coherence within the band of interest
    pub coherence: f32,
    /// Mean pairwise phase locking value
    pub phase_locking_value: f32,
    /// Mean pairwise phase lag index
    pub phase_lag_index: f32,
    /// Fraction of pairs with |corr| above the density threshold
    pub network_density: f32,
}

/// Compute all connectivity features.
///
/// `band` bounds the coherence estimate in Hz; PLV/PLI use broadband
/// Hilbert phase.
pub fn connectivity_features(
    channels: &[Vec<f32>],
    fs: f64,
    band: (f64, f64),
) -> ConnectivityFeatures {
    let c = channels.len();
    let n = channels.first().map(|x| x.len()).unwrap_or(0);
    if c < 2 || n < 8 {
        return ConnectivityFeatures::default();
    }

    // Pearson correlation over all pairs
    let mut sum_abs = 0.0f64;
    let mut max_abs = 0.0f64;
    let mut connected = 0usize;
    let mut pairs = 0usize;
    for i in 0..c {
        for j in (i + 1)..c {
            let r = pearson(&channels[i], &channels[j]).abs();
            sum_abs += r;
            max_abs = max_abs.max(r);
            if r > DENSITY_THRESHOLD {
                connected += 1;
            }
            pairs += 1;
        }
    }

    // Hilbert phases once per channel, reused for every pair
    let phases: Vec<Vec<f64>> = channels.iter().map(|x| hilbert_phase(x)).collect();
    let mut plv_sum = 0.0f64;
    let mut pli_sum = 0.0f64;
    for i in 0..c {
        for j in (i + 1)..c {
            let (plv, pli) = phase_sync(&phases[i], &phases[j]);
            plv_sum += plv;
            pli_sum += pli;
        }
    }

    let mut coh_sum = 0.0f64;
    for i in 0..c {
        for j in (i + 1)..c {
            coh_sum += band_coherence(&channels[i], &channels[j], fs, band);
        }
    }

    let p = pairs as f64;
    ConnectivityFeatures {
        mean_correlation: (sum_abs / p) as f32,
        max_correlation: max_abs as f32,
        coherence: (coh_sum / p) as f32,
        phase_locking_value: (plv_sum / p) as f32,
        phase_lag_index: (pli_sum / p) as f32,
        network_density: (connected as f64 / p) as f32,
    }
}

/// Pearson correlation coefficient of two equal-length signals
pub fn pearson(a: &[f32], b: &[f32]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let nf = n as f64;
    let mean_a = a[..n].iter().map(|&v| v as f64).sum::<f64>() / nf;
    let mean_b = b[..n].iter().map(|&v| v as f64).sum::<f64>() / nf;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for k in 0..n {
        let da = a[k] as f64 - mean_a;
        let db = b[k] as f64 - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

/// Instantaneous phase of the analytic signal (FFT-based Hilbert transform)
pub fn hilbert_phase(x: &[f32]) -> Vec<f64> {
    let n = x.len();
    let fft = PLANNER.lock().unwrap().plan_fft_forward(n);
    let ifft = PLANNER.lock().unwrap().plan_fft_inverse(n);

    let mean = x.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let mut buf: Vec<Complex64> = x
        .iter()
        .map(|&v| Complex64::new(v as f64 - mean, 0.0))
        .collect();
    fft.process(&mut buf);

    // Analytic signal: keep DC and Nyquist, double positives, zero negatives
    let half = n / 2;
    for (k, value) in buf.iter_mut().enumerate() {
        if k == 0 || (n % 2 == 0 && k == half) {
            continue;
        } else if k < half || (n % 2 == 1 && k <= half) {
            *value *= 2.0;
        } else {
            *value = Complex64::new(0.0, 0.0);
        }
    }
    ifft.process(&mut buf);

    buf.iter().map(|v| v.im.atan2(v.re)).collect()
}

fn phase_sync(pa: &[f64], pb: &[f64]) -> (f64, f64) {
    let n = pa.len().min(pb.len());
    if n == 0 {
        return (0.0, 0.0);
    }
    let mut re = 0.0;
    let mut im = 0.0;
    let mut sign_sum = 0.0;
    for k in 0..n {
        let d = pa[k] - pb[k];
        re += d.cos();
        im += d.sin();
        sign_sum += d.sin().signum();
    }
    let nf = n as f64;
    let plv = (re * re + im * im).sqrt() / nf;
    let pli = (sign_sum / nf).abs();
    (plv, pli)
}

/// Magnitude-squared coherence averaged over `band`, Welch-style with
/// Hann segments and 50 % overlap.
fn band_coherence(a: &[f32], b: &[f32], fs: f64, band: (f64, f64)) -> f64 {
    let n = a.len().min(b.len());
    let nperseg = (n / 2).clamp(8, 128);
    let step = (nperseg / 2).max(1);
    let hann: Vec<f64> = (0..nperseg)
        .map(|i| {
            let w = (std::f64::consts::PI * i as f64 / (nperseg - 1) as f64).sin();
            w * w
        })
        .collect();

    let fft = PLANNER.lock().unwrap().plan_fft_forward(nperseg);
    let bins = nperseg / 2 + 1;
    let mut pxx = vec![0.0f64; bins];
    let mut pyy = vec![0.0f64; bins];
    let mut pxy = vec![Complex64::new(0.0, 0.0); bins];
    let mut segments = 0usize;

    let mut start = 0;
    while start + nperseg <= n {
        let mut fa: Vec<Complex64> = a[start..start + nperseg]
            .iter()
            .zip(&hann)
            .map(|(&v, &w)| Complex64::new(v as f64 * w, 0.0))
            .collect();
        let mut fb: Vec<Complex64> = b[start..start + nperseg]
            .iter()
            .zip(&hann)
            .map(|(&v, &w)| Complex64::new(v as f64 * w, 0.0))
            .collect();
        fft.process(&mut fa);
        fft.process(&mut fb);
        for k in 0..bins {
            pxx[k] += fa[k].norm_sqr();
            pyy[k] += fb[k].norm_sqr();
            pxy[k] += fa[k] * fb[k].conj();
        }
        segments += 1;
        start += step;
    }
    if segments == 0 {
        return 0.0;
    }

    let df = fs / nperseg as f64;
    let mut coh_sum = 0.0;
    let mut count = 0usize;
    for k in 1..bins {
        let f = k as f64 * df;
        if f < band.0 || f > band.1 {
            continue;
        }
        let denom = pxx[k] * pyy[k];
        if denom > 0.0 {
            coh_sum += pxy[k].norm_sqr() / denom;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        coh_sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sine(freq: f64, fs: f64, n: usize, phase: f64) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / fs + phase).sin() as f32)
            .collect()
    }

    fn noise(n: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
    }

    #[test]
    fn test_identical_channels_fully_correlated() {
        let x = sine(10.0, 256.0, 512, 0.0);
        let f = connectivity_features(&[x.clone(), x], 256.0, (8.0, 12.0));
        assert!(f.mean_correlation > 0.99);
        assert!(f.max_correlation > 0.99);
        assert_eq!(f.network_density, 1.0);
        assert!(f.phase_locking_value > 0.99);
    }

    #[test]
    fn test_independent_noise_weakly_correlated() {
        let channels = vec![noise(2048, 1), noise(2048, 2), noise(2048, 3)];
        let f = connectivity_features(&channels, 1000.0, (8.0, 12.0));
        assert!(f.mean_correlation < 0.2, "corr {}", f.mean_correlation);
        assert_eq!(f.network_density, 0.0);
    }

    #[test]
    fn test_antiphase_counts_as_correlated() {
        let a = sine(10.0, 256.0, 512, 0.0);
        let b: Vec<f32> = a.iter().map(|v| -v).collect();
        let f = connectivity_features(&[a, b], 256.0, (8.0, 12.0));
        // Density uses |corr|
        assert_eq!(f.network_density, 1.0);
    }

    #[test]
    fn test_phase_locked_pair_has_high_plv() {
        // Same frequency, constant phase offset: PLV near 1, PLI near 1
        let a = sine(10.0, 256.0, 1024, 0.0);
        let b = sine(10.0, 256.0, 1024, std::f64::consts::FRAC_PI_3);
        let f = connectivity_features(&[a, b], 256.0, (8.0, 12.0));
        assert!(f.phase_locking_value > 0.9, "plv {}", f.phase_locking_value);
        assert!(f.phase_lag_index > 0.8, "pli {}", f.phase_lag_index);
    }

    #[test]
    fn test_coherent_band() {
        let shared = sine(10.0, 256.0, 2048, 0.0);
        let a: Vec<f32> = shared
            .iter()
            .zip(noise(2048, 5))
            .map(|(&s, n)| s * 5.0 + n * 0.3)
            .collect();
        let b: Vec<f32> = shared
            .iter()
            .zip(noise(2048, 6))
            .map(|(&s, n)| s * 5.0 + n * 0.3)
            .collect();
        let f = connectivity_features(&[a, b], 256.0, (8.0, 12.0));
        assert!(f.coherence > 0.8, "coherence {}", f.coherence);
    }

    #[test]
    fn test_single_channel_is_safe() {
        let f = connectivity_features(&[sine(10.0, 256.0, 128, 0.0)], 256.0, (8.0, 12.0));
        assert_eq!(f, ConnectivityFeatures::default());
    }

    #[test]
    fn test_pearson_bounds() {
        let a = noise(512, 10);
        let b = noise(512, 11);
        let r = pearson(&a, &b);
        assert!((-1.0..=1.0).contains(&r));
        assert!((pearson(&a, &a) - 1.0).abs() < 1e-9);
    }
}
