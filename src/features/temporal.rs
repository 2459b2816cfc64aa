//! Time-Domain Features
//!
//! Distribution moments, Hjorth parameters, zero-crossing rate and line
//! length for one channel of one window. All math is f64 internally.

use serde::{Deserialize, Serialize};

/// Time-domain descriptors of a single channel window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemporalFeatures {
    pub mean: f32,
    pub std: f32,
    pub skewness: f32,
    pub kurtosis: f32,
    /// Hjorth activity: variance of the signal
    pub hjorth_activity: f32,
    /// Hjorth mobility: sqrt(var(dx) / var(x))
    pub hjorth_mobility: f32,
    /// Hjorth complexity: mobility(dx) / mobility(x)
    pub hjorth_complexity: f32,
    pub zero_crossing_rate: f32,
    pub line_length: f32,
}

/// Compute all time-domain features for one channel window
pub fn temporal_features(x: &[f32]) -> TemporalFeatures {
    if x.len() < 2 {
        return TemporalFeatures::default();
    }

    let n = x.len() as f64;
    let mean = x.iter().map(|&v| v as f64).sum::<f64>() / n;

    let mut m2 = 0.0;
    let mut m3 = 0.0;
    let mut m4 = 0.0;
    for &v in x {
        let d = v as f64 - mean;
        m2 += d * d;
        m3 += d * d * d;
        m4 += d * d * d * d;
    }
    m2 /= n;
    m3 /= n;
    m4 /= n;

    let std = m2.sqrt();
    let skewness = if std > 0.0 { m3 / std.powi(3) } else { 0.0 };
    // Excess kurtosis; Gaussian input centers on zero
    let kurtosis = if m2 > 0.0 { m4 / (m2 * m2) - 3.0 } else { 0.0 };

    let (mobility, complexity) = hjorth(x, m2);

    let mut crossings = 0usize;
    let mut line_length = 0.0f64;
    for pair in x.windows(2) {
        if (pair[0] - mean as f32) * (pair[1] - mean as f32) < 0.0 {
            crossings += 1;
        }
        line_length += (pair[1] - pair[0]).abs() as f64;
    }

    TemporalFeatures {
        mean: mean as f32,
        std: std as f32,
        skewness: skewness as f32,
        kurtosis: kurtosis as f32,
        hjorth_activity: m2 as f32,
        hjorth_mobility: mobility as f32,
        hjorth_complexity: complexity as f32,
        zero_crossing_rate: crossings as f32 / (x.len() - 1) as f32,
        line_length: line_length as f32,
    }
}

fn hjorth(x: &[f32], var_x: f64) -> (f64, f64) {
    let dx: Vec<f64> = x.windows(2).map(|p| (p[1] - p[0]) as f64).collect();
    let var_dx = variance(&dx);
    let mobility = if var_x > 0.0 {
        (var_dx / var_x).sqrt()
    } else {
        0.0
    };

    let ddx: Vec<f64> = dx.windows(2).map(|p| p[1] - p[0]).collect();
    let var_ddx = variance(&ddx);
    let mobility_dx = if var_dx > 0.0 {
        (var_ddx / var_dx).sqrt()
    } else {
        0.0
    };
    let complexity = if mobility > 0.0 {
        mobility_dx / mobility
    } else {
        0.0
    };
    (mobility, complexity)
}

fn variance(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    x.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_signal() {
        let f = temporal_features(&[3.0; 64]);
        assert_eq!(f.mean, 3.0);
        assert_eq!(f.std, 0.0);
        assert_eq!(f.line_length, 0.0);
        assert_eq!(f.zero_crossing_rate, 0.0);
    }

    #[test]
    fn test_sine_moments() {
        let x: Vec<f32> = (0..1000)
            .map(|i| (2.0 * std::f32::consts::PI * i as f32 / 100.0).sin())
            .collect();
        let f = temporal_features(&x);
        assert!(f.mean.abs() < 1e-3);
        // RMS of a unit sine is 1/sqrt(2)
        assert!((f.std - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-2);
        assert!(f.skewness.abs() < 0.05);
        // Sine kurtosis is -1.5 (excess)
        assert!((f.kurtosis + 1.5).abs() < 0.05);
    }

    #[test]
    fn test_sine_zero_crossings() {
        // 10 full cycles in 1000 samples: 20 crossings of the mean
        let x: Vec<f32> = (0..1000)
            .map(|i| (2.0 * std::f32::consts::PI * 10.0 * i as f32 / 1000.0).sin())
            .collect();
        let f = temporal_features(&x);
        let crossings = f.zero_crossing_rate * 999.0;
        assert!((crossings - 20.0).abs() <= 1.0, "crossings {}", crossings);
    }

    #[test]
    fn test_hjorth_mobility_scales_with_frequency() {
        let slow: Vec<f32> = (0..1000)
            .map(|i| (2.0 * std::f32::consts::PI * 5.0 * i as f32 / 1000.0).sin())
            .collect();
        let fast: Vec<f32> = (0..1000)
            .map(|i| (2.0 * std::f32::consts::PI * 40.0 * i as f32 / 1000.0).sin())
            .collect();
        let f_slow = temporal_features(&slow);
        let f_fast = temporal_features(&fast);
        assert!(f_fast.hjorth_mobility > f_slow.hjorth_mobility * 4.0);
    }

    #[test]
    fn test_short_input() {
        assert_eq!(temporal_features(&[1.0]), TemporalFeatures::default());
        assert_eq!(temporal_features(&[]), TemporalFeatures::default());
    }
}
