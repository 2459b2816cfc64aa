//! Synthetic Device Driver
//!
//! Deterministic signal generator used by tests, CI and rig-less
//! development. Each device derives its sample stream from a seeded PRNG,
//! so the same seed always produces the same signal: a per-channel mix of
//! alpha/beta sinusoids plus noise, with phase continuity across chunks.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::chunk::{ChannelInfo, DataType, SampleChunk};
use crate::device::{
    DeviceDriver, DeviceError, DeviceInfo, DeviceResult, DeviceState, DeviceType, DriverEvent,
};
use crate::features::{assess_window, QualityReport};
use crate::util::now_ns;

/// Synthetic device parameters
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub device_id: String,
    pub channels: usize,
    pub sampling_rate_hz: u32,
    pub data_type: DataType,
    pub seed: u64,
    /// Samples per emitted chunk
    pub chunk_samples: usize,
    /// Emit chunks as fast as possible instead of pacing to real time;
    /// used by tests that replay sessions faster than wall clock.
    pub unpaced: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            device_id: "synthetic-0".to_string(),
            channels: 8,
            sampling_rate_hz: 1000,
            data_type: DataType::Eeg,
            seed: 0x1234,
            chunk_samples: 50,
            unpaced: false,
        }
    }
}

pub struct SyntheticDriver {
    config: SyntheticConfig,
    state: DeviceState,
    stream_task: Option<JoinHandle<()>>,
}

impl SyntheticDriver {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            state: DeviceState::Discovered,
            stream_task: None,
        }
    }

    /// Generate `n` samples for one channel starting at absolute sample
    /// index `start`. Pure given the config seed.
    pub fn generate(config: &SyntheticConfig, channel: usize, start: u64, n: usize) -> Vec<f32> {
        let fs = config.sampling_rate_hz as f64;
        // Channel-specific component amplitudes from the seed
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(channel as u64));
        let alpha_amp: f64 = rng.gen_range(10.0..40.0);
        let beta_amp: f64 = rng.gen_range(3.0..12.0);
        let alpha_hz: f64 = rng.gen_range(8.5..11.5);
        let beta_hz: f64 = rng.gen_range(15.0..25.0);
        let phase: f64 = rng.gen_range(0.0..std::f64::consts::TAU);

        // Noise stream positioned at `start` so chunks are reproducible
        // regardless of chunking boundaries
        let mut noise = StdRng::seed_from_u64(
            config
                .seed
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .wrapping_add(channel as u64),
        );
        for _ in 0..start {
            let _: f32 = noise.gen_range(-3.0..3.0);
        }

        (0..n)
            .map(|i| {
                let t = (start + i as u64) as f64 / fs;
                let alpha = alpha_amp * (std::f64::consts::TAU * alpha_hz * t + phase).sin();
                let beta = beta_amp * (std::f64::consts::TAU * beta_hz * t).sin();
                let eta: f32 = noise.gen_range(-3.0..3.0);
                (alpha + beta) as f32 + eta
            })
            .collect()
    }

    fn channel_list(config: &SyntheticConfig) -> Vec<ChannelInfo> {
        (0..config.channels as u32)
            .map(|i| ChannelInfo::neural(i, format!("SYN{}", i)))
            .collect()
    }

    fn make_chunk(config: &SyntheticConfig, chunk_seq: u64, start_ts_ns: i64) -> SampleChunk {
        let n = config.chunk_samples;
        let start_sample = chunk_seq * n as u64;
        let samples = (0..config.channels)
            .map(|ch| Self::generate(config, ch, start_sample, n))
            .collect();
        let sample_period_ns = 1_000_000_000 / config.sampling_rate_hz as i64;
        SampleChunk {
            session_id: String::new(),
            device_id: config.device_id.clone(),
            data_type: config.data_type,
            sampling_rate_hz: config.sampling_rate_hz,
            channels: Self::channel_list(config),
            samples,
            chunk_seq,
            device_ts_ns: start_ts_ns + start_sample as i64 * sample_period_ns,
            ingest_ts_ns: now_ns(),
        }
    }
}

#[async_trait]
impl DeviceDriver for SyntheticDriver {
    async fn connect(&mut self) -> DeviceResult<()> {
        if matches!(self.state, DeviceState::Connected | DeviceState::Streaming) {
            return Ok(());
        }
        self.state = DeviceState::Connected;
        debug!(device_id = %self.config.device_id, "synthetic device connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> DeviceResult<()> {
        self.stop_stream().await.ok();
        self.state = DeviceState::Closed;
        Ok(())
    }

    fn describe(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.config.device_id.clone(),
            device_type: DeviceType::Synthetic,
            data_type: self.config.data_type,
            channels: Self::channel_list(&self.config),
            sampling_rate_hz: self.config.sampling_rate_hz,
            supports_impedance_check: true,
            supports_battery: false,
        }
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    async fn start_stream(&mut self, sink: mpsc::Sender<DriverEvent>) -> DeviceResult<()> {
        if self.state == DeviceState::Streaming {
            return Err(DeviceError::new(
                crate::device::DeviceErrorKind::AlreadyStreaming,
                "stream already running",
            ));
        }
        if self.state != DeviceState::Connected {
            return Err(DeviceError::protocol(format!(
                "cannot stream from state {}",
                self.state.as_str()
            )));
        }

        let config = self.config.clone();
        let start_ts_ns = now_ns();
        let chunk_period = Duration::from_nanos(
            config.chunk_samples as u64 * 1_000_000_000 / config.sampling_rate_hz as u64,
        );

        let task = tokio::spawn(async move {
            let mut chunk_seq = 0u64;
            let mut ticker = tokio::time::interval(chunk_period.max(Duration::from_micros(1)));
            loop {
                if !config.unpaced {
                    ticker.tick().await;
                }
                let chunk = Self::make_chunk(&config, chunk_seq, start_ts_ns);
                if sink.send(DriverEvent::Chunk(chunk)).await.is_err() {
                    break;
                }
                chunk_seq += 1;
                if config.unpaced {
                    tokio::task::yield_now().await;
                }
            }
        });

        self.stream_task = Some(task);
        self.state = DeviceState::Streaming;
        Ok(())
    }

    async fn stop_stream(&mut self) -> DeviceResult<()> {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        if self.state == DeviceState::Streaming {
            self.state = DeviceState::Connected;
        }
        Ok(())
    }

    async fn check_impedance(&mut self) -> DeviceResult<HashMap<u32, f64>> {
        // Deterministic pseudo-impedances in the plausible scalp range
        let mut rng = StdRng::seed_from_u64(self.config.seed ^ 0xDEAD);
        Ok((0..self.config.channels as u32)
            .map(|ch| (ch, rng.gen_range(2_000.0..20_000.0)))
            .collect())
    }

    async fn probe_quality(&mut self, duration: Duration) -> DeviceResult<QualityReport> {
        let n = (duration.as_secs_f64() * self.config.sampling_rate_hz as f64) as usize;
        let n = n.max(64);
        let rows: Vec<(u32, Vec<f32>)> = (0..self.config.channels)
            .map(|ch| (ch as u32, Self::generate(&self.config, ch, 0, n)))
            .collect();
        let refs: Vec<(u32, &[f32])> = rows.iter().map(|(id, x)| (*id, x.as_slice())).collect();
        Ok(assess_window(&refs, self.config.sampling_rate_hz as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_seed_same_signal() {
        let config = SyntheticConfig::default();
        let a = SyntheticDriver::generate(&config, 3, 100, 256);
        let b = SyntheticDriver::generate(&config, 3, 100, 256);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_chunking_does_not_change_signal() {
        // Generating 0..100 must equal generating 0..50 and 50..100
        let config = SyntheticConfig::default();
        let whole = SyntheticDriver::generate(&config, 0, 0, 100);
        let mut parts = SyntheticDriver::generate(&config, 0, 0, 50);
        parts.extend(SyntheticDriver::generate(&config, 0, 50, 50));
        assert_eq!(whole, parts);
    }

    #[tokio::test]
    async fn test_different_seeds_differ() {
        let a = SyntheticDriver::generate(&SyntheticConfig::default(), 0, 0, 64);
        let b = SyntheticDriver::generate(
            &SyntheticConfig {
                seed: 0x5678,
                ..SyntheticConfig::default()
            },
            0,
            0,
            64,
        );
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_stream_emits_sequential_chunks() {
        let mut driver = SyntheticDriver::new(SyntheticConfig {
            unpaced: true,
            ..SyntheticConfig::default()
        });
        driver.connect().await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        driver.start_stream(tx).await.unwrap();

        let mut seqs = Vec::new();
        for _ in 0..5 {
            if let Some(DriverEvent::Chunk(chunk)) = rx.recv().await {
                seqs.push(chunk.chunk_seq);
                assert_eq!(chunk.channels.len(), 8);
                assert_eq!(chunk.samples_per_channel(), 50);
            }
        }
        driver.stop_stream().await.unwrap();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_start_stream_twice_fails() {
        let mut driver = SyntheticDriver::new(SyntheticConfig::default());
        driver.connect().await.unwrap();
        let (tx, _rx) = mpsc::channel(16);
        driver.start_stream(tx.clone()).await.unwrap();
        let err = driver.start_stream(tx).await.unwrap_err();
        assert_eq!(err.kind, crate::device::DeviceErrorKind::AlreadyStreaming);
        driver.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let mut driver = SyntheticDriver::new(SyntheticConfig::default());
        driver.connect().await.unwrap();
        driver.connect().await.unwrap();
        assert_eq!(driver.state(), DeviceState::Connected);
    }

    #[tokio::test]
    async fn test_probe_quality_reports_all_channels() {
        let mut driver = SyntheticDriver::new(SyntheticConfig::default());
        driver.connect().await.unwrap();
        let report = driver.probe_quality(Duration::from_millis(500)).await.unwrap();
        assert_eq!(report.channels.len(), 8);
        assert!(report.overall > 0.3);
    }
}
