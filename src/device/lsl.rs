//! Lab Streaming Layer Driver
//!
//! Passive subscriber to a named LSL stream, reached through the rig's
//! LSL relay: the relay resolves outlets on the local network and
//! re-publishes them as newline-delimited JSON. The first line of a
//! subscription is the stream header (name, type, channel count, nominal
//! rate); every following line is a sample block. The driver never
//! commands the device; it only listens.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::chunk::{ChannelInfo, DataType, SampleChunk};
use crate::device::{
    DeviceDriver, DeviceError, DeviceErrorKind, DeviceInfo, DeviceResult, DeviceState, DeviceType,
    DriverEvent,
};
use crate::features::{assess_window, QualityReport};
use crate::util::now_ns;

/// Stream header announced by the relay on subscription
#[derive(Debug, Clone, Deserialize)]
pub struct LslStreamInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub stream_type: String,
    pub channel_count: usize,
    pub nominal_srate: f64,
}

/// One relayed sample block
#[derive(Debug, Deserialize)]
pub struct LslBlock {
    /// LSL timestamps are seconds on the local clock
    pub timestamp: f64,
    /// samples[sample][channel], matching the LSL pull order
    pub samples: Vec<Vec<f32>>,
}

/// Map an LSL stream type string onto the engine's modality
pub fn modality_for(stream_type: &str) -> Option<DataType> {
    match stream_type.to_ascii_uppercase().as_str() {
        "EEG" => Some(DataType::Eeg),
        "ECOG" => Some(DataType::Ecog),
        "MARKER" | "MARKERS" => Some(DataType::Eeg),
        _ => None,
    }
}

/// Transpose a relayed block into channel-major rows
pub fn block_rows(block: &LslBlock, channel_count: usize) -> DeviceResult<Vec<Vec<f32>>> {
    let mut rows = vec![Vec::with_capacity(block.samples.len()); channel_count];
    for sample in &block.samples {
        if sample.len() != channel_count {
            return Err(DeviceError::protocol(format!(
                "sample width {} does not match {} channels",
                sample.len(),
                channel_count
            )));
        }
        for (ch, &v) in sample.iter().enumerate() {
            rows[ch].push(v);
        }
    }
    Ok(rows)
}

pub struct LslDriver {
    relay_addr: String,
    stream_name: String,
    device_id: String,
    state: DeviceState,
    info: Option<LslStreamInfo>,
    reader: Option<Lines<BufReader<TcpStream>>>,
    stream_task: Option<JoinHandle<()>>,
}

impl LslDriver {
    pub fn new(relay_addr: impl Into<String>, stream_name: impl Into<String>) -> Self {
        let relay_addr = relay_addr.into();
        let stream_name = stream_name.into();
        let device_id = format!("lsl:{}", stream_name);
        Self {
            relay_addr,
            stream_name,
            device_id,
            state: DeviceState::Discovered,
            info: None,
            reader: None,
            stream_task: None,
        }
    }

    fn channel_list(info: &LslStreamInfo) -> Vec<ChannelInfo> {
        (0..info.channel_count as u32)
            .map(|i| ChannelInfo::neural(i, format!("LSL{}", i)))
            .collect()
    }
}

#[async_trait]
impl DeviceDriver for LslDriver {
    async fn connect(&mut self) -> DeviceResult<()> {
        if matches!(self.state, DeviceState::Connected | DeviceState::Streaming) {
            return Ok(());
        }
        let mut stream = TcpStream::connect(&self.relay_addr).await.map_err(|e| {
            DeviceError::not_found(format!("LSL relay unreachable at {}: {e}", self.relay_addr))
        })?;
        let subscribe = format!("SUBSCRIBE {}\n", self.stream_name);
        stream
            .write_all(subscribe.as_bytes())
            .await
            .map_err(|e| DeviceError::hardware(format!("relay write: {e}")))?;

        let mut lines = BufReader::new(stream).lines();
        let header = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .map_err(|_| DeviceError::protocol("relay did not announce a stream header"))?
            .map_err(|e| DeviceError::hardware(e.to_string()))?
            .ok_or_else(|| DeviceError::protocol("relay closed before the header"))?;
        let info: LslStreamInfo = serde_json::from_str(&header)
            .map_err(|e| DeviceError::protocol(format!("bad stream header: {e}")))?;
        if modality_for(&info.stream_type).is_none() {
            return Err(DeviceError::unsupported(format!(
                "stream type {} is not ingestible",
                info.stream_type
            )));
        }
        debug!(stream = %info.name, srate = info.nominal_srate, "LSL stream resolved");
        self.info = Some(info);
        self.reader = Some(lines);
        self.state = DeviceState::Connected;
        Ok(())
    }

    async fn disconnect(&mut self) -> DeviceResult<()> {
        self.stop_stream().await.ok();
        self.reader = None;
        self.info = None;
        self.state = DeviceState::Closed;
        Ok(())
    }

    fn describe(&self) -> DeviceInfo {
        let (channels, rate, data_type) = match &self.info {
            Some(info) => (
                Self::channel_list(info),
                info.nominal_srate.round() as u32,
                modality_for(&info.stream_type).unwrap_or(DataType::Eeg),
            ),
            None => (Vec::new(), 0, DataType::Eeg),
        };
        DeviceInfo {
            device_id: self.device_id.clone(),
            device_type: DeviceType::Lsl,
            data_type,
            channels,
            sampling_rate_hz: rate,
            supports_impedance_check: false,
            supports_battery: false,
        }
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    async fn start_stream(&mut self, sink: mpsc::Sender<DriverEvent>) -> DeviceResult<()> {
        if self.state == DeviceState::Streaming {
            return Err(DeviceError::new(
                DeviceErrorKind::AlreadyStreaming,
                "stream already running",
            ));
        }
        let info = self
            .info
            .clone()
            .ok_or_else(|| DeviceError::protocol("not connected"))?;
        let mut lines = self
            .reader
            .take()
            .ok_or_else(|| DeviceError::protocol("not connected"))?;

        let device_id = self.device_id.clone();
        let data_type = modality_for(&info.stream_type).unwrap_or(DataType::Eeg);
        let rate = info.nominal_srate.round() as u32;

        let task = tokio::spawn(async move {
            let mut chunk_seq = 0u64;
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(device_id = %device_id, "relay read failed: {e}");
                        let _ = sink
                            .send(DriverEvent::Fault {
                                device_id: device_id.clone(),
                                kind: DeviceErrorKind::HardwareError,
                                message: e.to_string(),
                            })
                            .await;
                        break;
                    }
                };
                let block: LslBlock = match serde_json::from_str(&line) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(device_id = %device_id, "bad relay block: {e}");
                        continue;
                    }
                };
                let samples = match block_rows(&block, info.channel_count) {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(device_id = %device_id, "dropping block: {e}");
                        continue;
                    }
                };
                if samples.first().map(|r| r.is_empty()).unwrap_or(true) {
                    continue;
                }
                let chunk = SampleChunk {
                    session_id: String::new(),
                    device_id: device_id.clone(),
                    data_type,
                    sampling_rate_hz: rate,
                    channels: LslDriver::channel_list(&info),
                    samples,
                    chunk_seq,
                    device_ts_ns: (block.timestamp * 1e9) as i64,
                    ingest_ts_ns: now_ns(),
                };
                chunk_seq += 1;
                if sink.send(DriverEvent::Chunk(chunk)).await.is_err() {
                    break;
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
            // The subscription socket moved into the reader task
            self.state = DeviceState::Errored;
        }
        Ok(())
    }

    async fn probe_quality(&mut self, duration: Duration) -> DeviceResult<QualityReport> {
        let info = self
            .info
            .clone()
            .ok_or_else(|| DeviceError::protocol("not connected"))?;
        let (tx, mut rx) = mpsc::channel(64);
        self.start_stream(tx).await?;
        let deadline = tokio::time::Instant::now() + duration;
        let mut rows: Vec<Vec<f32>> = vec![Vec::new(); info.channel_count];
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if let DriverEvent::Chunk(chunk) = event {
                for (row, data) in rows.iter_mut().zip(&chunk.samples) {
                    row.extend_from_slice(data);
                }
            }
        }
        self.stop_stream().await?;
        let refs: Vec<(u32, &[f32])> = rows
            .iter()
            .enumerate()
            .map(|(i, x)| (i as u32, x.as_slice()))
            .collect();
        Ok(assess_window(&refs, info.nominal_srate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modality_mapping() {
        assert_eq!(modality_for("EEG"), Some(DataType::Eeg));
        assert_eq!(modality_for("eeg"), Some(DataType::Eeg));
        assert_eq!(modality_for("ECoG"), Some(DataType::Ecog));
        assert_eq!(modality_for("Audio"), None);
    }

    #[test]
    fn test_block_rows_transposes() {
        let block = LslBlock {
            timestamp: 1.5,
            samples: vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]],
        };
        let rows = block_rows(&block, 2).unwrap();
        assert_eq!(rows[0], vec![1.0, 3.0, 5.0]);
        assert_eq!(rows[1], vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_block_rows_width_mismatch() {
        let block = LslBlock {
            timestamp: 0.0,
            samples: vec![vec![1.0, 2.0, 3.0]],
        };
        assert!(block_rows(&block, 2).is_err());
    }

    #[tokio::test]
    async fn test_connect_against_relay() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 128];
            let n = sock.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("SUBSCRIBE motor-cap"));
            let header = serde_json::json!({
                "name": "motor-cap",
                "type": "EEG",
                "channel_count": 4,
                "nominal_srate": 256.0,
            });
            let block = serde_json::json!({
                "timestamp": 12.5,
                "samples": [[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]],
            });
            let payload = format!("{header}\n{block}\n");
            sock.write_all(payload.as_bytes()).await.unwrap();
            // Hold the socket open while the driver reads
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut driver = LslDriver::new(addr.to_string(), "motor-cap");
        driver.connect().await.unwrap();
        assert_eq!(driver.state(), DeviceState::Connected);
        let info = driver.describe();
        assert_eq!(info.sampling_rate_hz, 256);
        assert_eq!(info.channels.len(), 4);

        let (tx, mut rx) = mpsc::channel(8);
        driver.start_stream(tx).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
        {
            Some(DriverEvent::Chunk(chunk)) => {
                assert_eq!(chunk.samples_per_channel(), 2);
                assert_eq!(chunk.device_ts_ns, 12_500_000_000);
            }
            other => panic!("expected a chunk, got {:?}", other.is_some()),
        }
        driver.disconnect().await.unwrap();
    }
}
