//! Serial Device Driver
//!
//! Cyton-class 8-channel boards speaking the binary serial protocol:
//! 33-byte frames of `0xA0 | sample number | 8 x 24-bit big-endian ADC
//! counts | 6 aux bytes | 0xC0..=0xCF`. ADC counts convert to µV with the
//! board's fixed scale factor. The sample counter is a wrapping u8; a jump
//! larger than one frame is reported as a gap event.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

use crate::chunk::{ChannelInfo, DataType, SampleChunk};
use crate::device::{
    DeviceDriver, DeviceError, DeviceErrorKind, DeviceInfo, DeviceResult, DeviceState, DeviceType,
    DriverEvent,
};
use crate::features::{assess_window, QualityReport};
use crate::util::now_ns;

/// Cyton ADC scale: 4.5 V reference / gain 24 / (2^23 - 1), in µV per count
pub const CYTON_SCALE_UV_PER_LSB: f32 = 0.022351744;
/// Frame layout constants
pub const FRAME_LEN: usize = 33;
pub const FRAME_HEADER: u8 = 0xA0;
pub const CYTON_CHANNELS: usize = 8;
pub const CYTON_RATE_HZ: u32 = 250;

const CMD_START_STREAM: &[u8] = b"b";
const CMD_STOP_STREAM: &[u8] = b"s";

/// One decoded frame: wrapping sample counter plus per-channel µV values
#[derive(Debug, Clone, PartialEq)]
pub struct SerialFrame {
    pub sample_number: u8,
    pub channels_uv: [f32; CYTON_CHANNELS],
}

/// Decode one 33-byte frame. The caller has already aligned the buffer.
pub fn parse_frame(frame: &[u8]) -> DeviceResult<SerialFrame> {
    if frame.len() != FRAME_LEN {
        return Err(DeviceError::protocol(format!(
            "frame is {} bytes, expected {}",
            frame.len(),
            FRAME_LEN
        )));
    }
    if frame[0] != FRAME_HEADER {
        return Err(DeviceError::protocol(format!(
            "bad frame header {:#04x}",
            frame[0]
        )));
    }
    let footer = frame[FRAME_LEN - 1];
    if !(0xC0..=0xCF).contains(&footer) {
        return Err(DeviceError::protocol(format!(
            "bad frame footer {:#04x}",
            footer
        )));
    }

    let mut channels_uv = [0.0f32; CYTON_CHANNELS];
    for (ch, value) in channels_uv.iter_mut().enumerate() {
        let offset = 2 + ch * 3;
        let count = i24_be(&frame[offset..offset + 3]);
        *value = count as f32 * CYTON_SCALE_UV_PER_LSB;
    }
    Ok(SerialFrame {
        sample_number: frame[1],
        channels_uv,
    })
}

/// Sign-extend a 24-bit big-endian value
fn i24_be(bytes: &[u8]) -> i32 {
    let raw = ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32;
    if raw & 0x80_0000 != 0 {
        (raw | 0xFF00_0000) as i32
    } else {
        raw as i32
    }
}

/// Scan `buf` for the next aligned frame; returns (consumed, frame)
pub fn next_frame(buf: &[u8]) -> Option<(usize, SerialFrame)> {
    let mut start = 0;
    while start + FRAME_LEN <= buf.len() {
        if buf[start] == FRAME_HEADER {
            if let Ok(frame) = parse_frame(&buf[start..start + FRAME_LEN]) {
                return Some((start + FRAME_LEN, frame));
            }
        }
        start += 1;
    }
    None
}

/// Wrapping distance between consecutive u8 sample counters; 1 means no loss
pub fn sample_gap(prev: u8, next: u8) -> u8 {
    next.wrapping_sub(prev)
}

// ============================================================================
// Driver
// ============================================================================

pub struct CytonSerialDriver {
    port_path: String,
    baud: u32,
    device_id: String,
    chunk_samples: usize,
    state: DeviceState,
    port: Option<tokio_serial::SerialStream>,
    stream_task: Option<JoinHandle<()>>,
}

impl CytonSerialDriver {
    pub fn new(port_path: impl Into<String>, baud: u32) -> Self {
        let port_path = port_path.into();
        let device_id = format!("cyton:{}", port_path);
        Self {
            port_path,
            baud,
            device_id,
            chunk_samples: 25,
            state: DeviceState::Discovered,
            port: None,
            stream_task: None,
        }
    }

    fn channel_list() -> Vec<ChannelInfo> {
        (0..CYTON_CHANNELS as u32)
            .map(|i| ChannelInfo::neural(i, format!("N{}P", i + 1)))
            .collect()
    }
}

#[async_trait]
impl DeviceDriver for CytonSerialDriver {
    async fn connect(&mut self) -> DeviceResult<()> {
        if matches!(self.state, DeviceState::Connected | DeviceState::Streaming) {
            return Ok(());
        }
        let port = tokio_serial::new(&self.port_path, self.baud)
            .timeout(Duration::from_millis(500))
            .open_native_async()
            .map_err(|e| match e.kind {
                tokio_serial::ErrorKind::NoDevice => DeviceError::not_found(e.to_string()),
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    DeviceError::new(DeviceErrorKind::PermissionDenied, e.to_string())
                }
                _ => DeviceError::hardware(e.to_string()),
            })?;
        self.port = Some(port);
        self.state = DeviceState::Connected;
        debug!(port = %self.port_path, "serial board connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> DeviceResult<()> {
        self.stop_stream().await.ok();
        self.port = None;
        self.state = DeviceState::Closed;
        Ok(())
    }

    fn describe(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id.clone(),
            device_type: DeviceType::Serial,
            data_type: DataType::Eeg,
            channels: Self::channel_list(),
            sampling_rate_hz: CYTON_RATE_HZ,
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
                DeviceErrorKind::AlreadyStreaming,
                "stream already running",
            ));
        }
        let mut port = self.port.take().ok_or_else(|| {
            DeviceError::protocol(format!(
                "cannot stream from state {}",
                self.state.as_str()
            ))
        })?;
        port.write_all(CMD_START_STREAM)
            .await
            .map_err(|e| DeviceError::hardware(format!("start command: {e}")))?;

        let device_id = self.device_id.clone();
        let chunk_samples = self.chunk_samples;
        let start_ts_ns = now_ns();

        let task = tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::with_capacity(4096);
            let mut read = [0u8; 1024];
            let mut rows: Vec<Vec<f32>> = vec![Vec::new(); CYTON_CHANNELS];
            let mut chunk_seq = 0u64;
            let mut total_samples = 0u64;
            let mut last_counter: Option<u8> = None;
            let sample_period_ns = 1_000_000_000 / CYTON_RATE_HZ as i64;

            loop {
                let n = match port.read(&mut read).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        warn!(device_id = %device_id, "serial read failed: {e}");
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
                buf.extend_from_slice(&read[..n]);

                while let Some((consumed, frame)) = next_frame(&buf) {
                    buf.drain(..consumed);

                    if let Some(prev) = last_counter {
                        let gap = sample_gap(prev, frame.sample_number);
                        if gap > 1 {
                            let _ = sink
                                .send(DriverEvent::Gap {
                                    device_id: device_id.clone(),
                                    expected_seq: prev.wrapping_add(1) as u64,
                                    got_seq: frame.sample_number as u64,
                                })
                                .await;
                        }
                    }
                    last_counter = Some(frame.sample_number);

                    for (ch, row) in rows.iter_mut().enumerate() {
                        row.push(frame.channels_uv[ch]);
                    }

                    if rows[0].len() >= chunk_samples {
                        let samples: Vec<Vec<f32>> = rows
                            .iter_mut()
                            .map(|row| row.drain(..).collect())
                            .collect();
                        let chunk = SampleChunk {
                            session_id: String::new(),
                            device_id: device_id.clone(),
                            data_type: DataType::Eeg,
                            sampling_rate_hz: CYTON_RATE_HZ,
                            channels: CytonSerialDriver::channel_list(),
                            samples,
                            chunk_seq,
                            device_ts_ns: start_ts_ns
                                + total_samples as i64 * sample_period_ns,
                            ingest_ts_ns: now_ns(),
                        };
                        total_samples += chunk_samples as u64;
                        chunk_seq += 1;
                        if sink.send(DriverEvent::Chunk(chunk)).await.is_err() {
                            return;
                        }
                    }
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
        if let Some(port) = self.port.as_mut() {
            let _ = port.write_all(CMD_STOP_STREAM).await;
        }
        if self.state == DeviceState::Streaming {
            // The port moved into the reader task; a fresh connect is
            // required before the next stream.
            self.state = DeviceState::Errored;
        }
        Ok(())
    }

    async fn check_impedance(&mut self) -> DeviceResult<HashMap<u32, f64>> {
        // The board interleaves impedance data with the signal stream;
        // without an active lease on the port we cannot probe.
        if self.port.is_none() {
            return Err(DeviceError::protocol("not connected"));
        }
        // TODO: drive the z-command handshake once firmware >= 3.1.2 is
        // the fleet minimum; older firmware answers with corrupt frames.
        Err(DeviceError::unsupported(
            "impedance handshake not implemented for this firmware",
        ))
    }

    async fn probe_quality(&mut self, duration: Duration) -> DeviceResult<QualityReport> {
        let (tx, mut rx) = mpsc::channel(64);
        self.start_stream(tx).await?;
        let deadline = tokio::time::Instant::now() + duration;
        let mut rows: Vec<Vec<f32>> = vec![Vec::new(); CYTON_CHANNELS];
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(DriverEvent::Chunk(chunk))) => {
                    for (row, data) in rows.iter_mut().zip(&chunk.samples) {
                        row.extend_from_slice(data);
                    }
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        self.stop_stream().await?;
        let refs: Vec<(u32, &[f32])> = rows
            .iter()
            .enumerate()
            .map(|(i, x)| (i as u32, x.as_slice()))
            .collect();
        Ok(assess_window(&refs, CYTON_RATE_HZ as f64))
    }
}
