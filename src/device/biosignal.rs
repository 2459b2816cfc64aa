//! Biosignal SDK Driver
//!
//! BrainFlow-class boards reached through the vendor streaming daemon:
//! the driver opens a TCP session, issues JSON commands and consumes
//! newline-delimited JSON packets of raw ADC counts, converting them to
//! µV with the per-board scale. The board table mirrors the SDK's board
//! ids so configuration stays interchangeable with the vendor tooling.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
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

// ============================================================================
// Board table
// ============================================================================

/// Supported SDK boards, tagged with the SDK's numeric board ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiosignalBoard {
    Cyton,
    CytonDaisy,
    Ganglion,
    Muse2,
    MuseS,
}

impl BiosignalBoard {
    /// SDK board id, as accepted by the vendor daemon
    pub fn board_id(&self) -> i32 {
        match self {
            BiosignalBoard::Cyton => 0,
            BiosignalBoard::CytonDaisy => 2,
            BiosignalBoard::Ganglion => 1,
            BiosignalBoard::Muse2 => 38,
            BiosignalBoard::MuseS => 39,
        }
    }

    pub fn from_board_id(id: i32) -> Option<Self> {
        [
            BiosignalBoard::Cyton,
            BiosignalBoard::CytonDaisy,
            BiosignalBoard::Ganglion,
            BiosignalBoard::Muse2,
            BiosignalBoard::MuseS,
        ]
        .into_iter()
        .find(|b| b.board_id() == id)
    }

    pub fn channel_count(&self) -> usize {
        match self {
            BiosignalBoard::Cyton => 8,
            BiosignalBoard::CytonDaisy => 16,
            BiosignalBoard::Ganglion => 4,
            BiosignalBoard::Muse2 | BiosignalBoard::MuseS => 4,
        }
    }

    pub fn sampling_rate_hz(&self) -> u32 {
        match self {
            BiosignalBoard::Cyton => 250,
            BiosignalBoard::CytonDaisy => 125,
            BiosignalBoard::Ganglion => 200,
            BiosignalBoard::Muse2 | BiosignalBoard::MuseS => 256,
        }
    }

    /// µV per raw ADC count
    pub fn scale_uv_per_count(&self) -> f64 {
        match self {
            // 4.5 V reference / gain 24 / (2^23 - 1)
            BiosignalBoard::Cyton | BiosignalBoard::CytonDaisy => 0.022351744,
            // 1.2 V reference over the 24-bit range
            BiosignalBoard::Ganglion => 1.2 / 8_388_607.0 * 1e6,
            // 12-bit BLE packets
            BiosignalBoard::Muse2 | BiosignalBoard::MuseS => 0.48828125,
        }
    }

    pub fn supports_impedance(&self) -> bool {
        matches!(
            self,
            BiosignalBoard::Cyton | BiosignalBoard::CytonDaisy | BiosignalBoard::Ganglion
        )
    }

    pub fn supports_battery(&self) -> bool {
        matches!(
            self,
            BiosignalBoard::Ganglion | BiosignalBoard::Muse2 | BiosignalBoard::MuseS
        )
    }

    fn channel_labels(&self) -> Vec<&'static str> {
        match self {
            BiosignalBoard::Ganglion => vec!["CH1", "CH2", "CH3", "CH4"],
            BiosignalBoard::Muse2 | BiosignalBoard::MuseS => {
                vec!["TP9", "AF7", "AF8", "TP10"]
            }
            BiosignalBoard::Cyton => {
                vec!["N1P", "N2P", "N3P", "N4P", "N5P", "N6P", "N7P", "N8P"]
            }
            BiosignalBoard::CytonDaisy => vec![
                "N1P", "N2P", "N3P", "N4P", "N5P", "N6P", "N7P", "N8P", "D1P", "D2P", "D3P",
                "D4P", "D5P", "D6P", "D7P", "D8P",
            ],
        }
    }
}

// ============================================================================
// Daemon wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct DaemonCommand<'a> {
    command: &'a str,
    board_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    serial_port: Option<&'a str>,
}

/// One newline-delimited packet from the daemon: raw counts per channel
#[derive(Debug, Deserialize)]
pub struct DaemonPacket {
    pub seq: u64,
    /// counts[channel][sample]
    pub counts: Vec<Vec<f64>>,
    #[serde(default)]
    pub battery_pct: Option<f32>,
}

/// Convert a daemon packet into µV rows for `board`
pub fn convert_packet(board: BiosignalBoard, packet: &DaemonPacket) -> DeviceResult<Vec<Vec<f32>>> {
    if packet.counts.len() != board.channel_count() {
        return Err(DeviceError::protocol(format!(
            "packet has {} channels, board {:?} has {}",
            packet.counts.len(),
            board,
            board.channel_count()
        )));
    }
    let scale = board.scale_uv_per_count();
    Ok(packet
        .counts
        .iter()
        .map(|row| row.iter().map(|&c| (c * scale) as f32).collect())
        .collect())
}

// ============================================================================
// Driver
// ============================================================================

pub struct BiosignalDriver {
    board: BiosignalBoard,
    daemon_addr: String,
    serial_port: Option<String>,
    device_id: String,
    state: DeviceState,
    control: Option<TcpStream>,
    stream_task: Option<JoinHandle<()>>,
}

impl BiosignalDriver {
    pub fn new(
        board: BiosignalBoard,
        daemon_addr: impl Into<String>,
        serial_port: Option<String>,
    ) -> Self {
        let daemon_addr = daemon_addr.into();
        let device_id = format!("biosignal:{}:{}", board.board_id(), daemon_addr);
        Self {
            board,
            daemon_addr,
            serial_port,
            device_id,
            state: DeviceState::Discovered,
            control: None,
            stream_task: None,
        }
    }

    fn channel_list(board: BiosignalBoard) -> Vec<ChannelInfo> {
        board
            .channel_labels()
            .into_iter()
            .enumerate()
            .map(|(i, label)| ChannelInfo::neural(i as u32, label))
            .collect()
    }

    async fn send_command(&mut self, command: &str) -> DeviceResult<()> {
        let stream = self
            .control
            .as_mut()
            .ok_or_else(|| DeviceError::protocol("not connected"))?;
        let cmd = DaemonCommand {
            command,
            board_id: self.board.board_id(),
            serial_port: self.serial_port.as_deref(),
        };
        let mut line = serde_json::to_vec(&cmd)
            .map_err(|e| DeviceError::protocol(format!("encode command: {e}")))?;
        line.push(b'\n');
        stream
            .write_all(&line)
            .await
            .map_err(|e| DeviceError::hardware(format!("daemon write: {e}")))
    }
}

#[async_trait]
impl DeviceDriver for BiosignalDriver {
    async fn connect(&mut self) -> DeviceResult<()> {
        if matches!(self.state, DeviceState::Connected | DeviceState::Streaming) {
            return Ok(());
        }
        let stream = TcpStream::connect(&self.daemon_addr).await.map_err(|e| {
            match e.kind() {
                std::io::ErrorKind::ConnectionRefused => DeviceError::not_found(format!(
                    "biosignal daemon unreachable at {}: {e}",
                    self.daemon_addr
                )),
                std::io::ErrorKind::PermissionDenied => {
                    DeviceError::new(DeviceErrorKind::PermissionDenied, e.to_string())
                }
                _ => DeviceError::hardware(e.to_string()),
            }
        })?;
        self.control = Some(stream);
        self.send_command("prepare_session").await?;
        self.state = DeviceState::Connected;
        debug!(board = ?self.board, addr = %self.daemon_addr, "biosignal session prepared");
        Ok(())
    }

    async fn disconnect(&mut self) -> DeviceResult<()> {
        self.stop_stream().await.ok();
        if self.control.is_some() {
            self.send_command("release_session").await.ok();
        }
        self.control = None;
        self.state = DeviceState::Closed;
        Ok(())
    }

    fn describe(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id.clone(),
            device_type: DeviceType::BiosignalSdk,
            data_type: DataType::Eeg,
            channels: Self::channel_list(self.board),
            sampling_rate_hz: self.board.sampling_rate_hz(),
            supports_impedance_check: self.board.supports_impedance(),
            supports_battery: self.board.supports_battery(),
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
        self.send_command("start_stream").await?;
        let stream = self
            .control
            .take()
            .ok_or_else(|| DeviceError::protocol("not connected"))?;

        let board = self.board;
        let device_id = self.device_id.clone();
        let start_ts_ns = now_ns();
        let rate = board.sampling_rate_hz();

        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            let mut chunk_seq = 0u64;
            let mut total_samples = 0u64;
            let mut last_seq: Option<u64> = None;
            let sample_period_ns = 1_000_000_000 / rate as i64;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(device_id = %device_id, "daemon read failed: {e}");
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
                let packet: DaemonPacket = match serde_json::from_str(&line) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(device_id = %device_id, "bad daemon packet: {e}");
                        continue;
                    }
                };

                if let Some(prev) = last_seq {
                    if packet.seq > prev + 1 {
                        let _ = sink
                            .send(DriverEvent::Gap {
                                device_id: device_id.clone(),
                                expected_seq: prev + 1,
                                got_seq: packet.seq,
                            })
                            .await;
                    }
                }
                last_seq = Some(packet.seq);

                let samples = match convert_packet(board, &packet) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(device_id = %device_id, "dropping malformed packet: {e}");
                        continue;
                    }
                };
                let n = samples.first().map(|r| r.len()).unwrap_or(0);
                if n == 0 {
                    continue;
                }
                let chunk = SampleChunk {
                    session_id: String::new(),
                    device_id: device_id.clone(),
                    data_type: DataType::Eeg,
                    sampling_rate_hz: rate,
                    channels: BiosignalDriver::channel_list(board),
                    samples,
                    chunk_seq,
                    device_ts_ns: start_ts_ns + total_samples as i64 * sample_period_ns,
                    ingest_ts_ns: now_ns(),
                };
                total_samples += n as u64;
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
            // The control socket moved into the reader; reconnect to
            // issue further commands.
            self.state = DeviceState::Errored;
        }
        Ok(())
    }

    async fn check_impedance(&mut self) -> DeviceResult<HashMap<u32, f64>> {
        if !self.board.supports_impedance() {
            return Err(DeviceError::unsupported(format!(
                "board {:?} has no impedance mode",
                self.board
            )));
        }
        self.send_command("impedance_check").await?;
        let stream = self
            .control
            .as_mut()
            .ok_or_else(|| DeviceError::protocol("not connected"))?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(10), reader.read_line(&mut line))
            .await
            .map_err(|_| DeviceError::hardware("impedance probe timed out"))?
            .map_err(|e| DeviceError::hardware(e.to_string()))?;
        let ohms: HashMap<u32, f64> = serde_json::from_str(line.trim())
            .map_err(|e| DeviceError::protocol(format!("impedance reply: {e}")))?;
        Ok(ohms)
    }

    async fn probe_quality(&mut self, duration: Duration) -> DeviceResult<QualityReport> {
        let (tx, mut rx) = mpsc::channel(64);
        self.start_stream(tx).await?;
        let deadline = tokio::time::Instant::now() + duration;
        let mut rows: Vec<Vec<f32>> = vec![Vec::new(); self.board.channel_count()];
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
        Ok(assess_window(&refs, self.board.sampling_rate_hz() as f64))
    }
}
