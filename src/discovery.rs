//! Device Discovery
//!
//! A protocol-bus scanner that probes serial ports, bluetooth
//! advertisements, mDNS service announcements and the LSL relay for
//! attachable devices. A failing probe never aborts the scan; its error
//! is recorded per protocol and returned alongside whatever the other
//! buses found.

use std::time::Duration;

use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::DeviceConfig;
use crate::device::DeviceType;

/// mDNS service type announced by NeuraScale-aware hardware
const MDNS_SERVICE: &str = "_neurascale._tcp.local";
/// Biosignal SDK daemons announce under this service type
const MDNS_SDK_SERVICE: &str = "_biosignal-sdk._tcp.local";
const MDNS_ADDR: &str = "224.0.0.251:5353";

/// LSL stream types the engine can ingest
const LSL_TYPES: [&str; 3] = ["EEG", "ECoG", "Marker"];

static SERIAL_PORT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(ttyUSB|ttyACM|cu\.usb|COM)\d*").unwrap());

// ============================================================================
// Types
// ============================================================================

/// Bus a device was found on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryProtocol {
    Serial,
    Bluetooth,
    Mdns,
    Lsl,
    Synthetic,
}

impl DiscoveryProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryProtocol::Serial => "serial",
            DiscoveryProtocol::Bluetooth => "bluetooth",
            DiscoveryProtocol::Mdns => "mdns",
            DiscoveryProtocol::Lsl => "lsl",
            DiscoveryProtocol::Synthetic => "synthetic",
        }
    }
}

/// One discoverable endpoint. `discovery_id` is stable across scans for
/// the same physical endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub discovery_id: String,
    pub device_type: DeviceType,
    pub protocol: DiscoveryProtocol,
    /// Port path, address or stream name, protocol-dependent
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
    pub friendly_name: String,
}

impl DiscoveredDevice {
    fn new(
        device_type: DeviceType,
        protocol: DiscoveryProtocol,
        endpoint: impl Into<String>,
        friendly_name: impl Into<String>,
    ) -> Self {
        let endpoint = endpoint.into();
        Self {
            discovery_id: stable_id(protocol, &endpoint),
            device_type,
            protocol,
            endpoint,
            rssi: None,
            friendly_name: friendly_name.into(),
        }
    }
}

/// Deterministic id from protocol and endpoint
fn stable_id(protocol: DiscoveryProtocol, endpoint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(protocol.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(endpoint.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// A curated bluetooth advertisement signature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothSignature {
    pub name_prefix: String,
    pub service_uuid: String,
    pub address: String,
}

/// Scanner options, derived from the device configuration
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub timeout: Duration,
    pub mdns_enabled: bool,
    pub synthetic_enabled: bool,
    /// LSL relay to query for visible streams
    pub lsl_relay_addr: Option<String>,
    /// Known bluetooth advertisements supplied by the operator
    pub bluetooth_table: Vec<BluetoothSignature>,
}

impl DiscoveryOptions {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            timeout: config.discovery_timeout,
            mdns_enabled: config.mdns_enabled,
            synthetic_enabled: config.synthetic_enabled,
            lsl_relay_addr: std::env::var("LSL_RELAY_ADDR").ok(),
            bluetooth_table: Vec::new(),
        }
    }
}

/// Full result of one scan: discoveries plus per-protocol failures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    pub devices: Vec<DiscoveredDevice>,
    pub errors: Vec<ProtocolError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolError {
    pub protocol: DiscoveryProtocol,
    pub message: String,
}

// ============================================================================
// Scanner
// ============================================================================

/// One-shot scan across all enabled buses
pub async fn quick_scan(options: &DiscoveryOptions) -> ScanReport {
    let timeout = options.timeout;
    let mut report = ScanReport::default();

    let probes: Vec<(
        DiscoveryProtocol,
        futures::future::BoxFuture<'_, Result<Vec<DiscoveredDevice>, String>>,
    )> = vec![
        (DiscoveryProtocol::Serial, Box::pin(probe_serial())),
        (
            DiscoveryProtocol::Bluetooth,
            Box::pin(probe_bluetooth(&options.bluetooth_table)),
        ),
        (
            DiscoveryProtocol::Mdns,
            Box::pin(probe_mdns(options.mdns_enabled, timeout)),
        ),
        (
            DiscoveryProtocol::Lsl,
            Box::pin(probe_lsl(options.lsl_relay_addr.clone(), timeout)),
        ),
        (
            DiscoveryProtocol::Synthetic,
            Box::pin(probe_synthetic(options.synthetic_enabled)),
        ),
    ];

    let (protocols, futures): (Vec<_>, Vec<_>) = probes.into_iter().unzip();
    let outcomes = join_all(futures.into_iter().map(|f| async move {
        tokio::time::timeout(timeout, f)
            .await
            .unwrap_or_else(|_| Err("probe timed out".to_string()))
    }))
    .await;

    for (protocol, outcome) in protocols.into_iter().zip(outcomes) {
        match outcome {
            Ok(devices) => report.devices.extend(devices),
            Err(message) => {
                debug!(protocol = protocol.as_str(), "probe failed: {message}");
                report.errors.push(ProtocolError { protocol, message });
            }
        }
    }

    report
}

/// Spawn a periodic scanner and subscribe to its discoveries. Each tick
/// broadcasts the full scan report.
pub fn watch(
    options: DiscoveryOptions,
    interval: Duration,
) -> (broadcast::Receiver<ScanReport>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = broadcast::channel(8);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let report = quick_scan(&options).await;
            if tx.send(report).is_err() {
                break;
            }
        }
    });
    (rx, task)
}

// ============================================================================
// Probes
// ============================================================================

async fn probe_serial() -> Result<Vec<DiscoveredDevice>, String> {
    let ports = tokio::task::spawn_blocking(tokio_serial::available_ports)
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;

    let mut found = Vec::new();
    for port in ports {
        if !SERIAL_PORT_PATTERN.is_match(&port.port_name) {
            continue;
        }
        let friendly = match &port.port_type {
            tokio_serial::SerialPortType::UsbPort(usb) => {
                let product = usb.product.clone().unwrap_or_default();
                // Cyton dongles enumerate as FTDI bridges
                if !(product.contains("OpenBCI")
                    || product.contains("FT231X")
                    || product.contains("FTDI"))
                {
                    continue;
                }
                format!("{} ({})", product, port.port_name)
            }
            _ => continue,
        };
        found.push(DiscoveredDevice::new(
            DeviceType::Serial,
            DiscoveryProtocol::Serial,
            &port.port_name,
            friendly,
        ));
    }
    Ok(found)
}

async fn probe_bluetooth(
    table: &[BluetoothSignature],
) -> Result<Vec<DiscoveredDevice>, String> {
    if table.is_empty() {
        // No BLE stack on the host; the operator supplies known
        // advertisements through configuration instead.
        return Err("bluetooth scanning not supported on this host".to_string());
    }
    Ok(table
        .iter()
        .map(|sig| {
            DiscoveredDevice::new(
                DeviceType::BiosignalSdk,
                DiscoveryProtocol::Bluetooth,
                &sig.address,
                &sig.name_prefix,
            )
        })
        .collect())
}

async fn probe_mdns(enabled: bool, timeout: Duration) -> Result<Vec<DiscoveredDevice>, String> {
    if !enabled {
        return Ok(Vec::new());
    }
    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| e.to_string())?;

    for service in [MDNS_SERVICE, MDNS_SDK_SERVICE] {
        let query = build_ptr_query(service);
        socket
            .send_to(&query, MDNS_ADDR)
            .await
            .map_err(|e| format!("mdns send: {e}"))?;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let mut found = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, peer))) => {
                for instance in parse_ptr_instances(&buf[..n], MDNS_SERVICE)
                    .into_iter()
                    .chain(parse_ptr_instances(&buf[..n], MDNS_SDK_SERVICE))
                {
                    let endpoint = format!("{}@{}", instance, peer.ip());
                    found.push(DiscoveredDevice::new(
                        DeviceType::BiosignalSdk,
                        DiscoveryProtocol::Mdns,
                        endpoint,
                        instance,
                    ));
                }
            }
            _ => break,
        }
    }
    found.dedup_by(|a, b| a.discovery_id == b.discovery_id);
    Ok(found)
}

async fn probe_lsl(
    relay_addr: Option<String>,
    timeout: Duration,
) -> Result<Vec<DiscoveredDevice>, String> {
    let Some(addr) = relay_addr else {
        return Ok(Vec::new());
    };
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| "LSL relay connect timed out".to_string())?
        .map_err(|e| format!("LSL relay: {e}"))?;
    stream
        .write_all(b"LIST\n")
        .await
        .map_err(|e| e.to_string())?;

    let mut lines = BufReader::new(stream).lines();
    let mut found = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    while let Ok(Ok(Some(line))) = tokio::time::timeout_at(deadline, lines.next_line()).await {
        if line.is_empty() {
            break;
        }
        #[derive(Deserialize)]
        struct Entry {
            name: String,
            #[serde(rename = "type")]
            stream_type: String,
        }
        let Ok(entry) = serde_json::from_str::<Entry>(&line) else {
            continue;
        };
        if !LSL_TYPES
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&entry.stream_type))
        {
            continue;
        }
        found.push(DiscoveredDevice::new(
            DeviceType::Lsl,
            DiscoveryProtocol::Lsl,
            &entry.name,
            format!("{} [{}]", entry.name, entry.stream_type),
        ));
    }
    Ok(found)
}

async fn probe_synthetic(enabled: bool) -> Result<Vec<DiscoveredDevice>, String> {
    if !enabled {
        return Ok(Vec::new());
    }
    Ok(vec![DiscoveredDevice::new(
        DeviceType::Synthetic,
        DiscoveryProtocol::Synthetic,
        "synthetic-0",
        "Synthetic signal generator",
    )])
}

// ============================================================================
// Minimal DNS-SD encoding
// ============================================================================

/// Build a standard PTR question for `service`
fn build_ptr_query(service: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(64);
    msg.extend_from_slice(&[0, 0]); // id
    msg.extend_from_slice(&[0, 0]); // flags: standard query
    msg.extend_from_slice(&[0, 1]); // one question
    msg.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // no records
    for label in service.split('.') {
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
    msg.extend_from_slice(&[0, 12]); // PTR
    msg.extend_from_slice(&[0, 1]); // IN
    msg
}

/// Pull instance names out of PTR answers for `service`. Tolerates name
/// compression by decompressing every name in the answer section.
fn parse_ptr_instances(msg: &[u8], service: &str) -> Vec<String> {
    let mut out = Vec::new();
    if msg.len() < 12 {
        return out;
    }
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]) as usize;
    let ancount = u16::from_be_bytes([msg[6], msg[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        let Some(next) = skip_name(msg, pos) else {
            return out;
        };
        pos = next + 4;
    }
    for _ in 0..ancount {
        let Some((name, after_name)) = read_name(msg, pos) else {
            return out;
        };
        if after_name + 10 > msg.len() {
            return out;
        }
        let rtype = u16::from_be_bytes([msg[after_name], msg[after_name + 1]]);
        let rdlen =
            u16::from_be_bytes([msg[after_name + 8], msg[after_name + 9]]) as usize;
        let rdata_start = after_name + 10;
        if rdata_start + rdlen > msg.len() {
            return out;
        }
        if rtype == 12 && name.eq_ignore_ascii_case(service) {
            if let Some((target, _)) = read_name(msg, rdata_start) {
                // Instance is the leading label of the PTR target
                if let Some(instance) = target.split('.').next() {
                    if !instance.is_empty() {
                        out.push(instance.to_string());
                    }
                }
            }
        }
        pos = rdata_start + rdlen;
    }
    out
}

fn skip_name(msg: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *msg.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Some(pos + 2);
        }
        pos += 1 + len;
    }
}

fn read_name(msg: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels = Vec::new();
    let mut end_after: Option<usize> = None;
    let mut hops = 0;
    loop {
        let len = *msg.get(pos)? as usize;
        if len == 0 {
            let end = end_after.unwrap_or(pos + 1);
            return Some((labels.join("."), end));
        }
        if len & 0xC0 == 0xC0 {
            let ptr = (((len & 0x3F) as usize) << 8) | *msg.get(pos + 1)? as usize;
            if end_after.is_none() {
                end_after = Some(pos + 2);
            }
            pos = ptr;
            hops += 1;
            if hops > 16 {
                return None;
            }
            continue;
        }
        let label = msg.get(pos + 1..pos + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).to_string());
        pos += 1 + len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_id_is_deterministic() {
        let a = stable_id(DiscoveryProtocol::Serial, "/dev/ttyUSB0");
        let b = stable_id(DiscoveryProtocol::Serial, "/dev/ttyUSB0");
        let c = stable_id(DiscoveryProtocol::Serial, "/dev/ttyUSB1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_same_endpoint_different_protocol_differs() {
        let serial = stable_id(DiscoveryProtocol::Serial, "x");
        let lsl = stable_id(DiscoveryProtocol::Lsl, "x");
        assert_ne!(serial, lsl);
    }

    #[test]
    fn test_ptr_query_shape() {
        let query = build_ptr_query(MDNS_SERVICE);
        // question count 1, answer count 0
        assert_eq!(&query[4..6], &[0, 1]);
        assert_eq!(&query[6..8], &[0, 0]);
        // trailing QTYPE PTR, QCLASS IN
        let n = query.len();
        assert_eq!(&query[n - 4..], &[0, 12, 0, 1]);
    }

    #[test]
    fn test_parse_ptr_round_trip() {
        // Hand-build a response: one answer, PTR from the service to
        // "amp-1.<service>"
        let mut msg = Vec::new();
        msg.extend_from_slice(&[0, 0, 0x84, 0, 0, 0, 0, 1, 0, 0, 0, 0]);
        let name_offset = msg.len() as u16;
        for label in MDNS_SERVICE.split('.') {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0);
        msg.extend_from_slice(&[0, 12, 0, 1]); // PTR IN
        msg.extend_from_slice(&[0, 0, 0, 60]); // TTL
        // RDATA: "amp-1" + pointer back to the service name
        let rdata_len = 1 + 5 + 2;
        msg.extend_from_slice(&(rdata_len as u16).to_be_bytes());
        msg.push(5);
        msg.extend_from_slice(b"amp-1");
        msg.push(0xC0);
        msg.push(name_offset as u8);

        let instances = parse_ptr_instances(&msg, MDNS_SERVICE);
        assert_eq!(instances, vec!["amp-1".to_string()]);
    }

    #[tokio::test]
    async fn test_synthetic_probe_gated() {
        assert!(probe_synthetic(false).await.unwrap().is_empty());
        let devices = probe_synthetic(true).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].protocol, DiscoveryProtocol::Synthetic);
    }

    #[tokio::test]
    async fn test_bluetooth_probe_without_stack_reports_error() {
        let err = probe_bluetooth(&[]).await.unwrap_err();
        assert!(err.contains("not supported"));
    }

    #[tokio::test]
    async fn test_scan_survives_partial_failures() {
        let options = DiscoveryOptions {
            timeout: Duration::from_millis(200),
            mdns_enabled: false,
            synthetic_enabled: true,
            lsl_relay_addr: None,
            bluetooth_table: Vec::new(),
        };
        let report = quick_scan(&options).await;
        // Synthetic still discovered even though bluetooth failed
        assert!(report
            .devices
            .iter()
            .any(|d| d.protocol == DiscoveryProtocol::Synthetic));
        assert!(report
            .errors
            .iter()
            .any(|e| e.protocol == DiscoveryProtocol::Bluetooth));
    }

    #[tokio::test]
    async fn test_discovery_id_stable_across_scans() {
        let options = DiscoveryOptions {
            timeout: Duration::from_millis(200),
            mdns_enabled: false,
            synthetic_enabled: true,
            lsl_relay_addr: None,
            bluetooth_table: Vec::new(),
        };
        let first = quick_scan(&options).await;
        let second = quick_scan(&options).await;
        let id = |r: &ScanReport| {
            r.devices
                .iter()
                .find(|d| d.protocol == DiscoveryProtocol::Synthetic)
                .map(|d| d.discovery_id.clone())
        };
        assert_eq!(id(&first), id(&second));
        assert!(id(&first).is_some());
    }
}
