//! SampleChunk Wire Codec
//!
//! Canonical on-wire representation of a `SampleChunk`:
//!
//! ```text
//! magic "NSCK" | version u8 | checksum u32 BE | header | zstd payload
//! ```
//!
//! The payload quantizes each channel's float32 samples to int16 with a
//! per-chunk scale factor published in the header, delta-encodes the
//! quantized stream along the time axis (wrapping arithmetic, exactly
//! reversible), and frames the bytes with zstd. Round-tripping reconstructs
//! every sample within 0.5/scale µV.
//!
//! The checksum is the first four bytes of SHA-256 over everything after the
//! checksum field (header + compressed payload).

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::chunk::{ChannelInfo, ChannelKind, DataType, SampleChunk};

/// Codec frame magic
pub const MAGIC: [u8; 4] = *b"NSCK";
/// Current codec version
pub const CODEC_VERSION: u8 = 1;
/// Default maximum encoded chunk size
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 1024 * 1024;

const ZSTD_LEVEL: i32 = 1;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload or header corruption detected by the checksum
    #[error("chunk checksum mismatch")]
    Checksum,

    /// Unknown version byte
    #[error("unsupported codec version {0}")]
    UnsupportedVersion(u8),

    /// Encoded frame exceeds the configured maximum
    #[error("encoded chunk is {size} bytes, maximum is {max}")]
    ChunkTooLarge { size: usize, max: usize },

    /// Frame ended before the declared contents
    #[error("truncated chunk frame at offset {0}")]
    Truncated(usize),

    /// Malformed field inside an otherwise intact frame
    #[error("malformed chunk frame: {0}")]
    Malformed(String),
}

impl CodecError {
    /// Stable machine-readable code surfaced in API rejections
    pub fn code(&self) -> &'static str {
        match self {
            CodecError::Checksum => "ErrChecksum",
            CodecError::UnsupportedVersion(_) => "ErrUnsupportedCodecVersion",
            CodecError::ChunkTooLarge { .. } => "ErrChunkTooLarge",
            CodecError::Truncated(_) => "ErrTruncated",
            CodecError::Malformed(_) => "ErrMalformed",
        }
    }
}

type CodecResult<T> = Result<T, CodecError>;

// ============================================================================
// Encoding
// ============================================================================

/// Encode a chunk with the default size cap
pub fn encode(chunk: &SampleChunk) -> CodecResult<Vec<u8>> {
    encode_with_limit(chunk, DEFAULT_MAX_CHUNK_BYTES)
}

/// Encode a chunk, failing if the resulting frame exceeds `max_bytes`
pub fn encode_with_limit(chunk: &SampleChunk, max_bytes: usize) -> CodecResult<Vec<u8>> {
    let scale = quantization_scale(&chunk.samples);

    // Quantize to int16 first, then delta-encode the quantized stream.
    // Deltas of int16 values wrap, decode reverses with wrapping adds, so
    // the quantized values survive the trip bit-exactly.
    let n = chunk.samples_per_channel();
    let mut raw = Vec::with_capacity(chunk.channel_count() * n * 2);
    for row in &chunk.samples {
        let mut prev: i16 = 0;
        for (i, &x) in row.iter().enumerate() {
            let q = quantize(x, scale);
            let out = if i == 0 { q } else { q.wrapping_sub(prev) };
            raw.extend_from_slice(&out.to_le_bytes());
            prev = q;
        }
    }
    let payload = zstd::bulk::compress(&raw, ZSTD_LEVEL)
        .map_err(|e| CodecError::Malformed(format!("zstd compress: {e}")))?;

    let mut body = Vec::with_capacity(payload.len() + 128);
    write_header(&mut body, chunk, scale);
    body.extend_from_slice(&payload);

    let checksum = checksum32(&body);

    let mut frame = Vec::with_capacity(body.len() + 9);
    frame.extend_from_slice(&MAGIC);
    frame.push(CODEC_VERSION);
    frame.extend_from_slice(&checksum.to_be_bytes());
    frame.extend_from_slice(&body);

    if frame.len() > max_bytes {
        return Err(CodecError::ChunkTooLarge {
            size: frame.len(),
            max: max_bytes,
        });
    }
    Ok(frame)
}

fn write_header(out: &mut Vec<u8>, chunk: &SampleChunk, scale: f32) {
    out.push(chunk.data_type.wire_tag());
    out.extend_from_slice(&chunk.sampling_rate_hz.to_le_bytes());
    out.extend_from_slice(&(chunk.channel_count() as u16).to_le_bytes());
    out.extend_from_slice(&(chunk.samples_per_channel() as u32).to_le_bytes());
    out.extend_from_slice(&chunk.chunk_seq.to_le_bytes());
    out.extend_from_slice(&chunk.device_ts_ns.to_le_bytes());
    out.extend_from_slice(&chunk.ingest_ts_ns.to_le_bytes());
    out.extend_from_slice(&scale.to_le_bytes());
    write_str(out, &chunk.session_id);
    write_str(out, &chunk.device_id);
    for ch in &chunk.channels {
        out.extend_from_slice(&ch.id.to_le_bytes());
        out.push(channel_kind_tag(ch.kind));
        write_str(out, &ch.label);
        write_str(out, &ch.unit);
        match ch.position {
            Some(p) => {
                out.push(1);
                for axis in p {
                    out.extend_from_slice(&axis.to_le_bytes());
                }
            }
            None => out.push(0),
        }
    }
}

/// Scale chosen so the largest absolute sample maps near the top of the
/// int16 range. Flat-zero chunks get scale 1.0.
fn quantization_scale(samples: &[Vec<f32>]) -> f32 {
    let max_abs = samples
        .iter()
        .flatten()
        .fold(0.0f32, |acc, &x| acc.max(x.abs()));
    if max_abs <= f32::EPSILON {
        1.0
    } else {
        (i16::MAX as f32 - 1.0) / max_abs
    }
}

fn quantize(x: f32, scale: f32) -> i16 {
    (x * scale).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a frame with the default size cap
pub fn decode(frame: &[u8]) -> CodecResult<SampleChunk> {
    decode_with_limit(frame, DEFAULT_MAX_CHUNK_BYTES)
}

/// Decode a frame, rejecting oversized input before touching the payload
pub fn decode_with_limit(frame: &[u8], max_bytes: usize) -> CodecResult<SampleChunk> {
    if frame.len() > max_bytes {
        return Err(CodecError::ChunkTooLarge {
            size: frame.len(),
            max: max_bytes,
        });
    }
    if frame.len() < 9 {
        return Err(CodecError::Truncated(frame.len()));
    }
    if frame[0..4] != MAGIC {
        return Err(CodecError::Malformed("bad magic".to_string()));
    }
    if frame[4] != CODEC_VERSION {
        return Err(CodecError::UnsupportedVersion(frame[4]));
    }
    let declared = u32::from_be_bytes(frame[5..9].try_into().unwrap());
    let body = &frame[9..];
    if checksum32(body) != declared {
        return Err(CodecError::Checksum);
    }

    let mut r = Reader::new(body);
    let data_type = DataType::from_wire_tag(r.u8()?)
        .ok_or_else(|| CodecError::Malformed("unknown data type tag".to_string()))?;
    let sampling_rate_hz = r.u32()?;
    let channel_count = r.u16()? as usize;
    let samples_per_channel = r.u32()? as usize;
    let chunk_seq = r.u64()?;
    let device_ts_ns = r.i64()?;
    let ingest_ts_ns = r.i64()?;
    let scale = r.f32()?;
    if !scale.is_finite() || scale <= 0.0 {
        return Err(CodecError::Malformed(format!("bad scale factor {scale}")));
    }
    let session_id = r.string()?;
    let device_id = r.string()?;

    let mut channels = Vec::with_capacity(channel_count);
    for _ in 0..channel_count {
        let id = r.u32()?;
        let kind = channel_kind_from_tag(r.u8()?)?;
        let label = r.string()?;
        let unit = r.string()?;
        let position = match r.u8()? {
            0 => None,
            1 => Some([r.f32()?, r.f32()?, r.f32()?]),
            other => {
                return Err(CodecError::Malformed(format!(
                    "bad position flag {other}"
                )))
            }
        };
        channels.push(ChannelInfo {
            id,
            label,
            kind,
            unit,
            position,
        });
    }

    let raw = zstd::bulk::decompress(r.rest(), channel_count * samples_per_channel * 2)
        .map_err(|_| CodecError::Malformed("zstd decompress".to_string()))?;
    if raw.len() != channel_count * samples_per_channel * 2 {
        return Err(CodecError::Malformed(format!(
            "payload holds {} bytes, header declares {}x{} samples",
            raw.len(),
            channel_count,
            samples_per_channel
        )));
    }

    let mut samples = Vec::with_capacity(channel_count);
    let mut offset = 0usize;
    for _ in 0..channel_count {
        let mut row = Vec::with_capacity(samples_per_channel);
        let mut acc: i16 = 0;
        for i in 0..samples_per_channel {
            let v = i16::from_le_bytes([raw[offset], raw[offset + 1]]);
            offset += 2;
            acc = if i == 0 { v } else { acc.wrapping_add(v) };
            row.push(acc as f32 / scale);
        }
        samples.push(row);
    }

    Ok(SampleChunk {
        session_id,
        device_id,
        data_type,
        sampling_rate_hz,
        channels,
        samples,
        chunk_seq,
        device_ts_ns,
        ingest_ts_ns,
    })
}

/// SHA-256 of an encoded frame; the `data_hash` recorded in `data_ingested`
/// ledger events.
pub fn data_hash(frame: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(frame);
    digest.into()
}

/// Maximum reconstruction error for a frame encoded at `scale`
pub fn max_quantization_error(scale: f32) -> f32 {
    0.5 / scale
}

// ============================================================================
// Internals
// ============================================================================

fn checksum32(body: &[u8]) -> u32 {
    let digest = Sha256::digest(body);
    u32::from_be_bytes(digest[0..4].try_into().unwrap())
}

fn channel_kind_tag(kind: ChannelKind) -> u8 {
    match kind {
        ChannelKind::Neural => 0,
        ChannelKind::Accelerometer => 1,
        ChannelKind::Marker => 2,
        ChannelKind::Auxiliary => 3,
    }
}

fn channel_kind_from_tag(tag: u8) -> CodecResult<ChannelKind> {
    match tag {
        0 => Ok(ChannelKind::Neural),
        1 => Ok(ChannelKind::Accelerometer),
        2 => Ok(ChannelKind::Marker),
        3 => Ok(ChannelKind::Auxiliary),
        other => Err(CodecError::Malformed(format!("bad channel kind {other}"))),
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_uvarint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

fn write_uvarint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::Truncated(self.pos));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> CodecResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> CodecResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> CodecResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> CodecResult<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn uvarint(&mut self) -> CodecResult<u64> {
        let mut v: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            v |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
            if shift >= 64 {
                return Err(CodecError::Malformed("uvarint overflow".to_string()));
            }
        }
    }

    fn string(&mut self) -> CodecResult<String> {
        let len = self.uvarint()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::Malformed("invalid utf8".to_string()))
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}
