//! Event-Time Windowing
//!
//! Per-session tumbling windows over the sample stream. Windows are
//! anchored to the session's first sample so a gap-free session of
//! duration D yields exactly `floor(D / W)` windows. The watermark
//! trails the maximum observed event time by the allowed lateness
//! (2·W); chunks arriving behind it go to the late side-output and never
//! replace an emitted window. A sequence gap re-anchors the stream and
//! surfaces exactly one gap record.

use crate::chunk::{DataType, SampleChunk};

/// What feeding one chunk into the assembler can produce
#[derive(Debug, Clone, PartialEq)]
pub enum WindowOutput {
    /// A completed window, ready for feature extraction
    Window(WindowData),
    /// Samples were lost upstream; the stream re-anchored after the hole
    Gap { length_ns: i64 },
    /// Chunk arrived behind the watermark and was side-lined
    Late { chunk_seq: u64, behind_ns: i64 },
}

/// The samples of one completed window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowData {
    pub session_id: String,
    pub data_type: DataType,
    pub sampling_rate_hz: u32,
    pub window_start_ns: i64,
    pub window_end_ns: i64,
    /// (channel id, samples) rows covering exactly the window
    pub channels: Vec<(u32, Vec<f32>)>,
    /// Inclusive chunk_seq range the window drew from
    pub chunk_range: (u64, u64),
}

/// Tumbling-window assembler for one session
#[derive(Debug)]
pub struct WindowAssembler {
    session_id: String,
    window_ns: i64,
    allowed_lateness_ns: i64,

    /// Sample-stream anchor; window k spans
    /// `[anchor + k·W, anchor + (k+1)·W)`
    anchor_ns: Option<i64>,
    samples_per_window: usize,
    emitted_windows: u64,
    channel_ids: Vec<u32>,
    pending: Vec<Vec<f32>>,
    pending_first_chunk: u64,
    last_chunk: u64,

    expected_seq: Option<u64>,
    max_event_ts_ns: i64,
}

impl WindowAssembler {
    pub fn new(session_id: impl Into<String>, window_ns: i64, allowed_lateness_ns: i64) -> Self {
        Self {
            session_id: session_id.into(),
            window_ns: window_ns.max(1),
            allowed_lateness_ns,
            anchor_ns: None,
            samples_per_window: 0,
            emitted_windows: 0,
            channel_ids: Vec::new(),
            pending: Vec::new(),
            pending_first_chunk: 0,
            last_chunk: 0,
            expected_seq: None,
            max_event_ts_ns: i64::MIN,
        }
    }

    /// Watermark: max observed event time minus the allowed lateness
    pub fn watermark_ns(&self) -> i64 {
        if self.max_event_ts_ns == i64::MIN {
            i64::MIN
        } else {
            self.max_event_ts_ns - self.allowed_lateness_ns
        }
    }

    pub fn emitted_windows(&self) -> u64 {
        self.emitted_windows
    }

    /// Feed the next chunk; returns everything it completed or triggered
    pub fn push(&mut self, chunk: &SampleChunk) -> Vec<WindowOutput> {
        let mut out = Vec::new();

        // Late check against the pre-update watermark: a chunk that ends
        // at or before it can only describe windows already closed
        let watermark = self.watermark_ns();
        if chunk.end_ts_ns() <= watermark {
            out.push(WindowOutput::Late {
                chunk_seq: chunk.chunk_seq,
                behind_ns: watermark - chunk.end_ts_ns(),
            });
            return out;
        }
        self.max_event_ts_ns = self.max_event_ts_ns.max(chunk.end_ts_ns());

        // Sequence continuity; a hole re-anchors the stream
        if let Some(expected) = self.expected_seq {
            if chunk.chunk_seq < expected {
                // Redelivery of an already-consumed chunk
                out.push(WindowOutput::Late {
                    chunk_seq: chunk.chunk_seq,
                    behind_ns: 0,
                });
                return out;
            }
            if chunk.chunk_seq > expected {
                let missing = chunk.chunk_seq - expected;
                let length_ns = missing as i64 * chunk.duration_ns();
                out.push(WindowOutput::Gap { length_ns });
                self.reanchor();
            }
        }
        self.expected_seq = Some(chunk.chunk_seq + 1);

        if self.anchor_ns.is_none() {
            self.anchor_ns = Some(chunk.device_ts_ns);
            self.samples_per_window = ((self.window_ns as i128
                * chunk.sampling_rate_hz as i128)
                / 1_000_000_000) as usize;
            self.channel_ids = chunk.channels.iter().map(|c| c.id).collect();
            self.pending = vec![Vec::new(); chunk.channel_count()];
            self.pending_first_chunk = chunk.chunk_seq;
        }
        if self.samples_per_window == 0 || self.pending.is_empty() {
            // Window shorter than one sample period, or a chunk with no
            // channels; nothing to emit
            return out;
        }
        if self.pending.len() != chunk.channel_count() {
            // Shape is enforced upstream; drop defensively mismatched data
            return out;
        }

        for (row, data) in self.pending.iter_mut().zip(&chunk.samples) {
            row.extend_from_slice(data);
        }
        self.last_chunk = chunk.chunk_seq;

        // Cut every full window now buffered
        while self.pending[0].len() >= self.samples_per_window {
            let anchor = self.anchor_ns.expect("anchored above");
            let start = anchor + self.emitted_windows as i64 * self.window_ns;
            let channels = self
                .channel_ids
                .iter()
                .zip(self.pending.iter_mut())
                .map(|(&id, row)| {
                    let samples: Vec<f32> = row.drain(..self.samples_per_window).collect();
                    (id, samples)
                })
                .collect();
            out.push(WindowOutput::Window(WindowData {
                session_id: self.session_id.clone(),
                data_type: chunk.data_type,
                sampling_rate_hz: chunk.sampling_rate_hz,
                window_start_ns: start,
                window_end_ns: start + self.window_ns,
                channels,
                chunk_range: (self.pending_first_chunk, self.last_chunk),
            }));
            self.emitted_windows += 1;
            self.pending_first_chunk = self.last_chunk;
        }
        out
    }

    /// Drop the partial window and re-anchor at the next chunk
    fn reanchor(&mut self) {
        self.anchor_ns = None;
        for row in &mut self.pending {
            row.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::test_chunk;

    const W: i64 = 50_000_000; // 50 ms

    fn chunk(seq: u64, samples: usize) -> SampleChunk {
        let mut c = test_chunk(4, samples);
        c.chunk_seq = seq;
        // 1 kHz: one sample per millisecond
        c.device_ts_ns = 1_000_000_000_000 + seq as i64 * samples as i64 * 1_000_000;
        c
    }

    fn windows(outputs: &[WindowOutput]) -> Vec<&WindowData> {
        outputs
            .iter()
            .filter_map(|o| match o {
                WindowOutput::Window(w) => Some(w),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_gap_free_stream_emits_floor_d_over_w() {
        // 10 s at 1 kHz in 50-sample chunks: exactly 200 windows
        let mut assembler = WindowAssembler::new("s", W, 2 * W);
        let mut emitted = 0;
        for seq in 0..200 {
            let outputs = assembler.push(&chunk(seq, 50));
            emitted += windows(&outputs).len();
            assert!(outputs
                .iter()
                .all(|o| matches!(o, WindowOutput::Window(_))));
        }
        assert_eq!(emitted, 200);
        assert_eq!(assembler.emitted_windows(), 200);
    }

    #[test]
    fn test_windows_are_ordered_and_contiguous() {
        let mut assembler = WindowAssembler::new("s", W, 2 * W);
        let mut starts = Vec::new();
        for seq in 0..40 {
            for output in assembler.push(&chunk(seq, 30)) {
                if let WindowOutput::Window(w) = output {
                    assert_eq!(w.window_end_ns - w.window_start_ns, W);
                    assert_eq!(w.channels.len(), 4);
                    assert_eq!(w.channels[0].1.len(), 50);
                    starts.push(w.window_start_ns);
                }
            }
        }
        // 40 chunks x 30 samples = 1200 samples = 24 windows
        assert_eq!(starts.len(), 24);
        for pair in starts.windows(2) {
            assert_eq!(pair[1] - pair[0], W);
        }
    }

    #[test]
    fn test_chunks_smaller_and_larger_than_window() {
        let mut assembler = WindowAssembler::new("s", W, 2 * W);
        // One 130-sample chunk: two full windows, 30 samples pending
        let outputs = assembler.push(&chunk(0, 130));
        assert_eq!(windows(&outputs).len(), 2);
        // 20 more samples complete the third window
        let outputs = assembler.push(&chunk(1, 20));
        assert_eq!(windows(&outputs).len(), 1);
    }

    #[test]
    fn test_gap_emits_single_anomaly_and_reanchors() {
        let mut assembler = WindowAssembler::new("s", W, 2 * W);
        for seq in 0..4 {
            assembler.push(&chunk(seq, 50));
        }
        // Skip chunks 4..9: a 250 ms hole
        let outputs = assembler.push(&chunk(9, 50));
        let gaps: Vec<_> = outputs
            .iter()
            .filter(|o| matches!(o, WindowOutput::Gap { .. }))
            .collect();
        assert_eq!(gaps.len(), 1);
        match gaps[0] {
            WindowOutput::Gap { length_ns } => assert_eq!(*length_ns, 5 * 50_000_000),
            _ => unreachable!(),
        }
        // The stream continues and still windows correctly
        let mut emitted = windows(&outputs).len();
        for seq in 10..14 {
            emitted += windows(&assembler.push(&chunk(seq, 50))).len();
        }
        assert_eq!(emitted, 5);
        // No second gap record for the same hole
        let outputs = assembler.push(&chunk(14, 50));
        assert!(outputs
            .iter()
            .all(|o| !matches!(o, WindowOutput::Gap { .. })));
    }

    #[test]
    fn test_late_chunk_sidelined() {
        let mut assembler = WindowAssembler::new("s", W, 2 * W);
        for seq in 0..10 {
            assembler.push(&chunk(seq, 50));
        }
        // A chunk 2.5 W behind the watermark
        let mut late = chunk(3, 50);
        late.device_ts_ns = assembler.watermark_ns() - (2 * W + W / 2);
        let outputs = assembler.push(&late);
        assert_eq!(outputs.len(), 1);
        match &outputs[0] {
            WindowOutput::Late { chunk_seq, behind_ns } => {
                assert_eq!(*chunk_seq, 3);
                assert!(*behind_ns > 0);
            }
            other => panic!("expected late, got {:?}", other),
        }
        // The original windows were not replaced
        assert_eq!(assembler.emitted_windows(), 10);
    }

    #[test]
    fn test_redelivered_chunk_not_reprocessed() {
        let mut assembler = WindowAssembler::new("s", W, 2 * W);
        assembler.push(&chunk(0, 50));
        assembler.push(&chunk(1, 50));
        let outputs = assembler.push(&chunk(1, 50));
        assert!(matches!(outputs[0], WindowOutput::Late { .. }));
        assert_eq!(assembler.emitted_windows(), 2);
    }

    #[test]
    fn test_watermark_advances_with_event_time() {
        let mut assembler = WindowAssembler::new("s", W, 2 * W);
        assert_eq!(assembler.watermark_ns(), i64::MIN);
        let c = chunk(0, 50);
        assembler.push(&c);
        assert_eq!(assembler.watermark_ns(), c.end_ts_ns() - 2 * W);
    }
}
