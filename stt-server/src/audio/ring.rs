use std::collections::VecDeque;

/// Bounded PCM16 ring buffer with absolute-sample addressing.
///
/// Holds the most recent `max_samples` of signed 16-bit mono audio. Two
/// marks are tracked: `cursor`, the absolute index of the next sample to be
/// written, and `committed`, the boundary of the last finalized utterance.
/// Reads never cross below `committed`: once an utterance has been
/// delivered as a final, its audio is no longer addressable.
pub struct PcmRing {
    sample_rate: u32,
    max_samples: u64,
    samples: VecDeque<i16>,
    cursor: u64,
    committed: u64,
}

impl PcmRing {
    pub fn new(sample_rate: u32, max_seconds: u32) -> Self {
        let max_samples = sample_rate as u64 * max_seconds as u64;
        Self {
            sample_rate,
            max_samples,
            samples: VecDeque::with_capacity(max_samples as usize),
            cursor: 0,
            committed: 0,
        }
    }

    /// Absolute index of the next write.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seconds of audio currently addressable.
    pub fn buffered_seconds(&self) -> f64 {
        (self.cursor - self.window_start()) as f64 / self.sample_rate as f64
    }

    /// Append little-endian PCM16 bytes. `raw` must have even length (the
    /// session validates chunk framing before calling). Returns the number
    /// of samples written. Oldest samples are evicted past capacity.
    pub fn append(&mut self, raw: &[u8]) -> usize {
        debug_assert!(raw.len() % 2 == 0, "PCM16 chunk must be an even byte count");
        // Byte slices from the transport are not guaranteed 2-byte aligned,
        // so the cast can fail even for valid chunks.
        match bytemuck::try_cast_slice::<u8, i16>(raw) {
            Ok(slice) => {
                self.samples.extend(slice.iter().map(|s| i16::from_le(*s)));
            }
            Err(_) => {
                self.samples.extend(
                    raw.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])),
                );
            }
        }
        let n = raw.len() / 2;
        self.cursor += n as u64;
        while self.samples.len() as u64 > self.max_samples {
            self.samples.pop_front();
        }
        n
    }

    /// Mark everything up to `abs_sample` as finalized.
    pub fn commit(&mut self, abs_sample: u64) {
        debug_assert!(abs_sample <= self.cursor);
        self.committed = self.committed.max(abs_sample.min(self.cursor));
    }

    /// Start of the addressable window: capacity eviction or the commit
    /// mark, whichever is later.
    fn window_start(&self) -> u64 {
        self.cursor.saturating_sub(self.max_samples).max(self.committed)
    }

    /// Last `seconds` of audio, normalized to f32 in [-1, 1]. Clamped to the
    /// addressable window; `None` when the range is empty.
    pub fn tail_f32(&self, seconds: f64) -> Option<Vec<f32>> {
        let want = (seconds * self.sample_rate as f64) as u64;
        let start = self.cursor.saturating_sub(want).max(self.window_start());
        self.range_f32(start, self.cursor)
    }

    /// Audio with absolute index in `[start_abs, cursor)`, clamped to the
    /// addressable window.
    pub fn since_f32(&self, start_abs: u64) -> Option<Vec<f32>> {
        let start = start_abs.max(self.window_start());
        self.range_f32(start, self.cursor)
    }

    fn range_f32(&self, start: u64, end: u64) -> Option<Vec<f32>> {
        if start >= end {
            return None;
        }
        // Map absolute indices onto the deque. The deque's front sample has
        // absolute index cursor - len.
        let base = self.cursor - self.samples.len() as u64;
        let lo = (start - base) as usize;
        let hi = (end - base) as usize;
        let out: Vec<f32> = self
            .samples
            .iter()
            .skip(lo)
            .take(hi - lo)
            .map(|&s| s as f32 / 32768.0)
            .collect();
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}
