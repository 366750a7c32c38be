//! Interim emission filter.
//!
//! Interim decodes of overlapping tail windows mostly produce the same
//! text, and clients flicker if every revision hits the wire. Unchanged
//! text is never re-sent; a changed interim passes only when it changed
//! meaningfully (length delta of at least [`MIN_LENGTH_DELTA`] chars) or
//! when enough time has passed that a small revision is still worth
//! sending. Alongside the decision it
//! reports how many leading chars are unchanged, so clients can render the
//! stable prefix without re-layout.

const MIN_LENGTH_DELTA: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitDecision {
    /// Length of the common prefix with the previously emitted text.
    pub stable_chars: usize,
}

#[derive(Default)]
pub struct EmitGate {
    last_text: String,
    last_emit_ms: Option<u64>,
}

impl EmitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `new_text` goes out. On emit, the gate records the
    /// text and timestamp; on suppression nothing changes.
    pub fn check(&mut self, new_text: &str, now_ms: u64, interim_min_ms: u64) -> Option<EmitDecision> {
        if new_text.is_empty() {
            return None;
        }
        // Byte-identical revisions never go out, elapsed time or not.
        if new_text == self.last_text {
            return None;
        }
        let emit = if self.last_text.is_empty() {
            true
        } else {
            let prev_len = self.last_text.chars().count();
            let new_len = new_text.chars().count();
            let delta = prev_len.abs_diff(new_len);
            let elapsed = self
                .last_emit_ms
                .map(|last| now_ms.saturating_sub(last))
                .unwrap_or(u64::MAX);
            delta >= MIN_LENGTH_DELTA || elapsed >= interim_min_ms
        };
        if !emit {
            return None;
        }
        let stable_chars = common_prefix_chars(&self.last_text, new_text);
        self.last_text = new_text.to_string();
        self.last_emit_ms = Some(now_ms);
        Some(EmitDecision { stable_chars })
    }

    /// Clear state after a final so the next utterance starts fresh.
    pub fn reset(&mut self) {
        self.last_text.clear();
        self.last_emit_ms = None;
    }
}

fn common_prefix_chars(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}
