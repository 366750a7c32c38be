use rand::Rng;

/// Per-connection interim rate limiter.
///
/// Each connection gets a stable random jitter in [-30, +30] ms on top of
/// the base cooldown so that clients whose chunk cadence happens to line up
/// do not enqueue interims in lockstep. The backpressure controller's
/// current cooldown acts as a floor that can only lengthen the wait.
pub struct InterimThrottle {
    effective_base_ms: u64,
    last_enqueue_ms: Option<u64>,
}

const JITTER_RANGE_MS: i64 = 30;

impl InterimThrottle {
    pub fn new(base_cooldown_ms: u64) -> Self {
        let jitter = rand::thread_rng().gen_range(-JITTER_RANGE_MS..=JITTER_RANGE_MS);
        let effective_base_ms = (base_cooldown_ms as i64 + jitter).max(0) as u64;
        Self { effective_base_ms, last_enqueue_ms: None }
    }

    #[cfg(test)]
    fn with_jitter(base_cooldown_ms: u64, jitter_ms: i64) -> Self {
        Self {
            effective_base_ms: (base_cooldown_ms as i64 + jitter_ms).max(0) as u64,
            last_enqueue_ms: None,
        }
    }

    pub fn should_allow(&self, now_ms: u64, current_cooldown_ms: u64) -> bool {
        let Some(last) = self.last_enqueue_ms else {
            return true;
        };
        let cooldown = self.effective_base_ms.max(current_cooldown_ms);
        now_ms.saturating_sub(last) >= cooldown
    }

    /// Record a successful enqueue. Skipped attempts do not push the window
    /// out.
    pub fn mark_enqueued(&mut self, now_ms: u64) {
        self.last_enqueue_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_always_allowed() {
        let t = InterimThrottle::with_jitter(220, 0);
        assert!(t.should_allow(0, 220));
    }

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let mut t = InterimThrottle::with_jitter(220, 0);
        t.mark_enqueued(1_000);
        assert!(!t.should_allow(1_100, 220));
        assert!(!t.should_allow(1_219, 220));
        assert!(t.should_allow(1_220, 220));
    }

    #[test]
    fn backpressure_cooldown_extends_the_wait() {
        let mut t = InterimThrottle::with_jitter(220, 0);
        t.mark_enqueued(1_000);
        // Base would allow at 1220, but the controller floor wins.
        assert!(!t.should_allow(1_300, 470));
        assert!(t.should_allow(1_470, 470));
    }

    #[test]
    fn jitter_shifts_the_effective_base() {
        let mut early = InterimThrottle::with_jitter(220, -30);
        let mut late = InterimThrottle::with_jitter(220, 30);
        early.mark_enqueued(0);
        late.mark_enqueued(0);
        assert!(early.should_allow(190, 0));
        assert!(!late.should_allow(240, 0));
        assert!(late.should_allow(250, 0));
    }

    #[test]
    fn failed_attempts_do_not_reset_the_window() {
        let mut t = InterimThrottle::with_jitter(220, 0);
        t.mark_enqueued(1_000);
        // Probing repeatedly must not move the deadline.
        for now in (1_010..1_200).step_by(10) {
            assert!(!t.should_allow(now, 220));
        }
        assert!(t.should_allow(1_220, 220));
    }
}
