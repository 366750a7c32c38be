use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process counters and gauges, rendered as Prometheus text exposition on
/// `GET /metrics`. Plain atomics keep the hot paths (ingest, dispatch)
/// free of locks; gauges are overwritten by the 1 Hz backpressure poll.
#[derive(Default)]
pub struct Metrics {
    // Connections
    pub connections_total: AtomicU64,
    pub connections_active: AtomicI64,

    // Jobs
    pub jobs_enqueued_interim: AtomicU64,
    pub jobs_enqueued_final: AtomicU64,
    pub jobs_coalesced: AtomicU64,
    pub interims_rejected: AtomicU64,
    pub finals_rejected: AtomicU64,
    pub jobs_ok_interim: AtomicU64,
    pub jobs_ok_final: AtomicU64,
    pub jobs_err_interim: AtomicU64,
    pub jobs_err_final: AtomicU64,

    // Emission
    pub interims_emitted: AtomicU64,
    pub interims_suppressed: AtomicU64,
    pub interims_stale_dropped: AtomicU64,

    // Latency totals (pair with the job counters for averages)
    pub decode_ms_interim: AtomicU64,
    pub decode_ms_final: AtomicU64,
    pub queue_wait_ms_interim: AtomicU64,
    pub queue_wait_ms_final: AtomicU64,

    // Ingest
    pub audio_bytes_total: AtomicU64,

    // Gauges (refreshed by the backpressure poll)
    pub queue_depth_final: AtomicU64,
    pub queue_depth_interim: AtomicU64,
    pub backpressure_level: AtomicU64,
    pub cooldown_ms: AtomicU64,
    pub tail_ms: AtomicU64,
    pub interims_paused: AtomicU64,
}

struct Exposition {
    out: String,
}

impl Exposition {
    fn new() -> Self {
        Self { out: String::with_capacity(4096) }
    }

    fn family(&mut self, name: &str, kind: &str, help: &str, samples: &[(&str, i64)]) {
        let _ = writeln!(self.out, "# HELP {name} {help}");
        let _ = writeln!(self.out, "# TYPE {name} {kind}");
        for (labels, value) in samples {
            let _ = writeln!(self.out, "{name}{labels} {value}");
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prometheus text format.
    pub fn render(&self) -> String {
        let u = |a: &AtomicU64| a.load(Ordering::Relaxed) as i64;
        let mut exp = Exposition::new();

        exp.family(
            "stt_connections_total",
            "counter",
            "Total WebSocket connections accepted",
            &[("", u(&self.connections_total))],
        );
        exp.family(
            "stt_active_connections",
            "gauge",
            "Live WebSocket connections",
            &[("", self.connections_active.load(Ordering::Relaxed))],
        );
        exp.family(
            "stt_jobs_enqueued_total",
            "counter",
            "Jobs accepted by the scheduler",
            &[
                ("{kind=\"interim\"}", u(&self.jobs_enqueued_interim)),
                ("{kind=\"final\"}", u(&self.jobs_enqueued_final)),
            ],
        );
        exp.family(
            "stt_jobs_processed_total",
            "counter",
            "Jobs completed by the decode workers",
            &[
                ("{kind=\"interim\",status=\"ok\"}", u(&self.jobs_ok_interim)),
                ("{kind=\"interim\",status=\"error\"}", u(&self.jobs_err_interim)),
                ("{kind=\"final\",status=\"ok\"}", u(&self.jobs_ok_final)),
                ("{kind=\"final\",status=\"error\"}", u(&self.jobs_err_final)),
            ],
        );
        exp.family(
            "stt_jobs_coalesced_total",
            "counter",
            "Interim jobs replaced in the coalescing queue",
            &[("", u(&self.jobs_coalesced))],
        );
        exp.family(
            "stt_interims_rejected_total",
            "counter",
            "Interim enqueues skipped by throttle, inflight gate or pause",
            &[("", u(&self.interims_rejected))],
        );
        exp.family(
            "stt_finals_rejected_total",
            "counter",
            "Final enqueues rejected by the bounded final queue",
            &[("", u(&self.finals_rejected))],
        );
        exp.family(
            "stt_interims_emitted_total",
            "counter",
            "Interim frames that passed the emit gate",
            &[("", u(&self.interims_emitted))],
        );
        exp.family(
            "stt_interims_suppressed_total",
            "counter",
            "Interim results dropped by the emit gate",
            &[("", u(&self.interims_suppressed))],
        );
        exp.family(
            "stt_interims_stale_dropped_total",
            "counter",
            "Interim results discarded for arriving after a newer final",
            &[("", u(&self.interims_stale_dropped))],
        );
        exp.family(
            "stt_decode_ms_total",
            "counter",
            "Cumulative decode wall time in milliseconds",
            &[
                ("{kind=\"interim\"}", u(&self.decode_ms_interim)),
                ("{kind=\"final\"}", u(&self.decode_ms_final)),
            ],
        );
        exp.family(
            "stt_queue_wait_ms_total",
            "counter",
            "Cumulative enqueue-to-decode wait in milliseconds",
            &[
                ("{kind=\"interim\"}", u(&self.queue_wait_ms_interim)),
                ("{kind=\"final\"}", u(&self.queue_wait_ms_final)),
            ],
        );
        exp.family(
            "stt_audio_bytes_total",
            "counter",
            "PCM16 bytes ingested",
            &[("", u(&self.audio_bytes_total))],
        );
        exp.family(
            "stt_queue_depth",
            "gauge",
            "Current scheduler queue depth",
            &[
                ("{queue=\"final\"}", u(&self.queue_depth_final)),
                ("{queue=\"interim\"}", u(&self.queue_depth_interim)),
            ],
        );
        exp.family(
            "stt_backpressure_level",
            "gauge",
            "0=normal 1=high 2=critical",
            &[("", u(&self.backpressure_level))],
        );
        exp.family(
            "stt_interim_cooldown_ms",
            "gauge",
            "Current interim cooldown",
            &[("", u(&self.cooldown_ms))],
        );
        exp.family(
            "stt_tail_window_ms",
            "gauge",
            "Current interim tail window",
            &[("", u(&self.tail_ms))],
        );
        exp.family(
            "stt_interims_paused",
            "gauge",
            "1 when interims are paused",
            &[("", u(&self.interims_paused))],
        );
        exp.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_groups_samples_under_one_family_header() {
        let m = Metrics::new();
        m.connections_total.fetch_add(3, Ordering::Relaxed);
        m.jobs_enqueued_interim.fetch_add(7, Ordering::Relaxed);
        m.queue_depth_final.store(2, Ordering::Relaxed);
        let text = m.render();
        assert!(text.contains("stt_connections_total 3"));
        assert!(text.contains("stt_jobs_enqueued_total{kind=\"interim\"} 7"));
        assert!(text.contains("stt_queue_depth{queue=\"final\"} 2"));
        // TYPE lines carry the bare family name.
        assert!(text.contains("# TYPE stt_queue_depth gauge"));
        assert!(!text.contains("# TYPE stt_queue_depth{"));
    }
}
