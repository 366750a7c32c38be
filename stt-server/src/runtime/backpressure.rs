//! Watermark-driven backpressure.
//!
//! A 1 Hz poll turns scheduler queue depths into a small state record:
//! backpressure level, current interim cooldown, current tail window, the
//! interim burst allowance and whether interims are paused outright. The
//! record is published through a `tokio::sync::watch` channel so the ingest
//! path and the scheduler read it without taking a lock. Finals keep their
//! full burst at every level; only interims are throttled.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::runtime::state::ConnectionRegistry;
use crate::scheduler::priority::Scheduler;
use crate::server::messages::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureLevel {
    Normal,
    High,
    Critical,
}

impl BackpressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressureLevel::Normal => "normal",
            BackpressureLevel::High => "high",
            BackpressureLevel::Critical => "critical",
        }
    }
}

/// Snapshot read lock-free by the session and scheduler paths.
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressureState {
    pub level: BackpressureLevel,
    pub cooldown_ms: u64,
    pub tail_seconds: f64,
    pub interims_paused: bool,
    pub interim_burst: usize,
    pub final_burst: usize,
}

/// Watermark configuration plus the base knobs the levels scale from.
pub struct BackpressureController {
    final_hi: usize,
    final_crit: usize,
    interim_hi: usize,
    interim_crit: usize,
    base_cooldown_ms: u64,
    base_tail_seconds: f64,
    base_interim_burst: usize,
    final_burst: usize,
}

impl BackpressureController {
    pub fn new(config: &Config) -> Self {
        Self {
            final_hi: config.final_hi,
            final_crit: config.final_crit,
            interim_hi: config.interim_hi,
            interim_crit: config.interim_crit,
            base_cooldown_ms: config.interim_cooldown_ms,
            base_tail_seconds: config.tail_seconds,
            base_interim_burst: config.interim_burst,
            final_burst: config.final_burst,
        }
    }

    /// Initial (unloaded) state for the watch channel.
    pub fn initial_state(&self) -> BackpressureState {
        self.evaluate(0, 0)
    }

    /// Pure watermark table: queue depths in, full knob record out.
    pub fn evaluate(&self, final_len: usize, interim_len: usize) -> BackpressureState {
        let level = if final_len >= self.final_crit || interim_len >= self.interim_crit {
            BackpressureLevel::Critical
        } else if final_len >= self.final_hi || interim_len >= self.interim_hi {
            BackpressureLevel::High
        } else {
            BackpressureLevel::Normal
        };

        let (cooldown_ms, tail_seconds, interims_paused, interim_burst) = match level {
            BackpressureLevel::Normal => (
                self.base_cooldown_ms,
                self.base_tail_seconds,
                false,
                self.base_interim_burst,
            ),
            BackpressureLevel::High => (
                self.base_cooldown_ms + 150,
                (self.base_tail_seconds * 0.5).max(3.0),
                final_len >= self.final_hi,
                (self.base_interim_burst / 2).max(1),
            ),
            BackpressureLevel::Critical => (
                self.base_cooldown_ms + 250,
                (self.base_tail_seconds * 0.25).max(1.5),
                final_len >= self.final_crit,
                (self.base_interim_burst / 3).max(1),
            ),
        };

        BackpressureState {
            level,
            cooldown_ms,
            tail_seconds,
            interims_paused,
            interim_burst,
            final_burst: self.final_burst,
        }
    }

    /// Poll loop: re-evaluate every second, publish on change, broadcast a
    /// status frame to every live connection when the level moves.
    pub async fn run(
        self,
        tx: watch::Sender<BackpressureState>,
        scheduler: Arc<Scheduler>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) {
        let mut last = tx.borrow().clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }

            let (final_len, interim_len) = scheduler.depths();
            let state = self.evaluate(final_len, interim_len);

            metrics.queue_depth_final.store(final_len as u64, Ordering::Relaxed);
            metrics
                .queue_depth_interim
                .store(interim_len as u64, Ordering::Relaxed);
            metrics
                .backpressure_level
                .store(state.level as u64, Ordering::Relaxed);
            metrics.cooldown_ms.store(state.cooldown_ms, Ordering::Relaxed);
            metrics
                .tail_ms
                .store((state.tail_seconds * 1000.0) as u64, Ordering::Relaxed);
            metrics
                .interims_paused
                .store(state.interims_paused as u64, Ordering::Relaxed);

            if state == last {
                continue;
            }
            if state.level != last.level {
                warn!(
                    "backpressure {} -> {} (q_final={}, q_interim={})",
                    last.level.as_str(),
                    state.level.as_str(),
                    final_len,
                    interim_len
                );
                registry.broadcast(ServerMessage::status(&state));
            } else {
                debug!(
                    "backpressure knobs changed within level {}: cooldown={}ms tail={:.2}s",
                    state.level.as_str(),
                    state.cooldown_ms,
                    state.tail_seconds
                );
            }
            last = state.clone();
            // Receivers only see the newest value; a failed send just means
            // shutdown already dropped them.
            let _ = tx.send(state);
        }
        debug!("backpressure controller stopped");
    }
}
