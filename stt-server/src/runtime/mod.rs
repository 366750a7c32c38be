// src/runtime/mod.rs
pub mod backpressure;
pub mod dispatch;
pub mod emit;
pub mod state;
pub mod throttle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use crossbeam::channel::bounded;
use log::info;
use once_cell::sync::Lazy;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::asr::decoder::Decoder;
use crate::asr::worker::spawn_worker;
use crate::audio::{EnergyClassifier, PcmRing, VadGate};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::scheduler::job::JobKind;
use crate::scheduler::priority::Scheduler;
use backpressure::{BackpressureController, BackpressureState};
use state::{Connection, ConnectionRegistry};
use throttle::InterimThrottle;

/// Capacity of each per-connection outgoing frame queue.
pub const OUTGOING_QUEUE_CAPACITY: usize = 64;

static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since process start. All cooldown and emit-gate
/// arithmetic uses this clock.
pub fn now_ms() -> u64 {
    PROCESS_EPOCH.elapsed().as_millis() as u64
}

/// Everything the server shares: configuration, the connection registry,
/// the scheduler, metrics and the backpressure feed. Constructed once at
/// startup and passed explicitly; there is no global mutable state.
pub struct Runtime {
    pub config: Config,
    pub registry: Arc<ConnectionRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub metrics: Arc<Metrics>,
    backpressure: watch::Receiver<BackpressureState>,
    pub started_at: DateTime<Utc>,
    interim_warm: Arc<AtomicBool>,
    final_warm: Arc<AtomicBool>,
    cancel: CancellationToken,
    interim_model: String,
    final_model: String,
}

impl Runtime {
    /// Wire up queues, workers and background tasks. Must run inside a
    /// tokio runtime. Decoder construction happens before this call so a
    /// model that fails to load aborts startup.
    pub fn start(
        config: Config,
        interim_decoder: Box<dyn Decoder>,
        final_decoder: Box<dyn Decoder>,
    ) -> anyhow::Result<Arc<Self>> {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let interim_model = interim_decoder.name().to_string();
        let final_model = final_decoder.name().to_string();

        let controller = BackpressureController::new(&config);
        let (bp_tx, bp_rx) = watch::channel(controller.initial_state());

        // Worker channel capacity matches the per-tick burst: the scheduler
        // stops serving a kind once its channel fills.
        let (final_tx, final_jobs) = bounded(config.final_burst.max(1));
        let (interim_tx, interim_jobs) = bounded(config.interim_burst.max(1));

        let scheduler = Arc::new(Scheduler::new(
            config.final_crit,
            final_tx,
            interim_tx,
            bp_rx.clone(),
            config.scheduler_tick_ms,
            metrics.clone(),
        ));

        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
        let interim_warm = Arc::new(AtomicBool::new(false));
        let final_warm = Arc::new(AtomicBool::new(false));

        // The worker threads exit on their own once the job channels
        // disconnect at shutdown.
        let _ = spawn_worker(
            JobKind::Interim,
            interim_decoder,
            interim_jobs,
            event_tx.clone(),
            interim_warm.clone(),
        )
        .context("spawning interim decode worker")?;
        let _ = spawn_worker(
            JobKind::Final,
            final_decoder,
            final_jobs,
            event_tx,
            final_warm.clone(),
        )
        .context("spawning final decode worker")?;

        let cancel = CancellationToken::new();
        tokio::spawn(scheduler.clone().run(cancel.child_token()));
        tokio::spawn(dispatch::run(
            event_rx,
            registry.clone(),
            metrics.clone(),
            config.interim_min_ms,
            cancel.child_token(),
        ));
        tokio::spawn(controller.run(
            bp_tx,
            scheduler.clone(),
            registry.clone(),
            metrics.clone(),
            cancel.child_token(),
        ));

        info!(
            "runtime started: interim model `{}`, final model `{}`, tick {} ms",
            interim_model, final_model, config.scheduler_tick_ms
        );

        Ok(Arc::new(Self {
            config,
            registry,
            scheduler,
            metrics,
            backpressure: bp_rx,
            started_at: Utc::now(),
            interim_warm,
            final_warm,
            cancel,
            interim_model,
            final_model,
        }))
    }

    /// Current backpressure snapshot (lock-free read).
    pub fn backpressure(&self) -> BackpressureState {
        self.backpressure.borrow().clone()
    }

    /// Both model handles have completed their warmup decode.
    pub fn is_ready(&self) -> bool {
        self.interim_warm.load(Ordering::Acquire) && self.final_warm.load(Ordering::Acquire)
    }

    pub fn model_names(&self) -> (&str, &str) {
        (&self.interim_model, &self.final_model)
    }

    /// Create and register a connection with its own ring, VAD and
    /// throttle.
    pub fn open_connection(&self, language: String) -> Arc<Connection> {
        let conn_id = Uuid::new_v4();
        let classifier = Box::new(EnergyClassifier::new(self.config.vad_mode));
        let conn = Arc::new(Connection::new(
            conn_id,
            language,
            self.config.sample_rate,
            PcmRing::new(self.config.sample_rate, self.config.ring_buffer_seconds),
            VadGate::new(
                classifier,
                self.config.sample_rate,
                self.config.vad_start_speech_ms,
                self.config.vad_end_silence_ms,
            ),
            InterimThrottle::new(self.config.interim_cooldown_ms),
            OUTGOING_QUEUE_CAPACITY,
        ));
        self.registry.register(conn.clone());
        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
        self.metrics.connections_active.fetch_add(1, Ordering::Relaxed);
        conn
    }

    /// Tear down a connection. In-flight jobs keep decoding; their results
    /// miss the registry and are dropped.
    pub fn close_connection(&self, conn: &Arc<Connection>) {
        conn.close();
        if self.registry.unregister(&conn.conn_id).is_some() {
            self.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
        }
        self.scheduler.forget_connection(&conn.conn_id);
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
