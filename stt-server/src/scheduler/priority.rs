//! Finals-first dispatch loop.
//!
//! The scheduler owns both job queues and runs a fixed-tick loop: each tick
//! serves up to `final_burst` finals, and only when the final queue has
//! drained does it serve up to the backpressure-scaled interim burst. Served
//! jobs go to the per-model worker channels; a full channel ends the burst
//! early and the job stays queued for the next tick, so the loop itself
//! never blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Sender, TrySendError};
use log::debug;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::runtime::backpressure::BackpressureState;
use crate::scheduler::job::{Job, JobKind};
use crate::scheduler::queue::{CoalescingInterimQueue, FinalQueue};

struct Queues {
    finals: FinalQueue,
    interims: CoalescingInterimQueue,
}

/// Outcome of an interim enqueue.
#[derive(Debug, PartialEq, Eq)]
pub enum InterimEnqueue {
    Fresh(u64),
    /// The connection already had a pending interim; it was replaced.
    Coalesced(u64),
}

impl InterimEnqueue {
    pub fn seq(&self) -> u64 {
        match self {
            InterimEnqueue::Fresh(s) | InterimEnqueue::Coalesced(s) => *s,
        }
    }
}

pub struct Scheduler {
    queues: Mutex<Queues>,
    seq: AtomicU64,
    final_tx: Sender<Job>,
    interim_tx: Sender<Job>,
    backpressure: watch::Receiver<BackpressureState>,
    tick: Duration,
    metrics: Arc<Metrics>,
}

impl Scheduler {
    pub fn new(
        final_queue_capacity: usize,
        final_tx: Sender<Job>,
        interim_tx: Sender<Job>,
        backpressure: watch::Receiver<BackpressureState>,
        tick_ms: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            queues: Mutex::new(Queues {
                finals: FinalQueue::new(final_queue_capacity),
                interims: CoalescingInterimQueue::new(),
            }),
            seq: AtomicU64::new(1),
            final_tx,
            interim_tx,
            backpressure,
            tick: Duration::from_millis(tick_ms),
            metrics,
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a final. Rejected when the bounded final queue is full; the
    /// session surfaces that to the client.
    pub fn enqueue_final(
        &self,
        conn_id: Uuid,
        audio: Vec<f32>,
        language: String,
        t0: f64,
        t1: f64,
    ) -> Result<u64, ()> {
        let seq = self.next_seq();
        let job = Job::new(JobKind::Final, conn_id, audio, language, seq, t0, t1);
        let mut q = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        match q.finals.push(job) {
            Ok(()) => {
                self.metrics.jobs_enqueued_final.fetch_add(1, Ordering::Relaxed);
                Ok(seq)
            }
            Err(_) => {
                self.metrics.finals_rejected.fetch_add(1, Ordering::Relaxed);
                Err(())
            }
        }
    }

    /// Queue an interim snapshot, replacing any pending one for the same
    /// connection.
    pub fn enqueue_interim(
        &self,
        conn_id: Uuid,
        audio: Vec<f32>,
        language: String,
        t0: f64,
        t1: f64,
    ) -> InterimEnqueue {
        let seq = self.next_seq();
        let job = Job::new(JobKind::Interim, conn_id, audio, language, seq, t0, t1);
        let mut q = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        self.metrics.jobs_enqueued_interim.fetch_add(1, Ordering::Relaxed);
        match q.interims.put(job) {
            Some(_) => {
                self.metrics.jobs_coalesced.fetch_add(1, Ordering::Relaxed);
                InterimEnqueue::Coalesced(seq)
            }
            None => InterimEnqueue::Fresh(seq),
        }
    }

    /// Drop any pending interim for a closed connection.
    pub fn forget_connection(&self, conn_id: &Uuid) {
        let mut q = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        q.interims.remove(conn_id);
    }

    pub fn depths(&self) -> (usize, usize) {
        let q = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        (q.finals.len(), q.interims.len())
    }

    /// One scheduling round. Public so tests can drive ticks directly.
    pub fn tick(&self) {
        let bp = self.backpressure.borrow().clone();
        let mut q = self.queues.lock().unwrap_or_else(|e| e.into_inner());

        let mut served_finals = 0;
        while served_finals < bp.final_burst {
            if self.final_tx.is_full() {
                break;
            }
            let Some(job) = q.finals.pop() else { break };
            match self.final_tx.try_send(job) {
                Ok(()) => served_finals += 1,
                Err(TrySendError::Full(job)) => {
                    q.finals.push_front(job);
                    break;
                }
                Err(TrySendError::Disconnected(job)) => {
                    q.finals.push_front(job);
                    break;
                }
            }
        }

        // Interims only once finals have fully drained, and never while the
        // backpressure controller has paused them.
        if !q.finals.is_empty() || bp.interims_paused {
            return;
        }
        let mut served_interims = 0;
        while served_interims < bp.interim_burst {
            if self.interim_tx.is_full() {
                break;
            }
            let Some(job) = q.interims.pop_oldest() else { break };
            match self.interim_tx.try_send(job) {
                Ok(()) => served_interims += 1,
                Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                    q.interims.put(job);
                    break;
                }
            }
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        debug!("scheduler loop started, tick={:?}", self.tick);
        loop {
            self.tick();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.tick) => {}
            }
        }
        debug!("scheduler loop stopped");
    }
}
