//! Per-connection state and the process-wide connection registry.
//!
//! A [`Connection`] is shared between its session task (ingest, protocol)
//! and the decode-result dispatcher. The audio-side state lives behind one
//! short-held mutex; the flags the scheduler path needs are atomics so the
//! dispatcher never contends with ingest for them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use dashmap::DashMap;
use log::debug;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::audio::{PcmRing, VadGate};
use crate::runtime::emit::EmitGate;
use crate::runtime::throttle::InterimThrottle;
use crate::server::messages::ServerMessage;

/// Session phase machine: Idle -> Listening (speech started) ->
/// Processing (final enqueued) -> Idle (final delivered).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Listening,
    Processing,
}

/// Commit candidate recorded when a final is enqueued. Applied to the ring
/// when the final succeeds; on failure the previous mark is restored so the
/// same window is re-decoded. Finals resolve in FIFO order, so candidates
/// queue up alongside them.
#[derive(Debug, Clone, Copy)]
pub struct PendingCommit {
    pub previous: u64,
    pub next: u64,
}

/// Audio-side state, exclusively owned by the connection and guarded by
/// its mutex.
pub struct ConnInner {
    pub ring: PcmRing,
    pub vad: VadGate,
    pub throttle: InterimThrottle,
    pub emit: EmitGate,
    pub phase: Phase,
    pub last_commit_sample: u64,
    pub pending_commits: VecDeque<PendingCommit>,
}

pub struct Connection {
    pub conn_id: Uuid,
    pub language: String,
    pub sample_rate: u32,
    inner: Mutex<ConnInner>,
    pub outgoing: OutgoingQueue,
    /// True from interim enqueue until its result (or error) comes back.
    pub interim_inflight: AtomicBool,
    /// Sequence of the newest final enqueued for this connection; interim
    /// results older than this are stale and must not be emitted.
    pub last_final_seq: AtomicU64,
    closed: AtomicBool,
    pub created_at: Instant,
}

impl Connection {
    pub fn new(
        conn_id: Uuid,
        language: String,
        sample_rate: u32,
        ring: PcmRing,
        vad: VadGate,
        throttle: InterimThrottle,
        outgoing_capacity: usize,
    ) -> Self {
        Self {
            conn_id,
            language,
            sample_rate,
            inner: Mutex::new(ConnInner {
                ring,
                vad,
                throttle,
                emit: EmitGate::new(),
                phase: Phase::Idle,
                last_commit_sample: 0,
                pending_commits: VecDeque::new(),
            }),
            outgoing: OutgoingQueue::new(outgoing_capacity),
            interim_inflight: AtomicBool::new(false),
            last_final_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.outgoing.close();
    }

    /// Short id for log lines.
    pub fn short_id(&self) -> String {
        self.conn_id.to_string()[..8].to_string()
    }
}

/// Fixed-capacity outgoing frame queue, drained by the session task.
///
/// Overflow sheds the oldest droppable frame (status first, then interim);
/// finals and errors are never dropped and may transiently push the queue
/// past capacity rather than be lost.
pub struct OutgoingQueue {
    frames: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl OutgoingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, msg: ServerMessage) {
        let mut q = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        if q.len() >= self.capacity {
            let victim = q
                .iter()
                .enumerate()
                .filter(|(_, m)| m.is_droppable())
                .min_by_key(|(i, m)| (m.drop_priority(), *i))
                .map(|(i, _)| i);
            if let Some(i) = victim {
                q.remove(i);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        q.push_back(msg);
        drop(q);
        self.notify.notify_one();
    }

    /// Await the next frame; `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<ServerMessage> {
        loop {
            let notified = self.notify.notified();
            {
                let mut q = self.frames.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(msg) = q.pop_front() {
                    return Some(msg);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Live connections by id. Decode results for ids that have since
/// disconnected simply miss here and are dropped.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: Arc<Connection>) {
        debug!("conn {} registered", conn.short_id());
        self.connections.insert(conn.conn_id, conn);
    }

    pub fn unregister(&self, conn_id: &Uuid) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(conn_id).map(|(_, c)| c);
        if let Some(conn) = &removed {
            debug!("conn {} unregistered", conn.short_id());
        }
        removed
    }

    pub fn get(&self, conn_id: &Uuid) -> Option<Arc<Connection>> {
        self.connections.get(conn_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Push a frame to every live connection (droppable frames only make
    /// sense here; overflow handling is per-queue).
    pub fn broadcast(&self, msg: ServerMessage) {
        for entry in self.connections.iter() {
            entry.value().outgoing.push(msg.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::backpressure::BackpressureLevel;

    fn status_frame(cooldown_ms: u64) -> ServerMessage {
        ServerMessage::Status {
            backpressure: BackpressureLevel::Normal,
            cooldown_ms,
            tail_s: 7.0,
            interim_paused: false,
        }
    }

    fn final_frame(text: &str) -> ServerMessage {
        ServerMessage::Final {
            conn: Uuid::nil(),
            text: text.into(),
            segments: vec![],
            language: None,
            t0: 0.0,
            t1: 1.0,
        }
    }

    #[tokio::test]
    async fn queue_delivers_in_order() {
        let q = OutgoingQueue::new(8);
        q.push(status_frame(1));
        q.push(status_frame(2));
        assert!(matches!(q.pop().await, Some(ServerMessage::Status { cooldown_ms: 1, .. })));
        assert!(matches!(q.pop().await, Some(ServerMessage::Status { cooldown_ms: 2, .. })));
    }

    #[tokio::test]
    async fn overflow_sheds_oldest_status_first() {
        let q = OutgoingQueue::new(2);
        q.push(status_frame(1));
        q.push(final_frame("a"));
        q.push(status_frame(2));
        assert_eq!(q.dropped(), 1);
        // status 1 was shed; the final survived.
        assert!(matches!(q.pop().await, Some(ServerMessage::Final { .. })));
        assert!(matches!(q.pop().await, Some(ServerMessage::Status { cooldown_ms: 2, .. })));
    }

    #[tokio::test]
    async fn finals_are_never_shed() {
        let q = OutgoingQueue::new(2);
        q.push(final_frame("a"));
        q.push(final_frame("b"));
        q.push(final_frame("c"));
        assert_eq!(q.dropped(), 0);
        assert_eq!(q.len(), 3);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = OutgoingQueue::new(4);
        q.push(status_frame(1));
        q.close();
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = Arc::new(OutgoingQueue::new(4));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(status_frame(7));
        let got = waiter.await.unwrap();
        assert!(matches!(got, Some(ServerMessage::Status { cooldown_ms: 7, .. })));
    }
}
