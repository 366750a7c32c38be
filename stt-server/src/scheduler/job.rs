use std::time::Instant;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Interim,
    Final,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Interim => "interim",
            JobKind::Final => "final",
        }
    }
}

/// A decode request detached from its connection's ring buffer.
///
/// The audio is copied out at enqueue time so the decode path never touches
/// the ring; whatever the connection appends afterwards cannot tear the
/// snapshot a worker is reading.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub conn_id: Uuid,
    pub audio: Vec<f32>,
    pub language: String,
    /// Global enqueue sequence. Orders jobs of the same kind and lets the
    /// dispatcher detect interims that predate a connection's latest final.
    pub seq: u64,
    pub enqueued_at: Instant,
    /// Window boundaries in stream seconds.
    pub t0: f64,
    pub t1: f64,
}

impl Job {
    pub fn new(
        kind: JobKind,
        conn_id: Uuid,
        audio: Vec<f32>,
        language: String,
        seq: u64,
        t0: f64,
        t1: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            conn_id,
            audio,
            language,
            seq,
            enqueued_at: Instant::now(),
            t0,
            t1,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.t1 - self.t0
    }
}
