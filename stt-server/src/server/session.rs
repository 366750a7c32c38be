//! Per-connection ingest core.
//!
//! Transport-independent: the WebSocket layer feeds raw PCM16 chunks and
//! control ops in, and everything the client should see comes back out of
//! the connection's outgoing queue. Integration tests drive this type
//! directly with synthetic audio.
//!
//! The phase machine follows the VAD edges: speech start opens an
//! utterance (`Listening`), during which throttled interim snapshots of
//! the ring tail are enqueued; speech end closes it (`Processing`) with a
//! final job covering everything since the last commit point. The final's
//! result delivery returns the connection to `Idle`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, warn};

use crate::error::ProtocolError;
use crate::runtime::now_ms;
use crate::runtime::state::{ConnInner, Connection, PendingCommit, Phase};
use crate::runtime::Runtime;
use crate::scheduler::priority::InterimEnqueue;
use crate::server::messages::ServerMessage;

struct SliceRequest {
    audio: Vec<f32>,
    t0: f64,
    t1: f64,
}

pub struct Session {
    runtime: Arc<Runtime>,
    conn: Arc<Connection>,
}

impl Session {
    /// Register a connection and answer with a status frame so the client
    /// learns the initial cooldown and tail window.
    pub fn open(runtime: Arc<Runtime>, requested_lang: String, sample_rate: u32) -> Self {
        if sample_rate != runtime.config.sample_rate {
            warn!(
                "client requested {} Hz, serving at {} Hz",
                sample_rate, runtime.config.sample_rate
            );
        }
        let language = if requested_lang == "auto" {
            runtime.config.asr_language.clone()
        } else {
            requested_lang
        };
        let conn = runtime.open_connection(language);
        conn.outgoing.push(ServerMessage::status(&runtime.backpressure()));
        debug!("conn {}: session started (lang={})", conn.short_id(), conn.language);
        Self { runtime, conn }
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Ingest one PCM16 chunk: append to the ring, advance the VAD, and
    /// enqueue whatever jobs the phase machine calls for.
    pub fn on_audio(&self, raw: &[u8]) -> Result<(), ProtocolError> {
        if raw.is_empty() {
            return Ok(());
        }
        if raw.len() % 2 != 0 {
            return Err(ProtocolError::InvalidFrame);
        }
        self.runtime
            .metrics
            .audio_bytes_total
            .fetch_add(raw.len() as u64, Ordering::Relaxed);

        let bp = self.runtime.backpressure();
        let mut interim_req = None;
        let mut final_req = None;
        {
            let mut inner = self.conn.lock();
            inner.ring.append(raw);
            inner.vad.process(raw);

            if inner.phase == Phase::Idle && inner.vad.just_started() {
                inner.phase = Phase::Listening;
                debug!("conn {}: utterance started", self.conn.short_id());
            }

            if inner.phase == Phase::Listening {
                if inner.vad.just_ended() {
                    final_req = self.slice_final(&mut inner);
                } else {
                    interim_req = self.slice_interim(&mut inner, bp.cooldown_ms, bp.tail_seconds, bp.interims_paused);
                }
            }
        }

        if let Some(req) = interim_req {
            self.enqueue_interim(req);
        }
        if let Some(req) = final_req {
            self.enqueue_final(req)?;
        }
        Ok(())
    }

    /// `stop` op: force a final on everything since the last commit point,
    /// reset segmentation, keep the session alive.
    pub fn on_stop(&self) -> Result<(), ProtocolError> {
        let final_req = {
            let mut inner = self.conn.lock();
            inner.vad.reset();
            let req = self.slice_final(&mut inner);
            if req.is_none() {
                // Nothing pending; still reset the commit point so the next
                // utterance is segmented from here.
                let cursor = inner.ring.cursor();
                inner.last_commit_sample = cursor;
                inner.phase = Phase::Idle;
            }
            req
        };
        let result = match final_req {
            Some(req) => self.enqueue_final(req),
            None => Ok(()),
        };
        // Acknowledge with a status frame either way.
        self.conn
            .outgoing
            .push(ServerMessage::status(&self.runtime.backpressure()));
        result
    }

    pub fn close(&self) {
        self.runtime.close_connection(&self.conn);
    }

    /// Tail slice for an interim, gated by pause, the inflight flag and the
    /// throttle. Pause and inflight skips count toward the rejected metric;
    /// throttle skips are ordinary pacing.
    fn slice_interim(
        &self,
        inner: &mut ConnInner,
        cooldown_ms: u64,
        tail_seconds: f64,
        paused: bool,
    ) -> Option<SliceRequest> {
        if paused || self.conn.interim_inflight.load(Ordering::Acquire) {
            self.runtime.metrics.interims_rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let now = now_ms();
        if !inner.throttle.should_allow(now, cooldown_ms) {
            return None;
        }
        let audio = inner.ring.tail_f32(tail_seconds)?;
        let sr = inner.ring.sample_rate() as f64;
        let t1 = inner.ring.cursor() as f64 / sr;
        let t0 = t1 - audio.len() as f64 / sr;
        inner.throttle.mark_enqueued(now);
        self.conn.interim_inflight.store(true, Ordering::Release);
        Some(SliceRequest { audio, t0, t1 })
    }

    /// Since-commit slice for a final. Applies the commit candidate
    /// optimistically; the dispatcher confirms or rolls it back when the
    /// decode resolves.
    fn slice_final(&self, inner: &mut ConnInner) -> Option<SliceRequest> {
        let start = inner.last_commit_sample;
        let cursor = inner.ring.cursor();
        let audio = match inner.ring.since_f32(start) {
            Some(audio) => audio,
            None => {
                if inner.phase == Phase::Listening {
                    inner.phase = Phase::Idle;
                }
                return None;
            }
        };
        let sr = inner.ring.sample_rate() as f64;
        inner.pending_commits.push_back(PendingCommit { previous: start, next: cursor });
        inner.last_commit_sample = cursor;
        inner.phase = Phase::Processing;
        Some(SliceRequest {
            audio,
            t0: start as f64 / sr,
            t1: cursor as f64 / sr,
        })
    }

    fn enqueue_interim(&self, req: SliceRequest) {
        let outcome = self.runtime.scheduler.enqueue_interim(
            self.conn.conn_id,
            req.audio,
            self.conn.language.clone(),
            req.t0,
            req.t1,
        );
        if let InterimEnqueue::Coalesced(_) = outcome {
            debug!("conn {}: interim coalesced", self.conn.short_id());
        }
    }

    fn enqueue_final(&self, req: SliceRequest) -> Result<(), ProtocolError> {
        match self.runtime.scheduler.enqueue_final(
            self.conn.conn_id,
            req.audio,
            self.conn.language.clone(),
            req.t0,
            req.t1,
        ) {
            Ok(seq) => {
                self.conn.last_final_seq.store(seq, Ordering::Release);
                debug!(
                    "conn {}: final enqueued (window {:.2}s..{:.2}s)",
                    self.conn.short_id(),
                    req.t0,
                    req.t1
                );
                Ok(())
            }
            Err(()) => {
                // The job is lost; restore the commit candidate so the next
                // final covers this window again.
                let mut inner = self.conn.lock();
                if let Some(pc) = inner.pending_commits.pop_back() {
                    inner.last_commit_sample = pc.previous;
                }
                inner.phase = Phase::Idle;
                warn!("conn {}: final rejected, queue full", self.conn.short_id());
                Err(ProtocolError::QueueFull)
            }
        }
    }
}
