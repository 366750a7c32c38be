//! Decode-result fan-out.
//!
//! Workers post [`DecodeEvent`]s onto one channel; this task routes each to
//! its connection's outgoing queue. A result whose connection is gone is
//! dropped; jobs are never cancelled mid-decode, so stragglers after a
//! disconnect are expected. Interim results are additionally checked
//! against the connection's newest final: an interim enqueued before that
//! final describes audio the final already committed and must not reach
//! the wire after it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, error};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::asr::worker::{DecodeEvent, DecodePayload};
use crate::metrics::Metrics;
use crate::runtime::now_ms;
use crate::runtime::state::{Connection, ConnectionRegistry, Phase};
use crate::scheduler::job::JobKind;
use crate::server::messages::ServerMessage;

pub async fn run(
    mut events: UnboundedReceiver<DecodeEvent>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<Metrics>,
    interim_min_ms: u64,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                deliver(ev, &registry, &metrics, interim_min_ms);
            }
        }
    }
    debug!("dispatcher stopped");
}

/// Route one decode result. Separated from the loop so tests can call it
/// synchronously.
pub fn deliver(
    ev: DecodeEvent,
    registry: &ConnectionRegistry,
    metrics: &Metrics,
    interim_min_ms: u64,
) {
    record_metrics(&ev, metrics);

    let Some(conn) = registry.get(&ev.conn_id) else {
        debug!("dropping {} result for departed conn {}", ev.kind.as_str(), ev.conn_id);
        return;
    };
    if conn.is_closed() {
        return;
    }

    match ev.kind {
        JobKind::Interim => deliver_interim(ev, &conn, metrics, interim_min_ms),
        JobKind::Final => deliver_final(ev, &conn),
    }
}

fn deliver_interim(ev: DecodeEvent, conn: &Arc<Connection>, metrics: &Metrics, interim_min_ms: u64) {
    // The inflight gate opens as soon as the result lands, whatever its
    // fate below.
    conn.interim_inflight.store(false, Ordering::Release);

    if ev.seq < conn.last_final_seq.load(Ordering::Acquire) {
        metrics.interims_stale_dropped.fetch_add(1, Ordering::Relaxed);
        debug!("conn {}: stale interim (seq {} < last final)", conn.short_id(), ev.seq);
        return;
    }

    match ev.result {
        Ok(DecodePayload::Interim(text)) => {
            let decision = conn.lock().emit.check(&text, now_ms(), interim_min_ms);
            match decision {
                Some(d) => {
                    metrics.interims_emitted.fetch_add(1, Ordering::Relaxed);
                    conn.outgoing.push(ServerMessage::Interim {
                        conn: conn.conn_id,
                        text,
                        stable_chars: d.stable_chars,
                        t0: ev.t0,
                        t1: ev.t1,
                    });
                }
                None => {
                    metrics.interims_suppressed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(DecodePayload::Final(_)) => {
            error!("conn {}: final payload on interim job {}", conn.short_id(), ev.job_id);
        }
        Err(e) => {
            conn.outgoing
                .push(ServerMessage::decode_error(format!("interim job {}: {e}", ev.job_id)));
        }
    }
}

fn deliver_final(ev: DecodeEvent, conn: &Arc<Connection>) {
    match ev.result {
        Ok(DecodePayload::Final(result)) => {
            {
                let mut inner = conn.lock();
                if let Some(pc) = inner.pending_commits.pop_front() {
                    inner.ring.commit(pc.next);
                }
                // Speech may already have resumed while this final decoded;
                // drop straight back into Listening so interims continue.
                inner.phase = if inner.vad.speaking() { Phase::Listening } else { Phase::Idle };
                inner.emit.reset();
            }
            debug!(
                "conn {}: final delivered ({} chars, {} ms decode)",
                conn.short_id(),
                result.text.len(),
                ev.decode_ms
            );
            conn.outgoing.push(ServerMessage::Final {
                conn: conn.conn_id,
                text: result.text,
                segments: result.segments,
                language: result.language,
                t0: ev.t0,
                t1: ev.t1,
            });
        }
        Ok(DecodePayload::Interim(_)) => {
            error!("conn {}: interim payload on final job {}", conn.short_id(), ev.job_id);
        }
        Err(e) => {
            {
                let mut inner = conn.lock();
                // The window was never committed; restoring the previous
                // mark makes the next final re-decode it. Only restore if
                // the marker is still the one this candidate set: a later
                // final (e.g. a `stop` issued mid-decode) may already have
                // advanced it, and its candidate must keep the win.
                if let Some(pc) = inner.pending_commits.pop_front() {
                    if inner.last_commit_sample == pc.next {
                        inner.last_commit_sample = pc.previous;
                    }
                }
                inner.phase = if inner.vad.speaking() { Phase::Listening } else { Phase::Idle };
                inner.emit.reset();
            }
            conn.outgoing
                .push(ServerMessage::decode_error(format!("final job {}: {e}", ev.job_id)));
        }
    }
}

fn record_metrics(ev: &DecodeEvent, metrics: &Metrics) {
    match (ev.kind, ev.result.is_ok()) {
        (JobKind::Interim, true) => {
            metrics.jobs_ok_interim.fetch_add(1, Ordering::Relaxed);
        }
        (JobKind::Interim, false) => {
            metrics.jobs_err_interim.fetch_add(1, Ordering::Relaxed);
        }
        (JobKind::Final, true) => {
            metrics.jobs_ok_final.fetch_add(1, Ordering::Relaxed);
        }
        (JobKind::Final, false) => {
            metrics.jobs_err_final.fetch_add(1, Ordering::Relaxed);
        }
    }
    match ev.kind {
        JobKind::Interim => {
            metrics.decode_ms_interim.fetch_add(ev.decode_ms, Ordering::Relaxed);
            metrics
                .queue_wait_ms_interim
                .fetch_add(ev.queue_wait_ms, Ordering::Relaxed);
        }
        JobKind::Final => {
            metrics.decode_ms_final.fetch_add(ev.decode_ms, Ordering::Relaxed);
            metrics.queue_wait_ms_final.fetch_add(ev.queue_wait_ms, Ordering::Relaxed);
        }
    }
}
