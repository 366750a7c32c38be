//! Per-model decode workers.
//!
//! One dedicated OS thread per model handle: the thread owns its decoder
//! outright, which serializes decodes on that model without a lock, and the
//! two models (interim / final) still run in parallel with each other.
//! Jobs arrive over a bounded crossbeam channel fed by the scheduler;
//! results are posted back to the async side as [`DecodeEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam::channel::Receiver;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::asr::decoder::{Decoder, FinalResult};
use crate::error::DecodeError;
use crate::scheduler::job::{Job, JobKind};

/// Soft decode budgets. A decode cannot be interrupted, so an overrun is
/// detected after the fact: the result is abandoned and reported as a
/// timeout.
const INTERIM_BUDGET_MS: u64 = 5_000;
const FINAL_BUDGET_MS: u64 = 30_000;

const WARMUP_SAMPLES: usize = 8_000; // 0.5 s of silence

#[derive(Debug, Clone)]
pub enum DecodePayload {
    Interim(String),
    Final(FinalResult),
}

/// A finished decode, successful or not, headed back to the event loop.
#[derive(Debug, Clone)]
pub struct DecodeEvent {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub conn_id: Uuid,
    pub seq: u64,
    pub t0: f64,
    pub t1: f64,
    pub decode_ms: u64,
    pub queue_wait_ms: u64,
    pub result: Result<DecodePayload, DecodeError>,
}

/// Spawn the decode thread for one model handle. The thread exits when the
/// job channel closes or the event loop goes away. `warmed` flips once the
/// warmup decode has run; `/ready` reports 503 until both workers are warm.
pub fn spawn_worker(
    kind: JobKind,
    mut decoder: Box<dyn Decoder>,
    jobs: Receiver<Job>,
    events: UnboundedSender<DecodeEvent>,
    warmed: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let thread_name = format!("decode-{}", kind.as_str());
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            warmup(kind, decoder.as_mut());
            warmed.store(true, Ordering::Release);

            for job in jobs.iter() {
                let queue_wait_ms = job.enqueued_at.elapsed().as_millis() as u64;
                let started = Instant::now();
                let outcome = decode(decoder.as_mut(), &job);
                let decode_ms = started.elapsed().as_millis() as u64;

                let budget_ms = match kind {
                    JobKind::Interim => INTERIM_BUDGET_MS,
                    JobKind::Final => FINAL_BUDGET_MS,
                };
                let result = match outcome {
                    Ok(_) if decode_ms > budget_ms => {
                        warn!(
                            "{} decode for conn {} blew its budget ({decode_ms} ms), dropping result",
                            kind.as_str(),
                            job.conn_id
                        );
                        Err(DecodeError::Timeout { budget_ms, elapsed_ms: decode_ms })
                    }
                    Ok(payload) => Ok(payload),
                    Err(e) => {
                        error!("{} decode for conn {} failed: {e:#}", kind.as_str(), job.conn_id);
                        Err(DecodeError::Backend(format!("{e:#}")))
                    }
                };

                let event = DecodeEvent {
                    job_id: job.id,
                    kind,
                    conn_id: job.conn_id,
                    seq: job.seq,
                    t0: job.t0,
                    t1: job.t1,
                    decode_ms,
                    queue_wait_ms,
                    result,
                };
                if events.send(event).is_err() {
                    debug!("{thread_name}: event loop gone, exiting");
                    break;
                }
            }
            info!("{thread_name} stopped");
        })
}

fn decode(decoder: &mut dyn Decoder, job: &Job) -> anyhow::Result<DecodePayload> {
    match job.kind {
        JobKind::Interim => Ok(DecodePayload::Interim(
            decoder.decode_interim(&job.audio, &job.language)?,
        )),
        JobKind::Final => Ok(DecodePayload::Final(
            decoder.decode_final(&job.audio, &job.language)?,
        )),
    }
}

/// Run one throwaway decode so model initialization cost is paid before the
/// first client, not during it.
fn warmup(kind: JobKind, decoder: &mut dyn Decoder) {
    let silence = vec![0.0_f32; WARMUP_SAMPLES];
    let started = Instant::now();
    match kind {
        JobKind::Interim => {
            if let Err(e) = decoder.decode_interim(&silence, "auto") {
                warn!("interim warmup decode failed: {e:#}");
                return;
            }
        }
        JobKind::Final => {
            if let Err(e) = decoder.decode_final(&silence, "auto") {
                warn!("final warmup decode failed: {e:#}");
                return;
            }
        }
    }
    info!(
        "{} model `{}` warmed up in {} ms",
        kind.as_str(),
        decoder.name(),
        started.elapsed().as_millis()
    );
}
