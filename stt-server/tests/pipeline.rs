//! End-to-end pipeline tests: session ingest through scheduler, stub
//! decode workers and result dispatch, without a network transport.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use uuid::Uuid;

use stt_server::asr::decoder::FinalResult;
use stt_server::asr::stub::StubDecoder;
use stt_server::asr::worker::{DecodeEvent, DecodePayload};
use stt_server::audio::{EnergyClassifier, PcmRing, VadGate};
use stt_server::config::Config;
use stt_server::error::DecodeError;
use stt_server::metrics::Metrics;
use stt_server::runtime::dispatch::deliver;
use stt_server::runtime::state::{Connection, ConnectionRegistry, PendingCommit, Phase};
use stt_server::runtime::throttle::InterimThrottle;
use stt_server::runtime::Runtime;
use stt_server::scheduler::job::JobKind;
use stt_server::server::messages::ServerMessage;
use stt_server::server::Session;

const SAMPLE_RATE: usize = 16_000;

/// Loud alternating samples: passes the energy classifier's RMS and ZCR
/// checks, like real speech would.
fn speech_chunk(ms: usize) -> Vec<u8> {
    let samples = SAMPLE_RATE * ms / 1000;
    let mut out = Vec::with_capacity(samples * 2);
    for i in 0..samples {
        let v: i16 = if i % 2 == 0 { 6000 } else { -6000 };
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn silence_chunk(ms: usize) -> Vec<u8> {
    vec![0u8; SAMPLE_RATE * ms / 1000 * 2]
}

fn test_runtime(stub_latency_ms: u64, mutate: impl FnOnce(&mut Config)) -> Arc<Runtime> {
    let mut config = Config::default_config();
    config.interim_cooldown_ms = 50;
    mutate(&mut config);
    Runtime::start(
        config,
        Box::new(StubDecoder::new("stub-interim", stub_latency_ms)),
        Box::new(StubDecoder::new("stub-final", stub_latency_ms)),
    )
    .expect("runtime start")
}

/// Drain the connection's outgoing queue until it stays quiet for
/// `settle`.
async fn drain_frames(session: &Session, settle: Duration) -> Vec<ServerMessage> {
    let mut frames = Vec::new();
    while let Ok(Some(frame)) = timeout(settle, session.conn().outgoing.pop()).await {
        frames.push(frame);
    }
    frames
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_utterance_yields_interims_then_one_final() {
    let runtime = test_runtime(5, |_| {});
    let session = Session::open(runtime.clone(), "auto".into(), 16_000);

    // 2 s of speech in 100 ms chunks, paced so interim results can round-trip.
    for _ in 0..20 {
        session.on_audio(&speech_chunk(100)).unwrap();
        sleep(Duration::from_millis(25)).await;
    }
    // 600 ms of silence closes the utterance at the 500 ms mark.
    for _ in 0..6 {
        session.on_audio(&silence_chunk(100)).unwrap();
        sleep(Duration::from_millis(25)).await;
    }

    let frames = drain_frames(&session, Duration::from_millis(800)).await;

    let interims: Vec<_> = frames
        .iter()
        .filter(|f| matches!(f, ServerMessage::Interim { .. }))
        .collect();
    let finals: Vec<_> = frames
        .iter()
        .filter(|f| matches!(f, ServerMessage::Final { .. }))
        .collect();
    assert!(!interims.is_empty(), "expected at least one interim, got {frames:?}");
    assert_eq!(finals.len(), 1, "expected exactly one final, got {frames:?}");

    match finals[0] {
        ServerMessage::Final { text, t0, t1, .. } => {
            assert!(!text.is_empty());
            assert_eq!(*t0, 0.0);
            assert!((*t1 - 2.5).abs() < 1e-9, "final window should close at 2.5s, got {t1}");
        }
        _ => unreachable!(),
    }

    // The commit point advanced to the sample where end-silence triggered.
    let inner = session.conn().lock();
    assert_eq!(inner.ring.committed(), 40_000);
    assert_eq!(inner.last_commit_sample, 40_000);
    drop(inner);

    session.close();
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interim_jobs_are_conserved_under_slow_decoding() {
    // Decoder far slower than the chunk cadence: most chunks must be
    // absorbed by the inflight gate / coalescing rather than decoded.
    let runtime = test_runtime(300, |_| {});
    let session = Session::open(runtime.clone(), "auto".into(), 16_000);

    for _ in 0..30 {
        session.on_audio(&speech_chunk(100)).unwrap();
        sleep(Duration::from_millis(15)).await;
    }
    // Let the pipeline go quiet.
    sleep(Duration::from_millis(1_200)).await;
    let _ = drain_frames(&session, Duration::from_millis(200)).await;

    let m = &runtime.metrics;
    let enqueued = m.jobs_enqueued_interim.load(Ordering::Relaxed);
    let coalesced = m.jobs_coalesced.load(Ordering::Relaxed);
    let decoded =
        m.jobs_ok_interim.load(Ordering::Relaxed) + m.jobs_err_interim.load(Ordering::Relaxed);
    let (_, queued) = runtime.scheduler.depths();

    assert!(enqueued >= 1);
    // Conservation: every enqueued interim was decoded, coalesced away, or
    // is still queued (nothing at quiescence).
    assert_eq!(enqueued, coalesced + decoded + queued as u64);
    // 3 s of audio against a 300 ms decode: the decode count is bounded by
    // wall time, not by chunk count.
    assert!(decoded <= 12, "decoded {decoded} interims, expected far fewer than chunks");

    session.close();
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn final_preempts_a_primed_interim_backlog() {
    let runtime = test_runtime(5, |_| {});

    // Prime the interim queue with thirty connections' worth of jobs.
    for _ in 0..30 {
        runtime
            .scheduler
            .enqueue_interim(Uuid::new_v4(), vec![0.1; 1600], "auto".into(), 0.0, 0.1);
    }
    let session = Session::open(runtime.clone(), "auto".into(), 16_000);
    session.on_audio(&speech_chunk(300)).unwrap();
    session.on_stop().unwrap();

    // The final must come back promptly despite the backlog.
    let frames = drain_frames(&session, Duration::from_millis(700)).await;
    assert!(
        frames.iter().any(|f| matches!(f, ServerMessage::Final { .. })),
        "final not delivered past the interim backlog: {frames:?}"
    );

    session.close();
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_forces_a_final_and_resets_segmentation() {
    let runtime = test_runtime(5, |_| {});
    let session = Session::open(runtime.clone(), "auto".into(), 16_000);

    session.on_audio(&speech_chunk(1_000)).unwrap();
    session.on_stop().unwrap();

    let frames = drain_frames(&session, Duration::from_millis(500)).await;
    let finals = frames
        .iter()
        .filter(|f| matches!(f, ServerMessage::Final { .. }))
        .count();
    assert_eq!(finals, 1);

    let inner = session.conn().lock();
    assert_eq!(inner.last_commit_sample, 16_000);
    assert_eq!(inner.ring.committed(), 16_000);
    assert_eq!(inner.phase, Phase::Idle);
    assert!(!inner.vad.speaking());
    drop(inner);

    session.close();
    runtime.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn odd_sized_chunks_are_rejected_without_ingesting() {
    let runtime = test_runtime(5, |_| {});
    let session = Session::open(runtime.clone(), "auto".into(), 16_000);

    let err = session.on_audio(&[1, 2, 3]).unwrap_err();
    assert_eq!(err.code(), "invalid_frame");
    assert_eq!(session.conn().lock().ring.cursor(), 0);

    // The session keeps working afterwards.
    session.on_audio(&speech_chunk(100)).unwrap();
    assert_eq!(session.conn().lock().ring.cursor(), 1_600);

    session.close();
    runtime.shutdown();
}

// -- dispatcher-level checks (no runtime needed) ---------------------------

fn bare_connection() -> Arc<Connection> {
    Arc::new(Connection::new(
        Uuid::new_v4(),
        "auto".into(),
        16_000,
        PcmRing::new(16_000, 30),
        VadGate::new(Box::new(EnergyClassifier::new(2)), 16_000, 60, 500),
        InterimThrottle::new(220),
        64,
    ))
}

fn interim_event(conn_id: Uuid, seq: u64, text: &str) -> DecodeEvent {
    DecodeEvent {
        job_id: Uuid::new_v4(),
        kind: JobKind::Interim,
        conn_id,
        seq,
        t0: 0.0,
        t1: 1.0,
        decode_ms: 5,
        queue_wait_ms: 1,
        result: Ok(DecodePayload::Interim(text.to_string())),
    }
}

#[tokio::test]
async fn interim_older_than_latest_final_is_suppressed() {
    let registry = ConnectionRegistry::new();
    let metrics = Metrics::new();
    let conn = bare_connection();
    conn.last_final_seq.store(10, Ordering::Release);
    conn.interim_inflight.store(true, Ordering::Release);
    registry.register(conn.clone());

    deliver(interim_event(conn.conn_id, 5, "too late"), &registry, &metrics, 350);

    assert_eq!(conn.outgoing.len(), 0);
    assert_eq!(metrics.interims_stale_dropped.load(Ordering::Relaxed), 1);
    // The inflight gate still opens.
    assert!(!conn.interim_inflight.load(Ordering::Acquire));

    // A later interim passes.
    deliver(interim_event(conn.conn_id, 11, "in time"), &registry, &metrics, 350);
    assert!(matches!(conn.outgoing.pop().await, Some(ServerMessage::Interim { .. })));
}

#[tokio::test]
async fn results_for_departed_connections_are_dropped() {
    let registry = ConnectionRegistry::new();
    let metrics = Metrics::new();
    deliver(interim_event(Uuid::new_v4(), 1, "ghost"), &registry, &metrics, 350);
    assert_eq!(metrics.jobs_ok_interim.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn failed_final_rolls_the_commit_candidate_back() {
    let registry = ConnectionRegistry::new();
    let metrics = Metrics::new();
    let conn = bare_connection();
    {
        let mut inner = conn.lock();
        inner.ring.append(&speech_chunk(100));
        inner.pending_commits.push_back(PendingCommit { previous: 100, next: 1_600 });
        inner.last_commit_sample = 1_600;
        inner.phase = Phase::Processing;
    }
    registry.register(conn.clone());

    let event = DecodeEvent {
        job_id: Uuid::new_v4(),
        kind: JobKind::Final,
        conn_id: conn.conn_id,
        seq: 7,
        t0: 0.0,
        t1: 0.1,
        decode_ms: 10,
        queue_wait_ms: 1,
        result: Err(DecodeError::Backend("cuda OOM".into())),
    };
    deliver(event, &registry, &metrics, 350);

    let inner = conn.lock();
    assert_eq!(inner.last_commit_sample, 100, "failed final must not advance the commit point");
    assert_eq!(inner.ring.committed(), 0);
    assert!(inner.pending_commits.is_empty());
    assert_eq!(inner.phase, Phase::Idle);
    drop(inner);

    match conn.outgoing.pop().await {
        Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "decode_fail"),
        other => panic!("expected decode_fail error frame, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_final_does_not_clobber_a_later_candidate() {
    // Final A ([0,1600)) is in flight when a stop forces final B
    // ([1600,2000)), so two candidates are pending. A's failure must not
    // undo the advancement B already applied.
    let registry = ConnectionRegistry::new();
    let metrics = Metrics::new();
    let conn = bare_connection();
    {
        let mut inner = conn.lock();
        inner.ring.append(&speech_chunk(125)); // 2000 samples
        inner.pending_commits.push_back(PendingCommit { previous: 0, next: 1_600 });
        inner.pending_commits.push_back(PendingCommit { previous: 1_600, next: 2_000 });
        inner.last_commit_sample = 2_000;
        inner.phase = Phase::Processing;
    }
    registry.register(conn.clone());

    let failed_a = DecodeEvent {
        job_id: Uuid::new_v4(),
        kind: JobKind::Final,
        conn_id: conn.conn_id,
        seq: 3,
        t0: 0.0,
        t1: 0.1,
        decode_ms: 10,
        queue_wait_ms: 1,
        result: Err(DecodeError::Backend("cuda OOM".into())),
    };
    deliver(failed_a, &registry, &metrics, 350);

    {
        let inner = conn.lock();
        assert_eq!(
            inner.last_commit_sample, 2_000,
            "B's advancement must survive A's failure"
        );
        assert_eq!(inner.pending_commits.len(), 1);
        assert_eq!(inner.ring.committed(), 0);
    }

    let ok_b = DecodeEvent {
        job_id: Uuid::new_v4(),
        kind: JobKind::Final,
        conn_id: conn.conn_id,
        seq: 5,
        t0: 0.1,
        t1: 0.125,
        decode_ms: 10,
        queue_wait_ms: 1,
        result: Ok(DecodePayload::Final(FinalResult {
            text: "tail".into(),
            segments: vec![],
            language: None,
            confidence: None,
        })),
    };
    deliver(ok_b, &registry, &metrics, 350);

    let inner = conn.lock();
    assert_eq!(inner.ring.committed(), 2_000);
    assert_eq!(inner.last_commit_sample, 2_000);
    assert!(inner.pending_commits.is_empty());
}

#[tokio::test]
async fn successful_final_commits_and_resets_the_emit_gate() {
    let registry = ConnectionRegistry::new();
    let metrics = Metrics::new();
    let conn = bare_connection();
    {
        let mut inner = conn.lock();
        inner.ring.append(&speech_chunk(100));
        inner.pending_commits.push_back(PendingCommit { previous: 0, next: 1_600 });
        inner.last_commit_sample = 1_600;
        inner.phase = Phase::Processing;
        // Emit-gate state from the utterance's interims.
        let _ = inner.emit.check("partial text", 0, 350);
    }
    registry.register(conn.clone());

    let event = DecodeEvent {
        job_id: Uuid::new_v4(),
        kind: JobKind::Final,
        conn_id: conn.conn_id,
        seq: 9,
        t0: 0.0,
        t1: 0.1,
        decode_ms: 10,
        queue_wait_ms: 1,
        result: Ok(DecodePayload::Final(FinalResult {
            text: "hello world".into(),
            segments: vec![],
            language: Some("en".into()),
            confidence: Some(0.9),
        })),
    };
    deliver(event, &registry, &metrics, 350);

    {
        let inner = conn.lock();
        assert_eq!(inner.ring.committed(), 1_600);
        assert_eq!(inner.phase, Phase::Idle);
    }
    match conn.outgoing.pop().await {
        Some(ServerMessage::Final { text, .. }) => assert_eq!(text, "hello world"),
        other => panic!("expected final frame, got {other:?}"),
    }
    // After the reset, the next interim emits unconditionally.
    let d = conn.lock().emit.check("next utterance", 10, 350).unwrap();
    assert_eq!(d.stable_chars, 0);
}
