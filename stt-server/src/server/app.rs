//! HTTP surface: liveness, readiness, status snapshot, metrics and the
//! WebSocket upgrade.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;

use crate::runtime::Runtime;
use crate::server::ws::ws_handler;

pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws_handler))
        .with_state(runtime)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Ready once both model handles have finished their warmup decode.
async fn ready(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    if runtime.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "warming_up" })),
        )
    }
}

async fn status(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    let (final_depth, interim_depth) = runtime.scheduler.depths();
    let bp = runtime.backpressure();
    let (interim_model, final_model) = runtime.model_names();
    let cfg = &runtime.config;
    Json(json!({
        "service": "stt-server",
        "status": "ok",
        "started_at": runtime.started_at.to_rfc3339(),
        "ready": runtime.is_ready(),
        "models": {
            "interim": interim_model,
            "final": final_model,
        },
        "connections": runtime.registry.len(),
        "queues": {
            "final": final_depth,
            "interim": interim_depth,
        },
        "backpressure": {
            "level": bp.level.as_str(),
            "cooldown_ms": bp.cooldown_ms,
            "tail_s": bp.tail_seconds,
            "interims_paused": bp.interims_paused,
        },
        "config": {
            "sample_rate": cfg.sample_rate,
            "language": cfg.asr_language,
            "interim_cooldown_ms": cfg.interim_cooldown_ms,
            "tail_seconds": cfg.tail_seconds,
            "scheduler_tick_ms": cfg.scheduler_tick_ms,
            "final_burst": cfg.final_burst,
            "interim_burst": cfg.interim_burst,
            "watermarks": {
                "final_hi": cfg.final_hi,
                "final_crit": cfg.final_crit,
                "interim_hi": cfg.interim_hi,
                "interim_crit": cfg.interim_crit,
            },
            "vad_mode": cfg.vad_mode,
            "vad_end_silence_ms": cfg.vad_end_silence_ms,
            "ring_buffer_seconds": cfg.ring_buffer_seconds,
        },
    }))
}

async fn metrics(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        runtime.metrics.render(),
    )
}
