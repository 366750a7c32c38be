//! Realtime two-pass speech-to-text streaming core.
//!
//! Live PCM16 audio comes in over a framed transport; strictly ordered
//! `interim` (fast, revisable) and `final` (quality, committed)
//! transcriptions go back out. The library exposes the whole pipeline
//! (ring buffers, VAD gating, the finals-first scheduler, backpressure,
//! the session state machine) so it can be driven without a network
//! transport; the binary wires it to an HTTP/WebSocket surface.

pub mod asr;
pub mod audio;
pub mod config;
pub mod error;
pub mod metrics;
pub mod runtime;
pub mod scheduler;
pub mod server;

pub use config::Config;
pub use runtime::Runtime;
