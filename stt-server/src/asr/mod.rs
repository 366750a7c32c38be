// src/asr/mod.rs
pub mod decoder;
pub mod stub;
pub mod worker;

#[cfg(feature = "whisper")]
pub mod whisper;

pub use decoder::{Decoder, FinalResult, Segment};
pub use stub::StubDecoder;
pub use worker::{spawn_worker, DecodeEvent, DecodePayload};
