// src/audio/mod.rs
pub mod ring;
pub mod vad;

pub use ring::PcmRing;
pub use vad::{EnergyClassifier, SpeechClassifier, VadGate};
