use anyhow::Result;
use serde::Serialize;

/// One timestamped span of a final transcription.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Result of the quality (final) pass.
#[derive(Debug, Clone, Default)]
pub struct FinalResult {
    pub text: String,
    pub segments: Vec<Segment>,
    pub language: Option<String>,
    pub confidence: Option<f32>,
}

/// A loaded ASR model handle.
///
/// Implementations decode mono f32 audio at 16 kHz. Each handle is owned by
/// exactly one worker thread, which serializes access; `&mut self` makes
/// that exclusivity explicit. `language` is an ISO code or `"auto"`.
pub trait Decoder: Send {
    fn name(&self) -> &str;

    /// Fast, low-cost pass used for interim snapshots.
    fn decode_interim(&mut self, audio: &[f32], language: &str) -> Result<String>;

    /// Higher-quality pass for committed utterances.
    fn decode_final(&mut self, audio: &[f32], language: &str) -> Result<FinalResult>;
}
