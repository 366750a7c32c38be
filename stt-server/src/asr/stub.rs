//! Latency-simulation decoder.
//!
//! Stands in for a real model when the `whisper` feature is off: sleeps a
//! configurable decode time, then reports the audio it "heard" as a word
//! count derived from duration. That is enough to exercise every part of
//! the pipeline (emit gating, coalescing, backpressure) under load tests
//! and in CI, where model weights are unavailable.

use std::thread;
use std::time::Duration;

use anyhow::Result;

use super::decoder::{Decoder, FinalResult, Segment};

const SAMPLE_RATE: f64 = 16_000.0;
// Rough speaking rate used to synthesize transcript-shaped text.
const WORDS_PER_SECOND: f64 = 2.5;

pub struct StubDecoder {
    name: String,
    decode_latency: Duration,
}

impl StubDecoder {
    pub fn new(name: impl Into<String>, decode_latency_ms: u64) -> Self {
        Self {
            name: name.into(),
            decode_latency: Duration::from_millis(decode_latency_ms),
        }
    }

    fn synthesize_text(audio: &[f32]) -> String {
        let seconds = audio.len() as f64 / SAMPLE_RATE;
        let words = ((seconds * WORDS_PER_SECOND) as usize).max(1);
        let mut out = String::new();
        for i in 0..words {
            if i > 0 {
                out.push(' ');
            }
            out.push_str("lorem");
        }
        out
    }

    fn has_signal(audio: &[f32]) -> bool {
        audio.iter().any(|s| s.abs() > 0.001)
    }
}

impl Decoder for StubDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn decode_interim(&mut self, audio: &[f32], _language: &str) -> Result<String> {
        thread::sleep(self.decode_latency);
        if !Self::has_signal(audio) {
            return Ok(String::new());
        }
        Ok(Self::synthesize_text(audio))
    }

    fn decode_final(&mut self, audio: &[f32], language: &str) -> Result<FinalResult> {
        thread::sleep(self.decode_latency);
        if !Self::has_signal(audio) {
            return Ok(FinalResult::default());
        }
        let text = Self::synthesize_text(audio);
        let end = audio.len() as f64 / SAMPLE_RATE;
        Ok(FinalResult {
            segments: vec![Segment { start: 0.0, end, text: text.clone() }],
            text,
            language: if language == "auto" { Some("en".to_string()) } else { Some(language.to_string()) },
            confidence: Some(1.0),
        })
    }
}
