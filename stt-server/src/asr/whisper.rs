//! whisper.cpp-backed decoder (enabled with the `whisper` cargo feature).
//!
//! Two handles are loaded at startup: a small model tuned for speed
//! (interim pass, greedy sampling) and a large one tuned for quality
//! (final pass, beam search). Each handle lives on its own worker thread,
//! so no locking happens here.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::decoder::{Decoder, FinalResult, Segment};

pub struct WhisperDecoder {
    name: String,
    ctx: WhisperContext,
    quality_pass: bool,
}

impl WhisperDecoder {
    /// Load a model by name (resolved under `MODELS_DIR`, default `models/`,
    /// as `ggml-<name>.bin`) or by direct path.
    pub fn load(model: &str, quality_pass: bool) -> Result<Self> {
        let path = resolve_model_path(model);
        if !path.exists() {
            return Err(anyhow!("model file not found: {}", path.display()));
        }
        log::info!("loading whisper model {} from {}", model, path.display());
        let params = WhisperContextParameters {
            use_gpu: true,
            ..Default::default()
        };
        let ctx = WhisperContext::new_with_params(&path.to_string_lossy(), params)
            .map_err(|e| anyhow!("failed to load model {}: {}", model, e))?;
        Ok(Self { name: model.to_string(), ctx, quality_pass })
    }

    fn params<'a>(&self, language: &'a str) -> FullParams<'a, 'a> {
        let mut params = if self.quality_pass {
            FullParams::new(SamplingStrategy::BeamSearch { beam_size: 5, patience: 1.0 })
        } else {
            FullParams::new(SamplingStrategy::Greedy { best_of: 1 })
        };
        params.set_language(if language == "auto" { None } else { Some(language) });
        params.set_translate(false);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_suppress_blank(true);
        params.set_no_speech_thold(0.6);
        if self.quality_pass {
            params.set_temperature(0.0);
            params.set_logprob_thold(-1.0);
        } else {
            // Interims trade accuracy for latency; a single segment keeps
            // the pass cheap on long tails.
            params.set_temperature(0.0);
            params.set_single_segment(true);
        }
        params
    }

    fn run(&mut self, audio: &[f32], language: &str) -> Result<(String, Vec<Segment>)> {
        let params = self.params(language);
        let mut state = self.ctx.create_state()?;
        state.full(params, audio)?;

        let n = state.full_n_segments()?;
        let mut text = String::new();
        let mut segments = Vec::with_capacity(n as usize);
        for i in 0..n {
            let piece = state.full_get_segment_text(i)?;
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let start = state.full_get_segment_t0(i)? as f64 / 100.0;
            let end = state.full_get_segment_t1(i)? as f64 / 100.0;
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(piece);
            segments.push(Segment { start, end, text: piece.to_string() });
        }
        Ok((text, segments))
    }
}

impl Decoder for WhisperDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn decode_interim(&mut self, audio: &[f32], language: &str) -> Result<String> {
        let (text, _) = self.run(audio, language)?;
        Ok(text)
    }

    fn decode_final(&mut self, audio: &[f32], language: &str) -> Result<FinalResult> {
        let (text, segments) = self.run(audio, language)?;
        Ok(FinalResult {
            text,
            segments,
            language: if language == "auto" { None } else { Some(language.to_string()) },
            confidence: None,
        })
    }
}

fn resolve_model_path(model: &str) -> PathBuf {
    let direct = Path::new(model);
    if direct.extension().is_some() || direct.is_absolute() {
        return direct.to_path_buf();
    }
    let dir = std::env::var("MODELS_DIR").unwrap_or_else(|_| "models".to_string());
    Path::new(&dir).join(format!("ggml-{model}.bin"))
}
