use clap::Parser;

use crate::error::ConfigError;

/// Server configuration, sourced from environment variables with CLI
/// overrides. Defaults match the tuning the service ships with; the ranges
/// on the latency-sensitive knobs are validated at startup so a bad
/// deployment fails fast instead of misbehaving under load.
#[derive(Debug, Clone, Parser)]
#[command(name = "stt-server", about = "Two-pass realtime speech-to-text streaming server")]
pub struct Config {
    #[arg(long, env = "BIND_HOST", default_value = "127.0.0.1")]
    pub bind_host: String,

    #[arg(long, env = "BIND_PORT", default_value_t = 8081)]
    pub bind_port: u16,

    #[arg(long, env = "SAMPLE_RATE", default_value_t = 16_000)]
    pub sample_rate: u32,

    /// Base cooldown between interim enqueues per connection.
    #[arg(long, env = "INTERIM_COOLDOWN_MS", default_value_t = 220)]
    pub interim_cooldown_ms: u64,

    /// Emit-gate time floor: an unchanged-length interim is still emitted
    /// once this much time has passed since the previous emission.
    #[arg(long, env = "INTERIM_MIN_MS", default_value_t = 350)]
    pub interim_min_ms: u64,

    /// Tail window sliced from the ring for interim decodes.
    #[arg(long, env = "TAIL_SECONDS", default_value_t = 7.0)]
    pub tail_seconds: f64,

    #[arg(long, env = "SCHEDULER_TICK_MS", default_value_t = 12)]
    pub scheduler_tick_ms: u64,

    #[arg(long, env = "F_FINAL_BURST", default_value_t = 2)]
    pub final_burst: usize,

    #[arg(long, env = "F_INTERIM_BURST", default_value_t = 3)]
    pub interim_burst: usize,

    // Backpressure watermarks
    #[arg(long, env = "FINAL_HI", default_value_t = 6)]
    pub final_hi: usize,

    #[arg(long, env = "FINAL_CRIT", default_value_t = 12)]
    pub final_crit: usize,

    #[arg(long, env = "INTERIM_HI", default_value_t = 20)]
    pub interim_hi: usize,

    #[arg(long, env = "INTERIM_CRIT", default_value_t = 40)]
    pub interim_crit: usize,

    /// VAD aggressiveness, 0 (lenient) to 3 (strict).
    #[arg(long, env = "VAD_MODE", default_value_t = 2)]
    pub vad_mode: u8,

    #[arg(long, env = "VAD_START_SPEECH_MS", default_value_t = 60)]
    pub vad_start_speech_ms: u32,

    #[arg(long, env = "VAD_END_SILENCE_MS", default_value_t = 500)]
    pub vad_end_silence_ms: u32,

    /// ISO language code, or "auto" for per-utterance detection.
    #[arg(long, env = "ASR_LANGUAGE", default_value = "auto")]
    pub asr_language: String,

    #[arg(long, env = "RING_BUFFER_SECONDS", default_value_t = 30)]
    pub ring_buffer_seconds: u32,

    /// Model name/path for the interim (fast) pass. Whisper backend only.
    #[arg(long, env = "INTERIM_MODEL", default_value = "small")]
    pub interim_model: String,

    /// Model name/path for the final (quality) pass. Whisper backend only.
    #[arg(long, env = "FINAL_MODEL", default_value = "large-v3")]
    pub final_model: String,

    /// Synthetic decode latency of the stub backend.
    #[arg(long, env = "STUB_DECODE_MS", default_value_t = 120)]
    pub stub_decode_ms: u64,

    /// Fallback log filter when RUST_LOG is unset.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        range(
            "INTERIM_COOLDOWN_MS",
            self.interim_cooldown_ms as f64,
            50.0,
            1000.0,
        )?;
        range("TAIL_SECONDS", self.tail_seconds, 1.0, 30.0)?;
        range("VAD_MODE", self.vad_mode as f64, 0.0, 3.0)?;
        range("SCHEDULER_TICK_MS", self.scheduler_tick_ms as f64, 1.0, 1000.0)?;
        range(
            "RING_BUFFER_SECONDS",
            self.ring_buffer_seconds as f64,
            1.0,
            300.0,
        )?;
        Ok(())
    }

    /// Configuration parsed from an empty command line. Environment
    /// variables still apply (clap resolves each `env = "..."` arg from the
    /// process environment); only argv is overridden. Used by tests and the
    /// library entry points.
    pub fn default_config() -> Self {
        Config::parse_from(["stt-server"])
    }
}

fn range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange { name, value, min, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.sample_rate, 16_000);
        assert_eq!(cfg.interim_cooldown_ms, 220);
        assert_eq!(cfg.final_hi, 6);
    }

    #[test]
    fn cooldown_range_is_enforced()  {
        let mut cfg = Config::default_config();
        cfg.interim_cooldown_ms = 20;
        assert!(cfg.validate().is_err());
        cfg.interim_cooldown_ms = 1000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn cli_overrides_defaults() {
        let cfg = Config::parse_from(["stt-server", "--bind-port", "9000", "--tail-seconds", "4.5"]);
        assert_eq!(cfg.bind_port, 9000);
        assert_eq!(cfg.tail_seconds, 4.5);
    }
}
