use thiserror::Error;

/// Session-level protocol failures. Each maps to an `error` frame on the
/// wire; none of them terminate the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("audio chunk byte count is not divisible by 2")]
    InvalidFrame,
    #[error("audio payload is not valid base64: {0}")]
    InvalidPayload(String),
    #[error("control message is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("audio received before start")]
    NotStarted,
    #[error("unknown op: {0}")]
    UnknownOp(String),
    #[error("final queue is full")]
    QueueFull,
}

impl ProtocolError {
    /// Stable wire code for the `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidFrame => "invalid_frame",
            ProtocolError::InvalidPayload(_) => "invalid_frame",
            ProtocolError::InvalidJson(_) => "invalid_json",
            ProtocolError::NotStarted => "not_started",
            ProtocolError::UnknownOp(_) => "unknown_op",
            ProtocolError::QueueFull => "queue_full",
        }
    }
}

/// Decoder-side failures surfaced to the originating connection as an
/// `error` frame with code `decode_fail`.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("decoder failed: {0}")]
    Backend(String),
    #[error("decode exceeded its {budget_ms} ms budget ({elapsed_ms} ms)")]
    Timeout { budget_ms: u64, elapsed_ms: u64 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be between {min} and {max} (got {value})")]
    OutOfRange { name: &'static str, value: f64, min: f64, max: f64 },
}
