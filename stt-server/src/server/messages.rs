//! Wire protocol.
//!
//! Client control frames are JSON text tagged by `op`; audio may arrive
//! either inside an `audio` frame (base64 PCM16 LE) or as raw binary
//! WebSocket frames. Server frames are JSON text tagged by `type`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::asr::decoder::Segment;
use crate::error::ProtocolError;
use crate::runtime::backpressure::{BackpressureLevel, BackpressureState};

fn default_sample_rate() -> u32 {
    16_000
}

fn default_lang() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Initialize the session; must precede any audio.
    Start {
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
        #[serde(default = "default_lang")]
        lang: String,
    },
    /// Base64-encoded PCM16 LE mono chunk.
    Audio { payload: String },
    /// Force a final on the current window; the session stays alive.
    Stop,
}

/// Parse a control frame, distinguishing malformed JSON from a
/// well-formed frame with an unknown `op`.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, ProtocolError> {
    match serde_json::from_str::<ClientMessage>(raw) {
        Ok(msg) => Ok(msg),
        Err(e) => {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
                if let Some(op) = value.get("op").and_then(|v| v.as_str()) {
                    if !matches!(op, "start" | "audio" | "stop") {
                        return Err(ProtocolError::UnknownOp(op.to_string()));
                    }
                }
            }
            Err(ProtocolError::InvalidJson(e.to_string()))
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Interim {
        conn: Uuid,
        text: String,
        stable_chars: usize,
        t0: f64,
        t1: f64,
    },
    Final {
        conn: Uuid,
        text: String,
        segments: Vec<Segment>,
        language: Option<String>,
        t0: f64,
        t1: f64,
    },
    Status {
        backpressure: BackpressureLevel,
        cooldown_ms: u64,
        tail_s: f64,
        interim_paused: bool,
    },
    Error { code: String, detail: String },
}

impl ServerMessage {
    pub fn status(state: &BackpressureState) -> Self {
        ServerMessage::Status {
            backpressure: state.level,
            cooldown_ms: state.cooldown_ms,
            tail_s: state.tail_seconds,
            interim_paused: state.interims_paused,
        }
    }

    pub fn error(err: &ProtocolError) -> Self {
        ServerMessage::Error { code: err.code().to_string(), detail: err.to_string() }
    }

    pub fn decode_error(detail: String) -> Self {
        ServerMessage::Error { code: "decode_fail".to_string(), detail }
    }

    /// Frames the per-connection outgoing queue may shed under overflow.
    /// Finals and errors always survive.
    pub fn is_droppable(&self) -> bool {
        matches!(self, ServerMessage::Status { .. } | ServerMessage::Interim { .. })
    }

    /// Drop order under overflow: status frames first, then interims.
    pub fn drop_priority(&self) -> u8 {
        match self {
            ServerMessage::Status { .. } => 0,
            ServerMessage::Interim { .. } => 1,
            _ => u8::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_fills_defaults() {
        let msg = parse_client_message(r#"{"op":"start"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Start { sample_rate: 16_000, lang: "auto".into() });
    }

    #[test]
    fn audio_frame_round_trips() {
        let msg = parse_client_message(r#"{"op":"audio","payload":"AAAA"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Audio { payload } if payload == "AAAA"));
    }

    #[test]
    fn unknown_op_is_distinguished_from_bad_json() {
        match parse_client_message(r#"{"op":"pause"}"#) {
            Err(ProtocolError::UnknownOp(op)) => assert_eq!(op, "pause"),
            other => panic!("expected UnknownOp, got {other:?}"),
        }
        assert!(matches!(
            parse_client_message("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn server_frames_serialize_with_type_tag() {
        let conn = Uuid::nil();
        let json = serde_json::to_string(&ServerMessage::Interim {
            conn,
            text: "hello".into(),
            stable_chars: 3,
            t0: 0.0,
            t1: 1.5,
        })
        .unwrap();
        assert!(json.contains(r#""type":"interim""#));
        assert!(json.contains(r#""stable_chars":3"#));

        let status = serde_json::to_string(&ServerMessage::Status {
            backpressure: BackpressureLevel::High,
            cooldown_ms: 370,
            tail_s: 3.5,
            interim_paused: false,
        })
        .unwrap();
        assert!(status.contains(r#""backpressure":"high""#));
    }

    #[test]
    fn drop_priorities_protect_finals() {
        let status = ServerMessage::Status {
            backpressure: BackpressureLevel::Normal,
            cooldown_ms: 220,
            tail_s: 7.0,
            interim_paused: false,
        };
        let fin = ServerMessage::Final {
            conn: Uuid::nil(),
            text: "x".into(),
            segments: vec![],
            language: None,
            t0: 0.0,
            t1: 1.0,
        };
        assert!(status.is_droppable());
        assert!(!fin.is_droppable());
        assert!(status.drop_priority() < fin.drop_priority());
    }
}
