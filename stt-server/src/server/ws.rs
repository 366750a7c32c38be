//! WebSocket transport adapter.
//!
//! One task per socket. Before `start` only control traffic matters and
//! replies go straight out on the sink. Once a session exists, a `select!`
//! loop multiplexes incoming frames with the connection's outgoing queue,
//! so everything the client sees is serialized in arrival order. Protocol
//! errors are answered with `error` frames and never terminate the
//! session; only transport close does.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace};

use crate::error::ProtocolError;
use crate::runtime::Runtime;
use crate::server::messages::{parse_client_message, ClientMessage, ServerMessage};
use crate::server::session::Session;

pub async fn ws_handler(State(runtime): State<Arc<Runtime>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, runtime))
}

async fn handle_socket(socket: WebSocket, runtime: Arc<Runtime>) {
    let (mut sink, mut stream) = socket.split();
    let mut session: Option<Session> = None;

    'conn: loop {
        let Some(current) = session.as_ref() else {
            // No session yet: await the `start` op; anything else is an
            // error answered directly on the sink.
            let Some(Ok(msg)) = stream.next().await else { break };
            match msg {
                Message::Text(text) => match handle_prestart(&text, &runtime) {
                    Ok(opened) => session = Some(opened),
                    Err(err) => {
                        if send_frame(&mut sink, &ServerMessage::error(&err)).await.is_err() {
                            break;
                        }
                    }
                },
                Message::Binary(_) => {
                    let err = ServerMessage::error(&ProtocolError::NotStarted);
                    if send_frame(&mut sink, &err).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                // Pings are answered by the websocket layer itself.
                Message::Ping(_) | Message::Pong(_) => {}
            }
            continue;
        };

        tokio::select! {
            frame = current.conn().outgoing.pop() => {
                match frame {
                    Some(msg) => {
                        if send_frame(&mut sink, &msg).await.is_err() {
                            // Transport closed mid-send: drop silently.
                            break 'conn;
                        }
                    }
                    None => break 'conn,
                }
            }
            incoming = stream.next() => {
                let Some(Ok(msg)) = incoming else { break 'conn };
                match msg {
                    Message::Text(text) => {
                        if let Err(err) = handle_control(&text, current, &runtime) {
                            current.conn().outgoing.push(ServerMessage::error(&err));
                        }
                    }
                    Message::Binary(bytes) => {
                        trace!(
                            "conn {}: {} audio bytes (binary frame)",
                            current.conn().short_id(),
                            bytes.len()
                        );
                        if let Err(err) = current.on_audio(&bytes) {
                            current.conn().outgoing.push(ServerMessage::error(&err));
                        }
                    }
                    Message::Close(_) => break 'conn,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    if let Some(session) = session {
        debug!("conn {}: transport closed", session.conn().short_id());
        session.close();
    }
}

fn handle_prestart(text: &str, runtime: &Arc<Runtime>) -> Result<Session, ProtocolError> {
    match parse_client_message(text)? {
        ClientMessage::Start { sample_rate, lang } => {
            Ok(Session::open(runtime.clone(), lang, sample_rate))
        }
        ClientMessage::Audio { .. } | ClientMessage::Stop => Err(ProtocolError::NotStarted),
    }
}

fn handle_control(
    text: &str,
    session: &Session,
    runtime: &Arc<Runtime>,
) -> Result<(), ProtocolError> {
    match parse_client_message(text)? {
        ClientMessage::Start { .. } => {
            // Duplicate start: re-acknowledge, keep the session as is.
            session
                .conn()
                .outgoing
                .push(ServerMessage::status(&runtime.backpressure()));
            Ok(())
        }
        ClientMessage::Audio { payload } => {
            let raw = BASE64
                .decode(payload.as_bytes())
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
            trace!("conn {}: {} audio bytes (text frame)", session.conn().short_id(), raw.len());
            session.on_audio(&raw)
        }
        ClientMessage::Stop => session.on_stop(),
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).unwrap_or_else(|e| {
        // Serialization of our own closed types cannot fail; keep the
        // session alive regardless.
        format!(r#"{{"type":"error","code":"internal","detail":"{e}"}}"#)
    });
    sink.send(Message::Text(json)).await
}
