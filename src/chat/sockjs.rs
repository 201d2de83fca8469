//! SockJS WebSocket transport (the primary connection).
//!
//! Only the `websocket` SockJS transport is implemented. The client dials
//! `{base}/{server-id}/{session-id}/websocket` directly and unwraps SockJS
//! framing:
//!
//! - `o` opens the session
//! - `h` is a server heartbeat and carries nothing
//! - `a["..",".."]` is a batch of messages
//! - `m".."` is a single message
//! - `c[code,"reason"]` closes the session
//!
//! Outbound text is sent as a JSON array of strings.

use rand::Rng;
use rand::distr::Alphanumeric;

use super::transport::{Connector, Framing, TransportEvent, TransportHandle, TransportKind, spawn_socket};
use crate::config::to_ws_scheme;

const SESSION_ID_LEN: usize = 8;

/// Opens SockJS sessions against a base endpoint such as `https://host/ws`.
#[derive(Clone, Debug)]
pub struct SockJsConnector {
    base_url: String,
}

impl SockJsConnector {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Connector for SockJsConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Primary
    }

    fn url(&self) -> &str {
        &self.base_url
    }

    fn open(&self) -> TransportHandle {
        spawn_socket(session_url(&self.base_url), Framing::SockJs)
    }
}

/// Per-session WebSocket URL with a fresh server and session id.
#[must_use]
pub fn session_url(base_url: &str) -> String {
    let mut rng = rand::rng();
    let server_id: u16 = rng.random_range(0..1000);
    let session_id: String = (&mut rng)
        .sample_iter(Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect();
    format!(
        "{}/{server_id:03}/{session_id}/websocket",
        to_ws_scheme(base_url.trim_end_matches('/'))
    )
}

/// Wrap outbound payloads as a SockJS message array.
///
/// # Errors
///
/// Returns the `serde_json` error if encoding fails.
pub fn encode_messages(messages: &[String]) -> Result<String, serde_json::Error> {
    serde_json::to_string(messages)
}

/// Translate one SockJS frame into transport events.
#[must_use]
pub fn decode_frame(frame: &str) -> Vec<TransportEvent> {
    let Some(kind) = frame.chars().next() else {
        return Vec::new();
    };
    let rest = &frame[kind.len_utf8()..];
    match kind {
        'o' => vec![TransportEvent::Open],
        'h' => Vec::new(),
        'a' => match serde_json::from_str::<Vec<String>>(rest) {
            Ok(messages) => messages.into_iter().map(TransportEvent::Text).collect(),
            Err(error) => vec![malformed(frame, &error)],
        },
        'm' => match serde_json::from_str::<String>(rest) {
            Ok(message) => vec![TransportEvent::Text(message)],
            Err(error) => vec![malformed(frame, &error)],
        },
        'c' => match serde_json::from_str::<(u16, String)>(rest) {
            Ok((code, reason)) => vec![TransportEvent::Closed {
                code: Some(code),
                reason,
            }],
            Err(error) => vec![
                malformed(frame, &error),
                TransportEvent::Closed {
                    code: None,
                    reason: "malformed close frame".to_owned(),
                },
            ],
        },
        _ => vec![TransportEvent::Error(format!("unknown sockjs frame type {kind:?}"))],
    }
}

fn malformed(frame: &str, error: &serde_json::Error) -> TransportEvent {
    TransportEvent::Error(format!("malformed sockjs frame {frame:?}: {error}"))
}

#[cfg(test)]
#[path = "sockjs_test.rs"]
mod tests;
