//! Raw WebSocket transport (the fallback connection).

use super::transport::{Connector, Framing, TransportHandle, TransportKind, spawn_socket};
use crate::config::to_ws_scheme;

/// Dials a plain WebSocket endpoint; STOMP text travels unwrapped.
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: to_ws_scheme(&url.into()),
        }
    }
}

impl Connector for WebSocketConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Fallback
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn open(&self) -> TransportHandle {
        spawn_socket(self.url.clone(), Framing::Raw)
    }
}
