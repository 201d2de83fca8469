//! Transport capability shared by the primary and fallback connections.
//!
//! A [`Connector`] opens a connection and hands back a [`TransportHandle`]:
//! an outbound text sender plus an ordered stream of [`TransportEvent`]s. The
//! socket itself lives in a spawned I/O task owned by the handle, so dropping
//! or closing the handle tears the connection down immediately.
//!
//! Transports speak text only. STOMP framing happens above this layer.

use std::fmt;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::sockjs;

/// Which of the two connection strategies a transport implements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// SockJS-framed WebSocket.
    Primary,
    /// Raw WebSocket.
    Fallback,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("sockjs"),
            Self::Fallback => f.write_str("websocket"),
        }
    }
}

/// Something that happened on a transport, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport is ready to carry STOMP frames.
    Open,
    /// One text payload from the server.
    Text(String),
    /// A non-fatal problem; a `Closed` follows if the connection is gone.
    Error(String),
    /// The connection ended. No events follow.
    Closed { code: Option<u16>, reason: String },
}

/// Why a transport gave up or misbehaved.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket connect to {url} failed: {source}")]
    Connect {
        url: String,
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
    #[error("websocket send failed: {0}")]
    Send(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket receive failed: {0}")]
    Receive(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("sockjs encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<TransportError> for TransportEvent {
    fn from(error: TransportError) -> Self {
        Self::Error(error.to_string())
    }
}

/// Opens connections of one [`TransportKind`].
pub trait Connector: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Endpoint this connector dials, for logging.
    fn url(&self) -> &str;

    /// Start connecting. Must be called within a tokio runtime.
    fn open(&self) -> TransportHandle;
}

/// The far side of a [`TransportHandle`]: whoever drives the socket.
#[derive(Debug)]
pub struct TransportPeer {
    /// Text the channel wants written to the socket.
    pub outbound: mpsc::UnboundedReceiver<String>,
    /// Events to report back to the channel.
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportPeer {
    /// Report an event; returns `false` once the handle is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Channel-side end of an open transport.
#[derive(Debug)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    /// A connected handle/peer pair with no I/O task attached.
    #[must_use]
    pub fn channel() -> (Self, TransportPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = Self {
            outbound: outbound_tx,
            events: events_rx,
            task: None,
        };
        let peer = TransportPeer {
            outbound: outbound_rx,
            events: events_tx,
        };
        (handle, peer)
    }

    /// Tie the lifetime of `task` to this handle.
    #[must_use]
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Queue text for the socket; `false` if the transport is gone.
    pub fn send(&self, text: String) -> bool {
        self.outbound.send(text).is_ok()
    }

    /// Next event, or `None` after the peer has gone away.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Tear the connection down now.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events.close();
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// SOCKET PUMP
// =============================================================================

/// How text is wrapped on a particular WebSocket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Framing {
    /// Payloads are STOMP text as-is; the socket is open once the handshake completes.
    Raw,
    /// Payloads are SockJS frames; the socket is open on the server's `o` frame.
    SockJs,
}

/// Spawn the I/O task for `url` and return its handle.
pub(crate) fn spawn_socket(url: String, framing: Framing) -> TransportHandle {
    let (handle, peer) = TransportHandle::channel();
    let task = tokio::spawn(run_socket(url, framing, peer));
    handle.with_task(task)
}

async fn run_socket(url: String, framing: Framing, mut peer: TransportPeer) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(error) => {
            peer.emit(
                TransportError::Connect {
                    url: url.clone(),
                    source: Box::new(error),
                }
                .into(),
            );
            peer.emit(TransportEvent::Closed {
                code: None,
                reason: "connect failed".to_owned(),
            });
            return;
        }
    };
    if framing == Framing::Raw {
        peer.emit(TransportEvent::Open);
    }

    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            outgoing = peer.outbound.recv() => {
                let Some(text) = outgoing else {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                };
                let payload = match framing {
                    Framing::Raw => text,
                    Framing::SockJs => match sockjs::encode_messages(&[text]) {
                        Ok(payload) => payload,
                        Err(error) => {
                            peer.emit(TransportError::from(error).into());
                            continue;
                        }
                    },
                };
                if let Err(error) = write.send(Message::Text(payload.into())).await {
                    let reason = error.to_string();
                    peer.emit(TransportError::Send(Box::new(error)).into());
                    peer.emit(TransportEvent::Closed { code: None, reason });
                    return;
                }
            }
            incoming = read.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_owned()))
                            .unwrap_or((None, String::new()));
                        peer.emit(TransportEvent::Closed { code, reason });
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(error)) => {
                        let reason = error.to_string();
                        peer.emit(TransportError::Receive(Box::new(error)).into());
                        peer.emit(TransportEvent::Closed { code: None, reason });
                        return;
                    }
                    None => {
                        peer.emit(TransportEvent::Closed { code: None, reason: "stream ended".to_owned() });
                        return;
                    }
                };

                let events = match framing {
                    Framing::Raw => vec![TransportEvent::Text(text)],
                    Framing::SockJs => sockjs::decode_frame(&text),
                };
                for event in events {
                    let closed = matches!(event, TransportEvent::Closed { .. });
                    if !peer.emit(event) || closed {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
