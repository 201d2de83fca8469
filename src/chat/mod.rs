//! Realtime chat channel for one room.
//!
//! DESIGN
//! ======
//! A [`ChatChannel`] owns one driver task per activation. The driver holds the
//! state machine, the outbound queue and the live transport; the channel talks
//! to it over an unbounded command channel, so publishes keep issuance order
//! whether they are sent straight away or queued until `Connected`.
//!
//! CONNECT SEQUENCE
//! ================
//! `activate()` dials the primary (SockJS) transport and arms the fallback
//! deadline. Reaching STOMP `CONNECTED` first cancels the deadline; otherwise
//! the primary is dropped and the raw WebSocket fallback is dialed. Transport
//! events are polled ahead of the deadline, so a `CONNECTED` that is already
//! waiting when the deadline fires still wins.
//!
//! Once connected the driver subscribes to the room topics, flushes queued
//! jobs in order, then calls [`ChatHandler::on_connected`]. A closed socket
//! moves the channel to `Disconnected` and schedules a reconnect on the same
//! transport after a fixed delay. Every attempt, reconnects included, is
//! abandoned and retried if `CONNECTED` does not arrive within the fallback
//! timeout.

mod driver;
pub mod sockjs;
pub mod transport;
pub mod types;
pub mod websocket;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ChatConfig;
use crate::session::TokenStore;

pub use sockjs::SockJsConnector;
pub use transport::{
    Connector, TransportError, TransportEvent, TransportHandle, TransportKind, TransportPeer,
};
pub use types::{
    ChatMessage, MarkRead, MessageBody, MessageId, READ_DESTINATION, ReadReceipt, RoomId,
    SEND_DESTINATION, SendMessage, UserId, message_topic, read_topic,
};
pub use websocket::WebSocketConnector;

use driver::{Driver, Gate, Publish};

/// Errors reported through [`ChatHandler::on_error`]. None of them stop the channel.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{kind} transport error: {message}")]
    Transport { kind: TransportKind, message: String },
    #[error("broker error: {message}")]
    Broker { message: String },
    #[error("malformed payload on {destination}: {source}")]
    Malformed {
        destination: String,
        source: serde_json::Error,
    },
    #[error("stomp decode failed: {0}")]
    Codec(#[from] stomp::CodecError),
    #[error("outbound queue full ({limit} jobs); publish dropped")]
    QueueFull { limit: usize },
    #[error("failed to encode publish body: {0}")]
    Encode(serde_json::Error),
}

/// Callbacks invoked on the driver task, in delivery order.
///
/// Every method has an empty default so implementors pick what they need.
/// A callback must not deactivate its own channel.
pub trait ChatHandler: Send + Sync {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_message(&self, _message: ChatMessage) {}
    fn on_read_update(&self, _receipt: ReadReceipt) {}
    fn on_error(&self, _error: &ChatError) {}
}

/// Lifecycle of a [`ChatChannel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting(TransportKind),
    Connected(TransportKind),
    Disconnected,
}

/// A STOMP chat channel scoped to one room.
pub struct ChatChannel {
    room_id: RoomId,
    config: ChatConfig,
    tokens: Arc<dyn TokenStore>,
    handler: Arc<dyn ChatHandler>,
    primary: Arc<dyn Connector>,
    fallback: Arc<dyn Connector>,
    commands: mpsc::UnboundedSender<Publish>,
    pending: Option<mpsc::UnboundedReceiver<Publish>>,
    state: Arc<watch::Sender<ChannelState>>,
    gate: Arc<Gate>,
    driver: Option<JoinHandle<()>>,
}

impl ChatChannel {
    /// Channel using the SockJS primary at `config.ws_url` and the raw
    /// WebSocket fallback at `config.resolved_fallback_url()`.
    #[must_use]
    pub fn new(
        room_id: RoomId,
        config: ChatConfig,
        tokens: Arc<dyn TokenStore>,
        handler: Arc<dyn ChatHandler>,
    ) -> Self {
        let primary = Arc::new(SockJsConnector::new(config.ws_url.clone()));
        let fallback = Arc::new(WebSocketConnector::new(config.resolved_fallback_url()));
        Self::with_connectors(room_id, config, tokens, handler, primary, fallback)
    }

    /// Channel with explicit transports.
    #[must_use]
    pub fn with_connectors(
        room_id: RoomId,
        config: ChatConfig,
        tokens: Arc<dyn TokenStore>,
        handler: Arc<dyn ChatHandler>,
        primary: Arc<dyn Connector>,
        fallback: Arc<dyn Connector>,
    ) -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Idle);
        Self {
            room_id,
            config,
            tokens,
            handler,
            primary,
            fallback,
            commands,
            pending: Some(pending),
            state: Arc::new(state),
            gate: Arc::new(Gate::default()),
            driver: None,
        }
    }

    #[must_use]
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Start connecting. A no-op while already active.
    ///
    /// Must be called within a tokio runtime.
    pub fn activate(&mut self) {
        if self.driver.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let commands = match self.pending.take() {
            Some(commands) => commands,
            None => self.reset_commands(),
        };

        tracing::info!(room_id = self.room_id, "chat channel activating");
        self.gate = Arc::new(Gate::default());
        let driver = Driver {
            room_id: self.room_id,
            config: self.config.clone(),
            tokens: Arc::clone(&self.tokens),
            handler: Arc::clone(&self.handler),
            primary: Arc::clone(&self.primary),
            fallback: Arc::clone(&self.fallback),
            state: Arc::clone(&self.state),
            gate: Arc::clone(&self.gate),
            commands,
            outbound: std::collections::VecDeque::new(),
        };
        self.driver = Some(tokio::spawn(driver.run()));
    }

    /// Stop the driver and drop the live transport. Idempotent.
    ///
    /// Once this returns the channel stays `Idle` and no callback from the
    /// stopped driver runs; one already in progress finishes first. Jobs
    /// still queued inside the stopped driver are discarded; publishes issued
    /// afterwards wait for the next `activate()`.
    pub fn deactivate(&mut self) {
        let Some(task) = self.driver.take() else {
            return;
        };
        let state = &self.state;
        self.gate.close(|| {
            task.abort();
            state.send_replace(ChannelState::Idle);
        });
        let pending = self.reset_commands();
        self.pending = Some(pending);
        tracing::info!(room_id = self.room_id, "chat channel deactivated");
    }

    /// Publish a chat message now if connected, otherwise queue it.
    pub fn send_message(&self, room_id: RoomId, sender_id: UserId, body: MessageBody) {
        self.submit(Publish::Message(SendMessage::new(room_id, sender_id, body)));
    }

    /// Publish a read receipt now if connected, otherwise queue it.
    pub fn mark_as_read(&self, room_id: RoomId, user_id: UserId, up_to_id: Option<MessageId>) {
        self.submit(Publish::Read(MarkRead {
            room_id,
            user_id,
            up_to_id,
        }));
    }

    fn submit(&self, job: Publish) {
        if self.commands.send(job).is_err() {
            tracing::warn!(room_id = self.room_id, "chat driver gone; publish dropped");
        }
    }

    fn reset_commands(&mut self) -> mpsc::UnboundedReceiver<Publish> {
        let (commands, pending) = mpsc::unbounded_channel();
        self.commands = commands;
        pending
    }
}

impl Drop for ChatChannel {
    fn drop(&mut self) {
        if let Some(task) = self.driver.take() {
            self.gate.close(|| task.abort());
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
