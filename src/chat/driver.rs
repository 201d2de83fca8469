//! Driver task: STOMP session, fallback race, reconnect loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use stomp::{Command, Decoder, Frame, HeartBeat, Item};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::transport::{Connector, TransportEvent, TransportHandle, TransportKind};
use super::types::{
    ChatMessage, MarkRead, READ_DESTINATION, ReadReceipt, RoomId, SEND_DESTINATION, SendMessage,
    message_topic, read_topic,
};
use super::{ChannelState, ChatError, ChatHandler};
use crate::config::ChatConfig;
use crate::session::{TokenKey, TokenStore};

const ACCEPT_VERSION: &str = "1.2,1.1,1.0";
const MESSAGE_SUBSCRIPTION: &str = "sub-0";
const READ_SUBSCRIPTION: &str = "sub-1";

/// One publish job, queued or sent.
#[derive(Clone, Debug)]
pub(crate) enum Publish {
    Message(SendMessage),
    Read(MarkRead),
}

impl Publish {
    fn destination(&self) -> &'static str {
        match self {
            Self::Message(_) => SEND_DESTINATION,
            Self::Read(_) => READ_DESTINATION,
        }
    }

    fn body(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Message(message) => serde_json::to_string(message),
            Self::Read(read) => serde_json::to_string(read),
        }
    }
}

/// Shutdown latch shared by a channel and one driver activation.
///
/// The driver publishes state and runs callbacks while holding the lock, so
/// once [`Gate::close`] returns nothing from that activation is observable.
/// Callbacks must not call `deactivate` on their own channel.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    closed: Mutex<bool>,
}

impl Gate {
    /// Run `f` unless the gate is closed.
    fn pass(&self, f: impl FnOnce()) {
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if !*closed {
            f();
        }
    }

    /// Close the gate and run `f` under the lock.
    pub(crate) fn close(&self, f: impl FnOnce()) {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        *closed = true;
        f();
    }
}

pub(crate) struct Driver {
    pub(crate) room_id: RoomId,
    pub(crate) config: ChatConfig,
    pub(crate) tokens: Arc<dyn TokenStore>,
    pub(crate) handler: Arc<dyn ChatHandler>,
    pub(crate) primary: Arc<dyn Connector>,
    pub(crate) fallback: Arc<dyn Connector>,
    pub(crate) state: Arc<watch::Sender<ChannelState>>,
    pub(crate) gate: Arc<Gate>,
    pub(crate) commands: mpsc::UnboundedReceiver<Publish>,
    pub(crate) outbound: VecDeque<Publish>,
}

/// Why a connection attempt ended.
enum End {
    FallbackDue,
    Closed { was_connected: bool },
    Shutdown,
}

/// Per-connection state.
struct Link {
    handle: TransportHandle,
    kind: TransportKind,
    decoder: Decoder,
    connected: bool,
    heart_beat: HeartBeat,
    ticker: Option<Interval>,
    last_inbound: Instant,
    /// Attempt is abandoned if `CONNECTED` has not arrived by then.
    connect_by: Instant,
}

impl Driver {
    pub(crate) async fn run(mut self) {
        let mut kind = TransportKind::Primary;
        let mut fallback_at = Some(Instant::now() + self.config.fallback_timeout);

        loop {
            let connector = match kind {
                TransportKind::Primary => Arc::clone(&self.primary),
                TransportKind::Fallback => Arc::clone(&self.fallback),
            };
            self.set_state(ChannelState::Connecting(kind));
            tracing::info!(room_id = self.room_id, transport = %kind, url = connector.url(), "chat connecting");

            let link = Link {
                handle: connector.open(),
                kind,
                decoder: Decoder::new(),
                connected: false,
                heart_beat: HeartBeat::default(),
                ticker: None,
                last_inbound: Instant::now(),
                connect_by: Instant::now() + self.config.fallback_timeout,
            };

            let end = match self.session(link, &mut fallback_at).await {
                End::Closed { was_connected } => {
                    if was_connected {
                        self.set_state(ChannelState::Disconnected);
                        self.notify(|handler| handler.on_disconnected());
                    }
                    self.pause(fallback_at).await
                }
                end => end,
            };

            match end {
                End::Shutdown => return,
                End::FallbackDue => {
                    tracing::warn!(
                        room_id = self.room_id,
                        timeout_ms = u64::try_from(self.config.fallback_timeout.as_millis()).unwrap_or(u64::MAX),
                        "primary transport did not connect in time; switching to fallback"
                    );
                    kind = TransportKind::Fallback;
                    fallback_at = None;
                }
                End::Closed { .. } => {}
            }
        }
    }

    /// Drive one connection until it closes, the fallback deadline passes,
    /// or the channel goes away.
    async fn session(&mut self, mut link: Link, fallback_at: &mut Option<Instant>) -> End {
        loop {
            let deadline = *fallback_at;
            let silence = link
                .heart_beat
                .expect_every()
                .map(|every| link.last_inbound + every * 2);

            tokio::select! {
                biased;

                event = link.handle.next_event() => {
                    let Some(event) = event else {
                        return End::Closed { was_connected: link.connected };
                    };
                    if let Some(end) = self.on_event(&mut link, event, fallback_at).await {
                        return end;
                    }
                }
                command = self.commands.recv() => {
                    let Some(job) = command else {
                        return End::Shutdown;
                    };
                    if link.connected {
                        self.publish(&link, job);
                    } else {
                        self.enqueue(job);
                    }
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() && !link.connected =>
                {
                    link.handle.close();
                    return End::FallbackDue;
                }
                () = tokio::time::sleep_until(link.connect_by), if !link.connected => {
                    tracing::warn!(room_id = self.room_id, transport = %link.kind, "chat connect attempt timed out; retrying");
                    link.handle.close();
                    return End::Closed { was_connected: false };
                }
                () = tick(&mut link.ticker), if link.connected => {
                    link.handle.send("\n".to_owned());
                }
                () = tokio::time::sleep_until(silence.unwrap_or_else(Instant::now)),
                    if link.connected && silence.is_some() =>
                {
                    tracing::warn!(room_id = self.room_id, transport = %link.kind, "no inbound data within heart-beat window; closing");
                    link.handle.close();
                    return End::Closed { was_connected: true };
                }
            }
        }
    }

    async fn on_event(
        &mut self,
        link: &mut Link,
        event: TransportEvent,
        fallback_at: &mut Option<Instant>,
    ) -> Option<End> {
        match event {
            TransportEvent::Open => {
                let connect = self.connect_frame().await;
                link.handle.send(stomp::encode_frame(&connect));
                None
            }
            TransportEvent::Text(text) => {
                link.last_inbound = Instant::now();
                link.decoder.push(&text);
                while let Some(item) = link.decoder.next_item() {
                    match item {
                        Ok(Item::HeartBeat) => {}
                        Ok(Item::Frame(frame)) => self.on_frame(link, frame, fallback_at),
                        Err(error) => {
                            tracing::warn!(room_id = self.room_id, %error, "discarding undecodable stomp data");
                            self.notify(|handler| handler.on_error(&ChatError::Codec(error)));
                        }
                    }
                }
                None
            }
            TransportEvent::Error(message) => {
                tracing::warn!(room_id = self.room_id, transport = %link.kind, %message, "chat transport error");
                let error = ChatError::Transport {
                    kind: link.kind,
                    message,
                };
                self.notify(|handler| handler.on_error(&error));
                None
            }
            TransportEvent::Closed { code, reason } => {
                tracing::info!(room_id = self.room_id, transport = %link.kind, ?code, %reason, "chat transport closed");
                Some(End::Closed {
                    was_connected: link.connected,
                })
            }
        }
    }

    fn on_frame(&mut self, link: &mut Link, frame: Frame, fallback_at: &mut Option<Instant>) {
        match frame.command {
            Command::Connected if !link.connected => {
                *fallback_at = None;
                link.connected = true;
                link.heart_beat = self
                    .config
                    .heart_beat
                    .negotiate(HeartBeat::parse(frame.header("heart-beat")));
                link.ticker = link.heart_beat.send_every().map(heartbeat_interval);

                self.subscribe(link);
                self.flush(link);
                self.set_state(ChannelState::Connected(link.kind));
                tracing::info!(
                    room_id = self.room_id,
                    transport = %link.kind,
                    version = frame.header("version").unwrap_or("1.0"),
                    "chat connected"
                );
                self.notify(|handler| handler.on_connected());
            }
            Command::Message => self.dispatch(&frame),
            Command::Error => {
                let message = frame
                    .header("message")
                    .map_or_else(|| frame.body.clone(), ToOwned::to_owned);
                tracing::warn!(room_id = self.room_id, %message, "broker sent ERROR frame");
                self.notify(|handler| handler.on_error(&ChatError::Broker { message }));
            }
            command => {
                tracing::debug!(room_id = self.room_id, %command, "ignoring stomp frame");
            }
        }
    }

    fn dispatch(&self, frame: &Frame) {
        let destination = frame.header("destination").unwrap_or_default();
        let subscription = frame.header("subscription");
        let is_message = subscription == Some(MESSAGE_SUBSCRIPTION)
            || (subscription.is_none() && destination == message_topic(self.room_id));
        let is_read = subscription == Some(READ_SUBSCRIPTION)
            || (subscription.is_none() && destination == read_topic(self.room_id));

        if is_message {
            match serde_json::from_str::<ChatMessage>(&frame.body) {
                Ok(message) => self.notify(|handler| handler.on_message(message)),
                Err(source) => self.malformed(destination, source),
            }
        } else if is_read {
            match serde_json::from_str::<ReadReceipt>(&frame.body) {
                Ok(receipt) => self.notify(|handler| handler.on_read_update(receipt)),
                Err(source) => self.malformed(destination, source),
            }
        } else {
            tracing::debug!(room_id = self.room_id, destination, "message for unknown subscription");
        }
    }

    fn malformed(&self, destination: &str, source: serde_json::Error) {
        tracing::warn!(room_id = self.room_id, destination, %source, "malformed chat payload");
        let error = ChatError::Malformed {
            destination: destination.to_owned(),
            source,
        };
        self.notify(|handler| handler.on_error(&error));
    }

    async fn connect_frame(&self) -> Frame {
        let frame = Frame::new(Command::Connect)
            .with_header("accept-version", ACCEPT_VERSION)
            .with_header("heart-beat", self.config.heart_beat.to_header());
        match self.tokens.get(TokenKey::Access).await {
            Ok(Some(token)) => frame.with_header("Authorization", format!("Bearer {token}")),
            Ok(None) => frame,
            Err(error) => {
                tracing::warn!(room_id = self.room_id, %error, "could not read access token for chat connect");
                frame
            }
        }
    }

    fn subscribe(&self, link: &Link) {
        for (id, destination) in [
            (MESSAGE_SUBSCRIPTION, message_topic(self.room_id)),
            (READ_SUBSCRIPTION, read_topic(self.room_id)),
        ] {
            let frame = Frame::new(Command::Subscribe)
                .with_header("id", id)
                .with_header("destination", destination)
                .with_header("ack", "auto");
            link.handle.send(stomp::encode_frame(&frame));
        }
    }

    fn flush(&mut self, link: &Link) {
        let queued = self.outbound.len();
        while let Some(job) = self.outbound.pop_front() {
            if let Err(job) = self.try_publish(link, job) {
                self.outbound.push_front(job);
                break;
            }
        }
        if queued > 0 {
            tracing::debug!(room_id = self.room_id, queued, remaining = self.outbound.len(), "flushed outbound queue");
        }
    }

    fn publish(&mut self, link: &Link, job: Publish) {
        if let Err(job) = self.try_publish(link, job) {
            self.enqueue(job);
        }
    }

    /// Send `job` on `link`; hands the job back if the transport is gone.
    fn try_publish(&self, link: &Link, job: Publish) -> Result<(), Publish> {
        let body = match job.body() {
            Ok(body) => body,
            Err(error) => {
                self.notify(|handler| handler.on_error(&ChatError::Encode(error)));
                return Ok(());
            }
        };
        let frame = Frame::new(Command::Send)
            .with_header("destination", job.destination())
            .with_header("content-type", "application/json")
            .with_body(body);
        if link.handle.send(stomp::encode_frame(&frame)) {
            Ok(())
        } else {
            Err(job)
        }
    }

    fn enqueue(&mut self, job: Publish) {
        let limit = self.config.outbound_queue_limit;
        if self.outbound.len() >= limit {
            tracing::warn!(room_id = self.room_id, limit, "outbound queue full; dropping publish");
            self.notify(|handler| handler.on_error(&ChatError::QueueFull { limit }));
            return;
        }
        self.outbound.push_back(job);
    }

    /// Wait out the reconnect delay while still accepting publishes.
    async fn pause(&mut self, fallback_at: Option<Instant>) -> End {
        let resume = tokio::time::sleep(self.config.reconnect_delay);
        tokio::pin!(resume);
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(job) => self.enqueue(job),
                    None => return End::Shutdown,
                },
                () = tokio::time::sleep_until(fallback_at.unwrap_or_else(Instant::now)),
                    if fallback_at.is_some() => return End::FallbackDue,
                () = &mut resume => return End::Closed { was_connected: false },
            }
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.gate.pass(|| {
            self.state.send_replace(state);
        });
    }

    fn notify(&self, f: impl FnOnce(&dyn ChatHandler)) {
        self.gate.pass(|| f(self.handler.as_ref()));
    }
}

fn heartbeat_interval(every: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
