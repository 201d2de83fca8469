//! Client configuration parsed from environment variables.

use std::time::Duration;

use stomp::HeartBeat;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_FALLBACK_TIMEOUT_MS: u64 = 6_000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
pub const DEFAULT_HEARTBEAT_OUTGOING_MS: u64 = 10_000;
pub const DEFAULT_HEARTBEAT_INCOMING_MS: u64 = 10_000;
pub const DEFAULT_OUTBOUND_QUEUE_LIMIT: usize = 1_000;

/// Top-level configuration for both network components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Origin every API path is resolved against, without trailing slash.
    pub api_base_url: String,
    pub chat: ChatConfig,
}

/// Chat transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// SockJS endpoint, e.g. `http://host/ws`.
    pub ws_url: String,
    /// Raw WebSocket endpoint; derived from `ws_url` when absent.
    pub fallback_url: Option<String>,
    /// How long the primary transport gets to reach `Connected`.
    pub fallback_timeout: Duration,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Heart-beat intervals requested in `CONNECT`.
    pub heart_beat: HeartBeat,
    /// Maximum publish jobs held while not connected.
    pub outbound_queue_limit: usize,
}

impl ClientConfig {
    /// Build config from environment variables.
    ///
    /// - `DUET_API_BASE_URL`: default `http://127.0.0.1:8080`
    /// - `DUET_WS_URL`: default `{DUET_API_BASE_URL}/ws`
    /// - `DUET_FALLBACK_URL`: default derived from `DUET_WS_URL`
    /// - `DUET_FALLBACK_TIMEOUT_MS`: default 6000
    /// - `DUET_RECONNECT_DELAY_MS`: default 5000
    /// - `DUET_HEARTBEAT_OUTGOING_MS` / `DUET_HEARTBEAT_INCOMING_MS`: default 10000
    /// - `DUET_OUTBOUND_QUEUE_LIMIT`: default 1000
    #[must_use]
    pub fn from_env() -> Self {
        let api_base_url = std::env::var("DUET_API_BASE_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_owned());
        let ws_url = std::env::var("DUET_WS_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| default_ws_url(&api_base_url));

        let mut chat = ChatConfig::new(ws_url);
        chat.fallback_url = std::env::var("DUET_FALLBACK_URL")
            .ok()
            .filter(|s| !s.is_empty());
        chat.fallback_timeout = Duration::from_millis(env_parse(
            "DUET_FALLBACK_TIMEOUT_MS",
            DEFAULT_FALLBACK_TIMEOUT_MS,
        ));
        chat.reconnect_delay = Duration::from_millis(env_parse(
            "DUET_RECONNECT_DELAY_MS",
            DEFAULT_RECONNECT_DELAY_MS,
        ));
        chat.heart_beat = HeartBeat::new(
            env_parse("DUET_HEARTBEAT_OUTGOING_MS", DEFAULT_HEARTBEAT_OUTGOING_MS),
            env_parse("DUET_HEARTBEAT_INCOMING_MS", DEFAULT_HEARTBEAT_INCOMING_MS),
        );
        chat.outbound_queue_limit =
            env_parse("DUET_OUTBOUND_QUEUE_LIMIT", DEFAULT_OUTBOUND_QUEUE_LIMIT);

        Self::new(api_base_url, chat)
    }

    #[must_use]
    pub fn new(api_base_url: impl Into<String>, chat: ChatConfig) -> Self {
        Self {
            api_base_url: api_base_url.into().trim_end_matches('/').to_owned(),
            chat,
        }
    }
}

impl ChatConfig {
    /// Settings for `ws_url` with every other knob at its default.
    #[must_use]
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_owned(),
            fallback_url: None,
            fallback_timeout: Duration::from_millis(DEFAULT_FALLBACK_TIMEOUT_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            heart_beat: HeartBeat::new(DEFAULT_HEARTBEAT_OUTGOING_MS, DEFAULT_HEARTBEAT_INCOMING_MS),
            outbound_queue_limit: DEFAULT_OUTBOUND_QUEUE_LIMIT,
        }
    }

    /// Raw WebSocket endpoint: the configured override, or `ws_url` with the
    /// `http` scheme swapped for `ws` and `/websocket` appended.
    #[must_use]
    pub fn resolved_fallback_url(&self) -> String {
        self.fallback_url
            .clone()
            .unwrap_or_else(|| derive_fallback_url(&self.ws_url))
    }
}

/// `http://h/ws` → `ws://h/ws/websocket`, `https://h/ws` → `wss://h/ws/websocket`.
#[must_use]
pub fn derive_fallback_url(ws_url: &str) -> String {
    let base = ws_url.trim_end_matches('/');
    format!("{}/websocket", to_ws_scheme(base))
}

/// Swap an `http`/`https` scheme for `ws`/`wss`; other URLs pass through.
#[must_use]
pub fn to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        return format!("ws://{rest}");
    }
    if let Some(rest) = url.strip_prefix("https://") {
        return format!("wss://{rest}");
    }
    url.to_owned()
}

fn default_ws_url(api_base_url: &str) -> String {
    format!("{}/ws", api_base_url.trim_end_matches('/'))
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
