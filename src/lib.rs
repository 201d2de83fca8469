//! Client core for a chat product backend.
//!
//! ARCHITECTURE
//! ============
//! - [`session`]: authenticated HTTP with single-flight token refresh and
//!   FIFO replay of requests that hit an expired token.
//! - [`chat`]: STOMP chat channel per room, SockJS primary transport with a
//!   raw WebSocket fallback, outbound queueing and reconnect.
//! - [`config`]: environment-driven settings for both.
//!
//! Both components share one [`session::TokenStore`]; the chat channel reads
//! the current access token at every connect.

pub mod chat;
pub mod config;
pub mod session;

pub use chat::{ChannelState, ChatChannel, ChatError, ChatHandler};
pub use config::{ChatConfig, ClientConfig};
pub use session::{ApiRequest, ApiResponse, SessionClient, SessionError, TokenStore};
