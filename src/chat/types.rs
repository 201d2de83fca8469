//! Chat payloads and STOMP destinations.
//!
//! Wire names are camelCase. Ids are numeric on the wire; incoming ids are
//! also accepted as numeric strings.

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub type RoomId = i64;
pub type UserId = i64;
pub type MessageId = i64;

/// Publish destination for chat messages.
pub const SEND_DESTINATION: &str = "/app/chat.send";
/// Publish destination for read receipts.
pub const READ_DESTINATION: &str = "/app/chat.read";

/// Topic carrying a room's chat messages.
#[must_use]
pub fn message_topic(room_id: RoomId) -> String {
    format!("/topic/messages/{room_id}")
}

/// Topic carrying a room's read receipts.
#[must_use]
pub fn read_topic(room_id: RoomId) -> String {
    format!("/topic/messages/read/{room_id}")
}

/// A message delivered on the room's message topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(deserialize_with = "numeric_id")]
    pub id: MessageId,
    #[serde(deserialize_with = "numeric_id")]
    pub room_id: RoomId,
    #[serde(deserialize_with = "numeric_id")]
    pub sender_id: UserId,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub client_msg_id: Option<String>,
}

/// A receipt delivered on the room's read topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(deserialize_with = "numeric_id")]
    pub room_id: RoomId,
    #[serde(deserialize_with = "numeric_id")]
    pub user_id: UserId,
    #[serde(deserialize_with = "numeric_id", alias = "lastReadMessageId")]
    pub up_to_id: MessageId,
    #[serde(default)]
    pub read_at: Option<String>,
}

/// Content of an outgoing message, independent of room and sender.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageBody {
    pub message: Option<String>,
    pub image_url: Option<String>,
    pub client_msg_id: Option<String>,
    pub created_at: Option<String>,
}

impl MessageBody {
    /// Text message with a fresh idempotency id.
    #[must_use]
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            client_msg_id: Some(Uuid::new_v4().to_string()),
            ..Self::default()
        }
    }

    /// Image message with a fresh idempotency id.
    #[must_use]
    pub fn image(image_url: impl Into<String>) -> Self {
        Self {
            image_url: Some(image_url.into()),
            client_msg_id: Some(Uuid::new_v4().to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: impl Into<String>) -> Self {
        self.created_at = Some(created_at.into());
        self
    }
}

/// Body published to [`SEND_DESTINATION`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl SendMessage {
    #[must_use]
    pub fn new(room_id: RoomId, sender_id: UserId, body: MessageBody) -> Self {
        Self {
            room_id,
            sender_id,
            message: body.message,
            image_url: body.image_url,
            client_msg_id: body.client_msg_id,
            created_at: body.created_at,
        }
    }
}

/// Body published to [`READ_DESTINATION`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRead {
    pub room_id: RoomId,
    pub user_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub up_to_id: Option<MessageId>,
}

/// Parse an id typed by a user or read from a route parameter.
///
/// # Errors
///
/// Returns the parse error when `raw` is not an integer.
pub fn parse_id(raw: &str) -> Result<i64, std::num::ParseIntError> {
    raw.trim().parse()
}

fn numeric_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(id) => Ok(id),
        Raw::Text(text) => parse_id(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
