//! Shared envelope model and JSON codec for the realtime channel.
//!
//! Every frame on the wire is `{ "type", "payload", "timestamp" }`. This crate
//! owns that envelope plus a typed view over the message kinds the ERP client
//! understands. Kinds it does not know decode to [`Message::Unrecognized`]
//! so a newer server never breaks an older client.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Error returned by [`decode_frame`] and [`Message::from_envelope`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text is not a JSON object with a string `type` field.
    #[error("failed to decode frame envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    /// The envelope names a known kind but its payload does not match that kind's schema.
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// KINDS
// =============================================================================

/// Message type tag. Used as the subscription key in the client registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Notification,
    DashboardUpdate,
    ChatMessage,
    TypingIndicator,
    RecordLock,
    RecordUnlock,
    Ping,
    /// Any type string the client has no schema for.
    Other(String),
}

impl MessageKind {
    /// Every kind with a typed payload, in wire-name order.
    pub const KNOWN: [MessageKind; 7] = [
        MessageKind::Notification,
        MessageKind::DashboardUpdate,
        MessageKind::ChatMessage,
        MessageKind::TypingIndicator,
        MessageKind::RecordLock,
        MessageKind::RecordUnlock,
        MessageKind::Ping,
    ];

    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Notification => "notification",
            Self::DashboardUpdate => "dashboard_update",
            Self::ChatMessage => "chat_message",
            Self::TypingIndicator => "typing_indicator",
            Self::RecordLock => "record_lock",
            Self::RecordUnlock => "record_unlock",
            Self::Ping => "ping",
            Self::Other(name) => name,
        }
    }

    /// Map a wire name onto a kind. Never fails.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "notification" => Self::Notification,
            "dashboard_update" => Self::DashboardUpdate,
            "chat_message" => Self::ChatMessage,
            "typing_indicator" => Self::TypingIndicator,
            "record_lock" => Self::RecordLock,
            "record_unlock" => Self::RecordUnlock,
            "ping" | "keepalive" => Self::Ping,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Push notification as broadcast by the notification service.
///
/// Field names vary between the list endpoint and the push path, hence the aliases.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "body")]
    pub message: String,
    #[serde(default, rename = "type", alias = "notification_type")]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default, alias = "action_url")]
    pub link: Option<String>,
    #[serde(default, alias = "read")]
    pub is_read: bool,
    #[serde(default, alias = "timestamp")]
    pub created_at: Option<String>,
}

/// File attached to a chat message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub id: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub original_name: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub file_category: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub url: String,
}

/// A chat message pushed to conversation participants.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_username: String,
    /// Message body. Either plain text or a JSON-encoded structured body.
    #[serde(default)]
    pub encrypted_content: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub sender_public_key_id: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
}

/// Typing state for one user in one conversation.
///
/// Outbound frames leave `user_id` empty; the server stamps the sender.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TypingIndicatorPayload {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    pub is_typing: bool,
}

/// Advisory edit lock on one ERP record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLockPayload {
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_email: String,
}

impl RecordLockPayload {
    /// Whether this lock targets the given entity.
    #[must_use]
    pub fn is_for(&self, entity_type: &str, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Raw wire envelope. Payload stays untyped until [`Message::from_envelope`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: String,
}

/// Typed view over one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Notification(NotificationPayload),
    DashboardUpdate(Value),
    ChatMessage(ChatMessagePayload),
    TypingIndicator(TypingIndicatorPayload),
    RecordLock(RecordLockPayload),
    RecordUnlock(RecordLockPayload),
    Ping,
    Unrecognized { kind: String, payload: Value },
}

impl Message {
    /// Subscription key for this message.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Notification(_) => MessageKind::Notification,
            Self::DashboardUpdate(_) => MessageKind::DashboardUpdate,
            Self::ChatMessage(_) => MessageKind::ChatMessage,
            Self::TypingIndicator(_) => MessageKind::TypingIndicator,
            Self::RecordLock(_) => MessageKind::RecordLock,
            Self::RecordUnlock(_) => MessageKind::RecordUnlock,
            Self::Ping => MessageKind::Ping,
            Self::Unrecognized { kind, .. } => MessageKind::Other(kind.clone()),
        }
    }

    /// Interpret an envelope's payload according to its `type`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Payload`] when a known kind carries a payload
    /// that does not fit its schema.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, CodecError> {
        let Envelope { kind, payload, .. } = envelope;
        match MessageKind::parse(&kind) {
            MessageKind::Notification => typed(payload, "notification").map(Self::Notification),
            MessageKind::DashboardUpdate => Ok(Self::DashboardUpdate(payload)),
            MessageKind::ChatMessage => typed(payload, "chat_message").map(Self::ChatMessage),
            MessageKind::TypingIndicator => typed(payload, "typing_indicator").map(Self::TypingIndicator),
            MessageKind::RecordLock => typed(payload, "record_lock").map(Self::RecordLock),
            MessageKind::RecordUnlock => typed(payload, "record_unlock").map(Self::RecordUnlock),
            MessageKind::Ping => Ok(Self::Ping),
            MessageKind::Other(_) => Ok(Self::Unrecognized { kind, payload }),
        }
    }

    /// Build the wire envelope for this message with the given timestamp.
    #[must_use]
    pub fn to_envelope(&self, timestamp: impl Into<String>) -> Envelope {
        let payload = match self {
            Self::Notification(p) => to_value(p),
            Self::DashboardUpdate(v) | Self::Unrecognized { payload: v, .. } => v.clone(),
            Self::ChatMessage(p) => to_value(p),
            Self::TypingIndicator(p) => to_value(p),
            Self::RecordLock(p) | Self::RecordUnlock(p) => to_value(p),
            Self::Ping => Value::Object(Map::new()),
        };
        Envelope { kind: self.kind().as_str().to_owned(), payload, timestamp: timestamp.into() }
    }
}

/// A null payload is treated as an empty object so all-default schemas still decode.
fn typed<T: DeserializeOwned>(payload: Value, kind: &'static str) -> Result<T, CodecError> {
    let payload = if payload.is_null() { Value::Object(Map::new()) } else { payload };
    serde_json::from_value(payload).map_err(|source| CodecError::Payload { kind, source })
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    // Payload structs are plain string/number/bool maps; serialization cannot fail.
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

// =============================================================================
// CODEC
// =============================================================================

/// Current UTC time as an RFC 3339 string.
#[must_use]
pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// Parse raw text into an untyped envelope.
///
/// # Errors
///
/// Returns [`CodecError::Envelope`] for text that is not a JSON envelope.
pub fn decode_envelope(text: &str) -> Result<Envelope, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Parse raw text into a typed message.
///
/// # Errors
///
/// Returns [`CodecError::Envelope`] for malformed JSON and
/// [`CodecError::Payload`] for a known kind with a mismatched payload.
pub fn decode_frame(text: &str) -> Result<Message, CodecError> {
    Message::from_envelope(decode_envelope(text)?)
}

/// Encode a message stamped with the current time.
#[must_use]
pub fn encode_frame(message: &Message) -> String {
    encode_frame_at(message, now_timestamp())
}

/// Encode a message with an explicit timestamp.
#[must_use]
pub fn encode_frame_at(message: &Message, timestamp: impl Into<String>) -> String {
    let envelope = message.to_envelope(timestamp);
    // Envelope fields are a string, a JSON value and a string; serialization cannot fail.
    serde_json::to_string(&envelope).unwrap_or_default()
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
