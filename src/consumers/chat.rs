//! Chat consumer: appends pushed messages to the open conversation.
//!
//! DESIGN
//! ======
//! Every `chat_message` frame invalidates the conversation list and the
//! unread count, whoever sent it. Frames from the current user are then
//! dropped, since the sender already appended the message optimistically.
//! Anything else is appended only when it belongs to the active
//! conversation, and only once per message id: a push that races an
//! optimistic append or a reload is absorbed.
//!
//! Opening a conversation, and every push appended to it, marks the
//! conversation read on the backstop in the background. Failures are logged
//! and swallowed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use frames::{AttachmentPayload, ChatMessagePayload, Message, MessageKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::api::Backstop;
use crate::cache::{QueryCache, keys};
use crate::connection::ConnectionManager;
use crate::registry::Subscription;

// =============================================================================
// CONTENT
// =============================================================================

/// Link to an ERP record embedded in a message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_color: Option<String>,
    #[serde(default)]
    pub url: String,
}

/// Structured message body. Plain-text bodies carry only `text`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Attachment ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_refs: Vec<EntityRef>,
}

/// Interpret a message body. JSON objects with any of `text`,
/// `attachments` or `entity_refs` are structured; anything else is text.
#[must_use]
pub fn parse_message_content(body: &str) -> MessageContent {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body)
        && ["text", "attachments", "entity_refs"].iter().any(|k| map.contains_key(*k))
    {
        match serde_json::from_value(Value::Object(map)) {
            Ok(content) => return content,
            Err(e) => debug!(error = %e, "structured body did not parse; treating as text"),
        }
    }
    MessageContent { text: Some(body.to_owned()), ..MessageContent::default() }
}

/// Inverse of [`parse_message_content`]. A body with only text stays a
/// plain string.
#[must_use]
pub fn build_message_content(text: Option<&str>, attachments: &[String], entity_refs: &[EntityRef]) -> String {
    if attachments.is_empty() && entity_refs.is_empty() {
        return text.unwrap_or_default().to_owned();
    }
    let content = MessageContent {
        text: text.filter(|t| !t.is_empty()).map(str::to_owned),
        attachments: attachments.to_vec(),
        entity_refs: entity_refs.to_vec(),
    };
    serde_json::to_string(&content).unwrap_or_default()
}

// =============================================================================
// MESSAGES
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub created_at: String,
    pub content: MessageContent,
    pub attachments: Vec<AttachmentPayload>,
}

impl From<&ChatMessagePayload> for ChatMessage {
    fn from(p: &ChatMessagePayload) -> Self {
        Self {
            id: p.message_id.clone(),
            conversation_id: p.conversation_id.clone(),
            sender_id: p.sender_id.clone(),
            sender_username: p.sender_username.clone(),
            created_at: p.created_at.clone(),
            content: parse_message_content(&p.encrypted_content),
            attachments: p.attachments.clone(),
        }
    }
}

#[derive(Default)]
struct ChatState {
    active: Option<String>,
    messages: Vec<ChatMessage>,
    seen: HashSet<String>,
}

impl ChatState {
    fn append(&mut self, message: ChatMessage) -> bool {
        if self.active.as_deref() != Some(message.conversation_id.as_str()) {
            return false;
        }
        if !self.seen.insert(message.id.clone()) {
            debug!(id = %message.id, "duplicate chat message ignored");
            return false;
        }
        self.messages.push(message);
        true
    }
}

struct Shared {
    current_user_id: String,
    cache: Arc<QueryCache>,
    backstop: Arc<dyn Backstop>,
    state: Mutex<ChatState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receive(self: &Arc<Self>, payload: &ChatMessagePayload) {
        self.cache.invalidate(&keys::conversations());
        self.cache.invalidate(&keys::unread_messages());

        if payload.sender_id == self.current_user_id {
            debug!(id = %payload.message_id, "own chat message ignored");
            return;
        }
        let appended = self.state().append(ChatMessage::from(payload));
        if appended {
            self.mark_read(&payload.conversation_id);
        } else {
            self.cache.invalidate(&keys::messages(&payload.conversation_id));
        }
    }

    fn mark_read(self: &Arc<Self>, conversation_id: &str) {
        let Ok(handle) = Handle::try_current() else {
            debug!(conversation_id, "no runtime; mark-read skipped");
            return;
        };
        let shared = Arc::clone(self);
        let conversation_id = conversation_id.to_owned();
        handle.spawn(async move {
            match shared.backstop.mark_conversation_read(&conversation_id).await {
                Ok(()) => {
                    shared.cache.invalidate(&keys::unread_messages());
                }
                Err(e) => warn!(error = %e, %conversation_id, "mark conversation read failed"),
            }
        });
    }
}

// =============================================================================
// FEED
// =============================================================================

pub struct ChatFeed {
    shared: Arc<Shared>,
    _subscription: Subscription,
}

impl ChatFeed {
    pub fn mount(
        manager: &ConnectionManager,
        current_user_id: impl Into<String>,
        cache: Arc<QueryCache>,
        backstop: Arc<dyn Backstop>,
    ) -> Self {
        let shared = Arc::new(Shared {
            current_user_id: current_user_id.into(),
            cache,
            backstop,
            state: Mutex::new(ChatState::default()),
        });
        let handler_shared = Arc::clone(&shared);
        let subscription = manager.subscribe(MessageKind::ChatMessage, move |msg| {
            if let Message::ChatMessage(payload) = msg {
                handler_shared.receive(payload);
            }
        });
        Self { shared, _subscription: subscription }
    }

    /// Make `conversation_id` active with a freshly fetched history and
    /// mark it read.
    pub fn load_conversation(&self, conversation_id: &str, history: Vec<ChatMessage>) {
        {
            let mut state = self.shared.state();
            state.active = Some(conversation_id.to_owned());
            state.messages.clear();
            state.seen.clear();
            for message in history {
                state.append(message);
            }
        }
        self.shared.mark_read(conversation_id);
    }

    pub fn close_conversation(&self) {
        let mut state = self.shared.state();
        state.active = None;
        state.messages.clear();
        state.seen.clear();
    }

    /// Optimistic append of a message the current user just sent.
    /// Returns `false` when it is a duplicate or not for the active conversation.
    pub fn append_local(&self, message: ChatMessage) -> bool {
        self.shared.state().append(message)
    }

    #[must_use]
    pub fn active_conversation(&self) -> Option<String> {
        self.shared.state().active.clone()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.state().messages.clone()
    }
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
