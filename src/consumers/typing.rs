//! Typing indicator consumer with per-user expiry.
//!
//! DESIGN
//! ======
//! `is_typing = true` records the user against a conversation and starts an
//! expiry task that clears the entry after `typing_expiry` unless renewed.
//! Each entry carries a generation number and a child of the tracker's root
//! `CancellationToken`; a renewal cancels the old task and bumps the
//! generation, so a late-firing task never clears a fresher entry.
//! `is_typing = false` clears at once. Dropping the tracker cancels the root
//! token and with it every pending expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frames::{Message, MessageKind, TypingIndicatorPayload};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::registry::Subscription;

struct Entry {
    conversation_id: String,
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct TypingState {
    users: HashMap<String, Entry>,
    next_generation: u64,
}

struct Shared {
    expiry: Duration,
    root: CancellationToken,
    state: Mutex<TypingState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, TypingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(self: &Arc<Self>, payload: &TypingIndicatorPayload) {
        if payload.user_id.is_empty() {
            debug!("typing indicator without user id ignored");
            return;
        }
        if !payload.is_typing {
            if let Some(entry) = self.state().users.remove(&payload.user_id) {
                entry.cancel.cancel();
            }
            return;
        }

        let cancel = self.root.child_token();
        let generation = {
            let mut state = self.state();
            state.next_generation += 1;
            let generation = state.next_generation;
            let previous = state.users.insert(
                payload.user_id.clone(),
                Entry { conversation_id: payload.conversation_id.clone(), generation, cancel: cancel.clone() },
            );
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
            generation
        };

        let Ok(handle) = Handle::try_current() else {
            debug!("no runtime; typing expiry not scheduled");
            return;
        };
        let shared = Arc::clone(self);
        let user_id = payload.user_id.clone();
        handle.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(shared.expiry) => shared.expire(&user_id, generation),
            }
        });
    }

    fn expire(&self, user_id: &str, generation: u64) {
        let mut state = self.state();
        if state.users.get(user_id).is_some_and(|e| e.generation == generation) {
            state.users.remove(user_id);
            debug!(user_id, "typing indicator expired");
        }
    }
}

pub struct TypingTracker {
    shared: Arc<Shared>,
    _subscription: Subscription,
}

impl TypingTracker {
    pub fn mount(manager: &ConnectionManager) -> Self {
        let shared = Arc::new(Shared {
            expiry: manager.config().typing_expiry,
            root: CancellationToken::new(),
            state: Mutex::new(TypingState::default()),
        });
        let handler_shared = Arc::clone(&shared);
        let subscription = manager.subscribe(MessageKind::TypingIndicator, move |msg| {
            if let Message::TypingIndicator(payload) = msg {
                handler_shared.apply(payload);
            }
        });
        Self { shared, _subscription: subscription }
    }

    #[must_use]
    pub fn is_typing(&self, user_id: &str) -> bool {
        self.shared.state().users.contains_key(user_id)
    }

    /// Users currently typing in `conversation_id`, sorted.
    #[must_use]
    pub fn typing_in(&self, conversation_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .shared
            .state()
            .users
            .iter()
            .filter(|(_, e)| e.conversation_id == conversation_id)
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        self.shared.root.cancel();
    }
}

/// Tell the other participants whether the current user is typing.
/// Returns `false` when the socket is not open.
pub fn send_typing(manager: &ConnectionManager, conversation_id: &str, is_typing: bool) -> bool {
    manager.send(&Message::TypingIndicator(TypingIndicatorPayload {
        conversation_id: conversation_id.to_owned(),
        user_id: String::new(),
        is_typing,
    }))
}

#[cfg(test)]
#[path = "typing_test.rs"]
mod tests;
