//! Notification consumer: bounded feed with unread counter.
//!
//! A `notification` frame is normalized and prepended; the oldest entries
//! beyond the configured limit are evicted. Every push also triggers a
//! background refetch of the action-item summary, since badge counts are
//! only reliable when polled.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use frames::{Message, MessageKind, NotificationPayload};
use tokio::runtime::Handle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::{ActionItemSummary, ApiError, Backstop};
use crate::connection::ConnectionManager;
use crate::registry::Subscription;

/// A notification with every optional field settled.
#[derive(Clone, Debug, PartialEq)]
pub struct NotificationRecord {
    pub id: String,
    pub title: String,
    pub message: String,
    pub notification_type: String,
    pub priority: String,
    pub link: Option<String>,
    pub is_read: bool,
    pub created_at: String,
}

impl From<NotificationPayload> for NotificationRecord {
    fn from(p: NotificationPayload) -> Self {
        Self {
            id: p.id.filter(|id| !id.is_empty()).unwrap_or_else(|| Uuid::new_v4().to_string()),
            title: p.title,
            message: p.message,
            notification_type: p.notification_type.unwrap_or_else(|| "info".to_owned()),
            priority: p.priority.unwrap_or_else(|| "normal".to_owned()),
            link: p.link.filter(|l| !l.is_empty()),
            is_read: p.is_read,
            created_at: p.created_at.unwrap_or_else(frames::now_timestamp),
        }
    }
}

#[derive(Default)]
struct FeedState {
    items: VecDeque<NotificationRecord>,
    unread: u64,
    action_items: ActionItemSummary,
}

struct Shared {
    backstop: Arc<dyn Backstop>,
    limit: usize,
    state: Mutex<FeedState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receive(self: &Arc<Self>, payload: NotificationPayload) {
        let record = NotificationRecord::from(payload);
        debug!(id = %record.id, kind = %record.notification_type, "notification received");
        {
            let mut state = self.state();
            if !record.is_read {
                state.unread = state.unread.saturating_add(1);
            }
            state.items.push_front(record);
            state.items.truncate(self.limit);
        }

        let Ok(handle) = Handle::try_current() else {
            debug!("no runtime; action-item refetch skipped");
            return;
        };
        let shared = Arc::clone(self);
        handle.spawn(async move {
            if let Err(e) = shared.refresh_action_items().await {
                warn!(error = %e, "action-item refetch failed");
            }
        });
    }

    async fn refresh_action_items(&self) -> Result<(), ApiError> {
        let summary = self.backstop.action_items().await?;
        self.state().action_items = summary;
        Ok(())
    }
}

pub struct NotificationFeed {
    shared: Arc<Shared>,
    _subscription: Subscription,
}

impl NotificationFeed {
    /// Subscribe to `notification` frames. The feed holds at most
    /// `notification_limit` entries from the manager's config.
    pub fn mount(manager: &ConnectionManager, backstop: Arc<dyn Backstop>) -> Self {
        let shared = Arc::new(Shared {
            backstop,
            limit: manager.config().notification_limit.max(1),
            state: Mutex::new(FeedState::default()),
        });
        let handler_shared = Arc::clone(&shared);
        let subscription = manager.subscribe(MessageKind::Notification, move |msg| {
            if let Message::Notification(payload) = msg {
                handler_shared.receive(payload.clone());
            }
        });
        Self { shared, _subscription: subscription }
    }

    /// Replace the feed and unread count with the server's view.
    ///
    /// # Errors
    ///
    /// Returns the first backstop failure; local state is left untouched.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        let items = self.shared.backstop.notifications(self.shared.limit).await?;
        let unread = self.shared.backstop.notification_unread_count().await?;
        let mut state = self.shared.state();
        state.items = items.into_iter().take(self.shared.limit).map(NotificationRecord::from).collect();
        state.unread = unread;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the backstop failure; local state is left untouched.
    pub async fn refresh_action_items(&self) -> Result<(), ApiError> {
        self.shared.refresh_action_items().await
    }

    /// Mark one notification read on the server, then locally.
    ///
    /// # Errors
    ///
    /// Returns the backstop failure; local state is left untouched.
    pub async fn mark_read(&self, id: &str) -> Result<(), ApiError> {
        self.shared.backstop.mark_notification_read(id).await?;
        let mut state = self.shared.state();
        let newly_read = match state.items.iter_mut().find(|n| n.id == id) {
            Some(n) if !n.is_read => {
                n.is_read = true;
                true
            }
            _ => false,
        };
        if newly_read {
            state.unread = state.unread.saturating_sub(1);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the backstop failure; local state is left untouched.
    pub async fn mark_all_read(&self) -> Result<(), ApiError> {
        self.shared.backstop.mark_all_notifications_read().await?;
        let mut state = self.shared.state();
        for n in &mut state.items {
            n.is_read = true;
        }
        state.unread = 0;
        Ok(())
    }

    /// Newest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<NotificationRecord> {
        self.shared.state().items.iter().cloned().collect()
    }

    #[must_use]
    pub fn unread_count(&self) -> u64 {
        self.shared.state().unread
    }

    #[must_use]
    pub fn action_items(&self) -> ActionItemSummary {
        self.shared.state().action_items.clone()
    }
}

#[cfg(test)]
#[path = "notifications_test.rs"]
mod tests;
