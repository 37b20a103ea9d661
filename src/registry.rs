//! Subscription registry: message kind → ordered handler list.
//!
//! DESIGN
//! ======
//! One registry per connection manager (and therefore per signed-in
//! session), never a process-wide singleton. Handlers are identified by the
//! [`HandlerId`] handed out at registration, so `off` removes exactly one
//! handler and leaves every other handler for the same kind untouched.
//!
//! Consumers normally hold a [`Subscription`] guard instead of calling `off`
//! themselves: dropping the guard unregisters synchronously, so a consumer
//! that has gone away can never be invoked again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use frames::{Message, MessageKind};

/// Callback invoked with each decoded message of the subscribed kind.
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Identity of one registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<MessageKind, Vec<(HandlerId, Handler)>>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<MessageKind, Vec<(HandlerId, Handler)>>> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register `handler` for `kind`. Handlers run in registration order.
    pub fn on(&self, kind: MessageKind, handler: impl Fn(&Message) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().entry(kind).or_default().push((id, Arc::new(handler)));
        id
    }

    /// Remove exactly the registration `id` under `kind`. Returns whether it existed.
    pub fn off(&self, kind: &MessageKind, id: HandlerId) -> bool {
        let mut entries = self.entries();
        let Some(handlers) = entries.get_mut(kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            entries.remove(kind);
        }
        removed
    }

    /// Snapshot of handlers for `kind`, in registration order.
    ///
    /// The lock is released before the caller invokes anything, so handlers
    /// may register or unregister while running.
    #[must_use]
    pub fn handlers(&self, kind: &MessageKind) -> Vec<Handler> {
        self.entries()
            .get(kind)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn handler_count(&self, kind: &MessageKind) -> usize {
        self.entries().get(kind).map_or(0, Vec::len)
    }

    /// Drop every registration. Used when the session ends.
    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Register `handler` and return a guard that unregisters it on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        kind: MessageKind,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.on(kind.clone(), handler);
        Subscription { registry: Arc::downgrade(self), kind, id }
    }
}

/// Registration bound to a consumer's lifetime.
#[must_use = "dropping a Subscription unregisters its handler immediately"]
pub struct Subscription {
    registry: Weak<SubscriptionRegistry>,
    kind: MessageKind,
    id: HandlerId,
}

impl Subscription {
    #[must_use]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.off(&self.kind, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("kind", &self.kind).field("id", &self.id).finish()
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
