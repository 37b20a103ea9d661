//! Record lock consumer: advisory "someone else is editing" state.
//!
//! LIFECYCLE
//! =========
//! 1. `mount` with a non-empty entity id announces `record_lock`
//! 2. Lock/unlock frames from other sessions for the same entity update
//!    `locked_by`; frames from the current user are ignored
//! 3. Connection drops clear `locked_by`; every re-open re-announces the lock
//! 4. Drop announces `record_unlock` and stops the state watcher
//!
//! Locks are never enforced here. Nothing prevents two users from saving.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use frames::{Message, MessageKind, RecordLockPayload};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::registry::Subscription;

/// Identity of the signed-in user, stamped on outbound lock frames.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: String,
    pub email: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockHolder {
    pub user_id: String,
    pub user_email: String,
}

struct Shared {
    entity_type: String,
    entity_id: String,
    user: CurrentUser,
    holder: Mutex<Option<LockHolder>>,
}

impl Shared {
    fn holder(&self) -> MutexGuard<'_, Option<LockHolder>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn payload(&self) -> RecordLockPayload {
        RecordLockPayload {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            user_id: self.user.id.clone(),
            user_email: self.user.email.clone(),
        }
    }

    /// Whether a frame is about this record and came from another session.
    fn concerns_us(&self, p: &RecordLockPayload) -> bool {
        if !p.is_for(&self.entity_type, &self.entity_id) {
            return false;
        }
        if p.user_id == self.user.id {
            debug!(entity_id = %p.entity_id, "own lock frame ignored");
            return false;
        }
        true
    }

    fn on_lock(&self, p: &RecordLockPayload) {
        if self.concerns_us(p) {
            info!(entity_type = %p.entity_type, entity_id = %p.entity_id, by = %p.user_email, "record locked by another user");
            *self.holder() = Some(LockHolder { user_id: p.user_id.clone(), user_email: p.user_email.clone() });
        }
    }

    fn on_unlock(&self, p: &RecordLockPayload) {
        if self.concerns_us(p) {
            self.holder().take();
        }
    }
}

pub struct RecordLockWatch {
    manager: ConnectionManager,
    shared: Arc<Shared>,
    active: bool,
    watcher: CancellationToken,
    _subscriptions: Vec<Subscription>,
}

impl RecordLockWatch {
    /// Start watching `entity_type`/`entity_id`. With no id (a record not yet
    /// saved) nothing is announced or watched.
    pub fn mount(manager: &ConnectionManager, entity_type: &str, entity_id: Option<&str>, user: CurrentUser) -> Self {
        let entity_id = entity_id.map(str::trim).unwrap_or_default();
        let shared = Arc::new(Shared {
            entity_type: entity_type.to_owned(),
            entity_id: entity_id.to_owned(),
            user,
            holder: Mutex::new(None),
        });
        let active = !entity_id.is_empty();
        let watcher = CancellationToken::new();
        let mut subscriptions = Vec::new();

        if active {
            let lock_shared = Arc::clone(&shared);
            subscriptions.push(manager.subscribe(MessageKind::RecordLock, move |msg| {
                if let Message::RecordLock(p) = msg {
                    lock_shared.on_lock(p);
                }
            }));
            let unlock_shared = Arc::clone(&shared);
            subscriptions.push(manager.subscribe(MessageKind::RecordUnlock, move |msg| {
                if let Message::RecordUnlock(p) = msg {
                    unlock_shared.on_unlock(p);
                }
            }));

            manager.send(&Message::RecordLock(shared.payload()));
            spawn_state_watcher(manager, &shared, watcher.clone());
        }

        Self { manager: manager.clone(), shared, active, watcher, _subscriptions: subscriptions }
    }

    #[must_use]
    pub fn is_locked_by_other(&self) -> bool {
        self.shared.holder().is_some()
    }

    #[must_use]
    pub fn locked_by(&self) -> Option<LockHolder> {
        self.shared.holder().clone()
    }
}

impl Drop for RecordLockWatch {
    fn drop(&mut self) {
        self.watcher.cancel();
        if self.active {
            self.manager.send(&Message::RecordUnlock(self.shared.payload()));
        }
    }
}

fn spawn_state_watcher(manager: &ConnectionManager, shared: &Arc<Shared>, cancel: CancellationToken) {
    let Ok(handle) = Handle::try_current() else {
        debug!("no runtime; record lock will not follow reconnects");
        return;
    };
    let manager = manager.clone();
    let shared = Arc::clone(shared);
    let mut states = manager.watch_state();
    handle.spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    match state {
                        ConnectionState::Connected => {
                            manager.send(&Message::RecordLock(shared.payload()));
                        }
                        ConnectionState::Disconnected => {
                            shared.holder().take();
                        }
                        ConnectionState::Connecting | ConnectionState::Reconnecting => {}
                    }
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "record_lock_test.rs"]
mod tests;
