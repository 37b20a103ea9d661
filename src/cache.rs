//! Client-side query cache: hierarchical keys with prefix invalidation.
//!
//! DESIGN
//! ======
//! Entries are JSON values keyed by a path of string segments, e.g.
//! `["messaging", "conversations"]`. `invalidate(prefix)` marks every entry
//! under the prefix stale and broadcasts the prefix, so refetchers listening
//! on `subscribe_invalidations()` know which queries to pull again. Stale
//! entries keep their last value until they are `set` again.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

const INVALIDATION_CAPACITY: usize = 64;

// =============================================================================
// KEYS
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// True when `prefix`'s segments are a leading run of this key's.
    #[must_use]
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Keys for the queries the realtime consumers touch.
pub mod keys {
    use super::QueryKey;

    #[must_use]
    pub fn conversations() -> QueryKey {
        QueryKey::new(["messaging", "conversations"])
    }

    #[must_use]
    pub fn messages(conversation_id: &str) -> QueryKey {
        QueryKey::new(["messaging", "messages", conversation_id])
    }

    #[must_use]
    pub fn unread_messages() -> QueryKey {
        QueryKey::new(["messaging", "unread-count"])
    }

    #[must_use]
    pub fn notifications() -> QueryKey {
        QueryKey::new(["notifications"])
    }

    #[must_use]
    pub fn notification_list() -> QueryKey {
        QueryKey::new(["notifications", "list"])
    }

    #[must_use]
    pub fn notification_unread() -> QueryKey {
        QueryKey::new(["notifications", "unread-count"])
    }

    #[must_use]
    pub fn action_items() -> QueryKey {
        QueryKey::new(["action-items"])
    }
}

// =============================================================================
// CACHE
// =============================================================================

struct Entry {
    value: Value,
    stale: bool,
}

pub struct QueryCache {
    entries: Mutex<HashMap<QueryKey, Entry>>,
    invalidations: broadcast::Sender<QueryKey>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    #[must_use]
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_CAPACITY);
        Self { entries: Mutex::new(HashMap::new()), invalidations }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<QueryKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a freshly fetched value.
    pub fn set(&self, key: QueryKey, value: Value) {
        self.entries().insert(key, Entry { value, stale: false });
    }

    #[must_use]
    pub fn get(&self, key: &QueryKey) -> Option<Value> {
        self.entries().get(key).map(|e| e.value.clone())
    }

    /// Missing entries count as stale.
    #[must_use]
    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.entries().get(key).is_none_or(|e| e.stale)
    }

    /// Mark every entry under `prefix` stale and notify refetchers.
    /// Returns the number of cached entries marked.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let marked = {
            let mut entries = self.entries();
            let mut marked = 0;
            for (_, entry) in entries.iter_mut().filter(|(key, _)| key.starts_with(prefix)) {
                entry.stale = true;
                marked += 1;
            }
            marked
        };
        let listeners = self.invalidations.send(prefix.clone()).unwrap_or(0);
        debug!(%prefix, marked, listeners, "query cache invalidated");
        marked
    }

    /// Receive every prefix passed to `invalidate` after this call.
    #[must_use]
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<QueryKey> {
        self.invalidations.subscribe()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod tests;
