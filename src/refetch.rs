//! Backstop refetcher: keeps the polled queries in the [`QueryCache`] fresh.
//!
//! DESIGN
//! ======
//! One background task per cache. It refetches a query when an invalidated
//! prefix covers its key, and refetches every query on a fixed interval.
//! The first tick fires immediately, so a freshly spawned refetcher fills
//! the cache. Results are written back with [`QueryCache::set`].
//!
//! ERROR HANDLING
//! ==============
//! Retryable failures (transport errors, 429, 5xx) are logged at debug and
//! picked up again by the next poll. Anything else is logged at warn. A
//! failed query keeps its last cached value.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ApiError, Backstop};
use crate::cache::{QueryCache, QueryKey, keys};
use crate::config::RealtimeConfig;

/// A REST query the refetcher owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackstopQuery {
    Notifications,
    NotificationUnread,
    MessageUnread,
    ActionItems,
}

impl BackstopQuery {
    pub const ALL: [BackstopQuery; 4] =
        [Self::Notifications, Self::NotificationUnread, Self::MessageUnread, Self::ActionItems];

    /// Cache key the result is stored under. The notification list lives
    /// under a `list` leaf so the unread count is not its descendant.
    #[must_use]
    pub fn key(self) -> QueryKey {
        match self {
            Self::Notifications => keys::notification_list(),
            Self::NotificationUnread => keys::notification_unread(),
            Self::MessageUnread => keys::unread_messages(),
            Self::ActionItems => keys::action_items(),
        }
    }

    /// Queries whose key falls under `prefix`.
    #[must_use]
    pub fn covered_by(prefix: &QueryKey) -> Vec<BackstopQuery> {
        Self::ALL.into_iter().filter(|q| q.key().starts_with(prefix)).collect()
    }

    async fn fetch(self, backstop: &dyn Backstop, limit: usize) -> Result<Value, ApiError> {
        match self {
            Self::Notifications => {
                let items = backstop.notifications(limit).await?;
                Ok(serde_json::to_value(items).unwrap_or(Value::Null))
            }
            Self::NotificationUnread => Ok(Value::from(backstop.notification_unread_count().await?)),
            Self::MessageUnread => Ok(Value::from(backstop.message_unread_count().await?)),
            Self::ActionItems => {
                let summary = backstop.action_items().await?;
                Ok(serde_json::to_value(summary.counts).unwrap_or(Value::Null))
            }
        }
    }
}

/// Handle to the refetch task. Dropping it stops the task.
pub struct BackstopRefetcher {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BackstopRefetcher {
    /// Spawn the refetch task on the current runtime.
    ///
    /// The invalidation subscription is taken before the task starts, so no
    /// invalidation issued after this call is missed.
    #[must_use]
    pub fn spawn(config: &RealtimeConfig, cache: Arc<QueryCache>, backstop: Arc<dyn Backstop>) -> Self {
        let cancel = CancellationToken::new();
        let invalidations = cache.subscribe_invalidations();
        let worker = Worker { cache, backstop, limit: config.notification_limit.max(1) };
        let task = tokio::spawn(worker.run(invalidations, config.backstop_poll_interval, cancel.clone()));
        Self { cancel, task: Some(task) }
    }

    /// Stop polling and wait for an in-flight refetch to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "backstop refetcher ended abnormally");
        }
    }
}

impl Drop for BackstopRefetcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// WORKER
// =============================================================================

struct Worker {
    cache: Arc<QueryCache>,
    backstop: Arc<dyn Backstop>,
    limit: usize,
}

impl Worker {
    async fn run(self, mut invalidations: broadcast::Receiver<QueryKey>, period: Duration, cancel: CancellationToken) {
        let mut poll = tokio::time::interval(period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let due = tokio::select! {
                () = cancel.cancelled() => break,
                _ = poll.tick() => BackstopQuery::ALL.to_vec(),
                received = invalidations.recv() => match received {
                    Ok(prefix) => BackstopQuery::covered_by(&prefix),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "invalidations lagged; refetching everything");
                        BackstopQuery::ALL.to_vec()
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            for query in due {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = self.refetch(query) => {}
                }
            }
        }
    }

    async fn refetch(&self, query: BackstopQuery) {
        match query.fetch(self.backstop.as_ref(), self.limit).await {
            Ok(value) => {
                debug!(?query, "backstop refetched");
                self.cache.set(query.key(), value);
            }
            Err(e) if e.retryable() => debug!(?query, error = %e, "backstop refetch failed; retrying next poll"),
            Err(ApiError::Unauthenticated) => debug!(?query, "backstop refetch skipped: no usable token"),
            Err(e) => warn!(?query, error = %e, "backstop refetch failed"),
        }
    }
}

#[cfg(test)]
#[path = "refetch_test.rs"]
mod tests;
