//! Realtime client for the Malaka ERP push channel.
//!
//! DESIGN
//! ======
//! One [`ConnectionManager`] per signed-in session owns the socket and a
//! [`SubscriptionRegistry`]. Inbound text frames go through the
//! [`MessageRouter`] to every handler registered for the frame's kind.
//! Feature consumers in [`consumers`] subscribe on mount and unsubscribe on
//! drop. The REST endpoints in [`api`] back up the push channel for state
//! that must not be lost when frames are missed; [`refetch`] polls them and
//! refreshes whatever the consumers invalidate in the [`QueryCache`].
//!
//! Wire types live in the `frames` crate and are re-exported here.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod connection;
pub mod consumers;
pub mod refetch;
pub mod registry;
pub mod router;

#[cfg(test)]
mod test_support;

pub use api::{ActionItemSummary, ApiError, Backstop, RestClient};
pub use auth::{FileTokenStore, MemoryTokenStore, TokenError, TokenStore};
pub use cache::{QueryCache, QueryKey};
pub use config::RealtimeConfig;
pub use connection::{ConnectOutcome, ConnectionManager, ConnectionState, LifecycleEvent, UrlError};
pub use frames::{Message, MessageKind};
pub use refetch::{BackstopQuery, BackstopRefetcher};
pub use registry::{HandlerId, Subscription, SubscriptionRegistry};
pub use router::MessageRouter;
