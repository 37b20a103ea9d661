//! Consumer hooks: feature adapters over the subscription registry.
//!
//! LIFECYCLE
//! =========
//! Each consumer subscribes in its `mount` constructor and holds the
//! returned [`Subscription`](crate::registry::Subscription) guards. Dropping
//! the consumer removes its handlers and cancels any timers it started, so
//! no handler runs after unmount.
//!
//! ERROR HANDLING
//! ==============
//! Handlers never fail. Payloads that do not fit are skipped with a debug
//! log; backstop REST failures are logged at warn and swallowed.

pub mod chat;
pub mod notifications;
pub mod record_lock;
pub mod typing;
