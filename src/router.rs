//! Message router: decode inbound text frames and fan them out.
//!
//! Malformed frames are dropped here with a debug log. They never reach a
//! handler and never affect the connection or the registry.

use std::sync::Arc;

use frames::Message;
use tracing::debug;

use crate::registry::SubscriptionRegistry;

#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<SubscriptionRegistry>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// Decode one frame and invoke every handler for its kind.
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, text: &str) -> usize {
        match frames::decode_frame(text) {
            Ok(message) => self.dispatch_message(&message),
            Err(e) => {
                debug!(error = %e, "discarding malformed frame");
                0
            }
        }
    }

    /// Invoke every handler registered for `message`'s kind, in registration order.
    pub fn dispatch_message(&self, message: &Message) -> usize {
        let kind = message.kind();
        let handlers = self.registry.handlers(&kind);
        if handlers.is_empty() {
            debug!(%kind, "no handlers for frame");
            return 0;
        }
        for handler in &handlers {
            handler(message);
        }
        handlers.len()
    }
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
