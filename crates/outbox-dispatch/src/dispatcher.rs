//! Event dispatcher trait and the in-process handler registry.

use crate::{DispatchResult, DomainEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Dispatches a reconstructed domain event to its consumers.
///
/// Dispatch is synchronous from the caller's point of view: when it returns
/// `Ok`, the event has been handed to every consumer.
pub trait EventDispatcher: Send + Sync {
    fn dispatch(&self, event: &DomainEvent) -> DispatchResult<()>;
}

/// Shared handle to an event dispatcher.
pub type DispatcherHandle = Arc<dyn EventDispatcher>;

/// Handler callback registered for an event type.
pub type HandlerFn = Box<dyn Fn(&DomainEvent) -> DispatchResult<()> + Send + Sync>;

/// In-process dispatcher that fans an event out to handlers registered for
/// its event type.
///
/// Handlers run in registration order; the first error stops the fan-out
/// and fails the dispatch. An event type with no handlers dispatches
/// successfully.
#[derive(Default)]
pub struct EventDispatcherRegistry {
    handlers: HashMap<String, Vec<HandlerFn>>,
}

impl EventDispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event type.
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        handler: impl Fn(&DomainEvent) -> DispatchResult<()> + Send + Sync + 'static,
    ) {
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push(Box::new(handler));
    }
}

impl EventDispatcher for EventDispatcherRegistry {
    fn dispatch(&self, event: &DomainEvent) -> DispatchResult<()> {
        let Some(handlers) = self.handlers.get(&event.event_type) else {
            debug!(event_type = %event.event_type, "No handlers registered for event");
            return Ok(());
        };

        for handler in handlers {
            handler(event)?;
        }

        debug!(
            event_type = %event.event_type,
            handler_count = handlers.len(),
            "Event dispatched"
        );
        Ok(())
    }
}
