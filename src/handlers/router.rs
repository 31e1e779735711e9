use super::call::{CallAcceptedHandler, EndCallHandler, IncomingCallHandler, LocalIdHandler};
use super::traits::RelayEventHandler;
use crate::calls::CallManager;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Central router for dispatching relay events to their handlers.
///
/// Registered once per client; calls never add or remove listeners.
pub struct EventRouter {
    /// Map of event name -> handler for fast lookups
    handlers: HashMap<&'static str, Arc<dyn RelayEventHandler>>,
}

impl EventRouter {
    /// Create a new empty router.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Router with a handler for every inbound call event.
    pub fn with_call_handlers() -> Self {
        let mut router = Self::new();
        router.register(Arc::new(LocalIdHandler));
        router.register(Arc::new(IncomingCallHandler));
        router.register(Arc::new(CallAcceptedHandler));
        router.register(Arc::new(EndCallHandler));
        router
    }

    /// Register a handler for its event.
    ///
    /// # Panics
    /// Panics if a handler is already registered for the same event, or if
    /// the event is never received from the relay.
    pub fn register(&mut self, handler: Arc<dyn RelayEventHandler>) {
        let event = handler.event();
        if !event.is_inbound() {
            panic!("Event '{}' is never received from the relay", event);
        }
        if self.handlers.insert(event.name(), handler).is_some() {
            panic!("Handler for event '{}' already registered", event);
        }
    }

    /// Dispatch a relay event to its handler.
    ///
    /// Returns `true` if a handler was found and accepted the payload.
    pub async fn dispatch(&self, calls: &CallManager, event: &str, payload: Value) -> bool {
        if let Some(handler) = self.handlers.get(event) {
            handler.handle(calls, payload).await
        } else {
            debug!("No handler for relay event '{event}'");
            false
        }
    }

    /// Get the number of registered handlers (useful for testing).
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
