use crate::calls::{CallManager, SignalingEvent};
use async_trait::async_trait;
use serde_json::Value;

/// Trait for handling one named event received from the relay.
///
/// Each handler owns exactly one [`SignalingEvent`]. Handlers decode the
/// payload and hand the typed result to the call manager; business rules
/// live in the manager.
#[async_trait]
pub trait RelayEventHandler: Send + Sync {
    /// The event this handler is responsible for.
    fn event(&self) -> SignalingEvent;

    /// Handle the payload.
    ///
    /// Returns `true` if the payload was well-formed and passed on.
    async fn handle(&self, calls: &CallManager, payload: Value) -> bool;
}
