use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event produced by the relay channel.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// The channel joined the relay and can send.
    Connected,
    /// A named event arrived from the relay.
    Message { event: String, payload: Value },
    /// The connection was lost. The channel may come back with a new identity.
    Disconnected,
}

/// Bidirectional, ordered message channel to the relay server.
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Emits a named event. Fire-and-forget: no acknowledgement is awaited.
    async fn send(&self, event: &str, payload: Value) -> Result<(), anyhow::Error>;

    /// Drops the current connection and dials again, yielding a new identity.
    async fn reconnect(&self) -> Result<(), anyhow::Error>;

    /// Closes the channel for good.
    async fn disconnect(&self);
}

/// A factory responsible for creating relay channels.
#[async_trait]
pub trait RelayChannelFactory: Send + Sync {
    /// Creates a channel and returns it along with its stream of events.
    async fn create_channel(
        &self,
    ) -> Result<(Arc<dyn RelayChannel>, mpsc::Receiver<RelayEvent>), anyhow::Error>;
}
