use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};

use crate::calls::{CallError, CallManager, MediaSource, NegotiationUpdate, NegotiatorFactory};
use crate::config::ClientConfig;
use crate::handlers::EventRouter;
use crate::transport::{RelayChannel, RelayChannelFactory, RelayEvent};
use crate::types::events::EventBus;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("relay connection failed: {0}")]
    Relay(anyhow::Error),
    #[error(transparent)]
    Call(#[from] CallError),
}

/// Event streams consumed by [`Client::run`].
pub struct ClientEvents {
    relay: mpsc::Receiver<RelayEvent>,
    negotiation: mpsc::UnboundedReceiver<NegotiationUpdate>,
}

/// Wires the relay channel, the call manager and the media source together.
pub struct Client {
    config: ClientConfig,
    relay: Arc<dyn RelayChannel>,
    calls: Arc<CallManager>,
    media: Arc<dyn MediaSource>,
    router: EventRouter,
    is_running: AtomicBool,
    shutdown_notifier: Notify,
}

impl Client {
    /// Opens the relay channel and builds an Idle client around it.
    ///
    /// Nothing is processed until [`Client::run`] is polled with the returned
    /// events.
    pub async fn connect(
        config: ClientConfig,
        relays: &dyn RelayChannelFactory,
        negotiators: Arc<dyn NegotiatorFactory>,
        media: Arc<dyn MediaSource>,
    ) -> Result<(Arc<Self>, ClientEvents), ClientError> {
        let (relay, relay_events) = relays.create_channel().await.map_err(ClientError::Relay)?;
        let event_bus = Arc::new(EventBus::new());
        let (calls, negotiation) =
            CallManager::new(config.calls.clone(), relay.clone(), negotiators, event_bus);

        if let Some(name) = &config.display_name {
            calls.set_display_name(name).await?;
        }

        let client = Arc::new(Self {
            config,
            relay,
            calls,
            media,
            router: EventRouter::with_call_handlers(),
            is_running: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),
        });
        let events = ClientEvents {
            relay: relay_events,
            negotiation,
        };
        Ok((client, events))
    }

    pub fn calls(&self) -> &Arc<CallManager> {
        &self.calls
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        self.calls.event_bus()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Asks the media source for the local stream once.
    ///
    /// A failure is recorded as the last error and the client carries on
    /// without a local stream; calls still work, they just send no media.
    pub async fn acquire_local_media(&self) -> bool {
        match self.media.acquire(self.config.media).await {
            Ok(stream) => {
                info!(
                    "Local media ready: {} track(s) on stream {}",
                    stream.tracks().len(),
                    stream.id()
                );
                self.calls.set_local_stream(Some(stream)).await;
                true
            }
            Err(e) => {
                warn!("Local media unavailable: {e}");
                self.calls.record_error(e.into()).await;
                false
            }
        }
    }

    /// Processes relay events and negotiator callbacks until the relay
    /// closes or [`Client::disconnect`] is called.
    pub async fn run(self: &Arc<Self>, events: ClientEvents) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("Client `run` method called while already running.");
            return;
        }
        let ClientEvents {
            relay: mut relay_events,
            mut negotiation,
        } = events;

        info!(target: "Client", "Starting event loop");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_notifier.notified() => {
                    info!(target: "Client", "Shutdown signaled. Exiting event loop.");
                    break;
                }
                event = relay_events.recv() => match event {
                    Some(event) => self.handle_relay_event(event).await,
                    None => {
                        info!(target: "Client", "Relay channel closed. Exiting event loop.");
                        break;
                    }
                },
                Some(update) = negotiation.recv() => {
                    self.calls.handle_negotiation_update(update).await;
                }
            }
        }
        self.is_running.store(false, Ordering::SeqCst);
    }

    async fn handle_relay_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::Connected => self.calls.handle_relay_connected().await,
            RelayEvent::Message { event, payload } => {
                if !self.router.dispatch(&self.calls, &event, payload).await {
                    debug!(target: "Client", "Relay event '{event}' was not handled");
                }
            }
            RelayEvent::Disconnected => self.calls.handle_relay_disconnected().await,
        }
    }

    /// Hangs up any active call, closes the relay channel and stops the
    /// event loop.
    pub async fn disconnect(&self) {
        info!("Disconnecting client intentionally.");
        if !self.calls.current_state().await.is_idle() {
            if let Err(e) = self.calls.hang_up().await {
                warn!("Hang up during disconnect failed: {e}");
            }
        }
        self.relay.disconnect().await;
        self.shutdown_notifier.notify_one();
    }
}
