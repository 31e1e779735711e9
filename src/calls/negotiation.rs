//! Seam between the call state machine and the offer/answer primitive.
//!
//! A [`Negotiator`] is created per call attempt with a fixed [`CallRole`].
//! Its asynchronous results (local description ready, remote stream ready,
//! failure) are reported through a [`NegotiationSink`] tagged with the attempt
//! they belong to, so results from a torn-down attempt can be recognised and
//! dropped.

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::sync::mpsc;

use super::media::MediaStream;
use super::signaling::SessionDescription;
use super::state::CallRole;

/// Identifies one call attempt (one Session instance).
pub type AttemptId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("invalid remote description: {0}")]
    InvalidDescription(String),

    #[error("negotiator already destroyed")]
    Closed,

    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    /// Local offer or answer is ready to be sent to the peer.
    LocalDescription(SessionDescription),
    /// Remote media arrived (may be reported again as tracks are added).
    RemoteStream(MediaStream),
    /// Opaque failure; the attempt will not reach Connected by itself.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct NegotiationUpdate {
    pub attempt: AttemptId,
    pub event: NegotiationEvent,
}

/// Callback handle given to a negotiator at creation.
#[derive(Debug, Clone)]
pub struct NegotiationSink {
    attempt: AttemptId,
    tx: mpsc::UnboundedSender<NegotiationUpdate>,
}

impl NegotiationSink {
    pub fn new(attempt: AttemptId, tx: mpsc::UnboundedSender<NegotiationUpdate>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn local_description(&self, description: SessionDescription) {
        self.emit(NegotiationEvent::LocalDescription(description));
    }

    pub fn remote_stream(&self, stream: MediaStream) {
        self.emit(NegotiationEvent::RemoteStream(stream));
    }

    pub fn failed(&self, reason: impl Into<String>) {
        self.emit(NegotiationEvent::Failed(reason.into()));
    }

    fn emit(&self, event: NegotiationEvent) {
        let update = NegotiationUpdate {
            attempt: self.attempt,
            event,
        };
        if self.tx.send(update).is_err() {
            debug!(
                "Dropping negotiation update for attempt {}: call manager is gone",
                self.attempt
            );
        }
    }
}

/// One offer/answer exchange.
#[async_trait]
pub trait Negotiator: Send + Sync {
    fn role(&self) -> CallRole;

    /// Feed the remote description. A description the backend cannot apply
    /// is rejected here; later results (answer, remote media, connection
    /// failure) are reported through the sink.
    async fn signal(&self, remote: SessionDescription) -> Result<(), NegotiationError>;

    /// Release all resources. Called on every exit path from a call.
    async fn destroy(&self);
}

#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    /// Create a negotiator. An initiator starts producing its offer right away.
    async fn create(
        &self,
        role: CallRole,
        local_stream: Option<MediaStream>,
        events: NegotiationSink,
    ) -> Result<Box<dyn Negotiator>, NegotiationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sink_tags_updates_with_attempt() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = NegotiationSink::new(7, tx);

        sink.local_description(SessionDescription::new(json!({"type": "offer"})));
        sink.failed("ice failed");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.attempt, 7);
        assert!(matches!(first.event, NegotiationEvent::LocalDescription(_)));

        let second = rx.try_recv().unwrap();
        assert!(matches!(second.event, NegotiationEvent::Failed(ref r) if r == "ice failed"));
    }

    #[test]
    fn test_sink_survives_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = NegotiationSink::new(1, tx);
        sink.failed("nobody listening");
        assert_eq!(sink.attempt(), 1);
    }
}
