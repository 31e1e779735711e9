//! Call-related error types.

use thiserror::Error;

use super::media::MediaError;
use super::negotiation::NegotiationError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("please enter your name before calling")]
    MissingName,

    #[error("please enter another user's id to call")]
    MissingTarget,

    #[error("no relay identity assigned yet")]
    NotConnected,

    #[error("display name is locked for the current call")]
    DisplayNameLocked,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("media unavailable: {0}")]
    Media(String),

    #[error("relay channel error: {0}")]
    Relay(String),

    #[error("unknown signaling event: {0}")]
    UnknownEvent(String),

    #[error("unexpected inbound signaling event: {0}")]
    UnexpectedEvent(&'static str),

    #[error("malformed {event} payload: {reason}")]
    MalformedPayload { event: &'static str, reason: String },
}

impl CallError {
    /// Validation errors are raised before any side effect and are fixed by
    /// correcting user input.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::MissingName | Self::MissingTarget)
    }
}

impl From<NegotiationError> for CallError {
    fn from(err: NegotiationError) -> Self {
        Self::Negotiation(err.to_string())
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        Self::Media(err.to_string())
    }
}
