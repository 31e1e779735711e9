//! One-to-one call signaling.
//!
//! A call is set up by exchanging two opaque descriptions (offer and answer)
//! through a relay server; media then flows between the peers directly.
//!
//! # Architecture
//!
//! - [`SignalingEvent`] / [`InboundSignal`] / [`OutboundSignal`]: the five
//!   relay events and their payloads
//! - [`Session`] & [`CallState`]: the single call and its state machine
//! - [`Negotiator`] / [`NegotiatorFactory`]: seam to the offer/answer primitive
//! - [`MediaSource`] / [`MediaStream`]: seam to local capture
//! - [`CallManager`]: applies user intents, relay messages and negotiator
//!   callbacks to the session
//!
//! # Protocol Overview
//!
//! ```text
//! caller                      relay                       callee
//!   | callUser{userToCall,..}   |                            |
//!   |-------------------------->| callUser{from,signal,name} |
//!   |                           |--------------------------->|
//!   |                           |      answerCall{signal,to} |
//!   |     callAccepted{signal}  |<---------------------------|
//!   |<--------------------------|                            |
//!   |          endCall{id}      |          endCall           |
//!   |-------------------------->|--------------------------->|
//! ```

mod error;
mod manager;
pub mod media;
mod negotiation;
mod signaling;
mod state;


pub use error::CallError;
pub use manager::{CallManager, CallManagerConfig, CallSnapshot, RemoteEndPolicy};
pub use media::{
    MediaConstraints, MediaError, MediaKind, MediaSource, MediaStream, MediaTrack, NoMediaSource,
    StaticMediaSource,
};
pub use negotiation::{
    AttemptId, NegotiationError, NegotiationEvent, NegotiationSink, NegotiationUpdate, Negotiator,
    NegotiatorFactory,
};
pub use signaling::{
    AnswerCallRequest, CallUserRequest, EndCallRequest, EventDirection, IncomingCall,
    InboundSignal, OutboundSignal, SessionDescription, SignalingEvent,
};
pub use state::{
    CallRole, CallState, CallStateKind, CallTransition, EndReason, InvalidTransition, Session,
};
