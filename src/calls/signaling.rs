//! Relay signaling event definitions.
//!
//! Five named events travel over the relay channel. None of them is
//! acknowledged. Payloads are JSON objects with camelCase keys, and the
//! negotiation descriptions inside them are opaque to this crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::CallError;

/// Named events exchanged with the relay server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingEvent {
    /// Server assigns this connection its identifier.
    Me,

    /// Call offer. Sent by the caller, relayed to the callee with the
    /// description renamed to `signal`.
    CallUser,

    /// Callee's answer description, relayed back to the caller.
    CallAccepted,

    /// Callee sends its answer description to the server.
    AnswerCall,

    /// Either party ends the call.
    EndCall,
}

/// Which way an event travels relative to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDirection {
    /// Only ever received.
    Inbound,
    /// Only ever sent.
    Outbound,
    /// Sent by one client and relayed to the other.
    Relayed,
}

impl SignalingEvent {
    pub const ALL: [SignalingEvent; 5] = [
        Self::Me,
        Self::CallUser,
        Self::CallAccepted,
        Self::AnswerCall,
        Self::EndCall,
    ];

    /// Event name on the wire.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Me => "me",
            Self::CallUser => "callUser",
            Self::CallAccepted => "callAccepted",
            Self::AnswerCall => "answerCall",
            Self::EndCall => "endCall",
        }
    }

    pub const fn direction(&self) -> EventDirection {
        match self {
            Self::Me | Self::CallAccepted => EventDirection::Inbound,
            Self::AnswerCall => EventDirection::Outbound,
            Self::CallUser | Self::EndCall => EventDirection::Relayed,
        }
    }

    pub const fn is_inbound(&self) -> bool {
        !matches!(self.direction(), EventDirection::Outbound)
    }
}

impl fmt::Display for SignalingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SignalingEvent {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.name() == s)
            .ok_or_else(|| CallError::UnknownEvent(s.to_string()))
    }
}

/// Opaque negotiation description (offer or answer).
///
/// Stored and forwarded verbatim; only the negotiator interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(Value);

impl SessionDescription {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// The `type` field browsers put on descriptions, if present.
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }
}

/// Outbound `callUser` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallUserRequest {
    pub user_to_call: String,
    pub signal_data: SessionDescription,
    pub from: String,
    pub name: String,
}

/// Inbound `callUser` payload, as relayed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingCall {
    pub from: String,
    pub signal: SessionDescription,
    #[serde(default)]
    pub name: String,
}

/// Outbound `answerCall` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerCallRequest {
    pub signal: SessionDescription,
    pub to: String,
}

/// Outbound `endCall` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndCallRequest {
    pub id: String,
}

/// A decoded message received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    Me(String),
    CallUser(IncomingCall),
    CallAccepted(SessionDescription),
    EndCall { id: Option<String> },
}

impl InboundSignal {
    /// Decode a relay payload for `event`. Only shape is checked here.
    pub fn decode(event: SignalingEvent, payload: Value) -> Result<Self, CallError> {
        match event {
            SignalingEvent::Me => match payload {
                Value::String(id) => Ok(Self::Me(id)),
                Value::Object(ref map) => map
                    .get("id")
                    .and_then(Value::as_str)
                    .map(|id| Self::Me(id.to_string()))
                    .ok_or_else(|| malformed(event, "missing id")),
                other => Err(malformed(event, format!("expected string id, got {other}"))),
            },
            SignalingEvent::CallUser => serde_json::from_value::<IncomingCall>(payload)
                .map(Self::CallUser)
                .map_err(|e| malformed(event, e.to_string())),
            SignalingEvent::CallAccepted => {
                // Relays either wrap the answer in `{signal}` or forward it bare.
                let signal = match payload {
                    Value::Object(mut map) if map.contains_key("signal") => {
                        map.remove("signal").unwrap_or(Value::Null)
                    }
                    other => other,
                };
                if signal.is_null() {
                    return Err(malformed(event, "missing signal"));
                }
                Ok(Self::CallAccepted(SessionDescription::new(signal)))
            }
            SignalingEvent::EndCall => Ok(Self::EndCall {
                id: payload
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            SignalingEvent::AnswerCall => Err(CallError::UnexpectedEvent(event.name())),
        }
    }

    pub fn event(&self) -> SignalingEvent {
        match self {
            Self::Me(_) => SignalingEvent::Me,
            Self::CallUser(_) => SignalingEvent::CallUser,
            Self::CallAccepted(_) => SignalingEvent::CallAccepted,
            Self::EndCall { .. } => SignalingEvent::EndCall,
        }
    }
}

/// A message this client sends to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    CallUser(CallUserRequest),
    AnswerCall(AnswerCallRequest),
    EndCall(EndCallRequest),
}

impl OutboundSignal {
    pub fn event(&self) -> SignalingEvent {
        match self {
            Self::CallUser(_) => SignalingEvent::CallUser,
            Self::AnswerCall(_) => SignalingEvent::AnswerCall,
            Self::EndCall(_) => SignalingEvent::EndCall,
        }
    }

    pub fn to_payload(&self) -> Result<Value, CallError> {
        let encoded = match self {
            Self::CallUser(req) => serde_json::to_value(req),
            Self::AnswerCall(req) => serde_json::to_value(req),
            Self::EndCall(req) => serde_json::to_value(req),
        };
        encoded.map_err(|e| malformed(self.event(), e.to_string()))
    }
}

fn malformed(event: SignalingEvent, reason: impl Into<String>) -> CallError {
    CallError::MalformedPayload {
        event: event.name(),
        reason: reason.into(),
    }
}
