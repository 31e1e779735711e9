//! Call session state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::media::MediaStream;
use super::negotiation::{AttemptId, Negotiator};
use super::signaling::SessionDescription;

/// Current state of the session.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub enum CallState {
    /// No call in progress.
    #[default]
    Idle,
    /// Outgoing call placed, waiting for the peer to accept.
    Calling { since: DateTime<Utc> },
    /// Incoming call waiting for a local answer.
    Ringing { received_at: DateTime<Utc> },
    /// Both descriptions exchanged (or being exchanged).
    Connected { connected_at: DateTime<Utc> },
    /// Call finished; replaced by a fresh Idle session right after.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn kind(&self) -> CallStateKind {
        match self {
            Self::Idle => CallStateKind::Idle,
            Self::Calling { .. } => CallStateKind::Calling,
            Self::Ringing { .. } => CallStateKind::Ringing,
            Self::Connected { .. } => CallStateKind::Connected,
            Self::Ended { .. } => CallStateKind::Ended,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_calling(&self) -> bool {
        matches!(self, Self::Calling { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// Calling, Ringing or Connected: a peer is involved and hanging up means something.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Calling { .. } | Self::Ringing { .. } | Self::Connected { .. }
        )
    }

    pub fn can_answer(&self) -> bool {
        self.is_ringing()
    }
}

/// [`CallState`] without its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallStateKind {
    Idle,
    Calling,
    Ringing,
    Connected,
    Ended,
}

impl fmt::Display for CallStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Ringing => "ringing",
            Self::Connected => "connected",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// This side hung up (or rejected a ringing call).
    LocalHangup,
    /// The peer sent `endCall`.
    RemoteHangup,
    /// The relay identity changed before the call got anywhere.
    Orphaned,
    /// Explicit reset requested by the application.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallRole {
    Initiator,
    Responder,
}

/// State transitions for a session.
#[derive(Debug, Clone)]
pub enum CallTransition {
    CallPlaced,
    OfferReceived,
    LocalAnswered,
    RemoteAccepted,
    Terminated { reason: EndReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl InvalidTransition {
    pub(crate) fn new(current: &CallState, attempted: impl fmt::Debug) -> Self {
        Self {
            current_state: current.kind().to_string(),
            attempted: format!("{attempted:?}"),
        }
    }
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// The single pending or active call.
///
/// A session is never reused: when a call ends the owner drops it and starts
/// a fresh one with a new attempt id.
pub struct Session {
    attempt: AttemptId,
    created_at: DateTime<Utc>,
    state: CallState,
    role: Option<CallRole>,
    /// Display name frozen when the role was set.
    local_display_name: Option<String>,
    peer_id: Option<String>,
    peer_display_name: Option<String>,
    pending_remote_description: Option<SessionDescription>,
    remote_stream: Option<MediaStream>,
    negotiator: Option<Box<dyn Negotiator>>,
}

impl Session {
    pub fn new(attempt: AttemptId) -> Self {
        Self {
            attempt,
            created_at: Utc::now(),
            state: CallState::Idle,
            role: None,
            local_display_name: None,
            peer_id: None,
            peer_display_name: None,
            pending_remote_description: None,
            remote_stream: None,
            negotiator: None,
        }
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn role(&self) -> Option<CallRole> {
        self.role
    }

    pub fn local_display_name(&self) -> Option<&str> {
        self.local_display_name.as_deref()
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn peer_display_name(&self) -> Option<&str> {
        self.peer_display_name.as_deref()
    }

    pub fn pending_remote_description(&self) -> Option<&SessionDescription> {
        self.pending_remote_description.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub fn set_remote_stream(&mut self, stream: MediaStream) {
        self.remote_stream = Some(stream);
    }

    /// The display name can change until a role is fixed for this session.
    pub fn display_name_locked(&self) -> bool {
        self.role.is_some()
    }

    pub fn negotiator(&self) -> Option<&dyn Negotiator> {
        self.negotiator.as_deref()
    }

    pub fn attach_negotiator(&mut self, negotiator: Box<dyn Negotiator>) {
        self.negotiator = Some(negotiator);
    }

    pub fn take_negotiator(&mut self) -> Option<Box<dyn Negotiator>> {
        self.negotiator.take()
    }

    /// Idle → Calling. Fixes the role as initiator.
    pub fn place_call(
        &mut self,
        target_id: String,
        display_name: String,
    ) -> Result<(), InvalidTransition> {
        self.apply_transition(CallTransition::CallPlaced)?;
        self.fix_role(CallRole::Initiator, display_name)?;
        self.peer_id = Some(target_id);
        Ok(())
    }

    /// Idle → Ringing. Buffers the caller's description until answered.
    pub fn receive_call(
        &mut self,
        from: String,
        name: String,
        description: SessionDescription,
    ) -> Result<(), InvalidTransition> {
        self.apply_transition(CallTransition::OfferReceived)?;
        self.peer_id = Some(from);
        self.peer_display_name = Some(name);
        self.pending_remote_description = Some(description);
        Ok(())
    }

    /// Ringing → Connected. Fixes the role as responder and hands back the
    /// buffered caller description.
    pub fn answer(
        &mut self,
        display_name: String,
    ) -> Result<Option<SessionDescription>, InvalidTransition> {
        self.apply_transition(CallTransition::LocalAnswered)?;
        self.fix_role(CallRole::Responder, display_name)?;
        Ok(self.pending_remote_description.take())
    }

    /// Moves to Ended. Returns the ended state for publishing.
    pub fn end(&mut self, reason: EndReason) -> Result<CallState, InvalidTransition> {
        self.apply_transition(CallTransition::Terminated { reason })?;
        Ok(self.state.clone())
    }

    fn fix_role(&mut self, role: CallRole, display_name: String) -> Result<(), InvalidTransition> {
        if let Some(existing) = self.role {
            return Err(InvalidTransition {
                current_state: format!("role {existing:?}"),
                attempted: format!("SetRole({role:?})"),
            });
        }
        self.role = Some(role);
        self.local_display_name = Some(display_name);
        Ok(())
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, &transition) {
            (CallState::Idle, CallTransition::CallPlaced) => CallState::Calling { since: Utc::now() },
            (CallState::Idle, CallTransition::OfferReceived) => CallState::Ringing {
                received_at: Utc::now(),
            },
            (CallState::Calling { .. }, CallTransition::RemoteAccepted)
            | (CallState::Ringing { .. }, CallTransition::LocalAnswered) => CallState::Connected {
                connected_at: Utc::now(),
            },
            (
                CallState::Calling { .. } | CallState::Ringing { .. },
                CallTransition::Terminated { reason },
            ) => CallState::Ended {
                reason: *reason,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (CallState::Connected { connected_at }, CallTransition::Terminated { reason }) => {
                let duration = Utc::now().signed_duration_since(*connected_at).num_seconds();
                CallState::Ended {
                    reason: *reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (current, _) => return Err(InvalidTransition::new(current, &transition)),
        };
        self.state = new_state;
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("attempt", &self.attempt)
            .field("state", &self.state)
            .field("role", &self.role)
            .field("peer_id", &self.peer_id)
            .field("peer_display_name", &self.peer_display_name)
            .field("negotiator", &self.negotiator.is_some())
            .finish()
    }
}
