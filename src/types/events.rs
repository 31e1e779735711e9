use crate::calls::{CallError, CallState, MediaStream};
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event type.
        ///
        /// The presentation layer subscribes to the channels it renders;
        /// publishing with no subscribers is not an error.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

/// The call session moved to a new state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChanged {
    pub attempt: u64,
    pub state: CallState,
    pub peer_id: Option<String>,
    pub peer_display_name: Option<String>,
}

/// The relay assigned this connection an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdAssigned {
    pub id: String,
    pub previous: Option<String>,
}

/// Someone is calling. Published when the session enters Ringing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCallNotice {
    pub from: String,
    pub name: String,
}

/// Remote media arrived (or gained a track) for the current call.
#[derive(Debug, Clone)]
pub struct RemoteStreamReady {
    pub attempt: u64,
    pub stream: MediaStream,
}

/// An error the user should see.
#[derive(Debug, Clone, PartialEq)]
pub struct CallErrorRaised {
    pub error: CallError,
}

/// Relay connectivity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Connected,
    Disconnected,
}

define_event_bus! {
    // Call session events
    (state_changed, Arc<StateChanged>),
    (incoming_call, Arc<IncomingCallNotice>),
    (remote_stream, Arc<RemoteStreamReady>),
    (call_error, Arc<CallErrorRaised>),

    // Relay events
    (local_id, Arc<LocalIdAssigned>),
    (relay_status, RelayStatus),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
