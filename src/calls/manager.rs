//! Call manager: owns the single session and reacts to user intents, relay
//! messages and negotiator callbacks.
//!
//! Every operation takes the manager lock for its whole duration, so the
//! three input sources are applied one at a time in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};

use super::error::CallError;
use super::media::MediaStream;
use super::negotiation::{
    AttemptId, NegotiationEvent, NegotiationSink, NegotiationUpdate, NegotiatorFactory,
};
use super::signaling::{
    AnswerCallRequest, CallUserRequest, EndCallRequest, IncomingCall, OutboundSignal,
    SessionDescription,
};
use super::state::{CallRole, CallState, CallTransition, EndReason, InvalidTransition, Session};
use crate::transport::RelayChannel;
use crate::types::events::{
    CallErrorRaised, EventBus, IncomingCallNotice, LocalIdAssigned, RelayStatus,
    RemoteStreamReady, StateChanged,
};

/// What to do when the peer ends the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoteEndPolicy {
    /// Clear the session and stay on the current relay connection.
    #[default]
    ClearSession,
    /// Clear the session and force the relay channel to reconnect, which
    /// yields a new identity.
    Reconnect,
}

#[derive(Debug, Clone, Default)]
pub struct CallManagerConfig {
    pub remote_end_policy: RemoteEndPolicy,
}

/// Everything the presentation layer renders, read in one go.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub attempt: AttemptId,
    pub local_id: Option<String>,
    pub display_name: String,
    pub state: CallState,
    pub role: Option<CallRole>,
    pub peer_id: Option<String>,
    pub peer_display_name: Option<String>,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<MediaStream>,
    pub last_error: Option<CallError>,
    pub session_started: DateTime<Utc>,
}

struct ManagerState {
    local_id: Option<String>,
    display_name: String,
    local_stream: Option<MediaStream>,
    last_error: Option<CallError>,
    session: Session,
}

pub struct CallManager {
    config: CallManagerConfig,
    relay: Arc<dyn RelayChannel>,
    negotiators: Arc<dyn NegotiatorFactory>,
    event_bus: Arc<EventBus>,
    inner: Mutex<ManagerState>,
    next_attempt: AtomicU64,
    negotiation_tx: mpsc::UnboundedSender<NegotiationUpdate>,
}

impl CallManager {
    /// Creates the manager with a fresh Idle session.
    ///
    /// The returned receiver carries negotiator callbacks; the owner must feed
    /// them back through [`CallManager::handle_negotiation_update`].
    pub fn new(
        config: CallManagerConfig,
        relay: Arc<dyn RelayChannel>,
        negotiators: Arc<dyn NegotiatorFactory>,
        event_bus: Arc<EventBus>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NegotiationUpdate>) {
        let (negotiation_tx, negotiation_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            config,
            relay,
            negotiators,
            event_bus,
            inner: Mutex::new(ManagerState {
                local_id: None,
                display_name: String::new(),
                local_stream: None,
                last_error: None,
                session: Session::new(1),
            }),
            next_attempt: AtomicU64::new(2),
            negotiation_tx,
        });
        (manager, negotiation_rx)
    }

    pub fn config(&self) -> &CallManagerConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    // -- Observable state --

    pub async fn snapshot(&self) -> CallSnapshot {
        let state = self.inner.lock().await;
        let session = &state.session;
        CallSnapshot {
            attempt: session.attempt(),
            local_id: state.local_id.clone(),
            display_name: state.display_name.clone(),
            state: session.state().clone(),
            role: session.role(),
            peer_id: session.peer_id().map(str::to_string),
            peer_display_name: session.peer_display_name().map(str::to_string),
            local_stream: state.local_stream.clone(),
            remote_stream: session.remote_stream().cloned(),
            last_error: state.last_error.clone(),
            session_started: session.created_at(),
        }
    }

    pub async fn current_state(&self) -> CallState {
        self.inner.lock().await.session.state().clone()
    }

    pub async fn local_id(&self) -> Option<String> {
        self.inner.lock().await.local_id.clone()
    }

    pub async fn peer_display_name(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .session
            .peer_display_name()
            .map(str::to_string)
    }

    pub async fn local_stream(&self) -> Option<MediaStream> {
        self.inner.lock().await.local_stream.clone()
    }

    pub async fn remote_stream(&self) -> Option<MediaStream> {
        self.inner.lock().await.session.remote_stream().cloned()
    }

    pub async fn last_error(&self) -> Option<CallError> {
        self.inner.lock().await.last_error.clone()
    }

    // -- User intents --

    /// Changes the display name. Clears the last error, like editing any
    /// input field does.
    pub async fn set_display_name(&self, name: &str) -> Result<(), CallError> {
        let mut state = self.inner.lock().await;
        if state.session.display_name_locked() {
            return Err(CallError::DisplayNameLocked);
        }
        state.display_name = name.to_string();
        state.last_error = None;
        Ok(())
    }

    pub async fn set_local_stream(&self, stream: Option<MediaStream>) {
        self.inner.lock().await.local_stream = stream;
    }

    /// Surfaces an error that happened outside the manager (e.g. media
    /// acquisition).
    pub async fn record_error(&self, error: CallError) {
        let mut state = self.inner.lock().await;
        self.raise(&mut state, error);
    }

    /// Returns the id to hand to the other party. Requires a display name so
    /// the callee sees who is calling.
    pub async fn shareable_id(&self) -> Result<String, CallError> {
        let mut state = self.inner.lock().await;
        if state.display_name.trim().is_empty() {
            return Err(self.fail(&mut state, CallError::MissingName));
        }
        match state.local_id.clone() {
            Some(id) => Ok(id),
            None => Err(self.fail(&mut state, CallError::NotConnected)),
        }
    }

    /// Idle → Calling. The `callUser` message goes out once the negotiator
    /// produced its offer.
    pub async fn initiate_call(&self, target_id: &str) -> Result<(), CallError> {
        let mut state = self.inner.lock().await;

        let name = state.display_name.trim().to_string();
        if name.is_empty() {
            return Err(self.fail(&mut state, CallError::MissingName));
        }
        let target = target_id.trim();
        if target.is_empty() {
            return Err(self.fail(&mut state, CallError::MissingTarget));
        }
        if state.local_id.is_none() {
            return Err(self.fail(&mut state, CallError::NotConnected));
        }

        if let Err(e) = state.session.place_call(target.to_string(), name) {
            return Err(self.fail(&mut state, e.into()));
        }

        let attempt = state.session.attempt();
        let sink = NegotiationSink::new(attempt, self.negotiation_tx.clone());
        match self
            .negotiators
            .create(CallRole::Initiator, state.local_stream.clone(), sink)
            .await
        {
            Ok(negotiator) => state.session.attach_negotiator(negotiator),
            Err(e) => {
                warn!("Could not create negotiator for call to {target}: {e}");
                state.session = self.fresh_session();
                return Err(self.fail(&mut state, e.into()));
            }
        }

        info!("Calling {target} (attempt {attempt})");
        state.last_error = None;
        self.publish_state(&state.session);
        Ok(())
    }

    /// Ringing → Connected. The buffered offer is fed to a new responder
    /// before the state changes, so a rejected offer leaves the call ringing.
    pub async fn answer_incoming_call(&self) -> Result<(), CallError> {
        let mut state = self.inner.lock().await;

        let name = state.display_name.trim().to_string();
        if name.is_empty() {
            return Err(self.fail(&mut state, CallError::MissingName));
        }
        if !state.session.state().can_answer() {
            let err = InvalidTransition::new(state.session.state(), CallTransition::LocalAnswered);
            return Err(self.fail(&mut state, err.into()));
        }
        let Some(offer) = state.session.pending_remote_description().cloned() else {
            let err = CallError::Negotiation("no offer to answer".to_string());
            return Err(self.fail(&mut state, err));
        };

        let attempt = state.session.attempt();
        let sink = NegotiationSink::new(attempt, self.negotiation_tx.clone());
        let negotiator = match self
            .negotiators
            .create(CallRole::Responder, state.local_stream.clone(), sink)
            .await
        {
            Ok(negotiator) => negotiator,
            Err(e) => {
                warn!("Could not create negotiator to answer attempt {attempt}: {e}");
                return Err(self.fail(&mut state, e.into()));
            }
        };

        if let Err(e) = negotiator.signal(offer).await {
            warn!("Caller's offer was rejected by the negotiator: {e}");
            negotiator.destroy().await;
            return Err(self.fail(&mut state, e.into()));
        }

        if let Err(e) = state.session.answer(name) {
            negotiator.destroy().await;
            return Err(self.fail(&mut state, e.into()));
        }
        state.session.attach_negotiator(negotiator);

        info!(
            "Answered call from {} (attempt {attempt})",
            state.session.peer_id().unwrap_or_default()
        );
        self.publish_state(&state.session);
        Ok(())
    }

    /// Ends the current call. No-op when Idle.
    ///
    /// The negotiator is released and `endCall` sent before the session is
    /// cleared. A relay failure is reported after the local reset, since the
    /// call is over either way.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let mut state = self.inner.lock().await;
        if !state.session.state().is_active() {
            debug!("hang_up with no active call");
            return Ok(());
        }

        let peer_id = state.session.peer_id().map(str::to_string);
        if let Some(negotiator) = state.session.take_negotiator() {
            negotiator.destroy().await;
        }

        let sent = match peer_id {
            Some(id) => {
                self.send_signal(OutboundSignal::EndCall(EndCallRequest { id }))
                    .await
            }
            None => Ok(()),
        };

        self.finish(&mut state, EndReason::LocalHangup).await;

        if let Err(e) = sent {
            return Err(self.fail(&mut state, e));
        }
        Ok(())
    }

    /// Clears the session without notifying the peer.
    pub async fn reset_session(&self) {
        let mut state = self.inner.lock().await;
        if state.session.state().is_active() {
            self.finish(&mut state, EndReason::Reset).await;
        }
    }

    // -- Relay messages --

    pub async fn handle_local_id(&self, id: String) {
        let mut state = self.inner.lock().await;
        let previous = state.local_id.replace(id.clone());
        if previous.as_deref() == Some(id.as_str()) {
            return;
        }
        info!("Relay identity is now {id}");
        let _ = self.event_bus.local_id.send(Arc::new(LocalIdAssigned {
            id,
            previous: previous.clone(),
        }));

        let session_state = state.session.state();
        if previous.is_some() && (session_state.is_calling() || session_state.is_ringing()) {
            warn!(
                "Identity changed during {}; abandoning attempt {}",
                session_state.kind(),
                state.session.attempt()
            );
            self.finish(&mut state, EndReason::Orphaned).await;
        }
    }

    pub async fn handle_incoming_call(&self, call: IncomingCall) {
        let mut state = self.inner.lock().await;
        if !state.session.state().is_idle() {
            info!(
                "Ignoring call from {} while {}",
                call.from,
                state.session.state().kind()
            );
            return;
        }

        let IncomingCall { from, signal, name } = call;
        if let Err(e) = state
            .session
            .receive_call(from.clone(), name.clone(), signal)
        {
            warn!("Could not ring for call from {from}: {e}");
            return;
        }

        info!("Incoming call from {name} ({from})");
        let _ = self
            .event_bus
            .incoming_call
            .send(Arc::new(IncomingCallNotice { from, name }));
        self.publish_state(&state.session);
    }

    pub async fn handle_call_accepted(&self, answer: SessionDescription) {
        let mut state = self.inner.lock().await;
        if !state.session.state().is_calling() {
            debug!(
                "Ignoring callAccepted while {}",
                state.session.state().kind()
            );
            return;
        }

        let fed = match state.session.negotiator() {
            Some(negotiator) => negotiator.signal(answer).await,
            None => {
                warn!("callAccepted arrived before the negotiator exists");
                return;
            }
        };
        if let Err(e) = fed {
            warn!("Peer's answer was rejected by the negotiator: {e}");
            self.raise(&mut state, e.into());
            return;
        }

        if let Err(e) = state
            .session
            .apply_transition(CallTransition::RemoteAccepted)
        {
            warn!("{e}");
            return;
        }
        info!(
            "Call accepted by {}",
            state.session.peer_id().unwrap_or_default()
        );
        self.publish_state(&state.session);
    }

    /// Peer ended the call.
    pub async fn handle_remote_end(&self, from: Option<String>) {
        {
            let mut state = self.inner.lock().await;
            if !state.session.state().is_active() {
                debug!("Ignoring endCall while {}", state.session.state().kind());
                return;
            }
            info!(
                "Call ended by peer {}",
                from.as_deref()
                    .or(state.session.peer_id())
                    .unwrap_or("unknown")
            );
            self.finish(&mut state, EndReason::RemoteHangup).await;
        }

        if self.config.remote_end_policy == RemoteEndPolicy::Reconnect {
            if let Err(e) = self.relay.reconnect().await {
                warn!("Relay reconnect after remote hangup failed: {e}");
            }
        }
    }

    pub async fn handle_relay_connected(&self) {
        info!("Relay channel connected");
        let _ = self.event_bus.relay_status.send(RelayStatus::Connected);
    }

    /// The local id stays until the relay assigns a new one.
    pub async fn handle_relay_disconnected(&self) {
        warn!("Relay channel disconnected");
        let _ = self.event_bus.relay_status.send(RelayStatus::Disconnected);
    }

    // -- Negotiator callbacks --

    pub async fn handle_negotiation_update(&self, update: NegotiationUpdate) {
        let mut state = self.inner.lock().await;
        if update.attempt != state.session.attempt() {
            debug!(
                "Dropping negotiation update for stale attempt {} (current {})",
                update.attempt,
                state.session.attempt()
            );
            return;
        }

        match update.event {
            NegotiationEvent::LocalDescription(description) => {
                self.send_local_description(&mut state, description).await;
            }
            NegotiationEvent::RemoteStream(stream) => {
                if !state.session.state().is_connected() {
                    debug!(
                        "Ignoring remote stream while {}",
                        state.session.state().kind()
                    );
                    return;
                }
                info!(
                    "Remote stream {} ready ({} tracks)",
                    stream.id(),
                    stream.tracks().len()
                );
                state.session.set_remote_stream(stream.clone());
                let _ = self.event_bus.remote_stream.send(Arc::new(RemoteStreamReady {
                    attempt: update.attempt,
                    stream,
                }));
            }
            NegotiationEvent::Failed(reason) => {
                warn!("Negotiation failed for attempt {}: {reason}", update.attempt);
                self.raise(&mut state, CallError::Negotiation(reason));
            }
        }
    }

    async fn send_local_description(
        &self,
        state: &mut ManagerState,
        description: SessionDescription,
    ) {
        let session = &state.session;
        let peer_id = session.peer_id().unwrap_or_default().to_string();
        let signal = match (session.role(), session.state()) {
            (Some(CallRole::Initiator), CallState::Calling { .. }) => state
                .local_id
                .clone()
                .map(|from| {
                    OutboundSignal::CallUser(CallUserRequest {
                        user_to_call: peer_id,
                        signal_data: description,
                        from,
                        name: session.local_display_name().unwrap_or_default().to_string(),
                    })
                })
                .ok_or(CallError::NotConnected),
            (Some(CallRole::Responder), CallState::Connected { .. }) => {
                Ok(OutboundSignal::AnswerCall(AnswerCallRequest {
                    signal: description,
                    to: peer_id,
                }))
            }
            (role, current) => {
                debug!(
                    "Ignoring local description for {role:?} while {}",
                    current.kind()
                );
                return;
            }
        };

        let sent = match signal {
            Ok(signal) => self.send_signal(signal).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.raise(state, e);
        }
    }

    // -- Helpers --

    async fn send_signal(&self, signal: OutboundSignal) -> Result<(), CallError> {
        let event = signal.event();
        let payload = signal.to_payload()?;
        debug!("--> {event}");
        self.relay
            .send(event.name(), payload)
            .await
            .map_err(|e| CallError::Relay(e.to_string()))
    }

    /// Ends the session with `reason`, publishes the Ended snapshot and
    /// installs a fresh Idle session.
    async fn finish(&self, state: &mut ManagerState, reason: EndReason) {
        if let Some(negotiator) = state.session.take_negotiator() {
            negotiator.destroy().await;
        }
        match state.session.end(reason) {
            Ok(CallState::Ended { duration_secs, .. }) => {
                info!(
                    "Call attempt {} ended: {reason:?}{}",
                    state.session.attempt(),
                    duration_secs
                        .map(|d| format!(" after {d}s"))
                        .unwrap_or_default()
                );
                self.publish_state(&state.session);
            }
            Ok(_) => {}
            Err(e) => warn!("{e}"),
        }
        state.session = self.fresh_session();
        self.publish_state(&state.session);
    }

    fn fresh_session(&self) -> Session {
        Session::new(self.next_attempt.fetch_add(1, Ordering::SeqCst))
    }

    fn raise(&self, state: &mut ManagerState, error: CallError) {
        if error.is_validation() {
            info!("{error}");
        } else {
            warn!("{error}");
        }
        state.last_error = Some(error.clone());
        let _ = self
            .event_bus
            .call_error
            .send(Arc::new(CallErrorRaised { error }));
    }

    /// [`Self::raise`] that hands the error back for returning.
    fn fail(&self, state: &mut ManagerState, error: CallError) -> CallError {
        self.raise(state, error.clone());
        error
    }

    fn publish_state(&self, session: &Session) {
        let _ = self.event_bus.state_changed.send(Arc::new(StateChanged {
            attempt: session.attempt(),
            state: session.state().clone(),
            peer_id: session.peer_id().map(str::to_string),
            peer_display_name: session.peer_display_name().map(str::to_string),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockNegotiatorFactory, answer_for, offer_for, pump};
    use crate::calls::CallStateKind;
    use crate::transport::mock::RecordingRelay;
    use serde_json::json;
    use tokio::sync::broadcast;

    struct Harness {
        calls: Arc<CallManager>,
        relay: Arc<RecordingRelay>,
        negotiators: Arc<MockNegotiatorFactory>,
        updates: mpsc::UnboundedReceiver<NegotiationUpdate>,
    }

    impl Harness {
        fn with(config: CallManagerConfig, negotiators: MockNegotiatorFactory) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let relay = Arc::new(RecordingRelay::new());
            let negotiators = Arc::new(negotiators);
            let (calls, updates) = CallManager::new(
                config,
                relay.clone(),
                negotiators.clone(),
                Arc::new(EventBus::new()),
            );
            Self {
                calls,
                relay,
                negotiators,
                updates,
            }
        }

        fn new() -> Self {
            Self::with(CallManagerConfig::default(), MockNegotiatorFactory::new())
        }

        async fn connected(name: &str) -> Self {
            let h = Self::new();
            h.calls.handle_local_id("A456".to_string()).await;
            h.calls.set_display_name(name).await.unwrap();
            h
        }

        async fn pump(&mut self) {
            pump(&self.calls, &mut self.updates).await;
        }

        async fn ring(&self) {
            self.calls
                .handle_incoming_call(IncomingCall {
                    from: "X".to_string(),
                    signal: offer_for(99),
                    name: "Alice".to_string(),
                })
                .await;
        }
    }

    #[tokio::test]
    async fn test_initiate_requires_name() {
        let h = Harness::new();
        h.calls.handle_local_id("A456".to_string()).await;

        let result = h.calls.initiate_call("B123").await;
        assert_eq!(result, Err(CallError::MissingName));
        assert!(h.calls.current_state().await.is_idle());
        assert_eq!(h.calls.last_error().await, Some(CallError::MissingName));
        assert!(h.negotiators.created().is_empty());
        assert!(h.relay.sent().is_empty());
    }

    #[tokio::test]
    async fn test_initiate_requires_target() {
        let h = Harness::connected("Alice").await;

        assert_eq!(
            h.calls.initiate_call("   ").await,
            Err(CallError::MissingTarget)
        );
        assert!(h.calls.current_state().await.is_idle());
        assert!(h.negotiators.created().is_empty());
    }

    #[tokio::test]
    async fn test_whitespace_name_counts_as_missing() {
        let h = Harness::connected("  ").await;
        assert_eq!(
            h.calls.initiate_call("B123").await,
            Err(CallError::MissingName)
        );
    }

    #[tokio::test]
    async fn test_initiate_without_identity() {
        let h = Harness::new();
        h.calls.set_display_name("Alice").await.unwrap();
        assert_eq!(
            h.calls.initiate_call("B123").await,
            Err(CallError::NotConnected)
        );
        assert!(h.calls.current_state().await.is_idle());
    }

    #[tokio::test]
    async fn test_changing_name_clears_error() {
        let h = Harness::new();
        h.calls.handle_local_id("A456".to_string()).await;
        let _ = h.calls.initiate_call("B123").await;
        assert!(h.calls.last_error().await.is_some());

        h.calls.set_display_name("Alice").await.unwrap();
        assert_eq!(h.calls.last_error().await, None);
    }

    #[tokio::test]
    async fn test_initiate_sends_call_user_when_offer_ready() {
        let mut h = Harness::connected("Alice").await;

        h.calls.initiate_call("B123").await.unwrap();
        let snapshot = h.calls.snapshot().await;
        assert!(snapshot.state.is_calling());
        assert_eq!(snapshot.role, Some(CallRole::Initiator));
        assert_eq!(snapshot.peer_id.as_deref(), Some("B123"));
        assert_eq!(h.negotiators.created(), vec![(snapshot.attempt, CallRole::Initiator)]);

        // Nothing goes out until the negotiator produced the offer.
        assert!(h.relay.sent().is_empty());
        h.pump().await;

        assert_eq!(
            h.relay.sent_named("callUser"),
            vec![json!({
                "userToCall": "B123",
                "signalData": offer_for(snapshot.attempt).into_value(),
                "from": "A456",
                "name": "Alice",
            })]
        );
    }

    #[tokio::test]
    async fn test_display_name_locked_once_role_set() {
        let h = Harness::connected("Alice").await;
        h.calls.initiate_call("B123").await.unwrap();

        assert_eq!(
            h.calls.set_display_name("Mallory").await,
            Err(CallError::DisplayNameLocked)
        );
        assert_eq!(h.calls.snapshot().await.display_name, "Alice");
    }

    #[tokio::test]
    async fn test_negotiator_create_failure_stays_idle() {
        let h = Harness::connected("Alice").await;
        h.negotiators.set_fail_create(true);

        let result = h.calls.initiate_call("B123").await;
        assert!(matches!(result, Err(CallError::Negotiation(_))));

        let snapshot = h.calls.snapshot().await;
        assert!(snapshot.state.is_idle());
        assert_eq!(snapshot.role, None);
        assert_eq!(snapshot.peer_id, None);

        // Name is unlocked again.
        h.calls.set_display_name("Alicia").await.unwrap();
    }

    #[tokio::test]
    async fn test_incoming_call_rings() {
        let h = Harness::new();
        let mut incoming = h.calls.event_bus().incoming_call.subscribe();

        h.ring().await;

        let snapshot = h.calls.snapshot().await;
        assert!(snapshot.state.is_ringing());
        assert_eq!(snapshot.peer_id.as_deref(), Some("X"));
        assert_eq!(snapshot.peer_display_name.as_deref(), Some("Alice"));
        assert_eq!(snapshot.role, None);

        let notice = incoming.try_recv().unwrap();
        assert_eq!(notice.from, "X");
        assert_eq!(notice.name, "Alice");
    }

    #[tokio::test]
    async fn test_second_incoming_call_is_ignored() {
        let h = Harness::new();
        h.ring().await;
        h.calls
            .handle_incoming_call(IncomingCall {
                from: "Y".to_string(),
                signal: offer_for(5),
                name: "Carol".to_string(),
            })
            .await;

        let snapshot = h.calls.snapshot().await;
        assert_eq!(snapshot.peer_id.as_deref(), Some("X"));
        assert_eq!(snapshot.peer_display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_answer_feeds_offer_and_sends_answer_call() {
        let mut h = Harness::connected("Bob").await;
        h.ring().await;

        h.calls.answer_incoming_call().await.unwrap();
        let snapshot = h.calls.snapshot().await;
        assert!(snapshot.state.is_connected());
        assert_eq!(snapshot.role, Some(CallRole::Responder));

        let attempt = snapshot.attempt;
        assert_eq!(h.negotiators.signals(), vec![(attempt, offer_for(99))]);

        h.pump().await;
        assert_eq!(
            h.relay.sent_named("answerCall"),
            vec![json!({"signal": answer_for(attempt).into_value(), "to": "X"})]
        );
        let remote = h.calls.remote_stream().await.unwrap();
        assert!(remote.has_video());
    }

    #[tokio::test]
    async fn test_answer_requires_name() {
        let h = Harness::new();
        h.ring().await;

        assert_eq!(
            h.calls.answer_incoming_call().await,
            Err(CallError::MissingName)
        );
        assert!(h.calls.current_state().await.is_ringing());
        assert!(h.negotiators.created().is_empty());
    }

    #[tokio::test]
    async fn test_answer_when_not_ringing() {
        let h = Harness::connected("Bob").await;
        let result = h.calls.answer_incoming_call().await;
        assert!(matches!(result, Err(CallError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_rejected_offer_keeps_ringing() {
        let h = Harness::connected("Bob").await;
        h.ring().await;
        h.negotiators.set_fail_signal(true);

        let result = h.calls.answer_incoming_call().await;
        assert!(matches!(result, Err(CallError::Negotiation(_))));

        let snapshot = h.calls.snapshot().await;
        assert!(snapshot.state.is_ringing());
        assert_eq!(snapshot.role, None);
        assert_eq!(h.negotiators.destroyed(), vec![snapshot.attempt]);
    }

    #[tokio::test]
    async fn test_call_accepted_feeds_answer_exactly_once() {
        let mut h = Harness::connected("Alice").await;
        h.calls.initiate_call("B123").await.unwrap();
        h.pump().await;
        let attempt = h.calls.snapshot().await.attempt;

        h.calls.handle_call_accepted(answer_for(7)).await;
        assert!(h.calls.current_state().await.is_connected());

        // A duplicate delivery is ignored once Connected.
        h.calls.handle_call_accepted(answer_for(7)).await;
        assert_eq!(h.negotiators.signals(), vec![(attempt, answer_for(7))]);
    }

    #[tokio::test]
    async fn test_call_accepted_ignored_unless_calling() {
        let h = Harness::connected("Alice").await;
        h.calls.handle_call_accepted(answer_for(1)).await;
        assert!(h.calls.current_state().await.is_idle());
        assert!(h.negotiators.signals().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_answer_stays_calling() {
        let h = Harness::connected("Alice").await;
        h.calls.initiate_call("B123").await.unwrap();
        h.negotiators.set_fail_signal(true);

        h.calls.handle_call_accepted(answer_for(1)).await;
        assert!(h.calls.current_state().await.is_calling());
        assert!(matches!(
            h.calls.last_error().await,
            Some(CallError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn test_hang_up_from_each_active_state() {
        for setup in ["calling", "ringing", "connected"] {
            let mut h = Harness::connected("Alice").await;
            match setup {
                "calling" => h.calls.initiate_call("X").await.unwrap(),
                "ringing" => h.ring().await,
                _ => {
                    h.ring().await;
                    h.calls.answer_incoming_call().await.unwrap();
                }
            }
            h.pump().await;
            let attempt = h.calls.snapshot().await.attempt;

            h.calls.hang_up().await.unwrap();

            assert_eq!(
                h.relay.sent_named("endCall"),
                vec![json!({"id": "X"})],
                "{setup}"
            );
            let snapshot = h.calls.snapshot().await;
            assert!(snapshot.state.is_idle(), "{setup}");
            assert_eq!(snapshot.peer_id, None);
            assert_eq!(snapshot.peer_display_name, None);
            assert_eq!(snapshot.role, None);
            assert_ne!(snapshot.attempt, attempt);

            let expected: Vec<AttemptId> = if setup == "ringing" {
                vec![]
            } else {
                vec![attempt]
            };
            assert_eq!(h.negotiators.destroyed(), expected, "{setup}");

            // Second hang up is a no-op.
            h.calls.hang_up().await.unwrap();
            assert_eq!(h.relay.sent_named("endCall").len(), 1);
        }
    }

    /// What was already true each time an event left through the relay.
    #[derive(Debug, PartialEq)]
    struct SendWitness {
        event: String,
        destroyed: Vec<AttemptId>,
        published: Vec<CallStateKind>,
    }

    struct WitnessRelay {
        negotiators: Arc<MockNegotiatorFactory>,
        states: std::sync::Mutex<broadcast::Receiver<Arc<StateChanged>>>,
        witnessed: std::sync::Mutex<Vec<SendWitness>>,
    }

    #[async_trait::async_trait]
    impl RelayChannel for WitnessRelay {
        async fn send(&self, event: &str, _payload: serde_json::Value) -> Result<(), anyhow::Error> {
            let mut published = Vec::new();
            let mut states = self.states.lock().unwrap();
            while let Ok(changed) = states.try_recv() {
                published.push(changed.state.kind());
            }
            self.witnessed.lock().unwrap().push(SendWitness {
                event: event.to_string(),
                destroyed: self.negotiators.destroyed(),
                published,
            });
            Ok(())
        }

        async fn reconnect(&self) -> Result<(), anyhow::Error> {
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    #[tokio::test]
    async fn test_hang_up_destroys_then_notifies_then_clears() {
        let event_bus = Arc::new(EventBus::new());
        let mut states = event_bus.state_changed.subscribe();
        let negotiators = Arc::new(MockNegotiatorFactory::new());
        let relay = Arc::new(WitnessRelay {
            negotiators: negotiators.clone(),
            states: std::sync::Mutex::new(event_bus.state_changed.subscribe()),
            witnessed: std::sync::Mutex::new(Vec::new()),
        });
        let (calls, _updates) = CallManager::new(
            CallManagerConfig::default(),
            relay.clone(),
            negotiators.clone(),
            event_bus,
        );
        calls.handle_local_id("A456".to_string()).await;
        calls.set_display_name("Alice").await.unwrap();
        calls.initiate_call("B123").await.unwrap();
        let attempt = calls.snapshot().await.attempt;
        relay.witnessed.lock().unwrap().clear();
        while relay.states.lock().unwrap().try_recv().is_ok() {}
        while states.try_recv().is_ok() {}

        calls.hang_up().await.unwrap();

        let witnessed = relay.witnessed.lock().unwrap();
        assert_eq!(
            *witnessed,
            vec![SendWitness {
                event: "endCall".to_string(),
                destroyed: vec![attempt],
                published: vec![],
            }]
        );
        let mut after = Vec::new();
        while let Ok(changed) = states.try_recv() {
            after.push(changed.state.kind());
        }
        assert_eq!(after, vec![CallStateKind::Ended, CallStateKind::Idle]);
    }

    #[tokio::test]
    async fn test_hang_up_in_idle_is_noop() {
        let h = Harness::connected("Alice").await;
        let mut states = h.calls.event_bus().state_changed.subscribe();

        h.calls.hang_up().await.unwrap();

        assert!(h.relay.sent().is_empty());
        assert!(states.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hang_up_reports_relay_failure_after_reset() {
        let h = Harness::connected("Alice").await;
        h.calls.initiate_call("B123").await.unwrap();
        h.relay.set_fail_sends(true);

        let result = h.calls.hang_up().await;
        assert!(matches!(result, Err(CallError::Relay(_))));
        assert!(h.calls.current_state().await.is_idle());
    }

    #[tokio::test]
    async fn test_hang_up_publishes_ended_then_idle() {
        let mut h = Harness::connected("Alice").await;
        h.ring().await;
        h.calls.answer_incoming_call().await.unwrap();
        h.pump().await;
        let mut states = h.calls.event_bus().state_changed.subscribe();

        h.calls.hang_up().await.unwrap();

        let ended = states.try_recv().unwrap();
        assert!(matches!(
            ended.state,
            CallState::Ended {
                reason: EndReason::LocalHangup,
                duration_secs: Some(_),
                ..
            }
        ));
        assert_eq!(ended.peer_id.as_deref(), Some("X"));
        assert!(states.try_recv().unwrap().state.is_idle());
    }

    #[tokio::test]
    async fn test_remote_end_resets_connected_call() {
        let mut h = Harness::connected("Bob").await;
        h.ring().await;
        h.calls.answer_incoming_call().await.unwrap();
        h.pump().await;
        let attempt = h.calls.snapshot().await.attempt;

        h.calls.handle_remote_end(Some("X".to_string())).await;

        let snapshot = h.calls.snapshot().await;
        assert!(snapshot.state.is_idle());
        assert_eq!(snapshot.peer_id, None);
        assert_eq!(snapshot.peer_display_name, None);
        assert!(snapshot.remote_stream.is_none());
        assert_eq!(h.negotiators.destroyed(), vec![attempt]);
        assert!(h.relay.sent_named("endCall").is_empty());
        assert_eq!(h.relay.reconnects(), 0);
        // Local identity survives the default policy.
        assert_eq!(snapshot.local_id.as_deref(), Some("A456"));
    }

    #[tokio::test]
    async fn test_remote_end_reconnect_policy() {
        let h = Harness::with(
            CallManagerConfig {
                remote_end_policy: RemoteEndPolicy::Reconnect,
            },
            MockNegotiatorFactory::new(),
        );
        h.ring().await;
        h.calls.handle_remote_end(None).await;

        assert!(h.calls.current_state().await.is_idle());
        assert_eq!(h.relay.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_remote_end_in_idle_is_ignored() {
        let h = Harness::new();
        let mut states = h.calls.event_bus().state_changed.subscribe();
        h.calls.handle_remote_end(None).await;
        assert!(states.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_negotiation_updates_are_dropped() {
        let h = Harness::with(
            CallManagerConfig::default(),
            MockNegotiatorFactory::with_auto_describe(false),
        );
        h.calls.handle_local_id("A456".to_string()).await;
        h.calls.set_display_name("Alice").await.unwrap();
        h.calls.initiate_call("B123").await.unwrap();
        let old_sink = h.negotiators.last_sink().unwrap();

        h.calls.hang_up().await.unwrap();
        h.calls.initiate_call("C789").await.unwrap();

        let update = NegotiationUpdate {
            attempt: old_sink.attempt(),
            event: NegotiationEvent::LocalDescription(offer_for(0)),
        };
        h.calls.handle_negotiation_update(update).await;

        assert!(h.relay.sent_named("callUser").is_empty());
    }

    #[tokio::test]
    async fn test_negotiation_failure_keeps_state() {
        let h = Harness::with(
            CallManagerConfig::default(),
            MockNegotiatorFactory::with_auto_describe(false),
        );
        h.calls.handle_local_id("A456".to_string()).await;
        h.calls.set_display_name("Alice").await.unwrap();
        h.calls.initiate_call("B123").await.unwrap();
        let attempt = h.negotiators.last_sink().unwrap().attempt();

        h.calls
            .handle_negotiation_update(NegotiationUpdate {
                attempt,
                event: NegotiationEvent::Failed("ice failed".to_string()),
            })
            .await;

        assert!(h.calls.current_state().await.is_calling());
        assert_eq!(
            h.calls.last_error().await,
            Some(CallError::Negotiation("ice failed".to_string()))
        );
    }

    #[tokio::test]
    async fn test_new_identity_orphans_pending_call() {
        let h = Harness::connected("Alice").await;
        h.calls.initiate_call("B123").await.unwrap();
        let attempt = h.calls.snapshot().await.attempt;
        let mut states = h.calls.event_bus().state_changed.subscribe();

        h.calls.handle_local_id("A999".to_string()).await;

        let ended = states.try_recv().unwrap();
        assert!(matches!(
            ended.state,
            CallState::Ended {
                reason: EndReason::Orphaned,
                ..
            }
        ));
        assert!(h.calls.current_state().await.is_idle());
        assert_eq!(h.negotiators.destroyed(), vec![attempt]);
        assert!(h.relay.sent_named("endCall").is_empty());
        assert_eq!(h.calls.local_id().await.as_deref(), Some("A999"));
    }

    #[tokio::test]
    async fn test_new_identity_keeps_connected_call() {
        let h = Harness::connected("Bob").await;
        h.ring().await;
        h.calls.answer_incoming_call().await.unwrap();

        h.calls.handle_local_id("B000".to_string()).await;
        assert!(h.calls.current_state().await.is_connected());
    }

    #[tokio::test]
    async fn test_shareable_id_requires_name() {
        let h = Harness::new();
        h.calls.handle_local_id("A456".to_string()).await;
        assert_eq!(h.calls.shareable_id().await, Err(CallError::MissingName));

        h.calls.set_display_name("Alice").await.unwrap();
        assert_eq!(h.calls.shareable_id().await.as_deref(), Ok("A456"));
    }

    #[tokio::test]
    async fn test_reset_session_without_peer_notice() {
        let h = Harness::connected("Alice").await;
        h.calls.initiate_call("B123").await.unwrap();

        h.calls.reset_session().await;
        assert!(h.calls.current_state().await.is_idle());
        assert!(h.relay.sent_named("endCall").is_empty());
    }
}
