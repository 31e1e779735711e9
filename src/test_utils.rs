use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::calls::{
    AttemptId, CallManager, CallRole, MediaKind, MediaStream, MediaTrack, NegotiationError,
    NegotiationSink, NegotiationUpdate, Negotiator, NegotiatorFactory, SessionDescription,
};
use crate::transport::RelayChannel;

pub fn offer_for(attempt: AttemptId) -> SessionDescription {
    SessionDescription::new(json!({"type": "offer", "sdp": format!("mock-offer-{attempt}")}))
}

pub fn answer_for(attempt: AttemptId) -> SessionDescription {
    SessionDescription::new(json!({"type": "answer", "sdp": format!("mock-answer-{attempt}")}))
}

/// What the mock negotiators were asked to do.
#[derive(Debug, Default)]
pub struct NegotiatorLog {
    pub created: Vec<(AttemptId, CallRole)>,
    pub signals: Vec<(AttemptId, SessionDescription)>,
    pub destroyed: Vec<AttemptId>,
}

/// Negotiator factory that never touches the network.
///
/// With `auto_describe` on, an initiator emits its offer on creation and a
/// responder emits its answer (plus a remote stream) once it is signalled.
pub struct MockNegotiatorFactory {
    log: Arc<Mutex<NegotiatorLog>>,
    sinks: Mutex<Vec<NegotiationSink>>,
    auto_describe: bool,
    fail_create: AtomicBool,
    fail_signal: Arc<AtomicBool>,
}

impl MockNegotiatorFactory {
    pub fn new() -> Self {
        Self::with_auto_describe(true)
    }

    pub fn with_auto_describe(auto_describe: bool) -> Self {
        Self {
            log: Arc::new(Mutex::new(NegotiatorLog::default())),
            sinks: Mutex::new(Vec::new()),
            auto_describe,
            fail_create: AtomicBool::new(false),
            fail_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_signal(&self, fail: bool) {
        self.fail_signal.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<(AttemptId, CallRole)> {
        self.log.lock().unwrap().created.clone()
    }

    pub fn signals(&self) -> Vec<(AttemptId, SessionDescription)> {
        self.log.lock().unwrap().signals.clone()
    }

    pub fn destroyed(&self) -> Vec<AttemptId> {
        self.log.lock().unwrap().destroyed.clone()
    }

    /// Sink handed to the most recently created negotiator.
    pub fn last_sink(&self) -> Option<NegotiationSink> {
        self.sinks.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl NegotiatorFactory for MockNegotiatorFactory {
    async fn create(
        &self,
        role: CallRole,
        _local_stream: Option<MediaStream>,
        events: NegotiationSink,
    ) -> Result<Box<dyn Negotiator>, NegotiationError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(NegotiationError::Backend("mock create failure".to_string()));
        }
        let attempt = events.attempt();
        self.log.lock().unwrap().created.push((attempt, role));
        self.sinks.lock().unwrap().push(events.clone());

        if self.auto_describe && role == CallRole::Initiator {
            events.local_description(offer_for(attempt));
        }

        Ok(Box::new(MockNegotiator {
            role,
            events,
            log: self.log.clone(),
            auto_describe: self.auto_describe,
            fail_signal: self.fail_signal.clone(),
            destroyed: AtomicBool::new(false),
        }))
    }
}

pub struct MockNegotiator {
    role: CallRole,
    events: NegotiationSink,
    log: Arc<Mutex<NegotiatorLog>>,
    auto_describe: bool,
    fail_signal: Arc<AtomicBool>,
    destroyed: AtomicBool,
}

#[async_trait]
impl Negotiator for MockNegotiator {
    fn role(&self) -> CallRole {
        self.role
    }

    async fn signal(&self, remote: SessionDescription) -> Result<(), NegotiationError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Closed);
        }
        if self.fail_signal.load(Ordering::SeqCst) {
            return Err(NegotiationError::InvalidDescription("mock".to_string()));
        }
        let attempt = self.events.attempt();
        self.log.lock().unwrap().signals.push((attempt, remote));

        if self.auto_describe {
            if self.role == CallRole::Responder {
                self.events.local_description(answer_for(attempt));
            }
            self.events.remote_stream(
                MediaStream::new(format!("remote-{attempt}"))
                    .with_track(MediaTrack::new("audio", MediaKind::Audio))
                    .with_track(MediaTrack::new("video", MediaKind::Video)),
            );
        }
        Ok(())
    }

    async fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.log
                .lock()
                .unwrap()
                .destroyed
                .push(self.events.attempt());
        }
    }
}

/// Applies every queued negotiation update to the manager.
pub async fn pump(calls: &CallManager, updates: &mut mpsc::UnboundedReceiver<NegotiationUpdate>) {
    while let Ok(update) = updates.try_recv() {
        calls.handle_negotiation_update(update).await;
    }
}

/// Stand-in for the relay server: routes events between joined clients the
/// way the signaling server does.
#[derive(Default)]
pub struct LoopbackHub {
    clients: Mutex<HashMap<String, mpsc::UnboundedSender<(String, Value)>>>,
    rejoins: AtomicU64,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Joins a client with a fixed id. Its inbox gets `me` first.
    pub fn join_as(
        self: &Arc<Self>,
        id: &str,
    ) -> (Arc<LoopbackRelay>, mpsc::UnboundedReceiver<(String, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(id, &tx);
        (
            Arc::new(LoopbackRelay {
                hub: self.clone(),
                id: Mutex::new(id.to_string()),
                inbox: tx,
            }),
            rx,
        )
    }

    fn register(&self, id: &str, inbox: &mpsc::UnboundedSender<(String, Value)>) {
        let _ = inbox.send(("me".to_string(), json!(id)));
        self.clients
            .lock()
            .unwrap()
            .insert(id.to_string(), inbox.clone());
    }

    fn deliver(&self, to: &str, event: &str, payload: Value) {
        if let Some(tx) = self.clients.lock().unwrap().get(to) {
            let _ = tx.send((event.to_string(), payload));
        }
    }

    fn route(&self, from: &str, event: &str, payload: Value) {
        let field = |name: &str| {
            payload
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match event {
            "callUser" => self.deliver(
                &field("userToCall"),
                "callUser",
                json!({
                    "signal": payload.get("signalData").cloned().unwrap_or(Value::Null),
                    "from": field("from"),
                    "name": field("name"),
                }),
            ),
            "answerCall" => self.deliver(
                &field("to"),
                "callAccepted",
                payload.get("signal").cloned().unwrap_or(Value::Null),
            ),
            "endCall" => self.deliver(&field("id"), "endCall", json!({"id": from})),
            _ => {}
        }
    }
}

pub struct LoopbackRelay {
    hub: Arc<LoopbackHub>,
    id: Mutex<String>,
    inbox: mpsc::UnboundedSender<(String, Value)>,
}

impl LoopbackRelay {
    fn current_id(&self) -> String {
        self.id.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayChannel for LoopbackRelay {
    async fn send(&self, event: &str, payload: Value) -> Result<(), anyhow::Error> {
        self.hub.route(&self.current_id(), event, payload);
        Ok(())
    }

    /// Leaves the hub and joins again under a fresh id, like a new socket.
    async fn reconnect(&self) -> Result<(), anyhow::Error> {
        let mut id = self.id.lock().unwrap();
        self.hub.clients.lock().unwrap().remove(id.as_str());
        let rejoin = self.hub.rejoins.fetch_add(1, Ordering::SeqCst) + 1;
        *id = format!("{id}-{rejoin}");
        self.hub.register(&id, &self.inbox);
        Ok(())
    }

    async fn disconnect(&self) {
        self.hub.clients.lock().unwrap().remove(&self.current_id());
    }
}
