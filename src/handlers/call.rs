use super::traits::RelayEventHandler;
use crate::calls::{CallManager, InboundSignal, SignalingEvent};
use async_trait::async_trait;
use log::warn;
use serde_json::Value;

fn decode(event: SignalingEvent, payload: Value) -> Option<InboundSignal> {
    match InboundSignal::decode(event, payload) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!("Dropping relay message: {e}");
            None
        }
    }
}

/// Handler for `me`: the relay assigned this connection its id.
#[derive(Default)]
pub struct LocalIdHandler;

#[async_trait]
impl RelayEventHandler for LocalIdHandler {
    fn event(&self) -> SignalingEvent {
        SignalingEvent::Me
    }

    async fn handle(&self, calls: &CallManager, payload: Value) -> bool {
        match decode(self.event(), payload) {
            Some(InboundSignal::Me(id)) => {
                calls.handle_local_id(id).await;
                true
            }
            _ => false,
        }
    }
}

/// Handler for inbound `callUser` offers.
#[derive(Default)]
pub struct IncomingCallHandler;

#[async_trait]
impl RelayEventHandler for IncomingCallHandler {
    fn event(&self) -> SignalingEvent {
        SignalingEvent::CallUser
    }

    async fn handle(&self, calls: &CallManager, payload: Value) -> bool {
        match decode(self.event(), payload) {
            Some(InboundSignal::CallUser(call)) => {
                calls.handle_incoming_call(call).await;
                true
            }
            _ => false,
        }
    }
}

/// Handler for `callAccepted`, the callee's answer.
#[derive(Default)]
pub struct CallAcceptedHandler;

#[async_trait]
impl RelayEventHandler for CallAcceptedHandler {
    fn event(&self) -> SignalingEvent {
        SignalingEvent::CallAccepted
    }

    async fn handle(&self, calls: &CallManager, payload: Value) -> bool {
        match decode(self.event(), payload) {
            Some(InboundSignal::CallAccepted(answer)) => {
                calls.handle_call_accepted(answer).await;
                true
            }
            _ => false,
        }
    }
}

/// Handler for `endCall` from the peer.
#[derive(Default)]
pub struct EndCallHandler;

#[async_trait]
impl RelayEventHandler for EndCallHandler {
    fn event(&self) -> SignalingEvent {
        SignalingEvent::EndCall
    }

    async fn handle(&self, calls: &CallManager, payload: Value) -> bool {
        match decode(self.event(), payload) {
            Some(InboundSignal::EndCall { id }) => {
                calls.handle_remote_end(id).await;
                true
            }
            _ => false,
        }
    }
}
