//! WebRTC-backed negotiator.
//!
//! Descriptions are exchanged without trickle ICE: the local description is
//! only handed to the sink once candidate gathering finished (or timed out),
//! so a single `callUser` / `answerCall` message carries everything the peer
//! needs. The wire form is the browser's `{"type": "...", "sdp": "..."}`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{MediaKind, MediaStream, MediaTrack};
use crate::calls::negotiation::{
    NegotiationError, NegotiationSink, Negotiator, NegotiatorFactory,
};
use crate::calls::signaling::SessionDescription;
use crate::calls::state::CallRole;
use crate::config::DEFAULT_ICE_SERVER;

/// Local tracks to publish, attached to a [`MediaStream`] as its handle.
#[derive(Clone, Default)]
pub struct LocalTracks(pub Vec<Arc<dyn TrackLocal + Send + Sync>>);

/// Remote tracks received so far, attached to the reported remote stream.
#[derive(Clone, Default)]
pub struct RemoteTracks(pub Vec<Arc<TrackRemote>>);

#[derive(Debug, Clone)]
pub struct WebRtcNegotiatorConfig {
    /// STUN/TURN urls.
    pub ice_servers: Vec<String>,
    /// Upper bound on ICE gathering before the description is sent anyway.
    pub gather_timeout: Duration,
}

impl Default for WebRtcNegotiatorConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            gather_timeout: Duration::from_secs(5),
        }
    }
}

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

pub struct WebRtcNegotiatorFactory {
    config: WebRtcNegotiatorConfig,
}

impl WebRtcNegotiatorFactory {
    pub fn new(config: WebRtcNegotiatorConfig) -> Self {
        Self { config }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Arc::new(
            api.new_peer_connection(self.rtc_configuration()).await?,
        ))
    }
}

impl Default for WebRtcNegotiatorFactory {
    fn default() -> Self {
        Self::new(WebRtcNegotiatorConfig::default())
    }
}

#[async_trait]
impl NegotiatorFactory for WebRtcNegotiatorFactory {
    async fn create(
        &self,
        role: CallRole,
        local_stream: Option<MediaStream>,
        events: NegotiationSink,
    ) -> Result<Box<dyn Negotiator>, NegotiationError> {
        let pc = self.new_peer_connection().await?;

        let local_tracks = local_stream
            .as_ref()
            .and_then(|s| s.handle::<LocalTracks>())
            .map(|t| t.0.clone())
            .unwrap_or_default();

        for track in local_tracks.iter() {
            pc.add_track(Arc::clone(track)).await?;
        }

        // Without local tracks the offer still has to ask for the peer's media.
        if local_tracks.is_empty() && role == CallRole::Initiator {
            pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
                .await?;
            pc.add_transceiver_from_kind(RTPCodecType::Video, None)
                .await?;
        }

        let closed = Arc::new(AtomicBool::new(false));
        install_callbacks(&pc, &events, &closed);

        let negotiator = WebRtcNegotiator {
            role,
            pc,
            events,
            gather_timeout: self.config.gather_timeout,
            closed,
        };

        if role == CallRole::Initiator {
            negotiator.spawn_local_description();
        }

        Ok(Box::new(negotiator))
    }
}

fn install_callbacks(pc: &Arc<RTCPeerConnection>, events: &NegotiationSink, closed: &Arc<AtomicBool>) {
    let attempt = events.attempt();
    let remote = Arc::new(Mutex::new(RemoteTracks::default()));

    let sink = events.clone();
    let closed_for_track = Arc::clone(closed);
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let sink = sink.clone();
            let remote = Arc::clone(&remote);
            let closed = Arc::clone(&closed_for_track);
            Box::pin(async move {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                info!(
                    "Remote {} track {} on stream {} (attempt {})",
                    track.kind(),
                    track.id(),
                    track.stream_id(),
                    attempt
                );
                let mut tracks = remote.lock().await;
                tracks.0.push(track);
                sink.remote_stream(remote_stream(&tracks));
            })
        },
    ));

    let sink = events.clone();
    let closed_for_state = Arc::clone(closed);
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = sink.clone();
        let closed = Arc::clone(&closed_for_state);
        Box::pin(async move {
            debug!("Peer connection state for attempt {attempt}: {state}");
            if state == RTCPeerConnectionState::Failed && !closed.load(Ordering::SeqCst) {
                sink.failed("peer connection failed");
            }
        })
    }));
}

fn remote_stream(tracks: &RemoteTracks) -> MediaStream {
    let id = tracks
        .0
        .first()
        .map(|t| t.stream_id())
        .unwrap_or_else(|| "remote".to_string());
    let mut stream = MediaStream::new(id);
    for track in &tracks.0 {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        stream.add_track(MediaTrack::new(track.id(), kind));
    }
    stream.with_handle(tracks.clone())
}

pub struct WebRtcNegotiator {
    role: CallRole,
    pc: Arc<RTCPeerConnection>,
    events: NegotiationSink,
    gather_timeout: Duration,
    closed: Arc<AtomicBool>,
}

impl WebRtcNegotiator {
    fn spawn_local_description(&self) {
        let pc = Arc::clone(&self.pc);
        let events = self.events.clone();
        let closed = Arc::clone(&self.closed);
        let role = self.role;
        let gather_timeout = self.gather_timeout;
        tokio::spawn(async move {
            match create_local_description(&pc, role, gather_timeout).await {
                Ok(description) if !closed.load(Ordering::SeqCst) => {
                    events.local_description(description)
                }
                Ok(_) => debug!("Discarding local description of a destroyed negotiator"),
                Err(e) if !closed.load(Ordering::SeqCst) => events.failed(e.to_string()),
                Err(e) => debug!("Ignoring error from destroyed negotiator: {e}"),
            }
        });
    }
}

async fn create_local_description(
    pc: &RTCPeerConnection,
    role: CallRole,
    gather_timeout: Duration,
) -> Result<SessionDescription, NegotiationError> {
    let description = match role {
        CallRole::Initiator => pc.create_offer(None).await?,
        CallRole::Responder => pc.create_answer(None).await?,
    };

    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(description).await?;
    if tokio::time::timeout(gather_timeout, gathered.recv())
        .await
        .is_err()
    {
        warn!("ICE gathering did not finish within {gather_timeout:?}, sending partial candidates");
    }

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| NegotiationError::Backend("no local description".to_string()))?;
    let value = serde_json::to_value(&local)
        .map_err(|e| NegotiationError::Backend(e.to_string()))?;
    Ok(SessionDescription::new(value))
}

fn parse_description(remote: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    serde_json::from_value::<RTCSessionDescription>(remote.into_value())
        .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
}

#[async_trait]
impl Negotiator for WebRtcNegotiator {
    fn role(&self) -> CallRole {
        self.role
    }

    async fn signal(&self, remote: SessionDescription) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Closed);
        }
        let description = parse_description(remote)?;
        self.pc.set_remote_description(description).await?;

        match self.role {
            CallRole::Responder => self.spawn_local_description(),
            CallRole::Initiator => {
                debug!("Remote answer applied for attempt {}", self.events.attempt())
            }
        }
        Ok(())
    }

    async fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection: {e}");
        }
        debug!("WebRTC negotiator for attempt {} closed", self.events.attempt());
    }
}
