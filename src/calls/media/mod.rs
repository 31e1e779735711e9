//! Local and remote media stream handles.
//!
//! The state machine never touches media samples. It only carries stream
//! handles between the [`MediaSource`], the negotiator and the presentation
//! layer. Backends attach their own track objects through
//! [`MediaStream::with_handle`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[cfg(feature = "webrtc")]
pub mod webrtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// A set of tracks that are rendered together.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
    handle: Option<Arc<dyn Any + Send + Sync>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
            handle: None,
        }
    }

    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.add_track(track);
        self
    }

    /// Attach a backend-specific object (e.g. native track handles).
    pub fn with_handle<T: Any + Send + Sync>(mut self, handle: T) -> Self {
        self.handle = Some(Arc::new(handle));
        self
    }

    /// Adds a track unless one with the same id is already present.
    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Audio)
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Video)
    }

    pub fn handle<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.handle.as_deref().and_then(|h| h.downcast_ref::<T>())
    }

    /// Copy of this stream keeping only the kinds allowed by `constraints`.
    pub fn restricted_to(&self, constraints: MediaConstraints) -> Self {
        Self {
            id: self.id.clone(),
            tracks: self
                .tracks
                .iter()
                .filter(|t| constraints.allows(t.kind))
                .cloned()
                .collect(),
            handle: self.handle.clone(),
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.tracks == other.tracks
    }
}

/// What to ask the media source for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn allows(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission to capture media was denied")]
    Denied,

    #[error("no capture device available")]
    Unavailable,

    #[error("capture failed: {0}")]
    Capture(String),
}

/// Asynchronous acquisition of the local stream.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;
}

/// Media source for clients without capture devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMediaSource;

#[async_trait]
impl MediaSource for NoMediaSource {
    async fn acquire(&self, _constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        Err(MediaError::Unavailable)
    }
}

/// Hands out a stream built ahead of time.
#[derive(Debug, Clone)]
pub struct StaticMediaSource {
    stream: MediaStream,
}

impl StaticMediaSource {
    pub fn new(stream: MediaStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError> {
        let stream = self.stream.restricted_to(constraints);
        if stream.tracks().is_empty() {
            return Err(MediaError::Unavailable);
        }
        Ok(stream)
    }
}
