//! Media capture and track ownership
//!
//! # Ownership
//!
//! A [`MediaTrack`] is the owning handle of one captured (or received) track.
//! It is not `Clone`: exactly one owner exists, and that owner is the
//! [`ConnectionManager`](crate::connection::ConnectionManager) once the
//! track has been attached. Dropping a `MediaTrack` stops it, so a handle
//! lost on an error path never leaves a camera running.
//!
//! Everything else (UI, call events, snapshots) gets a [`TrackView`], a
//! cloneable read-only reference that can observe the enabled flag and the
//! ready state but can neither stop nor re-enable the track.
//!
//! The capture layer keeps a [`TrackSource`] for tracks it produced. It
//! models the device side: `end()` is what happens when the OS-level
//! "stop sharing" control is pressed or a camera is unplugged.

use crate::types::MediaConstraints;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or OS denied access to the device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device missing or busy
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Platform cannot capture the screen
    #[error("Screen share is not supported on this platform")]
    ScreenShareUnsupported,

    /// User dismissed the screen picker
    #[error("Screen share cancelled by user")]
    UserCancelled,
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track (camera or screen)
    Video,
}

impl TrackKind {
    /// Default codec MIME type for outgoing tracks of this kind
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Audio => "audio/opus",
            Self::Video => "video/VP8",
        }
    }

    /// RTP clock rate of the default codec
    pub fn clock_rate(&self) -> u32 {
        match self {
            Self::Audio => 48000,
            Self::Video => 90000,
        }
    }

    /// Channel count of the default codec
    pub fn channels(&self) -> u16 {
        match self {
            Self::Audio => 2,
            Self::Video => 0,
        }
    }
}

/// Where a track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackOrigin {
    /// Local microphone
    Microphone,
    /// Local camera
    Camera,
    /// Local screen capture
    Screen,
    /// Received from the remote peer
    Remote,
}

/// Track lifecycle, mirroring `MediaStreamTrack.readyState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackReadyState {
    /// Producing media
    Live,
    /// Stopped or ended, never live again
    Ended,
}

#[derive(Debug)]
struct TrackShared {
    id: String,
    kind: TrackKind,
    origin: TrackOrigin,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    stop_count: AtomicUsize,
}

impl TrackShared {
    fn end(&self) -> bool {
        self.ended.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        })
    }

    fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }
}

/// Owning handle of a single media track
#[derive(Debug)]
pub struct MediaTrack {
    shared: Arc<TrackShared>,
}

impl MediaTrack {
    /// Create a live, enabled track
    pub fn new(kind: TrackKind, origin: TrackOrigin, label: impl Into<String>) -> Self {
        let prefix = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        Self::with_id(format!("{prefix}-{}", Uuid::new_v4()), kind, origin, label)
    }

    /// Create a live, enabled track with a known id
    pub fn with_id(
        id: impl Into<String>,
        kind: TrackKind,
        origin: TrackOrigin,
        label: impl Into<String>,
    ) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            shared: Arc::new(TrackShared {
                id: id.into(),
                kind,
                origin,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
                stop_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Track received from the remote peer
    pub fn remote(id: impl Into<String>, kind: TrackKind) -> Self {
        Self::with_id(id, kind, TrackOrigin::Remote, "remote")
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.shared.kind
    }

    /// Where the track comes from
    pub fn origin(&self) -> TrackOrigin {
        self.shared.origin
    }

    /// Whether the track currently produces media
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Live or ended
    pub fn ready_state(&self) -> TrackReadyState {
        if self.shared.is_ended() {
            TrackReadyState::Ended
        } else {
            TrackReadyState::Live
        }
    }

    /// Read-only reference for observers
    pub fn view(&self) -> TrackView {
        TrackView {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Device-side handle able to end the track
    pub fn source(&self) -> TrackSource {
        TrackSource {
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop the track. Returns `true` if this call ended it.
    pub(crate) fn stop(&self) -> bool {
        let stopped = self.shared.end();
        if stopped {
            self.shared.stop_count.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(track_id = %self.shared.id, kind = ?self.shared.kind, "Track stopped");
        }
        stopped
    }
}

impl Drop for MediaTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Non-owning, read-only track reference
#[derive(Debug, Clone)]
pub struct TrackView {
    shared: Arc<TrackShared>,
}

impl TrackView {
    /// Track identifier
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.shared.kind
    }

    /// Where the track comes from
    pub fn origin(&self) -> TrackOrigin {
        self.shared.origin
    }

    /// Human readable device label
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Whether the track currently produces media
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Live or ended
    pub fn ready_state(&self) -> TrackReadyState {
        if self.shared.is_ended() {
            TrackReadyState::Ended
        } else {
            TrackReadyState::Live
        }
    }

    /// How many times the owner stopped this track (0 or 1)
    pub fn stop_count(&self) -> usize {
        self.shared.stop_count.load(Ordering::SeqCst)
    }

    /// Resolves once the track has ended, for whatever reason
    pub async fn ended(&self) {
        let mut rx = self.shared.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

/// Device-side handle of a captured track
#[derive(Debug, Clone)]
pub struct TrackSource {
    shared: Arc<TrackShared>,
}

impl TrackSource {
    /// Track identifier
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// End the track from outside the call API (OS control, unplugged device)
    pub fn end(&self) {
        if self.shared.end() {
            tracing::info!(track_id = %self.shared.id, "Track ended by its source");
        }
    }

    /// Whether the track has ended
    pub fn is_ended(&self) -> bool {
        self.shared.is_ended()
    }
}

/// Tracks produced by one capture request
#[derive(Debug, Default)]
pub struct LocalMediaHandle {
    tracks: Vec<MediaTrack>,
}

impl LocalMediaHandle {
    /// Wrap captured tracks
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    /// All tracks
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Audio tracks
    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    /// Video tracks
    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// Read-only views of all tracks
    pub fn views(&self) -> Vec<TrackView> {
        self.tracks.iter().map(MediaTrack::view).collect()
    }

    /// Take ownership of the tracks
    pub fn into_tracks(self) -> Vec<MediaTrack> {
        self.tracks
    }

    /// Whether the handle carries no track
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Camera, microphone and screen capture
///
/// Implementations wrap the platform device APIs. Each call corresponds to
/// one permission prompt; callers only invoke it once the user chose to
/// start or accept a call.
#[async_trait]
pub trait MediaAcquirer: Send + Sync {
    /// Capture microphone and optionally camera
    async fn acquire_local(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaHandle, MediaError>;

    /// Capture the screen as a single video track
    async fn acquire_screen(&self) -> Result<LocalMediaHandle, MediaError>;
}

/// Device layer producing generated tracks
///
/// There is no real hardware behind these tracks; they let the engine run
/// end to end (CLI demo, headless peers). Permission and screen capture
/// availability can be switched off to exercise failure paths.
pub struct SyntheticMediaAcquirer {
    permission_granted: AtomicBool,
    screen_capture: AtomicBool,
    acquisitions: AtomicUsize,
    screen_sources: Mutex<Vec<TrackSource>>,
}

impl SyntheticMediaAcquirer {
    /// Acquirer granting every request
    #[must_use]
    pub fn new() -> Self {
        Self {
            permission_granted: AtomicBool::new(true),
            screen_capture: AtomicBool::new(true),
            acquisitions: AtomicUsize::new(0),
            screen_sources: Mutex::new(Vec::new()),
        }
    }

    /// Grant or deny device permission for later requests
    pub fn set_permission(&self, granted: bool) {
        self.permission_granted.store(granted, Ordering::SeqCst);
    }

    /// Enable or disable screen capture support
    pub fn set_screen_capture(&self, supported: bool) {
        self.screen_capture.store(supported, Ordering::SeqCst);
    }

    /// Number of successful `acquire_local` calls
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Simulate the OS "stop sharing" control for every screen capture
    pub fn end_screen_capture(&self) {
        for source in self.screen_sources.lock().drain(..) {
            source.end();
        }
    }
}

impl Default for SyntheticMediaAcquirer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaAcquirer for SyntheticMediaAcquirer {
    #[tracing::instrument(skip(self))]
    async fn acquire_local(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaHandle, MediaError> {
        if !self.permission_granted.load(Ordering::SeqCst) {
            tracing::warn!("Device permission denied");
            return Err(MediaError::PermissionDenied(
                "camera/microphone access denied".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if constraints.has_audio() {
            tracks.push(MediaTrack::new(
                TrackKind::Audio,
                TrackOrigin::Microphone,
                "Synthetic Microphone",
            ));
        }
        if let Some(video) = &constraints.video {
            tracks.push(MediaTrack::new(
                TrackKind::Video,
                TrackOrigin::Camera,
                format!("Synthetic Camera {}x{}@{}", video.width, video.height, video.frame_rate),
            ));
        }
        if tracks.is_empty() {
            return Err(MediaError::DeviceUnavailable(
                "no audio or video requested".to_string(),
            ));
        }

        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tracks = tracks.len(), "Local media acquired");
        Ok(LocalMediaHandle::new(tracks))
    }

    #[tracing::instrument(skip(self))]
    async fn acquire_screen(&self) -> Result<LocalMediaHandle, MediaError> {
        if !self.screen_capture.load(Ordering::SeqCst) {
            return Err(MediaError::ScreenShareUnsupported);
        }
        if !self.permission_granted.load(Ordering::SeqCst) {
            return Err(MediaError::UserCancelled);
        }

        let track = MediaTrack::new(TrackKind::Video, TrackOrigin::Screen, "Synthetic Screen");
        let mut sources = self.screen_sources.lock();
        sources.retain(|s| !s.is_ended());
        sources.push(track.source());
        drop(sources);
        tracing::debug!(track_id = %track.id(), "Screen capture acquired");
        Ok(LocalMediaHandle::new(vec![track]))
    }
}
