//! Peer connection ownership for one call
//!
//! The [`ConnectionManager`] owns the peer connection of a call together
//! with every track involved in it: local capture, the optional screen
//! capture, and tracks received from the peer. It alone stops tracks.
//!
//! Remote ICE candidates may arrive before the connection exists (the
//! callee is still ringing) or before the remote description is applied.
//! Those candidates wait in the [`IceCandidateBuffer`] and are applied in
//! arrival order as part of [`ConnectionManager::set_remote_description`].
//! All state sits behind one async mutex held for the full duration of each
//! operation, so a candidate arriving during a flush queues behind it and
//! cannot overtake earlier candidates.

use crate::media::{
    LocalMediaHandle, MediaAcquirer, MediaError, MediaTrack, TrackKind, TrackOrigin,
    TrackReadyState, TrackView,
};
use crate::peer::{
    ConnectionEvent, ConnectionEventSender, ConnectionStats, PeerTransport, PeerTransportFactory,
    SenderId, TransportError,
};
use crate::types::{IceCandidate, IceServer, SessionDescriptor};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// `create` has not been called yet
    #[error("Peer connection not created")]
    NotCreated,

    /// The connection was cleaned up
    #[error("Peer connection closed")]
    Closed,

    /// The underlying transport rejected the operation
    #[error("{operation} failed: {source}")]
    Transport {
        /// Operation that failed
        operation: &'static str,
        /// Transport error
        #[source]
        source: TransportError,
    },
}

impl NegotiationError {
    fn transport(operation: &'static str) -> impl FnOnce(TransportError) -> Self {
        move |source| Self::Transport { operation, source }
    }
}

/// Screen share errors, local to the screen-share toggle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScreenShareError {
    /// The call has no outgoing video sender (it started audio-only)
    #[error("No video sender available; the call was started without video")]
    NoVideoSenderAvailable,

    /// User dismissed the screen picker
    #[error("Screen share cancelled by user")]
    UserCancelled,

    /// Platform cannot capture the screen
    #[error("Screen share not supported")]
    Unsupported,

    /// Screen capture permission denied
    #[error("Screen capture permission denied")]
    PermissionDenied,

    /// No live peer connection
    #[error("Peer connection not established")]
    NotConnected,

    /// Sender track replacement failed
    #[error("Failed to replace outgoing track: {0}")]
    Transport(TransportError),
}

impl From<MediaError> for ScreenShareError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(_) => Self::PermissionDenied,
            MediaError::UserCancelled => Self::UserCancelled,
            MediaError::ScreenShareUnsupported | MediaError::DeviceUnavailable(_) => {
                Self::Unsupported
            }
        }
    }
}

/// What happened to a remote candidate handed to the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Applied to the connection
    Applied,
    /// Queued until the remote description is set
    Buffered,
    /// Applying failed; logged and skipped
    Rejected,
    /// Discarded (buffer full or connection closed)
    Dropped,
}

/// FIFO queue of remote candidates that cannot be applied yet
#[derive(Debug)]
pub struct IceCandidateBuffer {
    queue: VecDeque<IceCandidate>,
    limit: usize,
    dropped: usize,
}

impl IceCandidateBuffer {
    /// Empty buffer holding at most `limit` candidates
    pub fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    /// Append a candidate; returns `false` if the buffer is full
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if self.queue.len() >= self.limit {
            self.dropped += 1;
            return false;
        }
        self.queue.push_back(candidate);
        true
    }

    /// Remove and return all candidates in arrival order
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    /// Discard everything
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Buffered candidates
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Candidates discarded because the buffer was full
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

struct ScreenShare {
    track: MediaTrack,
    watcher: JoinHandle<()>,
}

struct ConnectionInner {
    transport: Option<Arc<dyn PeerTransport>>,
    closed: bool,
    remote_description_set: bool,
    candidates: IceCandidateBuffer,
    local_tracks: Vec<MediaTrack>,
    video_sender: Option<SenderId>,
    outgoing_video: Option<String>,
    screen: Option<ScreenShare>,
    remote_tracks: Vec<MediaTrack>,
}

impl ConnectionInner {
    fn set_enabled(&mut self, kind: TrackKind, enabled: Option<bool>) -> bool {
        let mut tracks = self
            .local_tracks
            .iter()
            .filter(|t| t.kind() == kind && t.origin() != TrackOrigin::Screen)
            .peekable();
        let Some(first) = tracks.peek() else {
            return false;
        };
        let new_state = enabled.unwrap_or(!first.is_enabled());
        for track in tracks {
            track.set_enabled(new_state);
        }
        new_state
    }

    /// Put the camera back on the video sender and stop the screen track.
    async fn restore_camera(&mut self, screen: MediaTrack) -> Option<TrackView> {
        let transport = self.transport.clone();
        let camera = self
            .local_tracks
            .iter()
            .find(|t| {
                t.origin() == TrackOrigin::Camera && t.ready_state() == TrackReadyState::Live
            });

        if let (Some(transport), Some(sender)) = (transport, self.video_sender) {
            match transport.replace_track(sender, camera).await {
                Ok(()) => {
                    tracing::debug!(
                        sender = %sender,
                        camera = camera.map(MediaTrack::id),
                        "Outgoing video restored"
                    );
                }
                Err(e) => {
                    tracing::warn!(sender = %sender, error = %e, "Failed to restore outgoing video");
                }
            }
        }

        let restored = camera.map(MediaTrack::view);
        self.outgoing_video = camera.map(|t| t.id().to_string());
        screen.stop();
        restored
    }
}

/// Owner of one call's peer connection and media tracks
pub struct ConnectionManager {
    inner: Arc<Mutex<ConnectionInner>>,
    factory: Arc<dyn PeerTransportFactory>,
    events: ConnectionEventSender,
}

impl ConnectionManager {
    /// Create a manager; no connection exists until [`create`](Self::create)
    #[must_use]
    pub fn new(
        factory: Arc<dyn PeerTransportFactory>,
        events: ConnectionEventSender,
        max_buffered_candidates: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConnectionInner {
                transport: None,
                closed: false,
                remote_description_set: false,
                candidates: IceCandidateBuffer::new(max_buffered_candidates),
                local_tracks: Vec::new(),
                video_sender: None,
                outgoing_video: None,
                screen: None,
                remote_tracks: Vec::new(),
            })),
            factory,
            events,
        }
    }

    /// Create the peer connection, or return the existing one
    ///
    /// # Errors
    ///
    /// Returns error if the manager was cleaned up or the transport cannot
    /// be created
    #[tracing::instrument(skip(self, ice_servers), fields(ice_servers = ice_servers.len()))]
    pub async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(NegotiationError::Closed);
        }
        if let Some(transport) = &inner.transport {
            tracing::debug!("Peer connection already created");
            return Ok(Arc::clone(transport));
        }

        let transport = self
            .factory
            .create(ice_servers, self.events.clone())
            .await
            .map_err(NegotiationError::transport("create peer connection"))?;
        inner.transport = Some(Arc::clone(&transport));
        tracing::debug!(buffered = inner.candidates.len(), "Peer connection created");
        Ok(transport)
    }

    /// Whether a connection exists and has not been cleaned up
    pub async fn is_created(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.transport.is_some() && !inner.closed
    }

    /// Attach every track of `handle` as an outgoing sender
    ///
    /// The manager takes ownership of the tracks whether or not attaching
    /// succeeds; cleanup stops them either way.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is missing or rejects a track
    pub async fn add_local_tracks(&self, handle: LocalMediaHandle) -> Result<(), NegotiationError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(NegotiationError::Closed);
        }
        let transport = inner.transport.clone().ok_or(NegotiationError::NotCreated)?;

        for track in handle.into_tracks() {
            let result = transport.add_track(&track).await;
            let (id, kind) = (track.id().to_string(), track.kind());
            inner.local_tracks.push(track);
            let sender = result.map_err(NegotiationError::transport("add track"))?;

            if kind == TrackKind::Video && inner.video_sender.is_none() {
                inner.video_sender = Some(sender);
                inner.outgoing_video = Some(id.clone());
            }
            tracing::debug!(track_id = %id, kind = ?kind, sender = %sender, "Local track attached");
        }
        Ok(())
    }

    /// Create an offer and set it as the local description
    ///
    /// # Errors
    ///
    /// Returns error if the connection is missing or not in a state that
    /// permits an offer
    pub async fn create_offer(&self) -> Result<SessionDescriptor, NegotiationError> {
        let transport = self.live_transport().await?;
        let offer = transport
            .create_offer()
            .await
            .map_err(NegotiationError::transport("create offer"))?;
        transport
            .set_local_description(&offer)
            .await
            .map_err(NegotiationError::transport("set local description"))?;
        tracing::debug!(sdp_len = offer.sdp().len(), "SDP offer created");
        Ok(offer)
    }

    /// Create an answer and set it as the local description
    ///
    /// # Errors
    ///
    /// Returns error if the connection is missing or has no remote offer
    pub async fn create_answer(&self) -> Result<SessionDescriptor, NegotiationError> {
        let transport = self.live_transport().await?;
        let answer = transport
            .create_answer()
            .await
            .map_err(NegotiationError::transport("create answer"))?;
        transport
            .set_local_description(&answer)
            .await
            .map_err(NegotiationError::transport("set local description"))?;
        tracing::debug!(sdp_len = answer.sdp().len(), "SDP answer created");
        Ok(answer)
    }

    /// Apply the peer's description, then flush buffered candidates in order
    ///
    /// A buffered candidate that fails to apply is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is missing or rejects the description
    #[tracing::instrument(skip(self, desc), fields(kind = ?desc.kind(), sdp_len = desc.sdp().len()))]
    pub async fn set_remote_description(
        &self,
        desc: &SessionDescriptor,
    ) -> Result<(), NegotiationError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(NegotiationError::Closed);
        }
        let transport = inner.transport.clone().ok_or(NegotiationError::NotCreated)?;

        transport
            .set_remote_description(desc)
            .await
            .map_err(NegotiationError::transport("set remote description"))?;
        inner.remote_description_set = true;

        let pending = inner.candidates.drain();
        let total = pending.len();
        let mut applied = 0usize;
        for candidate in pending {
            match transport.add_ice_candidate(&candidate).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::warn!(candidate = %candidate.candidate, error = %e, "Failed to apply buffered ICE candidate");
                }
            }
        }
        if total > 0 {
            tracing::debug!(total, applied, "Flushed buffered ICE candidates");
        }
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the remote description is set
    ///
    /// Safe to call before [`create`](Self::create).
    pub async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> CandidateDisposition {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            tracing::debug!("Connection closed, dropping ICE candidate");
            return CandidateDisposition::Dropped;
        }

        match (&inner.transport, inner.remote_description_set) {
            (Some(transport), true) => match transport.add_ice_candidate(&candidate).await {
                Ok(()) => {
                    tracing::trace!("ICE candidate applied");
                    CandidateDisposition::Applied
                }
                Err(e) => {
                    tracing::warn!(candidate = %candidate.candidate, error = %e, "Failed to apply ICE candidate");
                    CandidateDisposition::Rejected
                }
            },
            _ => {
                if inner.candidates.push(candidate) {
                    tracing::trace!(buffered = inner.candidates.len(), "ICE candidate buffered");
                    CandidateDisposition::Buffered
                } else {
                    tracing::warn!(
                        dropped = inner.candidates.dropped(),
                        "ICE candidate buffer full, dropping candidate"
                    );
                    CandidateDisposition::Dropped
                }
            }
        }
    }

    /// Number of candidates waiting for the remote description
    pub async fn buffered_candidates(&self) -> usize {
        self.inner.lock().await.candidates.len()
    }

    /// Flip or set the enabled flag of all local audio tracks
    ///
    /// Returns the resulting state, `false` if there is no audio track.
    pub async fn toggle_audio(&self, enabled: Option<bool>) -> bool {
        self.inner.lock().await.set_enabled(TrackKind::Audio, enabled)
    }

    /// Flip or set the enabled flag of all local camera tracks
    ///
    /// Returns the resulting state, `false` if there is no camera track.
    pub async fn toggle_video(&self, enabled: Option<bool>) -> bool {
        self.inner.lock().await.set_enabled(TrackKind::Video, enabled)
    }

    /// Replace the outgoing camera with a screen capture, without renegotiation
    ///
    /// The sender is checked before the capture is requested, so an
    /// audio-only call never prompts for the screen. If the capture ends
    /// outside the API, the camera is restored automatically and a
    /// [`ConnectionEvent::ScreenShareEnded`] is emitted.
    ///
    /// # Errors
    ///
    /// Returns error if there is no video sender, the capture fails, or the
    /// sender rejects the track
    pub async fn start_screen_share(
        &self,
        media: &dyn MediaAcquirer,
    ) -> Result<TrackView, ScreenShareError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(ScreenShareError::NotConnected);
        }
        let transport = inner.transport.clone().ok_or(ScreenShareError::NotConnected)?;
        if let Some(screen) = &inner.screen {
            tracing::debug!(track_id = %screen.track.id(), "Screen share already active");
            return Ok(screen.track.view());
        }
        let sender = inner
            .video_sender
            .ok_or(ScreenShareError::NoVideoSenderAvailable)?;

        let track = media
            .acquire_screen()
            .await?
            .into_tracks()
            .into_iter()
            .find(|t| t.kind() == TrackKind::Video)
            .ok_or(ScreenShareError::Unsupported)?;

        transport
            .replace_track(sender, Some(&track))
            .await
            .map_err(ScreenShareError::Transport)?;

        let view = track.view();
        let watcher = self.spawn_screen_watcher(track.view());
        inner.outgoing_video = Some(track.id().to_string());
        inner.screen = Some(ScreenShare { track, watcher });
        tracing::info!(track_id = %view.id(), sender = %sender, "Screen share started");
        Ok(view)
    }

    /// Put the camera back on the video sender and stop the screen capture
    ///
    /// Leaves the sender muted if there is no camera. Returns `false` if no
    /// screen share was active.
    pub async fn stop_screen_share(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(screen) = inner.screen.take() else {
            return false;
        };
        screen.watcher.abort();
        let track_id = screen.track.id().to_string();
        inner.restore_camera(screen.track).await;
        tracing::info!(track_id = %track_id, "Screen share stopped");
        true
    }

    fn spawn_screen_watcher(&self, view: TrackView) -> JoinHandle<()> {
        let weak: Weak<Mutex<ConnectionInner>> = Arc::downgrade(&self.inner);
        let events = self.events.clone();
        tokio::spawn(async move {
            view.ended().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut inner = inner.lock().await;
            let is_current = inner
                .screen
                .as_ref()
                .is_some_and(|s| s.track.id() == view.id());
            if !is_current {
                return;
            }
            let Some(screen) = inner.screen.take() else {
                return;
            };
            tracing::info!(track_id = %view.id(), "Screen capture ended, restoring camera");
            // This runs inside the watcher task, so detach instead of aborting
            drop(screen.watcher);
            let restored = inner.restore_camera(screen.track).await;
            drop(inner);
            let _ = events.send(ConnectionEvent::ScreenShareEnded {
                track_id: view.id().to_string(),
                restored,
            });
        })
    }

    /// Take ownership of a track received from the peer
    ///
    /// After cleanup the track is stopped right away.
    pub async fn adopt_remote_track(&self, track: MediaTrack) -> TrackView {
        let view = track.view();
        let mut inner = self.inner.lock().await;
        if inner.closed {
            tracing::debug!(track_id = %track.id(), "Connection closed, stopping late remote track");
            track.stop();
        } else {
            tracing::debug!(track_id = %track.id(), kind = ?track.kind(), "Remote track adopted");
            inner.remote_tracks.push(track);
        }
        view
    }

    /// Views of local capture tracks
    pub async fn local_tracks(&self) -> Vec<TrackView> {
        self.inner.lock().await.local_tracks.iter().map(MediaTrack::view).collect()
    }

    /// Views of tracks received from the peer
    pub async fn remote_tracks(&self) -> Vec<TrackView> {
        self.inner.lock().await.remote_tracks.iter().map(MediaTrack::view).collect()
    }

    /// View of the active screen capture
    pub async fn screen_track(&self) -> Option<TrackView> {
        self.inner.lock().await.screen.as_ref().map(|s| s.track.view())
    }

    /// Id of the track currently on the outgoing video sender
    pub async fn outgoing_video_track(&self) -> Option<String> {
        self.inner.lock().await.outgoing_video.clone()
    }

    /// Whether a video sender exists
    pub async fn has_video_sender(&self) -> bool {
        self.inner.lock().await.video_sender.is_some()
    }

    /// Traffic counters of the peer connection
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::NotCreated`] before [`create`](Self::create)
    /// and [`NegotiationError::Closed`] after [`cleanup`](Self::cleanup)
    pub async fn stats(&self) -> Result<ConnectionStats, NegotiationError> {
        let transport = self.live_transport().await?;
        transport
            .stats()
            .await
            .map_err(NegotiationError::transport("get stats"))
    }

    /// Whether [`cleanup`](Self::cleanup) has run
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    /// Stop every track, close the connection and clear the candidate buffer
    ///
    /// Idempotent. Failures are logged and never stop later steps.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            tracing::trace!("Connection already cleaned up");
            return;
        }
        inner.closed = true;

        if let Some(screen) = inner.screen.take() {
            screen.watcher.abort();
            screen.track.stop();
        }
        let local = inner.local_tracks.len();
        for track in inner.local_tracks.drain(..) {
            track.stop();
        }
        let remote = inner.remote_tracks.len();
        for track in inner.remote_tracks.drain(..) {
            track.stop();
        }
        let discarded = inner.candidates.len();
        inner.candidates.clear();
        inner.video_sender = None;
        inner.outgoing_video = None;

        if let Some(transport) = inner.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!(error = %e, "Failed to close peer connection");
            }
        }

        tracing::info!(
            local_tracks = local,
            remote_tracks = remote,
            discarded_candidates = discarded,
            "Connection cleaned up"
        );
    }

    async fn live_transport(&self) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let inner = self.inner.lock().await;
        if inner.closed {
            return Err(NegotiationError::Closed);
        }
        inner.transport.clone().ok_or(NegotiationError::NotCreated)
    }
}
