//! In-memory doubles for the transport and capture seams
//!
//! Enabled for unit tests and, through the `test-utils` feature, for
//! integration tests and downstream crates.

use crate::media::{
    LocalMediaHandle, MediaAcquirer, MediaError, MediaTrack, TrackKind, TrackOrigin, TrackSource,
    TrackView,
};
use crate::peer::{
    ConnectionEvent, ConnectionEventSender, ConnectionStats, PeerConnectionState, PeerTransport,
    PeerTransportFactory, SenderId, TransportError,
};
use crate::types::{IceCandidate, IceServer, MediaConstraints, SdpKind, SessionDescriptor};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct FakeState {
    local: Option<SessionDescriptor>,
    remote: Option<SessionDescriptor>,
    senders: Vec<(SenderId, TrackKind, Option<String>)>,
    applied: Vec<String>,
    rejected: HashSet<String>,
    offers: usize,
    close_count: usize,
    closed: bool,
    fail_remote: bool,
    fail_close: bool,
    fail_add_track: bool,
    stats: ConnectionStats,
}

/// Peer transport recording every call made on it
pub struct FakePeerTransport {
    id: usize,
    events: ConnectionEventSender,
    ice_servers: Vec<IceServer>,
    gather_candidates: bool,
    state: Mutex<FakeState>,
}

impl FakePeerTransport {
    /// Candidate lines applied so far, in order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    /// Make `add_ice_candidate` fail for this candidate line
    pub fn reject_candidate(&self, candidate: &str) {
        self.state.lock().rejected.insert(candidate.to_string());
    }

    /// Make `set_remote_description` fail
    pub fn fail_remote_description(&self, fail: bool) {
        self.state.lock().fail_remote = fail;
    }

    /// Make `close` fail
    pub fn fail_close(&self, fail: bool) {
        self.state.lock().fail_close = fail;
    }

    /// Make `add_track` fail
    pub fn fail_add_track(&self, fail: bool) {
        self.state.lock().fail_add_track = fail;
    }

    /// Number of `close` calls
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Number of offers created
    pub fn offer_count(&self) -> usize {
        self.state.lock().offers
    }

    /// Applied remote description
    pub fn remote_description(&self) -> Option<SessionDescriptor> {
        self.state.lock().remote.clone()
    }

    /// Applied local description
    pub fn local_description(&self) -> Option<SessionDescriptor> {
        self.state.lock().local.clone()
    }

    /// ICE servers the transport was created with
    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Track ids attached to senders, in sender order
    pub fn sender_tracks(&self) -> Vec<Option<String>> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|(_, _, track)| track.clone())
            .collect()
    }

    /// Track currently on the first video sender
    pub fn video_sender_track(&self) -> Option<String> {
        self.state
            .lock()
            .senders
            .iter()
            .find(|(_, kind, _)| *kind == TrackKind::Video)
            .and_then(|(_, _, track)| track.clone())
    }

    /// Counters returned by later `stats` calls
    pub fn set_stats(&self, stats: ConnectionStats) {
        self.state.lock().stats = stats;
    }

    /// Report a connection state change
    pub fn emit_state(&self, state: PeerConnectionState) {
        let _ = self.events.send(ConnectionEvent::StateChanged(state));
    }

    /// Deliver a track from the peer; returns a view of it
    pub fn emit_remote_track(&self, id: &str, kind: TrackKind) -> TrackView {
        let track = MediaTrack::remote(id, kind);
        let view = track.view();
        let _ = self.events.send(ConnectionEvent::RemoteTrack(track));
        view
    }
}

#[async_trait]
impl PeerTransport for FakePeerTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.fail_add_track {
            return Err(TransportError::Failed("add_track rejected".to_string()));
        }
        let sender = SenderId(state.senders.len() as u32);
        state
            .senders
            .push((sender, track.kind(), Some(track.id().to_string())));
        Ok(sender)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&MediaTrack>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let slot = state
            .senders
            .iter_mut()
            .find(|(id, _, _)| *id == sender)
            .ok_or_else(|| TransportError::Failed(format!("unknown {sender}")))?;
        slot.2 = track.map(|t| t.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescriptor, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.offers += 1;
        let media: Vec<&str> = state
            .senders
            .iter()
            .map(|(_, kind, _)| match kind {
                TrackKind::Audio => "m=audio",
                TrackKind::Video => "m=video",
            })
            .collect();
        Ok(SessionDescriptor::offer(format!(
            "v=0 fake-offer-{}-{} {}",
            self.id,
            state.offers,
            media.join(" ")
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, TransportError> {
        let state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        match &state.remote {
            Some(remote) if remote.kind() == SdpKind::Offer => Ok(SessionDescriptor::answer(
                format!("v=0 fake-answer-{}", self.id),
            )),
            _ => Err(TransportError::InvalidState(
                "no remote offer to answer".to_string(),
            )),
        }
    }

    async fn set_local_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.local = Some(desc.clone());
        }
        if self.gather_candidates {
            let mut candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host",
                self.id, self.id, self.id
            ));
            candidate.sdp_mid = Some("0".to_string());
            candidate.sdp_mline_index = Some(0);
            let _ = self.events.send(ConnectionEvent::LocalIceCandidate(candidate));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.fail_remote || desc.sdp().is_empty() {
            return Err(TransportError::InvalidSdp("rejected".to_string()));
        }
        state.remote = Some(desc.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.remote.is_none() {
            return Err(TransportError::InvalidState(
                "remote description not set".to_string(),
            ));
        }
        if state.rejected.contains(&candidate.candidate) {
            return Err(TransportError::InvalidCandidate(candidate.candidate.clone()));
        }
        state.applied.push(candidate.candidate.clone());
        Ok(())
    }

    async fn stats(&self) -> Result<ConnectionStats, TransportError> {
        let state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        Ok(state.stats.clone())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.close_count += 1;
        state.closed = true;
        if state.fail_close {
            return Err(TransportError::Failed("close failed".to_string()));
        }
        Ok(())
    }
}

/// Factory handing out [`FakePeerTransport`]s
pub struct FakeTransportFactory {
    created: Mutex<Vec<Arc<FakePeerTransport>>>,
    fail_create: AtomicBool,
    gather_candidates: AtomicBool,
}

impl FakeTransportFactory {
    /// Factory whose transports gather one local candidate per local description
    #[must_use]
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
            gather_candidates: AtomicBool::new(true),
        }
    }

    /// Make later `create` calls fail
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Whether later transports emit a local candidate
    pub fn set_gather_candidates(&self, gather: bool) {
        self.gather_candidates.store(gather, Ordering::SeqCst);
    }

    /// Number of transports created
    pub fn create_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Most recently created transport
    pub fn last(&self) -> Option<Arc<FakePeerTransport>> {
        self.created.lock().last().cloned()
    }

    /// All transports created so far
    pub fn transports(&self) -> Vec<Arc<FakePeerTransport>> {
        self.created.lock().clone()
    }
}

impl Default for FakeTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerTransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: ConnectionEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::Failed("factory unavailable".to_string()));
        }
        let mut created = self.created.lock();
        let transport = Arc::new(FakePeerTransport {
            id: created.len() + 1,
            events,
            ice_servers: ice_servers.to_vec(),
            gather_candidates: self.gather_candidates.load(Ordering::SeqCst),
            state: Mutex::new(FakeState::default()),
        });
        created.push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Capture double remembering every track it produced
pub struct FakeMediaAcquirer {
    deny_local: AtomicBool,
    cancel_screen: AtomicBool,
    local_calls: AtomicUsize,
    screen_calls: AtomicUsize,
    local_tracks: Mutex<Vec<TrackView>>,
    screen_sources: Mutex<Vec<TrackSource>>,
}

impl FakeMediaAcquirer {
    /// Acquirer granting every request
    #[must_use]
    pub fn new() -> Self {
        Self {
            deny_local: AtomicBool::new(false),
            cancel_screen: AtomicBool::new(false),
            local_calls: AtomicUsize::new(0),
            screen_calls: AtomicUsize::new(0),
            local_tracks: Mutex::new(Vec::new()),
            screen_sources: Mutex::new(Vec::new()),
        }
    }

    /// Deny later `acquire_local` calls
    pub fn deny_local(&self, deny: bool) {
        self.deny_local.store(deny, Ordering::SeqCst);
    }

    /// Make later screen captures look cancelled by the user
    pub fn cancel_screen(&self, cancel: bool) {
        self.cancel_screen.store(cancel, Ordering::SeqCst);
    }

    /// Number of `acquire_local` calls, denied ones included
    pub fn local_acquisitions(&self) -> usize {
        self.local_calls.load(Ordering::SeqCst)
    }

    /// Number of `acquire_screen` calls, cancelled ones included
    pub fn screen_acquisitions(&self) -> usize {
        self.screen_calls.load(Ordering::SeqCst)
    }

    /// Views of every camera and microphone track produced
    pub fn local_tracks(&self) -> Vec<TrackView> {
        self.local_tracks.lock().clone()
    }

    /// End every screen capture from the device side
    pub fn end_screen(&self) {
        for source in self.screen_sources.lock().iter() {
            source.end();
        }
    }
}

impl Default for FakeMediaAcquirer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaAcquirer for FakeMediaAcquirer {
    async fn acquire_local(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaHandle, MediaError> {
        self.local_calls.fetch_add(1, Ordering::SeqCst);
        if self.deny_local.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("denied by test".to_string()));
        }
        let mut tracks = Vec::new();
        if constraints.has_audio() {
            tracks.push(MediaTrack::new(TrackKind::Audio, TrackOrigin::Microphone, "fake mic"));
        }
        if constraints.has_video() {
            tracks.push(MediaTrack::new(TrackKind::Video, TrackOrigin::Camera, "fake camera"));
        }
        self.local_tracks
            .lock()
            .extend(tracks.iter().map(MediaTrack::view));
        Ok(LocalMediaHandle::new(tracks))
    }

    async fn acquire_screen(&self) -> Result<LocalMediaHandle, MediaError> {
        self.screen_calls.fetch_add(1, Ordering::SeqCst);
        if self.cancel_screen.load(Ordering::SeqCst) {
            return Err(MediaError::UserCancelled);
        }
        let track = MediaTrack::new(TrackKind::Video, TrackOrigin::Screen, "fake screen");
        self.screen_sources.lock().push(track.source());
        Ok(LocalMediaHandle::new(vec![track]))
    }
}
