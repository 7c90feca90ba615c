//! Call session state machine
//!
//! One [`CallSessionController`] drives one call attempt from `Idle` to a
//! terminal state. It is the single writer of call state: user commands,
//! inbound signaling and connection events all arrive through `&mut self`
//! methods, called from the task that owns the controller
//! ([`CallClient`](crate::client::CallClient)).
//!
//! # Outgoing call
//!
//! ```text
//! Idle --initiate_call--> OutgoingRinging --answer--> Negotiating --connected--> Active
//!                               |  '--declined--> Declined
//!                               '--ring timeout--> Ended (missed)
//! ```
//!
//! # Incoming call
//!
//! ```text
//! Idle --offer--> IncomingRinging --accept--> Negotiating --connected--> Active
//!                       '--decline--> Declined
//! ```
//!
//! Any non-terminal state reaches `Ended` through a local or remote hangup
//! and `Failed` through a negotiation or connectivity failure. Terminal
//! states never change again; a new call gets a new controller.

use crate::config::CallConfig;
use crate::connection::{ConnectionManager, NegotiationError, ScreenShareError};
use crate::identity::UserId;
use crate::media::{MediaAcquirer, MediaError, TrackView};
use crate::peer::{
    ConnectionEvent, ConnectionEventReceiver, PeerConnectionState, PeerTransportFactory,
};
use crate::repository::{CallSessionRepository, RepositoryError};
use crate::signaling::{InboundSignal, SignalingError, SignalingMessage, SignalingPort};
use crate::types::{
    CallId, CallSession, CallSnapshot, CallState, CallType, IceCandidate, ParticipantMediaState,
    ParticipantStatus, SessionDescriptor, SessionStatus,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

/// Call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Command not valid in the current state
    #[error("Invalid call state: cannot {operation} while {state}")]
    InvalidState {
        /// Rejected command
        operation: &'static str,
        /// State at the time
        state: CallState,
    },

    /// No one to call
    #[error("No participants to call")]
    NoParticipants,

    /// Media capture error
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// SDP negotiation error
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Signaling error
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Repository error
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Screen share error; the call itself is unaffected
    #[error("Screen share error: {0}")]
    ScreenShare(#[from] ScreenShareError),

    /// ICE failed or the connection dropped for good
    #[error("Connectivity failure: {0}")]
    Connectivity(String),

    /// The client task is gone
    #[error("Call client stopped")]
    ClientStopped,
}

/// Events published to observers
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// An offer arrived and the call is ringing locally
    IncomingCall {
        /// Session
        session_id: CallId,
        /// Caller
        from: UserId,
        /// Kind of call
        call_type: CallType,
    },
    /// Call state changed
    StateChanged {
        /// Session
        session_id: CallId,
        /// Previous state
        old_state: CallState,
        /// New state
        new_state: CallState,
    },
    /// A track from the peer is available
    RemoteTrackAdded {
        /// Session
        session_id: CallId,
        /// Read-only track reference
        track: TrackView,
    },
    /// Local media flags changed
    LocalMediaChanged {
        /// Session
        session_id: CallId,
        /// New flags
        media: ParticipantMediaState,
    },
    /// The peer reported new media flags
    RemoteMediaChanged {
        /// Session
        session_id: CallId,
        /// Peer flags
        media: ParticipantMediaState,
    },
    /// The screen capture ended outside the API and the camera is back
    ScreenShareEnded {
        /// Session
        session_id: CallId,
    },
    /// A failure surfaced outside of a command result
    Error {
        /// Session, if one exists
        session_id: Option<CallId>,
        /// Description
        message: String,
    },
}

/// Collaborators shared by every call of one client
#[derive(Clone)]
pub struct CallDependencies {
    /// Local participant
    pub local_user: UserId,
    /// Camera, microphone and screen capture
    pub media: Arc<dyn MediaAcquirer>,
    /// Peer connection factory
    pub transports: Arc<dyn PeerTransportFactory>,
    /// Signaling channel bound to `local_user`
    pub signaling: Arc<dyn SignalingPort>,
    /// Session storage
    pub repository: Arc<dyn CallSessionRepository>,
    /// Engine configuration
    pub config: CallConfig,
}

/// Output channels that outlive individual calls
#[derive(Clone)]
pub struct CallObservers {
    events: broadcast::Sender<CallEvent>,
    snapshot: Arc<watch::Sender<CallSnapshot>>,
}

impl CallObservers {
    /// Channels with an event buffer of `capacity`
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (snapshot, _) = watch::channel(CallSnapshot::idle());
        Self {
            events,
            snapshot: Arc::new(snapshot),
        }
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Watch the call snapshot
    pub fn watch_snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.subscribe()
    }

    /// Latest snapshot
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    fn emit(&self, event: CallEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn publish(&self, snapshot: CallSnapshot) {
        self.snapshot.send_replace(snapshot);
    }
}

fn best_effort<E: std::fmt::Display>(result: Result<(), E>, action: &'static str) {
    if let Err(e) = result {
        tracing::warn!(action, error = %e, "Best-effort step failed");
    }
}

/// State machine of one call attempt
pub struct CallSessionController {
    deps: CallDependencies,
    observers: CallObservers,
    connection: ConnectionManager,
    state: CallState,
    session: Option<CallSession>,
    remote_peer: Option<UserId>,
    pending_offer: Option<SessionDescriptor>,
    answer_applied: bool,
    local_media: Option<ParticipantMediaState>,
    started_at: Option<DateTime<Utc>>,
    ring_deadline: Option<Instant>,
}

impl CallSessionController {
    /// Create an idle controller
    ///
    /// The returned receiver carries the events of this call's connection;
    /// the owner must feed them back through
    /// [`handle_connection_event`](Self::handle_connection_event).
    #[must_use]
    pub fn new(
        deps: CallDependencies,
        observers: CallObservers,
    ) -> (Self, ConnectionEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(
            Arc::clone(&deps.transports),
            tx,
            deps.config.max_buffered_candidates,
        );
        let controller = Self {
            deps,
            observers,
            connection,
            state: CallState::Idle,
            session: None,
            remote_peer: None,
            pending_offer: None,
            answer_applied: false,
            local_media: None,
            started_at: None,
            ring_deadline: None,
        };
        (controller, rx)
    }

    /// Current state
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Session, once created or received
    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    /// Session id, once known
    pub fn session_id(&self) -> Option<CallId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Peer this controller negotiates with
    pub fn remote_peer(&self) -> Option<&UserId> {
        self.remote_peer.as_ref()
    }

    /// Connection of this call, for track views
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// When the outgoing call stops ringing
    pub fn ring_deadline(&self) -> Option<Instant> {
        self.ring_deadline
    }

    /// Read-only view of the call
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            session_id: self.session_id(),
            call_type: self.session.as_ref().map(|s| s.call_type),
            state: self.state,
            local_media: self.local_media.clone(),
            remote_peer: self.remote_peer.clone(),
            started_at: self.started_at,
        }
    }

    /// Start an outgoing call
    ///
    /// The offer goes to the first callee; every callee is recorded in the
    /// session. Any failure leaves the controller in `Failed` with all media
    /// released.
    ///
    /// # Errors
    ///
    /// Returns error if the controller is not idle, there is no callee, or a
    /// step of the setup fails
    #[tracing::instrument(skip(self, callee_ids), fields(user = %self.deps.local_user, callees = callee_ids.len()))]
    pub async fn initiate_call(
        &mut self,
        callee_ids: Vec<UserId>,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        if self.state != CallState::Idle {
            return Err(CallError::InvalidState {
                operation: "initiate a call",
                state: self.state,
            });
        }

        let local = self.deps.local_user.clone();
        let mut participants = vec![local.clone()];
        for callee in callee_ids {
            if !participants.contains(&callee) {
                participants.push(callee);
            }
        }
        if participants.len() < 2 {
            return Err(CallError::NoParticipants);
        }

        match self.setup_outgoing(participants, call_type).await {
            Ok(session_id) => {
                self.ring_deadline = Some(Instant::now() + self.deps.config.ring_timeout());
                self.transition(CallState::OutgoingRinging);
                tracing::info!(session_id = %session_id, call_type = ?call_type, "Outgoing call ringing");
                Ok(session_id)
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn setup_outgoing(
        &mut self,
        participants: Vec<UserId>,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        let session = self
            .deps
            .repository
            .create_session(call_type, &participants)
            .await?;
        let session_id = session.id;
        let callee = participants[1].clone();
        self.session = Some(session);
        self.remote_peer = Some(callee.clone());

        let handle = self.deps.media.acquire_local(&call_type.constraints()).await?;
        self.connection.create(&self.deps.config.ice_servers).await?;
        self.connection.add_local_tracks(handle).await?;
        self.local_media = Some(ParticipantMediaState::for_call(
            self.deps.local_user.clone(),
            call_type,
        ));
        best_effort(
            self.deps
                .repository
                .update_participant_status(
                    session_id,
                    &self.deps.local_user,
                    ParticipantStatus::Joined,
                )
                .await,
            "mark caller joined",
        );

        let offer = self.connection.create_offer().await?;
        self.deps
            .signaling
            .send_offer(&callee, session_id, call_type, offer.sdp(), &participants)
            .await?;
        Ok(session_id)
    }

    /// Accept the ringing incoming call
    ///
    /// Accepting again once negotiation started is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if no call is ringing or a setup step fails; on failure
    /// the call is `Failed` and the caller is told to hang up
    #[tracing::instrument(skip(self), fields(user = %self.deps.local_user, session_id = ?self.session_id()))]
    pub async fn accept(&mut self) -> Result<(), CallError> {
        match self.state {
            CallState::IncomingRinging => {}
            CallState::Negotiating | CallState::Active if self.pending_offer.is_none() => {
                tracing::debug!("Call already accepted");
                return Ok(());
            }
            state => {
                return Err(CallError::InvalidState {
                    operation: "accept",
                    state,
                })
            }
        }

        match self.setup_incoming().await {
            Ok(()) => {
                self.transition(CallState::Negotiating);
                tracing::info!("Incoming call accepted");
                Ok(())
            }
            Err(e) => {
                if let Some((peer, session_id)) = self.peer_and_session() {
                    best_effort(
                        self.deps.signaling.send_hangup(&peer, session_id).await,
                        "notify caller of failed accept",
                    );
                }
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn setup_incoming(&mut self) -> Result<(), CallError> {
        let (session_id, call_type) = match &self.session {
            Some(s) => (s.id, s.call_type),
            None => {
                return Err(CallError::InvalidState {
                    operation: "accept",
                    state: self.state,
                })
            }
        };
        let peer = self.remote_peer.clone().ok_or(CallError::InvalidState {
            operation: "accept",
            state: self.state,
        })?;
        let offer = self.pending_offer.take().ok_or(CallError::InvalidState {
            operation: "accept",
            state: self.state,
        })?;

        let handle = self.deps.media.acquire_local(&call_type.constraints()).await?;
        self.connection.create(&self.deps.config.ice_servers).await?;
        self.connection.add_local_tracks(handle).await?;
        self.local_media = Some(ParticipantMediaState::for_call(
            self.deps.local_user.clone(),
            call_type,
        ));

        self.connection.set_remote_description(&offer).await?;
        let answer = self.connection.create_answer().await?;
        self.deps
            .signaling
            .send_answer(&peer, session_id, answer.sdp())
            .await?;

        best_effort(
            self.deps
                .repository
                .update_participant_status(
                    session_id,
                    &self.deps.local_user,
                    ParticipantStatus::Joined,
                )
                .await,
            "mark callee joined",
        );
        Ok(())
    }

    /// Decline the ringing incoming call without touching any device
    ///
    /// # Errors
    ///
    /// Returns error if no call is ringing, or if the decline could not be
    /// delivered (the call is `Declined` locally either way)
    #[tracing::instrument(skip(self), fields(user = %self.deps.local_user, session_id = ?self.session_id()))]
    pub async fn decline(&mut self) -> Result<(), CallError> {
        if self.state != CallState::IncomingRinging {
            return Err(CallError::InvalidState {
                operation: "decline",
                state: self.state,
            });
        }

        let sent = match (self.remote_peer.clone(), self.session_id()) {
            (Some(peer), Some(session_id)) => {
                best_effort(
                    self.deps
                        .repository
                        .update_participant_status(
                    session_id,
                    &self.deps.local_user,
                    ParticipantStatus::Rejected,
                )
                        .await,
                    "mark callee rejected",
                );
                self.deps.signaling.send_decline(&peer, session_id).await
            }
            _ => Ok(()),
        };

        self.pending_offer = None;
        self.connection.cleanup().await;
        self.transition(CallState::Declined);
        tracing::info!("Incoming call declined");
        sent.map_err(CallError::from)
    }

    /// End the call from any non-terminal state
    ///
    /// Signaling and repository failures are logged; media is always
    /// released. Calling it again once terminal does nothing. An `Idle`
    /// controller has no call to end and stays `Idle`.
    ///
    /// # Errors
    ///
    /// Currently never fails
    #[tracing::instrument(skip(self), fields(user = %self.deps.local_user, session_id = ?self.session_id()))]
    pub async fn hangup(&mut self) -> Result<(), CallError> {
        if self.state.is_terminal() || self.state == CallState::Idle {
            tracing::debug!(state = %self.state, "Nothing to hang up");
            return Ok(());
        }

        if let Some((peer, session_id)) = self.peer_and_session() {
            best_effort(
                self.deps.signaling.send_hangup(&peer, session_id).await,
                "send hangup",
            );
        }
        self.teardown(ParticipantStatus::Left).await;
        self.transition(CallState::Ended);
        tracing::info!("Call hung up");
        Ok(())
    }

    /// Ringing deadline passed without an answer
    #[tracing::instrument(skip(self), fields(user = %self.deps.local_user, session_id = ?self.session_id()))]
    pub async fn on_ring_timeout(&mut self) {
        self.ring_deadline = None;
        if self.state != CallState::OutgoingRinging {
            return;
        }
        tracing::info!(
            timeout_secs = self.deps.config.ring_timeout_secs,
            "Outgoing call not answered"
        );

        if let Some((peer, session_id)) = self.peer_and_session() {
            best_effort(
                self.deps.signaling.send_hangup(&peer, session_id).await,
                "send hangup after ring timeout",
            );
            best_effort(
                self.deps
                    .repository
                    .update_session_status(session_id, SessionStatus::Missed)
                    .await,
                "mark session missed",
            );
        }
        self.teardown(ParticipantStatus::Left).await;
        self.transition(CallState::Ended);
    }

    /// Flip or set the microphone; returns the resulting flag
    ///
    /// # Errors
    ///
    /// Returns error if no local media is attached
    pub async fn toggle_audio(&mut self, enabled: Option<bool>) -> Result<bool, CallError> {
        self.ensure_media("toggle audio")?;
        let now = self.connection.toggle_audio(enabled).await;
        if let Some(media) = &mut self.local_media {
            media.audio_enabled = now;
        }
        self.publish_local_media().await;
        Ok(now)
    }

    /// Flip or set the camera; returns the resulting flag
    ///
    /// # Errors
    ///
    /// Returns error if no local media is attached
    pub async fn toggle_video(&mut self, enabled: Option<bool>) -> Result<bool, CallError> {
        self.ensure_media("toggle video")?;
        let now = self.connection.toggle_video(enabled).await;
        if let Some(media) = &mut self.local_media {
            media.video_enabled = now;
        }
        self.publish_local_media().await;
        Ok(now)
    }

    /// Send the screen instead of the camera
    ///
    /// # Errors
    ///
    /// Returns [`CallError::ScreenShare`] on any screen-share failure; the
    /// call state is left unchanged
    pub async fn start_screen_share(&mut self) -> Result<TrackView, CallError> {
        self.ensure_media("share the screen")?;
        let view = self
            .connection
            .start_screen_share(self.deps.media.as_ref())
            .await?;
        if let Some(media) = &mut self.local_media {
            if !media.screen_sharing {
                media.screen_sharing = true;
                self.publish_local_media().await;
            }
        }
        Ok(view)
    }

    /// Go back to the camera; returns `false` if nothing was shared
    pub async fn stop_screen_share(&mut self) -> bool {
        let stopped = self.connection.stop_screen_share().await;
        if stopped {
            if let Some(media) = &mut self.local_media {
                media.screen_sharing = false;
            }
            self.publish_local_media().await;
        }
        stopped
    }

    /// Route one inbound signaling message
    ///
    /// Messages for another session, or from someone other than the peer,
    /// are ignored.
    #[tracing::instrument(skip(self, signal), fields(user = %self.deps.local_user, from = %signal.from, message_type = signal.message.message_type()))]
    pub async fn handle_signal(&mut self, signal: InboundSignal) {
        let InboundSignal { from, message } = signal;

        if let SignalingMessage::CallOffer {
            session_id,
            call_type,
            sdp,
            participants,
        } = message
        {
            self.on_offer(from, session_id, call_type, sdp, participants);
            return;
        }

        if self.session_id() != Some(message.session_id()) {
            tracing::debug!(session_id = %message.session_id(), "Ignoring message for unknown session");
            return;
        }
        if self.remote_peer.as_ref() != Some(&from) {
            tracing::warn!("Ignoring message from a user outside the negotiation");
            return;
        }

        match message {
            SignalingMessage::CallOffer { .. } => {}
            SignalingMessage::CallAnswer { sdp, .. } => self.on_answer(sdp).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await;
            }
            SignalingMessage::CallEnded { .. } => self.on_remote_hangup().await,
            SignalingMessage::CallDeclined { .. } => self.on_remote_decline().await,
            SignalingMessage::MediaState {
                session_id,
                audio_enabled,
                video_enabled,
                screen_sharing,
            } => {
                self.observers.emit(CallEvent::RemoteMediaChanged {
                    session_id,
                    media: ParticipantMediaState {
                        user_id: from,
                        audio_enabled,
                        video_enabled,
                        screen_sharing,
                    },
                });
            }
        }
    }

    fn on_offer(
        &mut self,
        from: UserId,
        session_id: CallId,
        call_type: CallType,
        sdp: String,
        participants: Vec<UserId>,
    ) {
        if self.state != CallState::Idle {
            tracing::warn!(session_id = %session_id, state = %self.state, "Busy, ignoring call offer");
            return;
        }

        let mut participants = participants;
        if !participants.contains(&from) {
            participants.insert(0, from.clone());
        }
        if !participants.contains(&self.deps.local_user) {
            participants.push(self.deps.local_user.clone());
        }

        self.session = Some(CallSession::new(session_id, call_type, participants));
        self.remote_peer = Some(from.clone());
        self.pending_offer = Some(SessionDescriptor::offer(sdp));
        self.transition(CallState::IncomingRinging);
        tracing::info!(session_id = %session_id, from = %from, call_type = ?call_type, "Incoming call ringing");
        self.observers.emit(CallEvent::IncomingCall {
            session_id,
            from,
            call_type,
        });
    }

    async fn on_answer(&mut self, sdp: String) {
        if self.answer_applied {
            tracing::debug!("Duplicate answer ignored");
            return;
        }
        if self.state != CallState::OutgoingRinging {
            tracing::debug!(state = %self.state, "Unexpected answer ignored");
            return;
        }

        self.ring_deadline = None;
        match self
            .connection
            .set_remote_description(&SessionDescriptor::answer(sdp))
            .await
        {
            Ok(()) => {
                self.answer_applied = true;
                if let Some((peer, session_id)) = self.peer_and_session() {
                    best_effort(
                        self.deps
                            .repository
                            .update_participant_status(session_id, &peer, ParticipantStatus::Joined)
                            .await,
                        "mark callee joined",
                    );
                }
                self.transition(CallState::Negotiating);
            }
            Err(e) => self.fail(&CallError::from(e)).await,
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state.is_terminal() {
            tracing::trace!("Call over, dropping remote ICE candidate");
            return;
        }
        self.connection.add_remote_ice_candidate(candidate).await;
    }

    async fn on_remote_hangup(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        tracing::info!("Peer hung up");
        self.teardown(ParticipantStatus::Left).await;
        self.transition(CallState::Ended);
    }

    async fn on_remote_decline(&mut self) {
        if self.state != CallState::OutgoingRinging {
            tracing::debug!(state = %self.state, "Unexpected decline ignored");
            return;
        }
        tracing::info!("Peer declined");
        self.ring_deadline = None;
        if let Some((peer, session_id)) = self.peer_and_session() {
            best_effort(
                self.deps
                    .repository
                    .update_participant_status(session_id, &peer, ParticipantStatus::Rejected)
                    .await,
                "mark callee rejected",
            );
            best_effort(
                self.deps
                    .repository
                    .update_session_status(session_id, SessionStatus::Declined)
                    .await,
                "mark session declined",
            );
        }
        self.teardown(ParticipantStatus::Left).await;
        self.transition(CallState::Declined);
    }

    /// Consume one event from this call's connection
    pub async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalIceCandidate(candidate) => {
                if self.state.is_terminal() {
                    return;
                }
                if let Some((peer, session_id)) = self.peer_and_session() {
                    best_effort(
                        self.deps
                            .signaling
                            .send_ice_candidate(&peer, session_id, &candidate)
                            .await,
                        "send local ICE candidate",
                    );
                }
            }
            ConnectionEvent::RemoteTrack(track) => {
                let view = self.connection.adopt_remote_track(track).await;
                if let (false, Some(session_id)) = (self.state.is_terminal(), self.session_id()) {
                    self.observers.emit(CallEvent::RemoteTrackAdded {
                        session_id,
                        track: view,
                    });
                }
            }
            ConnectionEvent::StateChanged(state) => self.on_connection_state(state).await,
            ConnectionEvent::ScreenShareEnded { track_id, .. } => {
                tracing::debug!(track_id = %track_id, "Screen share ended by the device");
                if let Some(media) = &mut self.local_media {
                    media.screen_sharing = false;
                }
                if let Some(session_id) = self.session_id() {
                    self.observers.emit(CallEvent::ScreenShareEnded { session_id });
                }
                self.publish_local_media().await;
            }
        }
    }

    async fn on_connection_state(&mut self, state: PeerConnectionState) {
        match state {
            PeerConnectionState::Connected => {
                if self.state != CallState::Negotiating {
                    return;
                }
                self.started_at = Some(Utc::now());
                if let Some(session_id) = self.session_id() {
                    best_effort(
                        self.deps
                            .repository
                            .update_session_status(session_id, SessionStatus::Active)
                            .await,
                        "mark session active",
                    );
                }
                self.transition(CallState::Active);
                tracing::info!("Call connected");
            }
            PeerConnectionState::Disconnected => {
                tracing::warn!(state = %self.state, "Peer connection disconnected, waiting for recovery");
            }
            PeerConnectionState::Failed => {
                if !self.state.is_terminal() {
                    let err = CallError::Connectivity("peer connection failed".to_string());
                    self.fail(&err).await;
                }
            }
            PeerConnectionState::New
            | PeerConnectionState::Connecting
            | PeerConnectionState::Closed => {
                tracing::trace!(connection_state = ?state, "Peer connection state");
            }
        }
    }

    fn ensure_media(&self, operation: &'static str) -> Result<(), CallError> {
        if self.state.is_terminal() || self.local_media.is_none() {
            return Err(CallError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn peer_and_session(&self) -> Option<(UserId, CallId)> {
        Some((self.remote_peer.clone()?, self.session_id()?))
    }

    async fn publish_local_media(&mut self) {
        let (Some(media), Some(session_id)) = (self.local_media.clone(), self.session_id()) else {
            return;
        };
        best_effort(
            self.deps
                .repository
                .update_participant_media(session_id, &media.user_id, &media)
                .await,
            "store local media flags",
        );
        if let Some(peer) = self.remote_peer.clone() {
            best_effort(
                self.deps
                    .signaling
                    .send_media_state(
                        &peer,
                        session_id,
                        media.audio_enabled,
                        media.video_enabled,
                        media.screen_sharing,
                    )
                    .await,
                "send media state",
            );
        }
        self.observers.emit(CallEvent::LocalMediaChanged { session_id, media });
        self.observers.publish(self.snapshot());
    }

    /// Release media and close the session row
    async fn teardown(&mut self, status: ParticipantStatus) {
        self.ring_deadline = None;
        self.pending_offer = None;
        self.connection.cleanup().await;
        if let Some(session_id) = self.session_id() {
            best_effort(
                self.deps
                    .repository
                    .update_participant_status(session_id, &self.deps.local_user, status)
                    .await,
                "update participant status",
            );
            best_effort(
                self.deps.repository.end_session(session_id).await,
                "end session",
            );
        }
    }

    async fn fail(&mut self, err: &CallError) {
        tracing::warn!(error = %err, state = %self.state, "Call failed");
        self.observers.emit(CallEvent::Error {
            session_id: self.session_id(),
            message: err.to_string(),
        });
        self.teardown(ParticipantStatus::Left).await;
        self.transition(CallState::Failed);
    }

    fn transition(&mut self, new_state: CallState) {
        let old_state = self.state;
        if old_state == new_state {
            return;
        }
        self.state = new_state;
        if let Some(session) = &mut self.session {
            session.state = new_state;
        }
        tracing::debug!(old_state = %old_state, new_state = %new_state, "Call state changed");

        if let Some(session_id) = self.session_id() {
            self.observers.emit(CallEvent::StateChanged {
                session_id,
                old_state,
                new_state,
            });
        }
        self.observers.publish(self.snapshot());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::TrackReadyState;
    use crate::repository::InMemoryCallSessionRepository;
    use crate::signaling::{SignalReceiver, SignalingHub};
    use crate::testing::{FakeMediaAcquirer, FakeTransportFactory};

    struct Side {
        controller: CallSessionController,
        connection_events: ConnectionEventReceiver,
        inbox: SignalReceiver,
        media: Arc<FakeMediaAcquirer>,
        transports: Arc<FakeTransportFactory>,
        repository: Arc<InMemoryCallSessionRepository>,
    }

    async fn side(hub: &SignalingHub, user: &str) -> Side {
        let media = Arc::new(FakeMediaAcquirer::new());
        let transports = Arc::new(FakeTransportFactory::new());
        let repository = Arc::new(InMemoryCallSessionRepository::new());
        let port = hub.port(user);
        let inbox = port.subscribe().await.unwrap();
        let deps = CallDependencies {
            local_user: UserId::new(user),
            media: media.clone(),
            transports: transports.clone(),
            signaling: Arc::new(port),
            repository: repository.clone(),
            config: CallConfig::default(),
        };
        let (controller, connection_events) =
            CallSessionController::new(deps, CallObservers::new(16));
        Side {
            controller,
            connection_events,
            inbox,
            media,
            transports,
            repository,
        }
    }

    /// Feed every pending signal of `to` into its controller
    async fn pump(to: &mut Side) {
        while let Ok(signal) = to.inbox.try_recv() {
            to.controller.handle_signal(signal).await;
        }
    }

    #[tokio::test]
    async fn test_initiate_rejects_empty_callees() {
        let hub = SignalingHub::new();
        let mut alice = side(&hub, "alice").await;
        let result = alice
            .controller
            .initiate_call(vec![UserId::new("alice")], CallType::Audio)
            .await;
        assert_eq!(result.unwrap_err(), CallError::NoParticipants);
        assert_eq!(alice.media.local_acquisitions(), 0);
        assert_eq!(alice.controller.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_initiate_fails_when_callee_unreachable() {
        let hub = SignalingHub::new();
        let mut alice = side(&hub, "alice").await;
        let result = alice
            .controller
            .initiate_call(vec![UserId::new("bob")], CallType::Video)
            .await;
        assert!(matches!(result, Err(CallError::Signaling(_))));
        assert_eq!(alice.controller.state(), CallState::Failed);
        for track in alice.media.local_tracks() {
            assert_eq!(track.ready_state(), TrackReadyState::Ended);
        }
        assert_eq!(alice.transports.last().unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_fails_call() {
        let hub = SignalingHub::new();
        let mut alice = side(&hub, "alice").await;
        let _bob = side(&hub, "bob").await;
        alice.media.deny_local(true);
        let result = alice
            .controller
            .initiate_call(vec![UserId::new("bob")], CallType::Audio)
            .await;
        assert!(matches!(result, Err(CallError::Media(MediaError::PermissionDenied(_)))));
        assert_eq!(alice.controller.state(), CallState::Failed);
    }

    #[tokio::test]
    async fn test_offer_rings_without_media() {
        let hub = SignalingHub::new();
        let mut alice = side(&hub, "alice").await;
        let mut bob = side(&hub, "bob").await;

        let session_id = alice
            .controller
            .initiate_call(vec![UserId::new("bob")], CallType::Video)
            .await
            .unwrap();
        assert_eq!(alice.controller.state(), CallState::OutgoingRinging);
        assert!(alice.controller.ring_deadline().is_some());

        pump(&mut bob).await;
        assert_eq!(bob.controller.state(), CallState::IncomingRinging);
        assert_eq!(bob.controller.session_id(), Some(session_id));
        assert_eq!(bob.media.local_acquisitions(), 0);
        assert_eq!(bob.transports.create_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_accept_is_noop() {
        let hub = SignalingHub::new();
        let mut alice = side(&hub, "alice").await;
        let mut bob = side(&hub, "bob").await;
        alice
            .controller
            .initiate_call(vec![UserId::new("bob")], CallType::Audio)
            .await
            .unwrap();
        pump(&mut bob).await;

        bob.controller.accept().await.unwrap();
        bob.controller.accept().await.unwrap();
        assert_eq!(bob.controller.state(), CallState::Negotiating);
        assert_eq!(bob.media.local_acquisitions(), 1);
        assert_eq!(bob.transports.create_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_answer_ignored() {
        let hub = SignalingHub::new();
        let mut alice = side(&hub, "alice").await;
        let mut bob = side(&hub, "bob").await;
        let session_id = alice
            .controller
            .initiate_call(vec![UserId::new("bob")], CallType::Audio)
            .await
            .unwrap();
        pump(&mut bob).await;
        bob.controller.accept().await.unwrap();
        pump(&mut alice).await;
        assert_eq!(alice.controller.state(), CallState::Negotiating);

        let duplicate = InboundSignal {
            from: UserId::new("bob"),
            message: SignalingMessage::CallAnswer {
                session_id,
                sdp: "v=0 again".to_string(),
            },
        };
        alice.controller.handle_signal(duplicate).await;
        assert_eq!(alice.controller.state(), CallState::Negotiating);
        let remote = alice.transports.last().unwrap().remote_description().unwrap();
        assert_ne!(remote.sdp(), "v=0 again");
    }

    #[tokio::test]
    async fn test_stale_session_ignored() {
        let hub = SignalingHub::new();
        let mut alice = side(&hub, "alice").await;
        let _bob = side(&hub, "bob").await;
        alice
            .controller
            .initiate_call(vec![UserId::new("bob")], CallType::Audio)
            .await
            .unwrap();

        let stale = InboundSignal {
            from: UserId::new("bob"),
            message: SignalingMessage::CallEnded {
                session_id: CallId::new(),
            },
        };
        alice.controller.handle_signal(stale).await;
        assert_eq!(alice.controller.state(), CallState::OutgoingRinging);
    }

    #[tokio::test]
    async fn test_connection_failure_fails_call() {
        let hub = SignalingHub::new();
        let mut alice = side(&hub, "alice").await;
        let mut bob = side(&hub, "bob").await;
        let session_id = alice
            .controller
            .initiate_call(vec![UserId::new("bob")], CallType::Video)
            .await
            .unwrap();
        pump(&mut bob).await;
        bob.controller.accept().await.unwrap();

        bob.controller
            .handle_connection_event(ConnectionEvent::StateChanged(PeerConnectionState::Failed))
            .await;
        assert_eq!(bob.controller.state(), CallState::Failed);
        for track in bob.media.local_tracks() {
            assert_eq!(track.ready_state(), TrackReadyState::Ended);
        }
        // The callee never created the row, so ending it is logged and skipped
        assert!(bob.repository.get(session_id).is_none());
    }

    #[tokio::test]
    async fn test_local_candidates_forwarded() {
        let hub = SignalingHub::new();
        let mut alice = side(&hub, "alice").await;
        let _bob = side(&hub, "bob").await;
        alice
            .controller
            .initiate_call(vec![UserId::new("bob")], CallType::Audio)
            .await
            .unwrap();
        while let Ok(event) = alice.connection_events.try_recv() {
            alice.controller.handle_connection_event(event).await;
        }
        let sent = hub.sent_by(&UserId::new("alice"));
        assert!(sent
            .iter()
            .any(|m| matches!(m, SignalingMessage::IceCandidate { .. })));
    }

    #[tokio::test]
    async fn test_toggle_requires_media() {
        let hub = SignalingHub::new();
        let mut alice = side(&hub, "alice").await;
        assert!(matches!(
            alice.controller.toggle_audio(None).await,
            Err(CallError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_hangup_while_idle_is_noop() {
        let hub = SignalingHub::new();
        let mut alice = side(&hub, "alice").await;
        let _bob = side(&hub, "bob").await;

        alice.controller.hangup().await.unwrap();
        assert_eq!(alice.controller.state(), CallState::Idle);
        assert!(hub.sent().is_empty());
        assert_eq!(alice.transports.create_count(), 0);
        assert!(alice.repository.is_empty());

        // Still usable for a call afterwards
        alice
            .controller
            .initiate_call(vec![UserId::new("bob")], CallType::Audio)
            .await
            .unwrap();
        assert_eq!(alice.controller.state(), CallState::OutgoingRinging);
    }
}
