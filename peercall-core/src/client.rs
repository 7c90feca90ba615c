//! Call client
//!
//! [`CallClient`] is the explicit context object of the engine. It spawns
//! one task owning the current [`CallSessionController`] and selects over
//! user commands, inbound signaling, connection events, and the ringing
//! deadline. Nothing else touches call state, so no locks are needed around
//! it.
//!
//! ```rust,no_run
//! use peercall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = SignalingHub::new();
//! let client = CallClient::builder("alice", Arc::new(hub.port("alice")))
//!     .with_media(Arc::new(SyntheticMediaAcquirer::new()))
//!     .build()
//!     .await?;
//!
//! let session_id = client.call(vec![UserId::new("bob")], CallType::Video).await?;
//! println!("ringing: {session_id}");
//! client.hangup().await?;
//! # Ok(())
//! # }
//! ```

use crate::call::{CallDependencies, CallError, CallEvent, CallObservers, CallSessionController};
use crate::config::{CallConfig, ConfigError};
use crate::connection::NegotiationError;
use crate::identity::UserId;
use crate::media::{MediaAcquirer, SyntheticMediaAcquirer, TrackView};
use crate::peer::{
    ConnectionEvent, ConnectionEventReceiver, ConnectionStats, PeerTransportFactory,
};
use crate::repository::{CallSessionRepository, InMemoryCallSessionRepository};
use crate::signaling::{
    InboundSignal, SignalReceiver, SignalingError, SignalingMessage, SignalingPort,
};
use crate::types::{CallId, CallSnapshot, CallState, CallType};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const COMMAND_CAPACITY: usize = 32;

/// Finished session ids remembered to reject re-delivered offers
const FINISHED_SESSION_MEMORY: usize = 64;

/// Client construction errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// No transport factory and the `webrtc-transport` feature is off
    #[error("No peer transport factory configured")]
    MissingTransport,

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Signaling subscription failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Call {
        callees: Vec<UserId>,
        call_type: CallType,
        reply: Reply<Result<CallId, CallError>>,
    },
    Accept(Reply<Result<(), CallError>>),
    Decline(Reply<Result<(), CallError>>),
    Hangup(Reply<Result<(), CallError>>),
    ToggleAudio(Option<bool>, Reply<Result<bool, CallError>>),
    ToggleVideo(Option<bool>, Reply<Result<bool, CallError>>),
    StartScreenShare(Reply<Result<TrackView, CallError>>),
    StopScreenShare(Reply<bool>),
    LocalTracks(Reply<Vec<TrackView>>),
    RemoteTracks(Reply<Vec<TrackView>>),
    Stats(Reply<Result<ConnectionStats, CallError>>),
    Shutdown(Reply<()>),
}

/// Handle to a running call client
pub struct CallClient {
    local_user: UserId,
    commands: mpsc::Sender<Command>,
    observers: CallObservers,
    task: JoinHandle<()>,
}

impl CallClient {
    /// Create a builder for `local_user` signaling through `signaling`
    #[must_use]
    pub fn builder(
        local_user: impl Into<UserId>,
        signaling: Arc<dyn SignalingPort>,
    ) -> CallClientBuilder {
        CallClientBuilder::new(local_user.into(), signaling)
    }

    /// Local participant
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Start an outgoing call
    ///
    /// # Errors
    ///
    /// Returns error if a call is in progress or the setup fails
    pub async fn call(
        &self,
        callees: Vec<UserId>,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        self.request(|reply| Command::Call {
            callees,
            call_type,
            reply,
        })
        .await?
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing or the setup fails
    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(Command::Accept).await?
    }

    /// Decline the ringing call
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing or the decline was not delivered
    pub async fn decline(&self) -> Result<(), CallError> {
        self.request(Command::Decline).await?
    }

    /// Hang up the current call, if any
    ///
    /// # Errors
    ///
    /// Returns error if the client task is gone
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.request(Command::Hangup).await?
    }

    /// Flip or set the microphone
    ///
    /// # Errors
    ///
    /// Returns error if no call has local media
    pub async fn toggle_audio(&self, enabled: Option<bool>) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleAudio(enabled, reply))
            .await?
    }

    /// Flip or set the camera
    ///
    /// # Errors
    ///
    /// Returns error if no call has local media
    pub async fn toggle_video(&self, enabled: Option<bool>) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleVideo(enabled, reply))
            .await?
    }

    /// Share the screen in place of the camera
    ///
    /// # Errors
    ///
    /// Returns [`CallError::ScreenShare`] if sharing is not possible
    pub async fn start_screen_share(&self) -> Result<TrackView, CallError> {
        self.request(Command::StartScreenShare).await?
    }

    /// Stop sharing the screen
    ///
    /// # Errors
    ///
    /// Returns error if the client task is gone
    pub async fn stop_screen_share(&self) -> Result<bool, CallError> {
        self.request(Command::StopScreenShare).await
    }

    /// Local capture tracks of the current call
    ///
    /// # Errors
    ///
    /// Returns error if the client task is gone
    pub async fn local_tracks(&self) -> Result<Vec<TrackView>, CallError> {
        self.request(Command::LocalTracks).await
    }

    /// Tracks received in the current call
    ///
    /// # Errors
    ///
    /// Returns error if the client task is gone
    pub async fn remote_tracks(&self) -> Result<Vec<TrackView>, CallError> {
        self.request(Command::RemoteTracks).await
    }

    /// Traffic counters of the current call's connection
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Negotiation`] when no call has a connection
    pub async fn stats(&self) -> Result<ConnectionStats, CallError> {
        self.request(Command::Stats).await?
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.observers.subscribe_events()
    }

    /// Watch the call snapshot
    #[must_use]
    pub fn watch_snapshot(&self) -> watch::Receiver<CallSnapshot> {
        self.observers.watch_snapshot()
    }

    /// Latest snapshot
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.observers.snapshot()
    }

    /// Hang up any call and stop the client task
    pub async fn shutdown(self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(reply)).await.is_ok() {
            let _ = done.await;
        }
        let _ = self.task.await;
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| CallError::ClientStopped)?;
        response.await.map_err(|_| CallError::ClientStopped)
    }
}

/// Builder for [`CallClient`]
pub struct CallClientBuilder {
    local_user: UserId,
    signaling: Arc<dyn SignalingPort>,
    media: Option<Arc<dyn MediaAcquirer>>,
    transports: Option<Arc<dyn PeerTransportFactory>>,
    repository: Option<Arc<dyn CallSessionRepository>>,
    config: CallConfig,
}

impl CallClientBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(local_user: UserId, signaling: Arc<dyn SignalingPort>) -> Self {
        Self {
            local_user,
            signaling,
            media: None,
            transports: None,
            repository: None,
            config: CallConfig::default(),
        }
    }

    /// Set the capture layer (default: [`SyntheticMediaAcquirer`])
    #[must_use]
    pub fn with_media(mut self, media: Arc<dyn MediaAcquirer>) -> Self {
        self.media = Some(media);
        self
    }

    /// Set the peer transport factory (default: the `webrtc` crate)
    #[must_use]
    pub fn with_transports(mut self, transports: Arc<dyn PeerTransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Set session storage (default: in memory)
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn CallSessionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate, subscribe to signaling and start the client task
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid, no transport is available,
    /// or the signaling subscription fails
    pub async fn build(self) -> Result<CallClient, ClientError> {
        self.config.validate()?;
        let transports = match self.transports {
            Some(t) => t,
            None => default_transports()?,
        };
        let inbox = self.signaling.subscribe().await?;
        let observers = CallObservers::new(self.config.event_capacity);

        let deps = CallDependencies {
            local_user: self.local_user.clone(),
            media: self
                .media
                .unwrap_or_else(|| Arc::new(SyntheticMediaAcquirer::new())),
            transports,
            signaling: self.signaling,
            repository: self
                .repository
                .unwrap_or_else(|| Arc::new(InMemoryCallSessionRepository::new())),
            config: self.config,
        };

        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = ClientTask {
            deps,
            observers: observers.clone(),
            commands: command_rx,
            inbox: Some(inbox),
            current: None,
            connection_events: None,
            finished_sessions: VecDeque::new(),
        };
        let task = tokio::spawn(task.run());
        tracing::info!(user = %self.local_user, "Call client started");

        Ok(CallClient {
            local_user: self.local_user,
            commands,
            observers,
            task,
        })
    }
}

#[cfg(feature = "webrtc-transport")]
fn default_transports() -> Result<Arc<dyn PeerTransportFactory>, ClientError> {
    Ok(Arc::new(crate::rtc::WebRtcTransportFactory::new()))
}

#[cfg(not(feature = "webrtc-transport"))]
fn default_transports() -> Result<Arc<dyn PeerTransportFactory>, ClientError> {
    Err(ClientError::MissingTransport)
}

struct ClientTask {
    deps: CallDependencies,
    observers: CallObservers,
    commands: mpsc::Receiver<Command>,
    inbox: Option<SignalReceiver>,
    current: Option<CallSessionController>,
    connection_events: Option<ConnectionEventReceiver>,
    finished_sessions: VecDeque<CallId>,
}

async fn next_signal(inbox: &mut Option<SignalReceiver>) -> Option<InboundSignal> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_connection_event(
    events: &mut Option<ConnectionEventReceiver>,
) -> Option<ConnectionEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn ring_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl ClientTask {
    async fn run(mut self) {
        loop {
            let deadline = self.current.as_ref().and_then(CallSessionController::ring_deadline);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.hangup_current().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.hangup_current().await;
                        break;
                    }
                },
                signal = next_signal(&mut self.inbox) => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => {
                        tracing::warn!(user = %self.deps.local_user, "Signaling subscription closed");
                        self.inbox = None;
                    }
                },
                event = next_connection_event(&mut self.connection_events) => match event {
                    Some(event) => {
                        if let Some(controller) = self.current.as_mut() {
                            controller.handle_connection_event(event).await;
                        }
                    }
                    None => self.connection_events = None,
                },
                () = ring_deadline(deadline) => {
                    if let Some(controller) = self.current.as_mut() {
                        controller.on_ring_timeout().await;
                    }
                }
            }
        }
        tracing::info!(user = %self.deps.local_user, "Call client stopped");
    }

    /// Controller for a new call, replacing a finished one
    fn fresh_controller(&mut self) -> Result<&mut CallSessionController, CallError> {
        if let Some(current) = &self.current {
            let state = current.state();
            if !state.is_terminal() && state != CallState::Idle {
                return Err(CallError::InvalidState {
                    operation: "start a new call",
                    state,
                });
            }
        }
        let finished = self.current.as_ref().and_then(CallSessionController::session_id);
        if let Some(session_id) = finished {
            self.remember_finished(session_id);
        }
        let (controller, events) =
            CallSessionController::new(self.deps.clone(), self.observers.clone());
        self.connection_events = Some(events);
        Ok(self.current.insert(controller))
    }

    fn current_or_idle(
        &mut self,
        operation: &'static str,
    ) -> Result<&mut CallSessionController, CallError> {
        self.current.as_mut().ok_or(CallError::InvalidState {
            operation,
            state: CallState::Idle,
        })
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call {
                callees,
                call_type,
                reply,
            } => {
                let result = match self.fresh_controller() {
                    Ok(controller) => controller.initiate_call(callees, call_type).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Accept(reply) => {
                let result = match self.current_or_idle("accept") {
                    Ok(controller) => controller.accept().await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Decline(reply) => {
                let result = match self.current_or_idle("decline") {
                    Ok(controller) => controller.decline().await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Hangup(reply) => {
                let result = match self.current.as_mut() {
                    Some(controller) => controller.hangup().await,
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::ToggleAudio(enabled, reply) => {
                let result = match self.current_or_idle("toggle audio") {
                    Ok(controller) => controller.toggle_audio(enabled).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::ToggleVideo(enabled, reply) => {
                let result = match self.current_or_idle("toggle video") {
                    Ok(controller) => controller.toggle_video(enabled).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::StartScreenShare(reply) => {
                let result = match self.current_or_idle("share the screen") {
                    Ok(controller) => controller.start_screen_share().await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::StopScreenShare(reply) => {
                let stopped = match self.current.as_mut() {
                    Some(controller) => controller.stop_screen_share().await,
                    None => false,
                };
                let _ = reply.send(stopped);
            }
            Command::LocalTracks(reply) => {
                let tracks = match &self.current {
                    Some(controller) => controller.connection().local_tracks().await,
                    None => Vec::new(),
                };
                let _ = reply.send(tracks);
            }
            Command::RemoteTracks(reply) => {
                let tracks = match &self.current {
                    Some(controller) => controller.connection().remote_tracks().await,
                    None => Vec::new(),
                };
                let _ = reply.send(tracks);
            }
            Command::Stats(reply) => {
                let result = match &self.current {
                    Some(controller) => controller.connection().stats().await.map_err(Into::into),
                    None => Err(NegotiationError::NotCreated.into()),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn remember_finished(&mut self, session_id: CallId) {
        if self.finished_sessions.contains(&session_id) {
            return;
        }
        if self.finished_sessions.len() == FINISHED_SESSION_MEMORY {
            self.finished_sessions.pop_front();
        }
        self.finished_sessions.push_back(session_id);
    }

    fn is_known_session(&self, session_id: CallId) -> bool {
        let current = self.current.as_ref().and_then(CallSessionController::session_id);
        current == Some(session_id) || self.finished_sessions.contains(&session_id)
    }

    async fn handle_signal(&mut self, signal: InboundSignal) {
        if let SignalingMessage::CallOffer { session_id, .. } = &signal.message {
            let session_id = *session_id;
            if self.is_known_session(session_id) {
                tracing::debug!(
                    session_id = %session_id,
                    from = %signal.from,
                    "Ignoring offer for a session already seen"
                );
                return;
            }
            match self.fresh_controller() {
                Ok(controller) => controller.handle_signal(signal).await,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, from = %signal.from, error = %e, "Busy, ignoring call offer");
                }
            }
            return;
        }

        match self.current.as_mut() {
            Some(controller) => controller.handle_signal(signal).await,
            None => {
                tracing::debug!(
                    session_id = %signal.message.session_id(),
                    message_type = signal.message.message_type(),
                    "No call, dropping signaling message"
                );
            }
        }
    }

    async fn hangup_current(&mut self) {
        if let Some(controller) = self.current.as_mut() {
            if let Err(e) = controller.hangup().await {
                tracing::warn!(error = %e, "Hangup on shutdown failed");
            }
        }
    }
}
