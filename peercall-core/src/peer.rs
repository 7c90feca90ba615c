//! Peer connection abstraction
//!
//! [`PeerTransport`] is the seam between the
//! [`ConnectionManager`](crate::connection::ConnectionManager) and a
//! concrete peer connection. The default implementation lives in
//! [`crate::rtc`] and wraps the `webrtc` crate; tests use the doubles in
//! `crate::testing`.
//!
//! Transport callbacks (gathered candidates, incoming tracks, connection
//! state) are not closures registered by the caller. They are delivered as
//! [`ConnectionEvent`]s on the channel handed to the factory, and the call
//! controller consumes them in order.

use crate::media::{MediaTrack, TrackView};
use crate::types::{IceCandidate, IceServer, SessionDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a peer transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Operation not valid in the current signaling state
    #[error("Invalid signaling state: {0}")]
    InvalidState(String),

    /// Malformed or rejected session description
    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    /// Candidate could not be applied
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// Connection already closed
    #[error("Connection closed")]
    Closed,

    /// Any other failure of the underlying stack
    #[error("Transport failure: {0}")]
    Failed(String),
}

/// Handle of an outgoing sender created by [`PeerTransport::add_track`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u32);

impl std::fmt::Display for SenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sender-{}", self.0)
    }
}

/// Aggregate connection state, mirroring `RTCPeerConnectionState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    /// Created, nothing started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media path established
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity failed for good
    Failed,
    /// Closed locally
    Closed,
}

/// Traffic summary of a peer connection
///
/// Byte and packet counters add up every RTP stream in each direction.
/// The round trip time comes from the nominated candidate pair and stays
/// `None` until one has been measured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// RTP payload bytes sent
    pub bytes_sent: u64,
    /// RTP payload bytes received
    pub bytes_received: u64,
    /// RTP packets sent
    pub packets_sent: u64,
    /// RTP packets received
    pub packets_received: u64,
    /// Current round trip time
    pub round_trip_time: Option<Duration>,
}

/// Event emitted by a peer connection or by the connection manager
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Local ICE candidate gathered, to be sent to the peer
    LocalIceCandidate(IceCandidate),
    /// Track received from the peer; ownership travels with the event
    RemoteTrack(MediaTrack),
    /// Connection state changed
    StateChanged(PeerConnectionState),
    /// Screen capture ended outside the API and the camera was restored
    ScreenShareEnded {
        /// The screen track that ended
        track_id: String,
        /// Camera track now on the video sender, if any
        restored: Option<TrackView>,
    },
}

/// Sending half of the connection event channel
pub type ConnectionEventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// Receiving half of the connection event channel
pub type ConnectionEventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

/// One negotiated media session with a remote peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track as a new outgoing sender
    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId, TransportError>;

    /// Swap the track of an existing sender; `None` mutes the sender
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&MediaTrack>,
    ) -> Result<(), TransportError>;

    /// Create an SDP offer
    async fn create_offer(&self) -> Result<SessionDescriptor, TransportError>;

    /// Create an SDP answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescriptor, TransportError>;

    /// Apply a locally created description
    async fn set_local_description(&self, desc: &SessionDescriptor)
        -> Result<(), TransportError>;

    /// Apply the peer's description
    async fn set_remote_description(
        &self,
        desc: &SessionDescriptor,
    ) -> Result<(), TransportError>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Traffic counters collected so far
    async fn stats(&self) -> Result<ConnectionStats, TransportError>;

    /// Close the connection; closing twice is not an error
    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates peer transports
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a new connection using `ice_servers`, reporting events on `events`
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: ConnectionEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
