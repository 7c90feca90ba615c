//! peercall - one-to-one WebRTC calling core
//!
//! This library runs the client side of a peer-to-peer audio/video call:
//! offer/answer negotiation over a pluggable signaling channel, ICE
//! candidate exchange, local media capture and ownership, mid-call
//! microphone/camera toggles, and screen sharing by track replacement.
//!
//! - **Single writer**: one task per client owns the call state machine
//! - **Owned tracks**: every captured or received track is stopped exactly
//!   once, when the call is torn down
//! - **Ordered ICE**: remote candidates arriving early are buffered and
//!   applied in arrival order once the remote description is set
//! - **Pluggable seams**: signaling, media capture, peer transport, and
//!   session storage are traits
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = SignalingHub::new();
//! let alice = CallClient::builder("alice", Arc::new(hub.port("alice"))).build().await?;
//! let bob = CallClient::builder("bob", Arc::new(hub.port("bob"))).build().await?;
//!
//! let mut bob_events = bob.subscribe_events();
//! alice.call(vec![UserId::new("bob")], CallType::Audio).await?;
//!
//! while let Ok(event) = bob_events.recv().await {
//!     if let CallEvent::IncomingCall { .. } = event {
//!         bob.accept().await?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// User identity
pub mod identity;

/// Media capture and track ownership
pub mod media;

/// Peer transport abstraction
pub mod peer;

/// Peer connection ownership and ICE buffering
pub mod connection;

/// Signaling protocol and in-process hub
pub mod signaling;

/// Call session storage
pub mod repository;

/// Engine configuration
pub mod config;

/// Call state machine
pub mod call;

/// Call client task
pub mod client;

/// `webrtc` crate transport (requires webrtc-transport feature)
#[cfg(feature = "webrtc-transport")]
pub mod rtc;

/// Test doubles (requires test-utils feature)
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types at crate root
pub use call::{CallDependencies, CallError, CallEvent, CallObservers, CallSessionController};
pub use client::{CallClient, CallClientBuilder, ClientError};
pub use config::{CallConfig, ConfigError};
pub use connection::{
    CandidateDisposition, ConnectionManager, IceCandidateBuffer, NegotiationError,
    ScreenShareError,
};
pub use identity::UserId;
pub use media::{
    LocalMediaHandle, MediaAcquirer, MediaError, MediaTrack, SyntheticMediaAcquirer, TrackKind,
    TrackOrigin, TrackReadyState, TrackSource, TrackView,
};
pub use peer::{
    ConnectionEvent, ConnectionStats, PeerConnectionState, PeerTransport, PeerTransportFactory,
    SenderId, TransportError,
};
pub use repository::{CallSessionRepository, InMemoryCallSessionRepository, RepositoryError};
#[cfg(feature = "webrtc-transport")]
pub use rtc::{WebRtcPeerTransport, WebRtcTransportFactory};
pub use signaling::{
    HubPort, InboundSignal, SignalingError, SignalingHub, SignalingMessage, SignalingPort,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallEvent};
    pub use crate::client::{CallClient, CallClientBuilder};
    pub use crate::config::CallConfig;
    pub use crate::identity::UserId;
    pub use crate::media::{MediaAcquirer, SyntheticMediaAcquirer, TrackView};
    #[cfg(feature = "webrtc-transport")]
    pub use crate::rtc::WebRtcTransportFactory;
    pub use crate::signaling::{SignalingHub, SignalingPort};
    pub use crate::types::{CallId, CallSnapshot, CallState, CallType, MediaConstraints};
}
