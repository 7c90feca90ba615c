//! Call signaling protocol
//!
//! Offers, answers, ICE candidates and call control travel between peers as
//! JSON objects tagged by `type`. How they get there is up to the
//! application: [`SignalingPort`] is the seam, bound to one local user.
//! [`SignalingHub`] is an in-process loopback implementation used by the
//! CLI demo and by tests.

use crate::identity::UserId;
use crate::types::{CallId, CallType, IceCandidate};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Recipient is not connected
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(UserId),

    /// Message could not be encoded or decoded
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// SDP offer opening a call
    CallOffer {
        /// Session ID
        session_id: CallId,
        /// Kind of call
        call_type: CallType,
        /// SDP content
        sdp: String,
        /// Everyone invited, the caller first
        participants: Vec<UserId>,
    },

    /// SDP answer accepting a call
    CallAnswer {
        /// Session ID
        session_id: CallId,
        /// SDP content
        sdp: String,
    },

    /// Trickled ICE candidate
    IceCandidate {
        /// Session ID
        session_id: CallId,
        /// Candidate
        #[serde(flatten)]
        candidate: IceCandidate,
    },

    /// Call hung up
    CallEnded {
        /// Session ID
        session_id: CallId,
    },

    /// Incoming call declined
    CallDeclined {
        /// Session ID
        session_id: CallId,
    },

    /// Sender's media flags changed
    MediaState {
        /// Session ID
        session_id: CallId,
        /// Microphone enabled
        audio_enabled: bool,
        /// Camera enabled
        video_enabled: bool,
        /// Screen share active
        screen_sharing: bool,
    },
}

impl SignalingMessage {
    /// Get the session ID
    #[must_use]
    pub fn session_id(&self) -> CallId {
        match self {
            Self::CallOffer { session_id, .. }
            | Self::CallAnswer { session_id, .. }
            | Self::IceCandidate { session_id, .. }
            | Self::CallEnded { session_id }
            | Self::CallDeclined { session_id }
            | Self::MediaState { session_id, .. } => *session_id,
        }
    }

    /// Wire name of the message, for logging
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::CallOffer { .. } => "call-offer",
            Self::CallAnswer { .. } => "call-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallEnded { .. } => "call-ended",
            Self::CallDeclined { .. } => "call-declined",
            Self::MediaState { .. } => "media-state",
        }
    }

    /// Encode to the JSON wire format
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }

    /// Decode from the JSON wire format
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is not a known message
    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }
}

/// Message received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSignal {
    /// Sender
    pub from: UserId,
    /// Message
    pub message: SignalingMessage,
}

/// Receiving half of an inbound signaling subscription
pub type SignalReceiver = mpsc::UnboundedReceiver<InboundSignal>;

/// Signaling channel of one local user
///
/// Implementors provide [`send`](Self::send) and
/// [`subscribe`](Self::subscribe); the typed helpers build the messages.
#[async_trait]
pub trait SignalingPort: Send + Sync {
    /// User this port sends as
    fn local_user(&self) -> &UserId;

    /// Deliver a message to `to`
    async fn send(&self, to: &UserId, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Start receiving messages addressed to the local user
    async fn subscribe(&self) -> Result<SignalReceiver, SignalingError>;

    /// Send an SDP offer
    async fn send_offer(
        &self,
        to: &UserId,
        session_id: CallId,
        call_type: CallType,
        sdp: &str,
        participants: &[UserId],
    ) -> Result<(), SignalingError> {
        self.send(
            to,
            SignalingMessage::CallOffer {
                session_id,
                call_type,
                sdp: sdp.to_string(),
                participants: participants.to_vec(),
            },
        )
        .await
    }

    /// Send an SDP answer
    async fn send_answer(
        &self,
        to: &UserId,
        session_id: CallId,
        sdp: &str,
    ) -> Result<(), SignalingError> {
        self.send(
            to,
            SignalingMessage::CallAnswer {
                session_id,
                sdp: sdp.to_string(),
            },
        )
        .await
    }

    /// Send a local ICE candidate
    async fn send_ice_candidate(
        &self,
        to: &UserId,
        session_id: CallId,
        candidate: &IceCandidate,
    ) -> Result<(), SignalingError> {
        self.send(
            to,
            SignalingMessage::IceCandidate {
                session_id,
                candidate: candidate.clone(),
            },
        )
        .await
    }

    /// Send a hangup
    async fn send_hangup(&self, to: &UserId, session_id: CallId) -> Result<(), SignalingError> {
        self.send(to, SignalingMessage::CallEnded { session_id }).await
    }

    /// Send a decline
    async fn send_decline(&self, to: &UserId, session_id: CallId) -> Result<(), SignalingError> {
        self.send(to, SignalingMessage::CallDeclined { session_id })
            .await
    }

    /// Send local media flags
    async fn send_media_state(
        &self,
        to: &UserId,
        session_id: CallId,
        audio_enabled: bool,
        video_enabled: bool,
        screen_sharing: bool,
    ) -> Result<(), SignalingError> {
        self.send(
            to,
            SignalingMessage::MediaState {
                session_id,
                audio_enabled,
                video_enabled,
                screen_sharing,
            },
        )
        .await
    }
}

/// Message recorded by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSignal {
    /// Sender
    pub from: UserId,
    /// Recipient
    pub to: UserId,
    /// Message
    pub message: SignalingMessage,
}

#[derive(Default)]
struct HubState {
    mailboxes: HashMap<UserId, mpsc::UnboundedSender<InboundSignal>>,
    log: Vec<SentSignal>,
}

/// In-process signaling relay
///
/// Every message is encoded to JSON and decoded again on delivery, so the
/// wire format is exercised even in process.
#[derive(Clone, Default)]
pub struct SignalingHub {
    state: Arc<Mutex<HubState>>,
}

impl SignalingHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Port sending as `user`
    #[must_use]
    pub fn port(&self, user: impl Into<UserId>) -> HubPort {
        HubPort {
            user: user.into(),
            hub: self.clone(),
        }
    }

    /// Unregister `user`; later sends to it fail
    pub fn disconnect(&self, user: &UserId) {
        self.state.lock().mailboxes.remove(user);
    }

    /// Every message delivered so far
    pub fn sent(&self) -> Vec<SentSignal> {
        self.state.lock().log.clone()
    }

    /// Messages delivered from `from`
    pub fn sent_by(&self, from: &UserId) -> Vec<SignalingMessage> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|s| &s.from == from)
            .map(|s| s.message.clone())
            .collect()
    }

    fn deliver(
        &self,
        from: &UserId,
        to: &UserId,
        message: &SignalingMessage,
    ) -> Result<(), SignalingError> {
        let decoded = SignalingMessage::from_json(&message.to_json()?)?;
        let mut state = self.state.lock();
        let mailbox = state
            .mailboxes
            .get(to)
            .ok_or_else(|| SignalingError::PeerUnreachable(to.clone()))?;
        let delivered = mailbox.send(InboundSignal {
            from: from.clone(),
            message: decoded,
        });
        if delivered.is_err() {
            state.mailboxes.remove(to);
            return Err(SignalingError::PeerUnreachable(to.clone()));
        }
        state.log.push(SentSignal {
            from: from.clone(),
            to: to.clone(),
            message: message.clone(),
        });
        Ok(())
    }
}

/// [`SignalingPort`] backed by a [`SignalingHub`]
#[derive(Clone)]
pub struct HubPort {
    user: UserId,
    hub: SignalingHub,
}

#[async_trait]
impl SignalingPort for HubPort {
    fn local_user(&self) -> &UserId {
        &self.user
    }

    #[tracing::instrument(skip(self, message), fields(from = %self.user, to = %to, message_type = message.message_type()))]
    async fn send(&self, to: &UserId, message: SignalingMessage) -> Result<(), SignalingError> {
        tracing::trace!("Sending signaling message");
        self.hub.deliver(&self.user, to, &message)
    }

    async fn subscribe(&self) -> Result<SignalReceiver, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let replaced = self
            .hub
            .state
            .lock()
            .mailboxes
            .insert(self.user.clone(), tx);
        if replaced.is_some() {
            tracing::debug!(user = %self.user, "Replaced existing signaling subscription");
        }
        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_type_tags() {
        let session_id = CallId::new();
        let json = SignalingMessage::CallEnded { session_id }.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "call-ended");
        assert_eq!(value["session_id"], session_id.to_string());

        let offer = SignalingMessage::CallOffer {
            session_id,
            call_type: CallType::Video,
            sdp: "v=0".to_string(),
            participants: vec![UserId::new("alice"), UserId::new("bob")],
        };
        let value: serde_json::Value = serde_json::from_str(&offer.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "call-offer");
        assert_eq!(value["call_type"], "video");
        assert_eq!(value["participants"][1], "bob");
    }

    #[test]
    fn test_ice_candidate_fields_are_flat() {
        let mut candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        candidate.sdp_mid = Some("0".to_string());
        candidate.sdp_mline_index = Some(0);
        let message = SignalingMessage::IceCandidate {
            session_id: CallId::new(),
            candidate,
        };
        let json = message.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["sdp_mid"], "0");
        assert_eq!(SignalingMessage::from_json(&json).unwrap(), message);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = SignalingMessage::from_json(r#"{"type":"call-ringing","session_id":"x"}"#);
        assert!(matches!(err, Err(SignalingError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_hub_delivers_to_subscriber() {
        let hub = SignalingHub::new();
        let alice = hub.port("alice");
        let bob = hub.port("bob");
        let mut inbox = bob.subscribe().await.unwrap();

        let session_id = CallId::new();
        alice
            .send_answer(bob.local_user(), session_id, "v=0 answer")
            .await
            .unwrap();

        let signal = inbox.recv().await.unwrap();
        assert_eq!(signal.from, UserId::new("alice"));
        assert_eq!(
            signal.message,
            SignalingMessage::CallAnswer {
                session_id,
                sdp: "v=0 answer".to_string()
            }
        );
        assert_eq!(hub.sent_by(&UserId::new("alice")).len(), 1);
    }

    #[tokio::test]
    async fn test_hub_unreachable_peer() {
        let hub = SignalingHub::new();
        let alice = hub.port("alice");
        let err = alice
            .send_hangup(&UserId::new("nobody"), CallId::new())
            .await
            .unwrap_err();
        assert_eq!(err, SignalingError::PeerUnreachable(UserId::new("nobody")));
        assert!(hub.sent().is_empty());
    }

    #[tokio::test]
    async fn test_hub_disconnect() {
        let hub = SignalingHub::new();
        let alice = hub.port("alice");
        let bob = hub.port("bob");
        let _inbox = bob.subscribe().await.unwrap();
        hub.disconnect(bob.local_user());
        assert!(alice
            .send_decline(bob.local_user(), CallId::new())
            .await
            .is_err());
    }
}
