//! Call types and data structures

use crate::identity::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// One-to-one audio
    Audio,
    /// One-to-one video
    Video,
    /// Group audio (mesh)
    GroupAudio,
    /// Group video (mesh)
    GroupVideo,
}

impl CallType {
    /// Whether the call carries a camera track
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video | Self::GroupVideo)
    }

    /// Whether the call is a group call
    pub fn is_group(&self) -> bool {
        matches!(self, Self::GroupAudio | Self::GroupVideo)
    }

    /// Media constraints to capture for this call type
    pub fn constraints(&self) -> MediaConstraints {
        if self.has_video() {
            MediaConstraints::video_call()
        } else {
            MediaConstraints::audio_only()
        }
    }
}

/// Requested camera settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

/// Media constraints for local capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture microphone
    pub audio: bool,
    /// Capture camera, with optional settings
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: None,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints::default()),
        }
    }

    /// Check if audio is requested
    pub fn has_audio(&self) -> bool {
        self.audio
    }

    /// Check if video is requested
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }
}

/// Call state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No call yet
    Idle,
    /// Offer sent, waiting for the callee
    OutgoingRinging,
    /// Offer received, waiting for the local user
    IncomingRinging,
    /// Descriptions exchanged, waiting for connectivity
    Negotiating,
    /// Media is flowing
    Active,
    /// Callee declined
    Declined,
    /// Call was hung up
    Ended,
    /// Call failed
    Failed,
}

impl CallState {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Declined | Self::Ended | Self::Failed)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::OutgoingRinging => "outgoing_ringing",
            Self::IncomingRinging => "incoming_ringing",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Declined => "declined",
            Self::Ended => "ended",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Durable status of a session row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for the callee
    Ringing,
    /// Connected
    Active,
    /// Hung up or failed
    Ended,
    /// Ringing timed out
    Missed,
    /// Callee declined
    Declined,
}

/// Durable status of a participant row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    /// Invited, not answered
    Invited,
    /// Accepted the call
    Joined,
    /// Left the call
    Left,
    /// Declined the call
    Rejected,
}

/// Local media flags of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantMediaState {
    /// Participant
    pub user_id: UserId,
    /// Microphone enabled
    pub audio_enabled: bool,
    /// Camera enabled
    pub video_enabled: bool,
    /// Screen share replacing the camera
    pub screen_sharing: bool,
}

impl ParticipantMediaState {
    /// Initial flags for a participant joining a call of the given type
    pub fn for_call(user_id: UserId, call_type: CallType) -> Self {
        Self {
            user_id,
            audio_enabled: true,
            video_enabled: call_type.has_video(),
            screen_sharing: false,
        }
    }
}

/// Call session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    /// Session identifier
    pub id: CallId,
    /// Kind of call
    pub call_type: CallType,
    /// Current state
    pub state: CallState,
    /// Everyone in the call, the initiator first
    pub participant_ids: Vec<UserId>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    /// Create a new session record
    pub fn new(id: CallId, call_type: CallType, participant_ids: Vec<UserId>) -> Self {
        Self {
            id,
            call_type,
            state: CallState::Idle,
            participant_ids,
            created_at: Utc::now(),
        }
    }

    /// Participants other than `user`
    pub fn others<'a>(&'a self, user: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.participant_ids.iter().filter(move |p| *p != user)
    }
}

/// Which leg of the negotiation a description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Immutable SDP offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    kind: SdpKind,
    sdp: String,
}

impl SessionDescriptor {
    /// Wrap an SDP offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap an SDP answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Offer or answer
    pub fn kind(&self) -> SdpKind {
        self.kind
    }

    /// SDP body
    pub fn sdp(&self) -> &str {
        &self.sdp
    }
}

/// ICE candidate exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// ICE server entry (STUN by default)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs, e.g. `stun:stun.l.google.com:19302`
    pub urls: Vec<String>,
    /// Username for TURN servers
    #[serde(default)]
    pub username: Option<String>,
    /// Credential for TURN servers
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Read-only view of the call published to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSnapshot {
    /// Session, once one exists
    pub session_id: Option<CallId>,
    /// Kind of call
    pub call_type: Option<CallType>,
    /// Current state
    pub state: CallState,
    /// Local media flags
    pub local_media: Option<ParticipantMediaState>,
    /// Peer this client negotiates with
    pub remote_peer: Option<UserId>,
    /// When the call became active
    pub started_at: Option<DateTime<Utc>>,
}

impl CallSnapshot {
    /// Snapshot of a client with no call
    pub fn idle() -> Self {
        Self {
            session_id: None,
            call_type: None,
            state: CallState::Idle,
            local_media: None,
            remote_peer: None,
            started_at: None,
        }
    }

    /// Time since the call became active
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.started_at.map(|start| Utc::now() - start)
    }
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}
