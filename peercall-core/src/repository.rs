//! Durable call session storage
//!
//! The controller records sessions and participant flags through
//! [`CallSessionRepository`]. Persistence is the application's business;
//! [`InMemoryCallSessionRepository`] keeps everything in process.

use crate::identity::UserId;
use crate::types::{
    CallId, CallSession, CallType, ParticipantMediaState, ParticipantStatus, SessionStatus,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

/// Repository errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// No session with this id
    #[error("Session not found: {0}")]
    SessionNotFound(CallId),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Call session storage
#[async_trait]
pub trait CallSessionRepository: Send + Sync {
    /// Create a session for `participant_ids`, the initiator first
    async fn create_session(
        &self,
        call_type: CallType,
        participant_ids: &[UserId],
    ) -> Result<CallSession, RepositoryError>;

    /// Store the media flags of one participant
    async fn update_participant_media(
        &self,
        session_id: CallId,
        user_id: &UserId,
        flags: &ParticipantMediaState,
    ) -> Result<(), RepositoryError>;

    /// Mark a session ended
    async fn end_session(&self, session_id: CallId) -> Result<(), RepositoryError>;

    /// Store the session status
    async fn update_session_status(
        &self,
        _session_id: CallId,
        _status: SessionStatus,
    ) -> Result<(), RepositoryError> {
        Ok(())
    }

    /// Store the status of one participant
    async fn update_participant_status(
        &self,
        _session_id: CallId,
        _user_id: &UserId,
        _status: ParticipantStatus,
    ) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// Stored session row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Session as created
    pub session: CallSession,
    /// Latest status
    pub status: SessionStatus,
    /// Participant statuses
    pub participants: HashMap<UserId, ParticipantStatus>,
    /// Latest media flags per participant
    pub media: HashMap<UserId, ParticipantMediaState>,
    /// Number of `end_session` calls
    pub end_calls: usize,
}

/// Process-local repository
#[derive(Default)]
pub struct InMemoryCallSessionRepository {
    sessions: Mutex<HashMap<CallId, SessionRecord>>,
}

impl InMemoryCallSessionRepository {
    /// Empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session created elsewhere (the callee learns it from the offer)
    pub fn register(&self, session: CallSession) {
        let participants = session
            .participant_ids
            .iter()
            .map(|p| (p.clone(), ParticipantStatus::Invited))
            .collect();
        self.sessions.lock().entry(session.id).or_insert(SessionRecord {
            session,
            status: SessionStatus::Ringing,
            participants,
            media: HashMap::new(),
            end_calls: 0,
        });
    }

    /// Stored row for `session_id`
    pub fn get(&self, session_id: CallId) -> Option<SessionRecord> {
        self.sessions.lock().get(&session_id).cloned()
    }

    /// Number of sessions stored
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn with_record<R>(
        &self,
        session_id: CallId,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Result<R, RepositoryError> {
        let mut sessions = self.sessions.lock();
        let record = sessions
            .get_mut(&session_id)
            .ok_or(RepositoryError::SessionNotFound(session_id))?;
        Ok(f(record))
    }
}

#[async_trait]
impl CallSessionRepository for InMemoryCallSessionRepository {
    async fn create_session(
        &self,
        call_type: CallType,
        participant_ids: &[UserId],
    ) -> Result<CallSession, RepositoryError> {
        let session = CallSession::new(CallId::new(), call_type, participant_ids.to_vec());
        self.register(session.clone());
        tracing::debug!(session_id = %session.id, participants = participant_ids.len(), "Session created");
        Ok(session)
    }

    async fn update_participant_media(
        &self,
        session_id: CallId,
        user_id: &UserId,
        flags: &ParticipantMediaState,
    ) -> Result<(), RepositoryError> {
        self.with_record(session_id, |r| {
            r.media.insert(user_id.clone(), flags.clone());
        })
    }

    async fn end_session(&self, session_id: CallId) -> Result<(), RepositoryError> {
        self.with_record(session_id, |r| {
            r.end_calls += 1;
            if !matches!(r.status, SessionStatus::Missed | SessionStatus::Declined) {
                r.status = SessionStatus::Ended;
            }
        })
    }

    async fn update_session_status(
        &self,
        session_id: CallId,
        status: SessionStatus,
    ) -> Result<(), RepositoryError> {
        self.with_record(session_id, |r| r.status = status)
    }

    async fn update_participant_status(
        &self,
        session_id: CallId,
        user_id: &UserId,
        status: ParticipantStatus,
    ) -> Result<(), RepositoryError> {
        self.with_record(session_id, |r| {
            r.participants.insert(user_id.clone(), status);
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_end_session() {
        let repo = InMemoryCallSessionRepository::new();
        let alice = UserId::new("alice");
        let session = repo
            .create_session(CallType::Audio, &[alice.clone(), UserId::new("bob")])
            .await
            .unwrap();

        let record = repo.get(session.id).unwrap();
        assert_eq!(record.status, SessionStatus::Ringing);
        assert_eq!(record.participants[&alice], ParticipantStatus::Invited);

        repo.end_session(session.id).await.unwrap();
        let record = repo.get(session.id).unwrap();
        assert_eq!(record.status, SessionStatus::Ended);
        assert_eq!(record.end_calls, 1);
    }

    #[tokio::test]
    async fn test_missed_survives_end() {
        let repo = InMemoryCallSessionRepository::new();
        let session = repo
            .create_session(CallType::Video, &[UserId::new("a"), UserId::new("b")])
            .await
            .unwrap();
        repo.update_session_status(session.id, SessionStatus::Missed)
            .await
            .unwrap();
        repo.end_session(session.id).await.unwrap();
        assert_eq!(repo.get(session.id).unwrap().status, SessionStatus::Missed);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let repo = InMemoryCallSessionRepository::new();
        let id = CallId::new();
        assert_eq!(
            repo.end_session(id).await,
            Err(RepositoryError::SessionNotFound(id))
        );
    }

    #[tokio::test]
    async fn test_participant_media_stored() {
        let repo = InMemoryCallSessionRepository::new();
        let bob = UserId::new("bob");
        let session = repo
            .create_session(CallType::Video, &[UserId::new("alice"), bob.clone()])
            .await
            .unwrap();
        let mut flags = ParticipantMediaState::for_call(bob.clone(), CallType::Video);
        flags.audio_enabled = false;
        repo.update_participant_media(session.id, &bob, &flags)
            .await
            .unwrap();
        assert_eq!(repo.get(session.id).unwrap().media[&bob], flags);
    }
}
