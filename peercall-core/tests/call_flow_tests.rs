//! End-to-end call flows between two in-process clients

mod common;

use common::{connect, next_event, peer};
use peercall_core::testing::{FakeMediaAcquirer, FakeTransportFactory};
use peercall_core::{
    CallConfig, CallDependencies, CallError, CallEvent, CallObservers, CallSessionController,
    CallState, CallType, ConnectionStats, InboundSignal, InMemoryCallSessionRepository,
    NegotiationError, PeerConnectionState, SessionStatus, SignalingHub, SignalingMessage,
    SignalingPort, TrackKind, TrackReadyState, UserId,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn count_messages(
    hub: &SignalingHub,
    from: &UserId,
    matches: fn(&SignalingMessage) -> bool,
) -> usize {
    hub.sent_by(from).iter().filter(|m| matches(m)).count()
}

#[tokio::test]
async fn video_call_reaches_active_on_both_sides() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;

    let session_id = alice
        .client
        .call(vec![bob.user.clone()], CallType::Video)
        .await
        .unwrap();
    assert_eq!(alice.client.snapshot().state, CallState::OutgoingRinging);

    bob.wait_state(CallState::IncomingRinging).await;
    assert_eq!(bob.client.snapshot().session_id, Some(session_id));
    assert_eq!(bob.media.local_acquisitions(), 0);

    bob.client.accept().await.unwrap();
    assert_eq!(bob.client.snapshot().state, CallState::Negotiating);
    bob.transport().emit_state(PeerConnectionState::Connected);
    bob.wait_state(CallState::Active).await;

    alice.wait_state(CallState::Negotiating).await;
    alice.transport().emit_state(PeerConnectionState::Connected);
    alice.wait_state(CallState::Active).await;

    let snapshot = alice.client.snapshot();
    assert!(snapshot.started_at.is_some());
    assert_eq!(snapshot.call_type, Some(CallType::Video));
    assert_eq!(
        alice.repository.get(session_id).unwrap().status,
        SessionStatus::Active
    );
    assert_eq!(alice.media.local_acquisitions(), 1);
    assert_eq!(bob.media.local_acquisitions(), 1);
}

#[tokio::test]
async fn hangup_releases_everything() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;
    connect(&alice, &bob, CallType::Video).await;

    let mut bob_events = bob.client.subscribe_events();
    let remote = bob.transport().emit_remote_track("alice-video", TrackKind::Video);
    next_event(&mut bob_events, |e| matches!(e, CallEvent::RemoteTrackAdded { .. })).await;

    alice.client.hangup().await.unwrap();
    assert_eq!(alice.client.snapshot().state, CallState::Ended);
    bob.wait_state(CallState::Ended).await;

    for side in [&alice, &bob] {
        let tracks = side.media.local_tracks();
        assert_eq!(tracks.len(), 2);
        for track in tracks {
            assert_eq!(track.ready_state(), TrackReadyState::Ended);
            assert_eq!(track.stop_count(), 1);
        }
        assert_eq!(side.transport().close_count(), 1);
    }
    assert_eq!(remote.ready_state(), TrackReadyState::Ended);
}

#[tokio::test]
async fn stats_available_only_while_connected() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;
    connect(&alice, &bob, CallType::Audio).await;

    let counters = ConnectionStats {
        bytes_received: 48_000,
        packets_received: 300,
        round_trip_time: Some(Duration::from_millis(25)),
        ..ConnectionStats::default()
    };
    alice.transport().set_stats(counters.clone());
    assert_eq!(alice.client.stats().await.unwrap(), counters);

    alice.client.hangup().await.unwrap();
    assert_eq!(
        alice.client.stats().await,
        Err(CallError::Negotiation(NegotiationError::Closed))
    );
}

#[tokio::test]
async fn double_hangup_has_one_side_effect() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;
    connect(&alice, &bob, CallType::Audio).await;
    let session_id = alice.client.snapshot().session_id.unwrap();

    alice.client.hangup().await.unwrap();
    alice.client.hangup().await.unwrap();

    assert_eq!(alice.transport().close_count(), 1);
    assert_eq!(alice.repository.get(session_id).unwrap().end_calls, 1);
    assert_eq!(
        count_messages(&hub, &alice.user, |m| matches!(m, SignalingMessage::CallEnded { .. })),
        1
    );
}

#[tokio::test]
async fn remote_hangup_sends_nothing_back() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;
    connect(&alice, &bob, CallType::Audio).await;

    bob.client.hangup().await.unwrap();
    alice.wait_state(CallState::Ended).await;

    assert_eq!(
        count_messages(&hub, &alice.user, |m| matches!(m, SignalingMessage::CallEnded { .. })),
        0
    );
    for track in alice.media.local_tracks() {
        assert_eq!(track.ready_state(), TrackReadyState::Ended);
    }
}

#[tokio::test]
async fn decline_never_acquires_media() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;

    let session_id = alice
        .client
        .call(vec![bob.user.clone()], CallType::Video)
        .await
        .unwrap();
    bob.wait_state(CallState::IncomingRinging).await;
    bob.client.decline().await.unwrap();
    assert_eq!(bob.client.snapshot().state, CallState::Declined);

    alice.wait_state(CallState::Declined).await;
    assert_eq!(bob.media.local_acquisitions(), 0);
    assert_eq!(bob.transports.create_count(), 0);
    assert_eq!(alice.media.local_acquisitions(), 1);
    for track in alice.media.local_tracks() {
        assert_eq!(track.ready_state(), TrackReadyState::Ended);
    }
    assert_eq!(
        alice.repository.get(session_id).unwrap().status,
        SessionStatus::Declined
    );
}

#[tokio::test]
async fn failed_accept_hangs_up_caller() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;
    bob.transports.set_fail_create(true);

    alice
        .client
        .call(vec![bob.user.clone()], CallType::Audio)
        .await
        .unwrap();
    bob.wait_state(CallState::IncomingRinging).await;

    let result = bob.client.accept().await;
    assert!(matches!(result, Err(CallError::Negotiation(_))));
    assert_eq!(bob.client.snapshot().state, CallState::Failed);
    for track in bob.media.local_tracks() {
        assert_eq!(track.ready_state(), TrackReadyState::Ended);
    }
    alice.wait_state(CallState::Ended).await;
}

#[tokio::test]
async fn connectivity_failure_surfaces_error() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;
    connect(&alice, &bob, CallType::Audio).await;

    let mut events = alice.client.subscribe_events();
    alice.transport().emit_state(PeerConnectionState::Failed);
    alice.wait_state(CallState::Failed).await;
    let event = next_event(&mut events, |e| matches!(e, CallEvent::Error { .. })).await;
    assert!(matches!(event, CallEvent::Error { session_id: Some(_), .. }));
    assert_eq!(alice.transport().close_count(), 1);
}

#[tokio::test]
async fn disconnect_alone_keeps_call() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;
    connect(&alice, &bob, CallType::Audio).await;

    alice.transport().emit_state(PeerConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.client.snapshot().state, CallState::Active);
}

#[tokio::test]
async fn toggle_audio_twice_restores_and_mirrors() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;
    connect(&alice, &bob, CallType::Video).await;
    let mut bob_events = bob.client.subscribe_events();

    assert!(!alice.client.toggle_audio(None).await.unwrap());
    let event = next_event(&mut bob_events, |e| {
        matches!(e, CallEvent::RemoteMediaChanged { .. })
    })
    .await;
    match event {
        CallEvent::RemoteMediaChanged { media, .. } => {
            assert_eq!(media.user_id, alice.user);
            assert!(!media.audio_enabled);
            assert!(media.video_enabled);
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert!(alice.client.toggle_audio(None).await.unwrap());
    let audio = alice
        .client
        .local_tracks()
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.kind() == TrackKind::Audio)
        .unwrap();
    assert!(audio.is_enabled());

    let session_id = alice.client.snapshot().session_id.unwrap();
    let stored = alice.repository.get(session_id).unwrap().media[&alice.user].clone();
    assert!(stored.audio_enabled);
}

#[tokio::test]
async fn new_call_after_previous_ended() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;
    connect(&alice, &bob, CallType::Audio).await;
    let first = alice.client.snapshot().session_id.unwrap();
    alice.client.hangup().await.unwrap();
    bob.wait_state(CallState::Ended).await;

    connect(&alice, &bob, CallType::Audio).await;
    let second = alice.client.snapshot().session_id.unwrap();
    assert_ne!(first, second);
    assert_eq!(alice.transports.create_count(), 2);
}

#[tokio::test]
async fn busy_callee_ignores_second_offer() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;
    let carol = peer(&hub, "carol").await;
    connect(&alice, &bob, CallType::Audio).await;
    let session_id = bob.client.snapshot().session_id;

    carol
        .client
        .call(vec![bob.user.clone()], CallType::Audio)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.client.snapshot().state, CallState::Active);
    assert_eq!(bob.client.snapshot().session_id, session_id);
}

fn first_offer(hub: &SignalingHub, from: &UserId) -> SignalingMessage {
    hub.sent_by(from)
        .into_iter()
        .find(|m| matches!(m, SignalingMessage::CallOffer { .. }))
        .unwrap()
}

#[tokio::test]
async fn redelivered_offer_for_declined_session_is_ignored() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;

    let session_id = alice
        .client
        .call(vec![bob.user.clone()], CallType::Audio)
        .await
        .unwrap();
    bob.wait_state(CallState::IncomingRinging).await;
    bob.client.decline().await.unwrap();
    alice.wait_state(CallState::Declined).await;

    let offer = first_offer(&hub, &alice.user);
    hub.port("alice").send(&bob.user, offer).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = bob.client.snapshot();
    assert_eq!(snapshot.state, CallState::Declined);
    assert_eq!(snapshot.session_id, Some(session_id));
    assert_eq!(bob.media.local_acquisitions(), 0);
}

#[tokio::test]
async fn redelivered_offer_for_earlier_call_is_ignored() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;

    connect(&alice, &bob, CallType::Audio).await;
    let stale = first_offer(&hub, &alice.user);
    alice.client.hangup().await.unwrap();
    bob.wait_state(CallState::Ended).await;

    connect(&alice, &bob, CallType::Audio).await;
    let current = bob.client.snapshot().session_id;
    alice.client.hangup().await.unwrap();
    bob.wait_state(CallState::Ended).await;

    hub.port("alice").send(&bob.user, stale).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.client.snapshot().state, CallState::Ended);
    assert_eq!(bob.client.snapshot().session_id, current);
}

#[tokio::test]
async fn group_call_records_every_participant() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;
    let _carol = peer(&hub, "carol").await;

    let session_id = alice
        .client
        .call(
            vec![bob.user.clone(), UserId::new("carol")],
            CallType::GroupAudio,
        )
        .await
        .unwrap();
    bob.wait_state(CallState::IncomingRinging).await;

    let record = alice.repository.get(session_id).unwrap();
    assert_eq!(
        record.session.participant_ids,
        vec![UserId::new("alice"), UserId::new("bob"), UserId::new("carol")]
    );
    match hub.sent_by(&alice.user).first() {
        Some(SignalingMessage::CallOffer { participants, .. }) => assert_eq!(participants.len(), 3),
        other => panic!("expected offer, got {other:?}"),
    }
}

/// Candidates reaching a ringing callee wait for accept and are applied by it
#[tokio::test]
async fn candidate_before_accept_is_buffered_then_applied() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;

    let media = Arc::new(FakeMediaAcquirer::new());
    let transports = Arc::new(FakeTransportFactory::new());
    let port = hub.port("bob");
    let mut inbox = port.subscribe().await.unwrap();
    let deps = CallDependencies {
        local_user: UserId::new("bob"),
        media: media.clone(),
        transports: transports.clone(),
        signaling: Arc::new(port),
        repository: Arc::new(InMemoryCallSessionRepository::new()),
        config: CallConfig::default(),
    };
    let (mut bob, _bob_events) = CallSessionController::new(deps, CallObservers::new(8));

    let session_id = alice
        .client
        .call(vec![UserId::new("bob")], CallType::Audio)
        .await
        .unwrap();
    let offer = loop {
        let signal = tokio::time::timeout(common::WAIT, inbox.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(signal.message, SignalingMessage::CallOffer { .. }) {
            break signal;
        }
    };
    bob.handle_signal(offer).await;
    assert_eq!(bob.state(), CallState::IncomingRinging);

    let mut candidate =
        peercall_core::IceCandidate::new("candidate:early 1 udp 1 10.0.0.9 4000 typ host");
    candidate.sdp_mid = Some("0".to_string());
    bob.handle_signal(InboundSignal {
        from: UserId::new("alice"),
        message: SignalingMessage::IceCandidate {
            session_id,
            candidate,
        },
    })
    .await;
    assert_eq!(bob.connection().buffered_candidates().await, 1);
    assert_eq!(transports.create_count(), 0);

    bob.accept().await.unwrap();
    assert_eq!(bob.connection().buffered_candidates().await, 0);
    assert_eq!(
        transports.last().unwrap().applied_candidates(),
        vec!["candidate:early 1 udp 1 10.0.0.9 4000 typ host".to_string()]
    );
    assert_eq!(media.local_acquisitions(), 1);
}

#[tokio::test]
async fn trickled_candidates_reach_peer_connection() {
    let hub = SignalingHub::new();
    let alice = peer(&hub, "alice").await;
    let bob = peer(&hub, "bob").await;
    connect(&alice, &bob, CallType::Audio).await;

    // Each fake transport gathers one candidate when its local description is set
    let deadline = tokio::time::Instant::now() + common::WAIT;
    loop {
        let alice_applied = alice.transport().applied_candidates();
        let bob_applied = bob.transport().applied_candidates();
        if alice_applied.len() == 1 && bob_applied.len() == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "candidates not applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
