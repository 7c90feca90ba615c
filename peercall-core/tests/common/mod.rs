//! Shared helpers for integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use peercall_core::testing::{FakeMediaAcquirer, FakePeerTransport, FakeTransportFactory};
use peercall_core::{
    CallClient, CallConfig, CallEvent, CallState, InMemoryCallSessionRepository, SignalingHub,
    UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Peer {
    pub user: UserId,
    pub client: CallClient,
    pub media: Arc<FakeMediaAcquirer>,
    pub transports: Arc<FakeTransportFactory>,
    pub repository: Arc<InMemoryCallSessionRepository>,
}

impl Peer {
    /// Transport of the current call
    pub fn transport(&self) -> Arc<FakePeerTransport> {
        self.transports.last().expect("no transport created")
    }

    pub async fn wait_state(&self, state: CallState) {
        let mut snapshot = self.client.watch_snapshot();
        tokio::time::timeout(WAIT, snapshot.wait_for(|s| s.state == state))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "{} never reached {state}, stuck in {}",
                    self.user,
                    self.client.snapshot().state
                )
            })
            .unwrap();
    }
}

pub async fn peer(hub: &SignalingHub, name: &str) -> Peer {
    peer_with_config(hub, name, CallConfig::default()).await
}

pub async fn peer_with_config(hub: &SignalingHub, name: &str, config: CallConfig) -> Peer {
    let media = Arc::new(FakeMediaAcquirer::new());
    let transports = Arc::new(FakeTransportFactory::new());
    let repository = Arc::new(InMemoryCallSessionRepository::new());
    let client = CallClient::builder(name, Arc::new(hub.port(name)))
        .with_media(media.clone())
        .with_transports(transports.clone())
        .with_repository(repository.clone())
        .with_config(config)
        .build()
        .await
        .unwrap();
    Peer {
        user: UserId::new(name),
        client,
        media,
        transports,
        repository,
    }
}

pub async fn next_event(
    events: &mut broadcast::Receiver<CallEvent>,
    matches: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received")
}

/// Drive a call from `caller` to `callee` until both are active
pub async fn connect(caller: &Peer, callee: &Peer, call_type: peercall_core::CallType) {
    caller
        .client
        .call(vec![callee.user.clone()], call_type)
        .await
        .unwrap();
    callee.wait_state(CallState::IncomingRinging).await;
    callee.client.accept().await.unwrap();
    callee
        .transport()
        .emit_state(peercall_core::PeerConnectionState::Connected);
    callee.wait_state(CallState::Active).await;

    caller.wait_state(CallState::Negotiating).await;
    caller
        .transport()
        .emit_state(peercall_core::PeerConnectionState::Connected);
    caller.wait_state(CallState::Active).await;
}
