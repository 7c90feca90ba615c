//! [`PeerTransport`] over the `webrtc` crate

use crate::media::{MediaTrack, TrackKind};
use crate::peer::{
    ConnectionEvent, ConnectionEventSender, ConnectionStats, PeerConnectionState, PeerTransport,
    PeerTransportFactory, SenderId, TransportError,
};
use crate::types::{IceCandidate, IceServer, SdpKind, SessionDescriptor};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "peercall";

fn failed(e: webrtc::Error) -> TransportError {
    TransportError::Failed(e.to_string())
}

fn to_rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn to_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

/// Creates [`WebRtcPeerTransport`]s with default codecs and interceptors
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    #[tracing::instrument(skip(self, ice_servers, events), fields(ice_servers = ice_servers.len()))]
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: ConnectionEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(failed)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(failed)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: to_rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(failed)?);
        register_handlers(&pc, events);

        tracing::debug!("WebRTC peer connection created");
        Ok(Arc::new(WebRtcPeerTransport {
            pc,
            senders: Mutex::new(HashMap::new()),
            local_tracks: Mutex::new(HashMap::new()),
        }))
    }
}

fn register_handlers(pc: &RTCPeerConnection, events: ConnectionEventSender) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            // `None` marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(ConnectionEvent::LocalIceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize local ICE candidate"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            tracing::info!(track_id = %track.id(), kind = ?kind, "Remote track received");
            let _ = tx.send(ConnectionEvent::RemoteTrack(MediaTrack::remote(track.id(), kind)));
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        tracing::debug!(state = %state, "Peer connection state changed");
        let _ = events.send(ConnectionEvent::StateChanged(to_connection_state(state)));
        Box::pin(async {})
    }));
}

/// Peer connection backed by `RTCPeerConnection`
pub struct WebRtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl WebRtcPeerTransport {
    /// Local track for `track`, created on first use and reused afterwards
    fn local_track(&self, track: &MediaTrack) -> Arc<dyn TrackLocal + Send + Sync> {
        let mut tracks = self.local_tracks.lock();
        let local = tracks.entry(track.id().to_string()).or_insert_with(|| {
            let kind = track.kind();
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: kind.mime_type().to_string(),
                    clock_rate: kind.clock_rate(),
                    channels: kind.channels(),
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                track.id().to_string(),
                STREAM_ID.to_string(),
            ))
        });
        Arc::clone(local) as Arc<dyn TrackLocal + Send + Sync>
    }

    fn sender(&self, id: SenderId) -> Result<Arc<RTCRtpSender>, TransportError> {
        self.senders
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| TransportError::Failed(format!("unknown {id}")))
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<SenderId, TransportError> {
        let local = self.local_track(track);
        let sender = self.pc.add_track(local).await.map_err(failed)?;
        let mut senders = self.senders.lock();
        let id = SenderId(senders.len() as u32);
        senders.insert(id, sender);
        Ok(id)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&MediaTrack>,
    ) -> Result<(), TransportError> {
        let rtp_sender = self.sender(sender)?;
        let local = track.map(|t| self.local_track(t));
        rtp_sender.replace_track(local).await.map_err(failed)
    }

    async fn create_offer(&self) -> Result<SessionDescriptor, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::InvalidState(e.to_string()))?;
        Ok(SessionDescriptor::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::InvalidState(e.to_string()))?;
        Ok(SessionDescriptor::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError> {
        let rtc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(|e| TransportError::InvalidState(e.to_string()))
    }

    async fn set_remote_description(&self, desc: &SessionDescriptor) -> Result<(), TransportError> {
        if desc.sdp().trim().is_empty() {
            return Err(TransportError::InvalidSdp("SDP cannot be empty".to_string()));
        }
        let rtc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))
    }

    async fn stats(&self) -> Result<ConnectionStats, TransportError> {
        let report = self.pc.get_stats().await;
        Ok(summarize_stats(report.reports.values()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(failed)
    }
}

fn summarize_stats<'a>(reports: impl Iterator<Item = &'a StatsReportType>) -> ConnectionStats {
    let mut stats = ConnectionStats::default();
    for report in reports {
        match report {
            StatsReportType::InboundRTP(inbound) => {
                stats.bytes_received += inbound.bytes_received;
                stats.packets_received += inbound.packets_received;
            }
            StatsReportType::OutboundRTP(outbound) => {
                stats.bytes_sent += outbound.bytes_sent;
                stats.packets_sent += outbound.packets_sent;
            }
            StatsReportType::CandidatePair(pair)
                if pair.nominated && pair.current_round_trip_time > 0.0 =>
            {
                stats.round_trip_time =
                    Duration::try_from_secs_f64(pair.current_round_trip_time).ok();
            }
            _ => {}
        }
    }
    stats
}

fn to_rtc_description(desc: &SessionDescriptor) -> Result<RTCSessionDescription, TransportError> {
    let sdp = desc.sdp().to_string();
    let result = match desc.kind() {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    };
    result.map_err(|e| TransportError::InvalidSdp(e.to_string()))
}
