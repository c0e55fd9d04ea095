//! Peer connection engine seam.
//!
//! The orchestrator only sees [`PeerEngine`] / [`PeerHandle`] and a stream of
//! [`EngineEvent`]s per peer. [`WebRtcEngine`] backs them with the `webrtc`
//! crate and a single shared H.264 video track.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use camcast_protocol::{IceCandidatePayload, IceConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the peer is torn down.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    fn into_rtc(self) -> Result<RTCSessionDescription, EngineError> {
        if self.sdp.trim().is_empty() {
            return Err(EngineError::Rejected(format!("empty {:?} description", self.kind)));
        }
        let desc = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp)?,
        };
        Ok(desc)
    }
}

/// Everything a peer reports back asynchronously.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ConnectionState(ConnectionState),
    CandidateGathered(IceCandidatePayload),
    GatheringComplete,
}

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Rtc(#[from] webrtc::Error),
    #[error("{0}")]
    Rejected(String),
}

/// Receives the encoded video shared by every connected peer.
#[async_trait]
pub trait VideoSink: Send + Sync {
    /// Push one encoded H.264 access unit.
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), EngineError>;
}

#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Create a peer that reports its events on `events`.
    async fn create_peer(&self, events: EventSender) -> Result<Box<dyn PeerHandle>, EngineError>;
}

#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;
    /// Current local description, including any candidates gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

pub struct WebRtcEngine {
    api: API,
    config: RTCConfiguration,
    video_track: Arc<TrackLocalStaticSample>,
}

impl WebRtcEngine {
    pub fn new(ice: &IceConfig) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();

        // H.264 only: the camera pipeline produces Constrained Baseline.
        let h264_feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "ccm".into(),
                parameter: "fir".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "pli".into(),
            },
        ];
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: H264_FMTP.to_string(),
                    rtcp_feedback: h264_feedback,
                },
                payload_type: 125,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = Vec::new();
        if !ice.stun_urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: ice.stun_urls.clone(),
                ..Default::default()
            });
        }
        if !ice.turn_urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: ice.turn_urls.clone(),
                username: ice.turn_username.clone().unwrap_or_default(),
                credential: ice.turn_credential.clone().unwrap_or_default(),
                ..Default::default()
            });
        }

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: H264_FMTP.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "camcast".to_string(),
        ));

        Ok(Self {
            api,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            video_track,
        })
    }
}

#[async_trait]
impl VideoSink for WebRtcEngine {
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), EngineError> {
        self.video_track
            .write_sample(&webrtc::media::Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn create_peer(&self, events: EventSender) -> Result<Box<dyn PeerHandle>, EngineError> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        let sender = peer_connection
            .add_track(Arc::clone(&self.video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP must be drained for the interceptors (NACK, reports) to run.
        tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });

        let tx = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let _ = tx.send(EngineEvent::ConnectionState(state.into()));
            Box::pin(async {})
        }));

        let tx = events.clone();
        peer_connection.on_ice_gathering_state_change(Box::new(move |state| {
            if state == RTCIceGathererState::Complete {
                let _ = tx.send(EngineEvent::GatheringComplete);
            }
            Box::pin(async {})
        }));

        let tx = events;
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => {
                        let _ = tx.send(EngineEvent::CandidateGathered(IceCandidatePayload {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        }));
                    }
                    Err(e) => {
                        warn!("Failed to serialize ICE candidate: {e}");
                    }
                }
            }
            Box::pin(async {})
        }));

        info!("WebRTC peer connection created");
        Ok(Box::new(WebRtcPeer { peer_connection }))
    }
}

struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.peer_connection
            .set_local_description(desc.into_rtc()?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.peer_connection
            .set_remote_description(desc.into_rtc()?)
            .await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.peer_connection.local_description().await?;
        let kind = match desc.sdp_type {
            webrtc::peer_connection::sdp::sdp_type::RTCSdpType::Answer => SdpKind::Answer,
            _ => SdpKind::Offer,
        };
        Some(SessionDescription {
            kind,
            sdp: desc.sdp,
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection.add_ice_candidate(init).await?;
        debug!("Remote ICE candidate added");
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.peer_connection.close().await?;
        info!("Peer connection closed");
        Ok(())
    }
}

/// Scriptable in-memory engine for orchestrator and gateway tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    pub struct StubBehavior {
        /// Report gathering-complete once the local description is set
        pub gathers: bool,
        /// Report gathering-complete twice (duplicate engine callback)
        pub gathers_twice: bool,
        pub fail_create_peer: bool,
        pub fail_offer: bool,
        pub fail_remote: bool,
        /// Time each remote description takes to apply
        pub remote_delay: Option<Duration>,
    }

    impl Default for StubBehavior {
        fn default() -> Self {
            Self {
                gathers: true,
                gathers_twice: false,
                fail_create_peer: false,
                fail_offer: false,
                fail_remote: false,
                remote_delay: None,
            }
        }
    }

    #[derive(Default)]
    pub struct StubEngine {
        pub behavior: Mutex<StubBehavior>,
        pub events: Mutex<Vec<EventSender>>,
        pub closed: Arc<AtomicUsize>,
        pub candidates: Arc<Mutex<Vec<IceCandidatePayload>>>,
        /// Remote descriptions and candidates in the order peers applied them
        pub applied: Arc<Mutex<Vec<String>>>,
    }

    impl StubEngine {
        pub fn with(behavior: StubBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                ..Default::default()
            }
        }

        /// Deliver a connection state change to the `index`-th created peer.
        pub fn report(&self, index: usize, state: ConnectionState) {
            let events = self.events.lock().unwrap();
            let _ = events[index].send(EngineEvent::ConnectionState(state));
        }

        pub fn peers_created(&self) -> usize {
            self.events.lock().unwrap().len()
        }

        pub fn closed_count(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn applied(&self) -> Vec<String> {
            self.applied.lock().unwrap().clone()
        }
    }

    /// Deterministic answer text derived from the offer.
    pub fn stub_answer_for(offer: &str) -> String {
        format!("v=0\r\ns=stub-answer\r\na=x-offer-bytes:{}\r\n", offer.len())
    }

    #[async_trait]
    impl PeerEngine for StubEngine {
        async fn create_peer(
            &self,
            events: EventSender,
        ) -> Result<Box<dyn PeerHandle>, EngineError> {
            let behavior = *self.behavior.lock().unwrap();
            if behavior.fail_create_peer {
                return Err(EngineError::Rejected("no peer for you".into()));
            }
            self.events.lock().unwrap().push(events.clone());
            Ok(Box::new(StubPeer {
                behavior,
                events,
                local: Mutex::new(None),
                remote: Mutex::new(None),
                closed: Arc::clone(&self.closed),
                candidates: Arc::clone(&self.candidates),
                applied: Arc::clone(&self.applied),
            }))
        }
    }

    struct StubPeer {
        behavior: StubBehavior,
        events: EventSender,
        local: Mutex<Option<SessionDescription>>,
        remote: Mutex<Option<SessionDescription>>,
        closed: Arc<AtomicUsize>,
        candidates: Arc<Mutex<Vec<IceCandidatePayload>>>,
        applied: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PeerHandle for StubPeer {
        async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
            if self.behavior.fail_offer {
                return Err(EngineError::Rejected("offer failed".into()));
            }
            Ok(SessionDescription::offer("v=0\r\ns=stub-offer\r\n"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
            let remote = self.remote.lock().unwrap().clone();
            match remote {
                Some(offer) => Ok(SessionDescription::answer(stub_answer_for(&offer.sdp))),
                None => Err(EngineError::Rejected("no remote offer".into())),
            }
        }

        async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
            *self.local.lock().unwrap() = Some(desc);
            if self.behavior.gathers {
                let _ = self.events.send(EngineEvent::CandidateGathered(IceCandidatePayload {
                    candidate: "candidate:1 1 UDP 2130706431 10.0.0.2 40000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                }));
                let _ = self.events.send(EngineEvent::GatheringComplete);
                if self.behavior.gathers_twice {
                    let _ = self.events.send(EngineEvent::GatheringComplete);
                }
            }
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
            if let Some(delay) = self.behavior.remote_delay {
                tokio::time::sleep(delay).await;
            }
            if self.behavior.fail_remote {
                return Err(EngineError::Rejected("remote description rejected".into()));
            }
            let kind = match desc.kind {
                SdpKind::Offer => "remote-offer",
                SdpKind::Answer => "remote-answer",
            };
            self.applied.lock().unwrap().push(kind.to_string());
            *self.remote.lock().unwrap() = Some(desc);
            Ok(())
        }

        async fn local_description(&self) -> Option<SessionDescription> {
            self.local.lock().unwrap().clone()
        }

        async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), EngineError> {
            self.applied.lock().unwrap().push(candidate.candidate.clone());
            self.candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn close(&self) -> Result<(), EngineError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
