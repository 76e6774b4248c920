//! WebRTC peer connection
//!
//! [`PeerEndpoint`] is the seam between the signaling state machine and the
//! WebRTC stack: the client only needs offers, answers, candidates and a sink
//! to feed. [`RtcPeer`] implements it on top of webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info};
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

use super::signaling::IceCandidate;
use super::track::VideoTrack;
use crate::config::{SignalingConfig, StreamCodec};
use crate::error::{AppError, Result};
use crate::graph::MediaSink;

/// One negotiated (or negotiating) peer
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    /// Create an SDP offer, set it as local description and return its text
    async fn create_offer(&self) -> Result<String>;

    async fn set_remote_answer(&self, sdp: String) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Sink that feeds this peer's outgoing media
    fn media_sink(&self) -> Box<dyn MediaSink>;

    async fn close(&self) -> Result<()>;
}

/// Creates peers; locally gathered ICE candidates go to `ice_tx`
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, ice_tx: mpsc::UnboundedSender<IceCandidate>) -> Result<Arc<dyn PeerEndpoint>>;
}

/// webrtc-rs peer with a single outgoing video track
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    track: VideoTrack,
    handle: Handle,
}

impl RtcPeer {
    pub async fn new(
        stun_servers: &[String],
        codec: StreamCodec,
        handle: Handle,
        ice_tx: mpsc::UnboundedSender<IceCandidate>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create peer connection: {}", e)))?;
        let pc = Arc::new(pc);

        let track = VideoTrack::new(codec, "video0", "vigil");
        let sender = pc
            .add_track(track.as_track_local())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add video track: {}", e)))?;

        // Drain RTCP so interceptors (NACK, reports) keep working
        handle.spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            Box::pin(async move {
                info!("Peer connection state: {}", s);
            })
        }));

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ice_tx = ice_tx.clone();
            Box::pin(async move {
                let Some(c) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match c.to_json() {
                    Ok(init) => {
                        let _ = ice_tx.send(IceCandidate::new(
                            init.candidate,
                            init.sdp_mline_index.unwrap_or(0),
                        ));
                    }
                    Err(e) => debug!("Dropping unserializable ICE candidate: {}", e),
                }
            })
        }));

        Ok(Self { pc, track, handle })
    }
}

#[async_trait]
impl PeerEndpoint for RtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| AppError::WebRtcError(format!("Invalid SDP answer: {}", e)))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: None,
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    fn media_sink(&self) -> Box<dyn MediaSink> {
        Box::new(self.track.sink(self.handle.clone()))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

/// Factory producing [`RtcPeer`]s from the signaling configuration
pub struct RtcPeerFactory {
    stun_servers: Vec<String>,
    codec: StreamCodec,
    handle: Handle,
}

impl RtcPeerFactory {
    pub fn new(config: &SignalingConfig, handle: Handle) -> Self {
        Self {
            stun_servers: config.stun_servers.clone(),
            codec: config.codec,
            handle,
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, ice_tx: mpsc::UnboundedSender<IceCandidate>) -> Result<Arc<dyn PeerEndpoint>> {
        let peer = RtcPeer::new(&self.stun_servers, self.codec, self.handle.clone(), ice_tx).await?;
        Ok(Arc::new(peer))
    }
}
