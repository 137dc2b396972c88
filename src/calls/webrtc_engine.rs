//! Media engine backed by the `webrtc` crate.
//!
//! One `RTCPeerConnection` per call attempt. Audio and video transceivers
//! are negotiated; actual capture and rendering stay outside this crate —
//! this engine only owns the ICE/DTLS negotiation surface the call manager
//! drives through the [`MediaEngine`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use ringcore::protocol::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as RtcMediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use super::media::{
    ConnectivityState, EngineError, EngineEvent, MediaEngine, MediaEngineFactory,
};

const ENGINE_EVENT_QUEUE: usize = 64;

fn engine_err(e: webrtc::Error) -> EngineError {
    EngineError::new(e.to_string())
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()).map_err(engine_err),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()).map_err(engine_err),
    }
}

/// Factory creating one peer connection per call attempt.
pub struct WebRtcEngineFactory {
    stun_servers: Vec<String>,
}

impl Default for WebRtcEngineFactory {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
        }
    }
}

impl WebRtcEngineFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaEngineFactory for WebRtcEngineFactory {
    async fn create_engine(
        &self,
    ) -> Result<(Arc<dyn MediaEngine>, mpsc::Receiver<EngineEvent>), EngineError> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_err)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(engine_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_config())
                .await
                .map_err(engine_err)?,
        );
        pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .map_err(engine_err)?;
        pc.add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .map_err(engine_err)?;

        let (event_tx, event_rx) = mpsc::channel(ENGINE_EVENT_QUEUE);

        // Discovered candidates are relayed immediately, in emission order.
        let candidate_tx = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx
                            .send(EngineEvent::IceCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }))
                            .await;
                    }
                    Err(e) => warn!("cannot serialize ice candidate: {e}"),
                }
            })
        }));

        let state_tx = event_tx;
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = state_tx.clone();
            Box::pin(async move {
                debug!("peer connection state: {state}");
                let mapped = match state {
                    RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        Some(ConnectivityState::Failed)
                    }
                    _ => None,
                };
                if let Some(mapped) = mapped {
                    let _ = tx.send(EngineEvent::Connectivity(mapped)).await;
                }
            })
        }));

        Ok((Arc::new(WebRtcEngine { pc }), event_rx))
    }
}

/// One peer connection, driven through the trait.
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.pc.create_offer(None).await.map_err(engine_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(engine_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let rtc = to_rtc_description(&desc)?;
        self.pc.set_local_description(rtc).await.map_err(engine_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let rtc = to_rtc_description(&desc)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(engine_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(engine_err)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("error closing peer connection: {e}");
        }
    }
}
