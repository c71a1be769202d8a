//! Per-peer WebRTC plumbing: turns an SDP offer into an answer, wires the
//! Encoder Adapter's track into the peer connection, and forwards local ICE
//! candidates back out over the signaling channel.
//!
//! Grounded on `examples/angkira-rpi-webrtc-streamer/rust/src/streaming/webrtc_streamer.rs`
//! (`handle_websocket_connection`'s `MediaEngine`/`SettingEngine`/interceptor
//! registry setup, H.264-only codec registration, `on_ice_candidate`).
//! This is the crate's one deliberate excursion into the "external
//! collaborator" named in spec.md §1 (SDP/ICE/SRTP/RTP); everything it does
//! is glue around the `webrtc` crate, not reimplementation of it.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::encoder::{DelayedReinitController, EncoderWrapper};
use crate::quality::QualityController;
use crate::webrtc::adapter::EncoderAdapter;
use crate::webrtc::audio::{self, AudioTrack};

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Wraps one browser peer's `RTCPeerConnection` plus the Encoder Adapter
/// feeding its video track (spec.md §4.6) and the microphone Audio Track
/// feeding its audio track (spec.md §1).
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    pub adapter: Arc<EncoderAdapter>,
    drain_handle: tokio::task::JoinHandle<()>,
    audio: Option<AudioTrack>,
}

impl WebRtcPeer {
    /// Builds a fresh `RTCPeerConnection` restricted to H.264/UDP4 (matching
    /// the teacher's rationale: advertising VP8 alongside H264 caused some
    /// browsers to negotiate a codec the hardware encoder never produced),
    /// wires its track to a new Encoder Adapter, and registers the
    /// `on_ice_candidate` callback that forwards candidates back out over
    /// `outbound`.
    pub async fn new(
        stun_server: &str,
        encoder: Arc<EncoderWrapper>,
        quality: Arc<QualityController>,
        reinit: Arc<DelayedReinitController>,
        config: Arc<crate::config::ConfigRegistry>,
        outbound: UnboundedSender<String>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: H264_FMTP.to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: audio::OPUS_MIME_TYPE.to_owned(),
                    clock_rate: audio::OPUS_CLOCK_RATE,
                    channels: audio::OPUS_CHANNELS,
                    sdp_fmtp_line: audio::OPUS_FMTP.to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_network_types(vec![NetworkType::Udp4]);

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![webrtc::ice_transport::ice_server::RTCIceServer {
                urls: vec![stun_server.to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: H264_FMTP.to_owned(),
                rtcp_feedback: vec![],
            },
            "video".to_owned(),
            "rpi-webrtc-streamer".to_owned(),
        ));
        peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: audio::OPUS_MIME_TYPE.to_owned(),
                clock_rate: audio::OPUS_CLOCK_RATE,
                channels: audio::OPUS_CHANNELS,
                sdp_fmtp_line: audio::OPUS_FMTP.to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "rpi-webrtc-streamer".to_owned(),
        ));
        peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let audio = match AudioTrack::start(encoder.test_mode(), audio_track) {
            Ok(track) => Some(track),
            Err(e) => {
                warn!(error = %e, "microphone capture unavailable, streaming video only");
                None
            }
        };

        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            info!(state = %s, "peer connection state changed");
            Box::pin(async move {})
        }));

        let outbound_ice = outbound.clone();
        peer_connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let outbound_ice = outbound_ice.clone();
            Box::pin(async move {
                let Some(candidate) = c else { return };
                let Ok(init) = candidate.to_json() else { return };
                let Ok(json) = serde_json::to_string(&init) else { return };
                let _ = outbound_ice.send(json);
            })
        }));

        let adapter = Arc::new(EncoderAdapter::new(encoder, quality, reinit, config, video_track));
        adapter.init_encode(30)?;
        let drain_handle = tokio::spawn(Arc::clone(&adapter).run_drain_task());

        Ok(Arc::new(WebRtcPeer {
            peer_connection,
            adapter,
            drain_handle,
            audio,
        }))
    }

    /// Applies a remote SDP offer and returns the local answer, serialized
    /// the way the inner `{"cmd":"send","msg":...}` envelope expects.
    pub async fn handle_offer(&self, offer_sdp: RTCSessionDescription) -> anyhow::Result<RTCSessionDescription> {
        self.peer_connection.set_remote_description(offer_sdp).await?;
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer.clone()).await?;
        self.adapter.encode(false);
        Ok(answer)
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> anyhow::Result<()> {
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// Tears down the peer connection and stops the drain task (spec.md
    /// §4.6 `release`, §5 cancellation).
    pub async fn close(&self) {
        if let Err(e) = self.adapter.release() {
            warn!(error = %e, "encoder adapter release failed");
        }
        self.drain_handle.abort();
        if let Some(audio) = &self.audio {
            audio.stop().await;
        }
        if let Err(e) = self.peer_connection.close().await {
            warn!(error = %e, "peer connection close failed");
        }
    }
}
