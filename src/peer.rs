//! Peer connection construction
//!
//! One place that knows how to assemble the webrtc API object: default
//! audio/video codecs, the default interceptor chain (NACK, RTCP reports,
//! TWCC), and the ICE servers taken from the call configuration.

use std::sync::Arc;

use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_AV1, MIME_TYPE_VP9};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

use crate::config::CallConfig;
use crate::error::Result;

/// Label of the in-band signaling data channel
pub const SIGNALING_CHANNEL_LABEL: &str = "signaling";

/// Extra codec profiles offered when the alternate codec set is enabled:
/// (mime type, fmtp line, payload type), payload types chosen clear of the
/// defaults.
const ALT_CODEC_PROFILES: &[(&str, &str, u8)] = &[
    (MIME_TYPE_VP9, "profile-id=2", 49),
    (MIME_TYPE_AV1, "profile=1", 50),
];

/// Build a peer connection with default codecs and interceptors
pub async fn build_peer_connection(config: &CallConfig) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    if config.alt_codec {
        register_alt_codecs(&mut media_engine)?;
    }

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let rtc_config = RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    debug!(ice_servers = config.ice_servers.len(), "Building peer connection");
    let pc = api.new_peer_connection(rtc_config).await?;
    Ok(Arc::new(pc))
}

/// Register the alternate video codec profiles on top of the defaults
fn register_alt_codecs(media_engine: &mut MediaEngine) -> Result<()> {
    let feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_owned(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ];
    for (mime, fmtp, payload_type) in ALT_CODEC_PROFILES {
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: (*mime).to_owned(),
                    clock_rate: 90_000,
                    channels: 0,
                    sdp_fmtp_line: (*fmtp).to_owned(),
                    rtcp_feedback: feedback.clone(),
                },
                payload_type: *payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
    }
    Ok(())
}

/// Create the ordered data channel used for in-band signaling and telemetry
pub async fn create_signaling_channel(pc: &RTCPeerConnection) -> Result<Arc<RTCDataChannel>> {
    let init = RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    };
    let channel = pc
        .create_data_channel(SIGNALING_CHANNEL_LABEL, Some(init))
        .await?;
    Ok(channel)
}
