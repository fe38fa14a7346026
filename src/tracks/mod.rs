//! Track lifecycle management
//!
//! Local media: one voice sender that survives mute/unmute (muting swaps
//! the track out of the sender instead of removing it, so no renegotiation
//! is needed to speak again), and an optional screen share of one or two
//! quality layers on a send-only transceiver.
//!
//! Remote media: tracks are admitted by parsing their id, which encodes
//! the media type and the owning session (`{type}_{session}_{suffix}`).
//! Tracks with unparseable ids are stopped and reported as non-fatal
//! errors. Every admitted track gets drain tasks that pump RTP/RTCP into
//! the stats registry and, for video, periodically request keyframes.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{CallError, Result};
use crate::events::{CallEvent, EventBus};
use crate::monitor::StatsRegistry;
use crate::signaling::wire::action;
use crate::signaling::SignalingTransport;

/// Keyframe request cadence for remote video tracks
const PLI_INTERVAL: Duration = Duration::from_secs(3);

/// Media type encoded in a track id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackType {
    Voice,
    Video,
    Screen,
}

impl TrackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackType::Voice => "voice",
            TrackType::Video => "video",
            TrackType::Screen => "screen",
        }
    }
}

impl FromStr for TrackType {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "voice" => Ok(TrackType::Voice),
            "video" => Ok(TrackType::Video),
            "screen" => Ok(TrackType::Screen),
            other => Err(CallError::Track(format!("unknown track type '{other}'"))),
        }
    }
}

impl std::fmt::Display for TrackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mint a track id for a local track: `{type}_{session}_{random}`
pub fn local_track_id(track_type: TrackType, session_id: &str) -> String {
    format!(
        "{}_{}_{}",
        track_type,
        session_id,
        uuid::Uuid::new_v4().simple()
    )
}

/// Split a `{type}_{session}_{suffix}` track id into type and session
pub fn parse_track_id(id: &str) -> Result<(TrackType, String)> {
    let mut parts = id.splitn(3, '_');
    let (Some(kind), Some(session), Some(_suffix)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(CallError::Track(format!("malformed track id '{id}'")));
    };
    if session.is_empty() {
        return Err(CallError::Track(format!(
            "empty session in track id '{id}'"
        )));
    }
    Ok((kind.parse()?, session.to_string()))
}

/// A remote track admitted into the session
pub struct RemoteTrack {
    pub track_type: TrackType,
    pub track: Arc<TrackRemote>,
    receiver: Arc<RTCRtpReceiver>,
}

#[derive(Default)]
struct TrackSet {
    voice_sender: Option<Arc<RTCRtpSender>>,
    screen_transceiver: Option<Arc<RTCRtpTransceiver>>,
    remote: HashMap<String, Vec<RemoteTrack>>,
}

pub struct TrackManager {
    pc: Arc<RTCPeerConnection>,
    signaling: Arc<SignalingTransport>,
    bus: Arc<EventBus>,
    stats: Arc<StatsRegistry>,
    close_rx: watch::Receiver<bool>,
    inner: Mutex<TrackSet>,
}

impl TrackManager {
    pub fn new(
        pc: Arc<RTCPeerConnection>,
        signaling: Arc<SignalingTransport>,
        bus: Arc<EventBus>,
        stats: Arc<StatsRegistry>,
        close_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pc,
            signaling,
            bus,
            stats,
            close_rx,
            inner: Mutex::new(TrackSet::default()),
        }
    }

    /// Install the remote-track admission callback
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc
            .on_track(Box::new(move |track, receiver, _transceiver| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.admit_remote(track, receiver).await;
                    }
                })
            }));
    }

    /// Start (or resume) sending voice
    ///
    /// The first unmute adds the sender; later unmutes swap the track back
    /// into the existing sender so no renegotiation happens.
    pub async fn unmute(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            match &inner.voice_sender {
                Some(sender) => {
                    sender.replace_track(Some(track)).await?;
                    debug!("Voice track swapped back into existing sender");
                }
                None => {
                    let sender = self.pc.add_track(track).await?;
                    self.spawn_sender_drain(&sender, 48_000).await;
                    inner.voice_sender = Some(sender);
                    info!("Voice sender added");
                }
            }
        }
        self.notify(action::UNMUTE).await;
        Ok(())
    }

    /// Stop sending voice but keep the sender (and its m-line) alive
    pub async fn mute(&self) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if let Some(sender) = &inner.voice_sender {
                sender.replace_track(None).await?;
            }
        }
        self.notify(action::MUTE).await;
        Ok(())
    }

    /// Start screen sharing with one or two quality layers
    ///
    /// All layers ride one send-only transceiver; the second track is an
    /// additional simulcast encoding, so both must carry distinct rids.
    pub async fn start_screen_share(
        &self,
        tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<Arc<RTCRtpTransceiver>> {
        if tracks.is_empty() {
            return Err(CallError::InvalidArgument(
                "empty tracks for screen share".to_string(),
            ));
        }
        if tracks.len() > 2 {
            return Err(CallError::InvalidArgument(format!(
                "too many tracks for screen share: {}",
                tracks.len()
            )));
        }
        let mut inner = self.inner.lock().await;
        if inner.screen_transceiver.is_some() {
            return Err(CallError::InvalidState(
                "screen share already active".to_string(),
            ));
        }

        // The backend learns about the share before the media shows up.
        self.notify(action::SCREEN_ON).await;

        let mut layers = tracks.into_iter();
        let first = layers
            .next()
            .ok_or_else(|| CallError::InvalidArgument("empty tracks for screen share".to_string()))?;
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendonly,
            send_encodings: vec![],
        };
        let transceiver = self
            .pc
            .add_transceiver_from_track(first, Some(init))
            .await?;
        let sender = transceiver.sender().await;
        if let Some(second) = layers.next() {
            sender.add_encoding(second).await?;
        }
        self.spawn_sender_drain(&sender, 90_000).await;
        inner.screen_transceiver = Some(transceiver.clone());
        info!("Screen share started");
        Ok(transceiver)
    }

    /// Stop screen sharing; idempotent
    pub async fn stop_screen_share(&self) -> Result<()> {
        let transceiver = self.inner.lock().await.screen_transceiver.take();
        let Some(transceiver) = transceiver else {
            debug!("Screen share not active, nothing to stop");
            return Ok(());
        };
        let sender = transceiver.sender().await;
        if let Err(e) = self.pc.remove_track(&sender).await {
            warn!("Failed to remove screen sender: {e}");
        }
        self.notify(action::SCREEN_OFF).await;
        info!("Screen share stopped");
        Ok(())
    }

    /// Drop and stop every track a departed participant owned
    pub async fn handle_user_left(&self, session_id: &str) {
        let removed = self.inner.lock().await.remote.remove(session_id);
        let Some(tracks) = removed else {
            return;
        };
        info!(session_id, count = tracks.len(), "Discarding tracks of departed user");
        for remote in tracks {
            self.stats.forget_inbound(remote.track.ssrc());
            if let Err(e) = remote.receiver.stop().await {
                debug!("Failed to stop receiver: {e}");
            }
        }
    }

    /// Stop all remote receivers during teardown
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        for (_, tracks) in inner.remote.drain() {
            for remote in tracks {
                self.stats.forget_inbound(remote.track.ssrc());
                if let Err(e) = remote.receiver.stop().await {
                    debug!("Failed to stop receiver: {e}");
                }
            }
        }
    }

    pub async fn remote_sessions(&self) -> Vec<String> {
        self.inner.lock().await.remote.keys().cloned().collect()
    }

    async fn admit_remote(self: &Arc<Self>, track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>) {
        let id = track.id();
        let (track_type, session_id) = match parse_track_id(&id) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Rejecting remote track '{id}': {e}");
                if let Err(e) = receiver.stop().await {
                    debug!("Failed to stop rejected receiver: {e}");
                }
                self.bus.emit(CallEvent::Error {
                    message: format!("rejected remote track '{id}': {e}"),
                });
                return;
            }
        };

        let ssrc = track.ssrc();
        let clock_rate = track.codec().capability.clock_rate;
        self.stats.register_inbound(ssrc, clock_rate);
        info!(%track_type, session_id, ssrc, "Remote track admitted");

        self.inner
            .lock()
            .await
            .remote
            .entry(session_id.clone())
            .or_default()
            .push(RemoteTrack {
                track_type,
                track: track.clone(),
                receiver: receiver.clone(),
            });

        self.spawn_receiver_drains(track_type, track.clone(), receiver);
        self.bus.emit(CallEvent::TrackAdded {
            track_type,
            session_id,
            track,
        });
    }

    /// Pump RTCP out of a local sender into the stats registry
    async fn spawn_sender_drain(&self, sender: &Arc<RTCRtpSender>, default_clock: u32) {
        let params = sender.get_parameters().await;
        let clock_rate = params
            .rtp_parameters
            .codecs
            .first()
            .map(|c| c.capability.clock_rate)
            .unwrap_or(default_clock);
        if let Some(encoding) = params.encodings.first() {
            self.stats.register_outbound(encoding.ssrc, clock_rate);
        }

        let sender = sender.clone();
        let stats = self.stats.clone();
        let mut close_rx = self.close_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_rx.changed() => {
                        if *close_rx.borrow() {
                            break;
                        }
                    }
                    rtcp = sender.read_rtcp() => match rtcp {
                        Ok((packets, _attrs)) => stats.record_sender_rtcp(&packets),
                        Err(_) => break,
                    }
                }
            }
        });
    }

    /// Pump RTP/RTCP of a remote track into the stats registry and, for
    /// video, periodically ask for keyframes.
    fn spawn_receiver_drains(
        &self,
        track_type: TrackType,
        track: Arc<TrackRemote>,
        receiver: Arc<RTCRtpReceiver>,
    ) {
        let ssrc = track.ssrc();
        let rid = track.rid().to_string();

        {
            let stats = self.stats.clone();
            let mut close_rx = self.close_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = close_rx.changed() => {
                            if *close_rx.borrow() {
                                break;
                            }
                        }
                        rtcp = receiver.read_rtcp() => match rtcp {
                            Ok((packets, _attrs)) => stats.record_receiver_rtcp(&packets),
                            Err(_) => break,
                        }
                    }
                }
            });
        }

        let stats = self.stats.clone();
        let pc = Arc::downgrade(&self.pc);
        let mut close_rx = self.close_rx.clone();
        tokio::spawn(async move {
            let mut pli = tokio::time::interval(PLI_INTERVAL);
            pli.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = close_rx.changed() => {
                        if *close_rx.borrow() {
                            break;
                        }
                    }
                    _ = pli.tick(), if track_type != TrackType::Voice => {
                        let Some(pc) = pc.upgrade() else { break };
                        let request: Box<dyn RtcpPacket + Send + Sync> =
                            Box::new(PictureLossIndication {
                                sender_ssrc: 0,
                                media_ssrc: ssrc,
                            });
                        if let Err(e) = pc.write_rtcp(&[request]).await {
                            debug!("Keyframe request failed: {e}");
                        }
                    }
                    rtp = track.read_rtp() => match rtp {
                        Ok((packet, _attrs)) => {
                            stats.record_inbound_rtp(ssrc, packet.header.timestamp);
                        }
                        Err(_) => break,
                    }
                }
            }
            debug!(ssrc, rid, "Remote track drain stopped");
        });
    }

    /// Best-effort media state notification; ordering toward the backend
    /// matters but a dropped notification must not fail the media change.
    async fn notify(&self, act: &str) {
        if let Err(e) = self.signaling.send(act, serde_json::json!({})).await {
            warn!("Failed to notify backend of '{act}': {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::api::media_engine::MIME_TYPE_VP8;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

    use crate::config::CallConfig;
    use crate::peer::build_peer_connection;

    fn voice_track(id: &str) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            "media".to_owned(),
        ))
    }

    fn screen_track(id: &str, rid: &str) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::new(TrackLocalStaticSample::new_with_rid(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            rid.into(),
            "media".to_owned(),
        ))
    }

    async fn test_manager() -> Arc<TrackManager> {
        let pc = build_peer_connection(&CallConfig::default()).await.unwrap();
        let config = CallConfig {
            site_url: "https://call.example.com".to_string(),
            token: "secret".to_string(),
            channel_id: "room-1234".to_string(),
            ..Default::default()
        };
        let signaling = Arc::new(SignalingTransport::new(&config).unwrap());
        let (_close_tx, close_rx) = watch::channel(false);
        Arc::new(TrackManager::new(
            pc,
            signaling,
            Arc::new(EventBus::new()),
            Arc::new(StatsRegistry::new()),
            close_rx,
        ))
    }

    #[test]
    fn test_parse_track_id_variants() {
        let (kind, session) = parse_track_id("voice_sess-1_ab12").unwrap();
        assert_eq!(kind, TrackType::Voice);
        assert_eq!(session, "sess-1");

        let (kind, _) = parse_track_id("screen_sess-2_xy").unwrap();
        assert_eq!(kind, TrackType::Screen);

        // Suffixes may themselves contain underscores.
        let (_, session) = parse_track_id("video_s_a_b_c").unwrap();
        assert_eq!(session, "s");
    }

    #[test]
    fn test_minted_ids_parse_back() {
        let id = local_track_id(TrackType::Voice, "sess-7");
        let (kind, session) = parse_track_id(&id).unwrap();
        assert_eq!(kind, TrackType::Voice);
        assert_eq!(session, "sess-7");
        // Two mints never collide.
        assert_ne!(id, local_track_id(TrackType::Voice, "sess-7"));
    }

    #[test]
    fn test_parse_track_id_rejects_malformed() {
        assert!(parse_track_id("novoiceid").is_err());
        assert!(parse_track_id("voice_only").is_err());
        assert!(parse_track_id("hologram_sess_x").is_err());
        assert!(parse_track_id("voice__x").is_err());
    }

    #[tokio::test]
    async fn test_mute_cycle_keeps_single_sender() {
        let manager = test_manager().await;

        manager.unmute(voice_track("voice_self_a")).await.unwrap();
        assert_eq!(manager.pc.get_senders().await.len(), 1);

        manager.mute().await.unwrap();
        // The sender stays; only its track is swapped out.
        assert_eq!(manager.pc.get_senders().await.len(), 1);

        manager.unmute(voice_track("voice_self_a")).await.unwrap();
        assert_eq!(manager.pc.get_senders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_interleaved_mute_cycles_keep_single_sender() {
        let manager = test_manager().await;

        // Two callers hammering unmute/mute concurrently must still end
        // up with the one long-lived voice sender.
        let mut workers = Vec::new();
        for _ in 0..2 {
            let manager = manager.clone();
            workers.push(tokio::spawn(async move {
                for _ in 0..10 {
                    manager.unmute(voice_track("voice_self_a")).await.unwrap();
                    manager.mute().await.unwrap();
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(manager.pc.get_senders().await.len(), 1);
        assert!(manager.inner.lock().await.voice_sender.is_some());
    }

    #[tokio::test]
    async fn test_mute_without_sender_is_noop() {
        let manager = test_manager().await;
        manager.mute().await.unwrap();
        assert!(manager.pc.get_senders().await.is_empty());
    }

    #[tokio::test]
    async fn test_screen_share_rejects_bad_layer_counts() {
        let manager = test_manager().await;
        match manager.start_screen_share(vec![]).await {
            Err(CallError::InvalidArgument(msg)) => assert!(msg.contains("empty tracks")),
            other => panic!("expected invalid argument, got {other:?}"),
        }
        let too_many = vec![
            screen_track("screen_self_a", "f"),
            screen_track("screen_self_b", "h"),
            screen_track("screen_self_c", "q"),
        ];
        match manager.start_screen_share(too_many).await {
            Err(CallError::InvalidArgument(msg)) => assert!(msg.contains("too many tracks")),
            other => panic!("expected invalid argument, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_screen_share_lifecycle() {
        let manager = test_manager().await;
        let transceiver = manager
            .start_screen_share(vec![screen_track("screen_self_a", "f")])
            .await
            .unwrap();
        assert_eq!(transceiver.direction(), RTCRtpTransceiverDirection::Sendonly);

        // A second share while active is refused.
        match manager
            .start_screen_share(vec![screen_track("screen_self_b", "h")])
            .await
        {
            Err(CallError::InvalidState(_)) => {}
            other => panic!("expected invalid state, got {other:?}"),
        }

        manager.stop_screen_share().await.unwrap();
        // Stopping twice is fine.
        manager.stop_screen_share().await.unwrap();

        // A fresh share can start after stopping.
        manager
            .start_screen_share(vec![screen_track("screen_self_c", "q")])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_two_layer_screen_share() {
        let manager = test_manager().await;
        let transceiver = manager
            .start_screen_share(vec![
                screen_track("screen_self_a", "f"),
                screen_track("screen_self_a", "h"),
            ])
            .await
            .unwrap();
        let sender = transceiver.sender().await;
        assert!(sender.track().await.is_some());

        // Stopping removes both layers with the one screen sender.
        manager.stop_screen_share().await.unwrap();
        assert!(manager
            .inner
            .lock()
            .await
            .screen_transceiver
            .is_none());
    }

    #[tokio::test]
    async fn test_user_left_discards_tracks() {
        let manager = test_manager().await;
        // No tracks for this session: a no-op, not a panic.
        manager.handle_user_left("sess-9").await;
        assert!(manager.remote_sessions().await.is_empty());
    }
}
