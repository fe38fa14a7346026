//! Call session lifecycle
//!
//! [`CallSession`] owns one logical call: the signaling transport, the
//! peer connection, negotiation, tracks, the in-band data channel and the
//! health monitor. Its lifecycle is a strict one-way state machine
//! (`New -> Init -> Closing -> Closed`) driven by atomic compare-and-swap,
//! so concurrent `connect`/`close` calls race safely and teardown happens
//! exactly once no matter who triggers it (the caller, a backend
//! `call_end`, or a terminally failed transport).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use crate::config::{
    CallConfig, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_LOCK_POLL, DEFAULT_LOCK_TIMEOUT,
    DEFAULT_MONITOR_INTERVAL, DEFAULT_PENDING_CANDIDATES,
};
use crate::error::{CallError, Result};
use crate::events::{CallEvent, EventBus, EventHandler, EventKind};
use crate::monitor::{QualityReport, RtcMonitor, StatsRegistry};
use crate::negotiation::{NegotiationEngine, NegotiationLock};
use crate::peer;
use crate::rest::RestClient;
use crate::rtcmsg::{self, RtcMessage};
use crate::signaling::transport::WsSource;
use crate::signaling::wire::{action, decompress_sdp, ServerEvent, SignalKind, SignalPayload};
use crate::signaling::SignalingTransport;
use crate::tracks::TrackManager;

/// Codecs advertised to the peer when the alternate codec set is enabled
const ALT_CODECS: &[&str] = &["vp9", "av1"];

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    New = 0,
    Init = 1,
    Closing = 2,
    Closed = 3,
}

enum CloseAction {
    /// Session never connected; just mark closed and notify
    EmitOnly,
    /// Session is live, run the full teardown
    Teardown,
    /// Someone else is already closing (or closed)
    None,
}

/// Atomic lifecycle cell; all transitions are CAS so races resolve to
/// exactly one winner.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(SessionState::New as u8))
    }

    fn load(&self) -> SessionState {
        match self.0.load(Ordering::SeqCst) {
            0 => SessionState::New,
            1 => SessionState::Init,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    fn cas(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn try_init(&self) -> Result<()> {
        if self.cas(SessionState::New, SessionState::Init) {
            return Ok(());
        }
        match self.load() {
            SessionState::Init => Err(CallError::AlreadyInitialized),
            other => Err(CallError::InvalidState(format!(
                "cannot connect from {other:?}"
            ))),
        }
    }

    fn begin_close(&self) -> CloseAction {
        loop {
            match self.load() {
                SessionState::New => {
                    if self.cas(SessionState::New, SessionState::Closed) {
                        return CloseAction::EmitOnly;
                    }
                }
                SessionState::Init => {
                    if self.cas(SessionState::Init, SessionState::Closing) {
                        return CloseAction::Teardown;
                    }
                }
                SessionState::Closing | SessionState::Closed => return CloseAction::None,
            }
        }
    }

    fn finish_close(&self) {
        self.0.store(SessionState::Closed as u8, Ordering::SeqCst);
    }
}

/// Everything that exists only while the session is connected
struct Runtime {
    signaling: Arc<SignalingTransport>,
    pc: Arc<RTCPeerConnection>,
    negotiation: Arc<NegotiationEngine>,
    tracks: Arc<TrackManager>,
    rest: Arc<RestClient>,
    inband_tx: mpsc::Sender<RtcMessage>,
    inband_open: Arc<AtomicBool>,
    latest_quality: Arc<SyncMutex<Option<QualityReport>>>,
}

/// One client-side call session
pub struct CallSession {
    config: CallConfig,
    state: Arc<StateCell>,
    bus: Arc<EventBus>,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
    runtime: Arc<RwLock<Option<Arc<Runtime>>>>,
}

impl CallSession {
    pub fn new(config: CallConfig) -> Result<Self> {
        config.validate()?;
        let (close_tx, close_rx) = watch::channel(false);
        Ok(Self {
            config,
            state: Arc::new(StateCell::new()),
            bus: Arc::new(EventBus::new()),
            close_tx: Arc::new(close_tx),
            close_rx,
            runtime: Arc::new(RwLock::new(None)),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// Register the handler for an event kind (one handler per kind)
    pub fn on(&self, kind: EventKind, handler: EventHandler) -> Result<()> {
        self.bus.register(kind, handler)
    }

    /// Connection id of the current signaling leg
    pub fn conn_id(&self) -> Option<String> {
        let runtime = self.runtime.read();
        runtime.as_ref().and_then(|rt| rt.signaling.current_conn_id())
    }

    /// Most recent media-quality sample, if the monitor produced one
    pub fn last_quality(&self) -> Option<QualityReport> {
        let runtime = self.runtime.read();
        runtime.as_ref().and_then(|rt| *rt.latest_quality.lock())
    }

    /// Connect signaling, build the peer connection and start all session
    /// tasks. Valid exactly once, from `New`.
    pub async fn connect(&self) -> Result<()> {
        self.state.try_init()?;
        match self.connect_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A half-built session is not retryable; run the regular
                // teardown so already-spawned tasks see the close signal.
                teardown(
                    self.state.clone(),
                    self.bus.clone(),
                    self.close_tx.clone(),
                    self.runtime.clone(),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn connect_inner(&self) -> Result<()> {
        let signaling = Arc::new(SignalingTransport::new(&self.config)?);
        let source = signaling.connect().await?;

        let pc = peer::build_peer_connection(&self.config).await?;
        let stats = Arc::new(StatsRegistry::new());
        let rest = Arc::new(RestClient::new(&self.config)?);

        let (inband_tx, inband_rx) = mpsc::channel::<RtcMessage>(64);
        let (signal_tx, signal_rx) = mpsc::channel::<SignalPayload>(64);
        let (data_tx, data_rx) = mpsc::channel::<RtcMessage>(64);
        let (server_tx, server_rx) = mpsc::channel::<ServerEvent>(64);
        let inband_open = Arc::new(AtomicBool::new(false));

        let lock = Arc::new(NegotiationLock::new(
            inband_tx.clone(),
            DEFAULT_LOCK_POLL,
            DEFAULT_LOCK_TIMEOUT,
        ));
        // The lock protocol rides the data channel, so the engine only
        // locks while in-band signaling is enabled and the channel is open.
        let inband_active = if self.config.inband_signaling {
            inband_open.clone()
        } else {
            Arc::new(AtomicBool::new(false))
        };
        let negotiation = Arc::new(NegotiationEngine::new(
            pc.clone(),
            lock.clone(),
            signal_tx,
            self.bus.clone(),
            inband_active,
            DEFAULT_PENDING_CANDIDATES,
            self.close_rx.clone(),
        ));
        negotiation.start();

        let tracks = Arc::new(TrackManager::new(
            pc.clone(),
            signaling.clone(),
            self.bus.clone(),
            stats.clone(),
            self.close_rx.clone(),
        ));
        tracks.start();

        let latest_quality = Arc::new(SyncMutex::new(None));
        let runtime = Arc::new(Runtime {
            signaling: signaling.clone(),
            pc: pc.clone(),
            negotiation: negotiation.clone(),
            tracks: tracks.clone(),
            rest,
            inband_tx: inband_tx.clone(),
            inband_open: inband_open.clone(),
            latest_quality: latest_quality.clone(),
        });
        *self.runtime.write() = Some(runtime.clone());

        // The data channel is added after the callbacks are installed so
        // the negotiation it triggers finds everything wired up.
        let dc = peer::create_signaling_channel(&pc).await?;
        self.wire_data_channel(&dc, data_tx, inband_open.clone());
        self.spawn_inband_writer(dc, inband_rx);

        self.spawn_transport_runner(signaling.clone(), source, server_tx);
        self.spawn_router(runtime.clone(), server_rx, data_rx);
        self.spawn_signal_forwarder(runtime.clone(), signal_rx);
        self.spawn_keepalive(runtime.clone());

        if self.config.health_monitor {
            let (monitor, reports_rx) = RtcMonitor::new(stats, DEFAULT_MONITOR_INTERVAL);
            tokio::spawn(monitor.run(self.close_rx.clone()));
            self.spawn_quality_collector(reports_rx, latest_quality);
        }

        let conn_id = signaling.current_conn_id().unwrap_or_default();
        info!(conn_id, "Call session connected");
        self.bus.emit(CallEvent::Connected {
            conn_id,
            reconnect: false,
        });
        Ok(())
    }

    /// Tear the session down; emits `Closed` exactly once. Only the close
    /// that actually performs the teardown succeeds, every later (or
    /// concurrently losing) call reports the session already closed.
    pub async fn close(&self) -> Result<()> {
        if self.state.load() == SessionState::New {
            return Err(CallError::NotInitialized);
        }
        let won = teardown(
            self.state.clone(),
            self.bus.clone(),
            self.close_tx.clone(),
            self.runtime.clone(),
        )
        .await;
        if won {
            Ok(())
        } else {
            Err(CallError::Closed)
        }
    }

    fn runtime(&self) -> Result<Arc<Runtime>> {
        self.runtime
            .read()
            .clone()
            .ok_or(CallError::NotInitialized)
    }

    /// Start (or resume) sending voice
    pub async fn unmute(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
        self.runtime()?.tracks.unmute(track).await
    }

    /// Stop sending voice without tearing the sender down
    pub async fn mute(&self) -> Result<()> {
        self.runtime()?.tracks.mute().await
    }

    /// Start screen sharing with one or two quality layers
    pub async fn start_screen_share(
        &self,
        tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    ) -> Result<()> {
        self.runtime()?.tracks.start_screen_share(tracks).await?;
        Ok(())
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.runtime()?.tracks.stop_screen_share().await
    }

    pub async fn raise_hand(&self) -> Result<()> {
        self.runtime()?
            .signaling
            .send(action::RAISE_HAND, serde_json::json!({}))
            .await
    }

    pub async fn lower_hand(&self) -> Result<()> {
        self.runtime()?
            .signaling
            .send(action::LOWER_HAND, serde_json::json!({}))
            .await
    }

    pub async fn start_recording(&self) -> Result<()> {
        self.runtime()?.rest.start_recording().await
    }

    pub async fn stop_recording(&self) -> Result<()> {
        self.runtime()?.rest.stop_recording().await
    }

    /// Force a renegotiation (rarely needed by callers; media operations
    /// trigger it automatically).
    pub async fn renegotiate(&self) -> Result<()> {
        self.runtime()?.negotiation.renegotiate().await
    }

    fn wire_data_channel(
        &self,
        dc: &Arc<RTCDataChannel>,
        data_tx: mpsc::Sender<RtcMessage>,
        inband_open: Arc<AtomicBool>,
    ) {
        {
            let inband_open = inband_open.clone();
            let inband_tx = self.runtime.read().as_ref().map(|rt| rt.inband_tx.clone());
            let alt_codec = self.config.alt_codec;
            dc.on_open(Box::new(move || {
                inband_open.store(true, Ordering::SeqCst);
                info!("In-band signaling channel open");
                let inband_tx = inband_tx.clone();
                Box::pin(async move {
                    if alt_codec {
                        if let Some(tx) = inband_tx {
                            let codecs = ALT_CODECS.iter().map(|c| c.to_string()).collect();
                            let _ = tx.send(RtcMessage::CodecSupportMap { codecs }).await;
                        }
                    }
                })
            }));
        }
        {
            let inband_open = inband_open.clone();
            dc.on_close(Box::new(move || {
                inband_open.store(false, Ordering::SeqCst);
                debug!("In-band signaling channel closed");
                Box::pin(async {})
            }));
        }
        dc.on_message(Box::new(move |msg| {
            let data_tx = data_tx.clone();
            Box::pin(async move {
                match rtcmsg::decode(&msg.data) {
                    Ok(parsed) => {
                        if data_tx.send(parsed).await.is_err() {
                            debug!("Router gone, dropping in-band message");
                        }
                    }
                    Err(e) => warn!("Malformed in-band message: {e}"),
                }
            })
        }));
    }

    fn spawn_inband_writer(&self, dc: Arc<RTCDataChannel>, mut inband_rx: mpsc::Receiver<RtcMessage>) {
        let mut close_rx = self.close_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_rx.changed() => {
                        if *close_rx.borrow() {
                            break;
                        }
                    }
                    msg = inband_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let encoded = match rtcmsg::encode(&msg) {
                            Ok(encoded) => encoded,
                            Err(e) => {
                                warn!("Failed to encode in-band message: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = dc.send(&Bytes::from(encoded)).await {
                            debug!("In-band send failed: {e}");
                        }
                    }
                }
            }
        });
    }

    /// Drive the signaling read loop; a terminal failure (reconnect budget
    /// exhausted) tears the whole session down.
    fn spawn_transport_runner(
        &self,
        signaling: Arc<SignalingTransport>,
        source: WsSource,
        server_tx: mpsc::Sender<ServerEvent>,
    ) {
        let close_rx = self.close_rx.clone();
        let state = self.state.clone();
        let bus = self.bus.clone();
        let close_tx = self.close_tx.clone();
        let runtime_slot = self.runtime.clone();
        tokio::spawn(async move {
            if let Err(e) = signaling.run(source, server_tx, close_rx).await {
                if matches!(e, CallError::Closed) {
                    return;
                }
                warn!("Signaling terminally failed: {e}");
                bus.emit(CallEvent::Error {
                    message: format!("signaling failed: {e}"),
                });
                teardown(state, bus, close_tx, runtime_slot).await;
            }
        });
    }

    fn spawn_router(
        &self,
        runtime: Arc<Runtime>,
        mut server_rx: mpsc::Receiver<ServerEvent>,
        mut data_rx: mpsc::Receiver<RtcMessage>,
    ) {
        let ctx = Router {
            config_inband: self.config.inband_signaling,
            state: self.state.clone(),
            bus: self.bus.clone(),
            close_tx: self.close_tx.clone(),
            runtime_slot: self.runtime.clone(),
            runtime,
        };
        let mut close_rx = self.close_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_rx.changed() => {
                        if *close_rx.borrow() {
                            break;
                        }
                    }
                    event = server_rx.recv() => {
                        let Some(event) = event else { break };
                        ctx.handle_server(event).await;
                    }
                    msg = data_rx.recv() => {
                        let Some(msg) = msg else { break };
                        ctx.handle_data(msg).await;
                    }
                }
            }
            debug!("Session router stopped");
        });
    }

    /// Relay locally generated signals over the preferred path: the
    /// in-band channel while it is open (and enabled), the websocket
    /// otherwise. SDPs over the websocket are compressed.
    fn spawn_signal_forwarder(
        &self,
        runtime: Arc<Runtime>,
        mut signal_rx: mpsc::Receiver<SignalPayload>,
    ) {
        let inband_enabled = self.config.inband_signaling;
        let mut close_rx = self.close_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_rx.changed() => {
                        if *close_rx.borrow() {
                            break;
                        }
                    }
                    signal = signal_rx.recv() => {
                        let Some(signal) = signal else { break };
                        if let Err(e) = forward_signal(&runtime, inband_enabled, signal).await {
                            warn!("Failed to relay signal: {e}");
                        }
                    }
                }
            }
        });
    }

    fn spawn_keepalive(&self, runtime: Arc<Runtime>) {
        let mut close_rx = self.close_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEFAULT_KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would ping before the channel opens.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = close_rx.changed() => {
                        if *close_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if !runtime.inband_open.load(Ordering::SeqCst) {
                            continue;
                        }
                        let _ = runtime.inband_tx.send(RtcMessage::Ping).await;
                        let quality = *runtime.latest_quality.lock();
                        if let Some(q) = quality {
                            let _ = runtime
                                .inband_tx
                                .send(RtcMessage::LossRate { value: q.loss_rate })
                                .await;
                            let _ = runtime
                                .inband_tx
                                .send(RtcMessage::Jitter { millis: q.jitter_ms })
                                .await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_quality_collector(
        &self,
        mut reports_rx: mpsc::Receiver<QualityReport>,
        latest: Arc<SyncMutex<Option<QualityReport>>>,
    ) {
        tokio::spawn(async move {
            while let Some(report) = reports_rx.recv().await {
                *latest.lock() = Some(report);
            }
        });
    }
}

async fn forward_signal(
    runtime: &Runtime,
    inband_enabled: bool,
    signal: SignalPayload,
) -> Result<()> {
    if inband_enabled && runtime.inband_open.load(Ordering::SeqCst) {
        runtime
            .inband_tx
            .send(RtcMessage::Sdp {
                kind: signal.kind,
                payload: signal.payload,
            })
            .await
            .map_err(|_| CallError::Signaling("in-band channel closed".to_string()))
    } else {
        let payload = match signal.kind {
            SignalKind::Candidate => signal.payload,
            SignalKind::Offer | SignalKind::Answer => {
                crate::signaling::wire::compress_sdp(&signal.payload)?
            }
        };
        runtime
            .signaling
            .send(
                action::SIGNAL,
                serde_json::to_value(SignalPayload {
                    kind: signal.kind,
                    payload,
                })?,
            )
            .await
    }
}

/// Shared context of the inbound routing task
struct Router {
    config_inband: bool,
    state: Arc<StateCell>,
    bus: Arc<EventBus>,
    close_tx: Arc<watch::Sender<bool>>,
    runtime_slot: Arc<RwLock<Option<Arc<Runtime>>>>,
    runtime: Arc<Runtime>,
}

impl Router {
    async fn handle_server(&self, event: ServerEvent) {
        match event {
            ServerEvent::Hello { conn_id } => {
                // The initial hello is consumed by the handshake, so any
                // hello surfacing here marks a completed reconnect.
                info!(conn_id, "Signaling reconnected");
                self.bus.emit(CallEvent::Connected {
                    conn_id,
                    reconnect: true,
                });
            }
            ServerEvent::Signal { kind, payload } => {
                let payload = match kind {
                    SignalKind::Candidate => Ok(payload),
                    SignalKind::Offer | SignalKind::Answer => decompress_sdp(&payload),
                };
                let result = match payload {
                    Ok(payload) => self.runtime.negotiation.handle_signal(kind, payload).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!("Failed to handle remote signal: {e}");
                    self.bus.emit(CallEvent::Error {
                        message: format!("negotiation failed: {e}"),
                    });
                }
            }
            ServerEvent::UserLeft { session_id } => {
                self.runtime.tracks.handle_user_left(&session_id).await;
                self.bus.emit(CallEvent::UserLeft { session_id });
            }
            ServerEvent::HostChanged { session_id } => {
                self.bus.emit(CallEvent::HostChanged { session_id });
            }
            ServerEvent::JobState { state } => {
                self.bus.emit(CallEvent::JobState { state });
            }
            ServerEvent::Mute { session_id } => {
                self.bus.emit(CallEvent::MuteChanged {
                    session_id,
                    muted: true,
                });
            }
            ServerEvent::Unmute { session_id } => {
                self.bus.emit(CallEvent::MuteChanged {
                    session_id,
                    muted: false,
                });
            }
            ServerEvent::RaiseHand { session_id } => {
                self.bus.emit(CallEvent::HandRaiseChanged {
                    session_id,
                    raised: true,
                });
            }
            ServerEvent::LowerHand { session_id } => {
                self.bus.emit(CallEvent::HandRaiseChanged {
                    session_id,
                    raised: false,
                });
            }
            ServerEvent::ScreenOn { session_id } => {
                self.bus.emit(CallEvent::ScreenShareChanged {
                    session_id,
                    active: true,
                });
            }
            ServerEvent::ScreenOff { session_id } => {
                self.bus.emit(CallEvent::ScreenShareChanged {
                    session_id,
                    active: false,
                });
            }
            ServerEvent::CallEnd { reason } => {
                info!(reason, "Backend ended the call");
                self.bus.emit(CallEvent::CallEnded { reason });
                self.spawn_teardown();
            }
        }
    }

    async fn handle_data(&self, msg: RtcMessage) {
        match msg {
            RtcMessage::Ping => {
                let _ = self.runtime.inband_tx.send(RtcMessage::Pong).await;
            }
            RtcMessage::Pong => {}
            RtcMessage::Lock => {
                let granted = self.runtime.negotiation.lock().handle_request();
                let _ = self
                    .runtime
                    .inband_tx
                    .send(RtcMessage::LockResponse { granted })
                    .await;
            }
            RtcMessage::Unlock => self.runtime.negotiation.lock().handle_unlock(),
            RtcMessage::LockResponse { granted } => {
                self.runtime.negotiation.lock().handle_response(granted);
            }
            RtcMessage::Sdp { kind, payload } => {
                if !self.config_inband {
                    debug!("Ignoring in-band signal, in-band signaling disabled");
                    return;
                }
                if let Err(e) = self.runtime.negotiation.handle_signal(kind, payload).await {
                    warn!("Failed to handle in-band signal: {e}");
                    self.bus.emit(CallEvent::Error {
                        message: format!("negotiation failed: {e}"),
                    });
                }
            }
            RtcMessage::LossRate { value } => {
                debug!(value, "Peer reported loss rate");
            }
            RtcMessage::RoundTripTime { millis } => {
                debug!(millis, "Peer reported round-trip time");
            }
            RtcMessage::Jitter { millis } => {
                debug!(millis, "Peer reported jitter");
            }
            RtcMessage::MediaMap { entries } => {
                debug!(count = entries.len(), "Peer media map");
            }
            RtcMessage::CodecSupportMap { codecs } => {
                debug!(?codecs, "Peer codec support");
            }
        }
    }

    fn spawn_teardown(&self) {
        let state = self.state.clone();
        let bus = self.bus.clone();
        let close_tx = self.close_tx.clone();
        let runtime = self.runtime_slot.clone();
        tokio::spawn(teardown(state, bus, close_tx, runtime));
    }
}

/// The single teardown routine; every close path funnels here and the
/// state CAS guarantees only one caller runs the body. Returns whether
/// this caller was the one that performed the close.
async fn teardown(
    state: Arc<StateCell>,
    bus: Arc<EventBus>,
    close_tx: Arc<watch::Sender<bool>>,
    runtime_slot: Arc<RwLock<Option<Arc<Runtime>>>>,
) -> bool {
    match state.begin_close() {
        CloseAction::EmitOnly => {
            bus.emit(CallEvent::Closed);
            true
        }
        CloseAction::Teardown => {
            let _ = close_tx.send(true);
            let runtime = runtime_slot.write().take();
            if let Some(rt) = runtime {
                rt.tracks.close().await;
                rt.signaling.close().await;
                if let Err(e) = rt.pc.close().await {
                    warn!("Failed to close peer connection: {e}");
                }
            }
            state.finish_close();
            info!("Call session closed");
            bus.emit(CallEvent::Closed);
            true
        }
        CloseAction::None => false,
    }
}
