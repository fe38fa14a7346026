//! SDP negotiation engine
//!
//! Serializes every offer/answer exchange behind a local guard and the
//! cross-party [`NegotiationLock`], buffers remote ICE candidates that
//! arrive before the remote description, and emits every locally generated
//! signal (offer, answer, candidate) on an outbound channel for the session
//! router to relay over whichever signaling path is currently preferred.
//!
//! The first negotiation of a session skips the cross-party lock. Later
//! renegotiations acquire it before offering and release it when the
//! matching answer is applied, but only while signaling actually rides the
//! in-band data channel: the lock protocol itself travels in-band, so an
//! offer going out over the websocket proceeds unlocked.

pub mod lock;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{CallError, Result};
use crate::events::{CallEvent, EventBus};
use crate::signaling::wire::{SignalKind, SignalPayload};

pub use lock::{LockState, NegotiationLock};

pub struct NegotiationEngine {
    pc: Arc<RTCPeerConnection>,
    lock: Arc<NegotiationLock>,
    /// Remote candidates received before the remote description
    pending: SyncMutex<VecDeque<RTCIceCandidateInit>>,
    max_pending: usize,
    /// Local serialization of offer/answer handling
    guard: Mutex<()>,
    signal_tx: mpsc::Sender<SignalPayload>,
    bus: Arc<EventBus>,
    /// Whether signals currently travel over the in-band data channel
    inband_active: Arc<AtomicBool>,
    close_rx: watch::Receiver<bool>,
}

impl NegotiationEngine {
    pub fn new(
        pc: Arc<RTCPeerConnection>,
        lock: Arc<NegotiationLock>,
        signal_tx: mpsc::Sender<SignalPayload>,
        bus: Arc<EventBus>,
        inband_active: Arc<AtomicBool>,
        max_pending: usize,
        close_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pc,
            lock,
            pending: SyncMutex::new(VecDeque::new()),
            max_pending,
            guard: Mutex::new(()),
            signal_tx,
            bus,
            inband_active,
            close_rx,
        }
    }

    pub fn lock(&self) -> &Arc<NegotiationLock> {
        &self.lock
    }

    /// Install peer-connection callbacks and spawn the renegotiation driver
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc
            .on_ice_candidate(Box::new(move |candidate| {
                let weak = weak.clone();
                Box::pin(async move {
                    let (Some(engine), Some(candidate)) = (weak.upgrade(), candidate) else {
                        return;
                    };
                    let json = match candidate.to_json().map(|init| serde_json::to_string(&init))
                    {
                        Ok(Ok(json)) => json,
                        Ok(Err(e)) => {
                            warn!("Failed to encode local candidate: {e}");
                            return;
                        }
                        Err(e) => {
                            warn!("Failed to serialize local candidate: {e}");
                            return;
                        }
                    };
                    if engine.send(SignalKind::Candidate, json).await.is_err() {
                        warn!("Dropping local candidate, outbound channel closed");
                    }
                })
            }));

        // Coalesce bursts of negotiation-needed callbacks into one slot.
        let (needed_tx, mut needed_rx) = mpsc::channel::<()>(1);
        self.pc.on_negotiation_needed(Box::new(move || {
            let _ = needed_tx.try_send(());
            Box::pin(async {})
        }));

        let engine = self.clone();
        let mut close_rx = self.close_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_rx.changed() => {
                        if *close_rx.borrow() {
                            break;
                        }
                    }
                    needed = needed_rx.recv() => {
                        if needed.is_none() {
                            break;
                        }
                        if let Err(e) = engine.renegotiate().await {
                            warn!("Renegotiation failed: {e}");
                            engine.bus.emit(CallEvent::Error {
                                message: format!("negotiation failed: {e}"),
                            });
                        }
                    }
                }
            }
            debug!("Renegotiation driver stopped");
        });
    }

    /// Dispatch a remote signal to the matching handler
    pub async fn handle_signal(&self, kind: SignalKind, payload: String) -> Result<()> {
        match kind {
            SignalKind::Candidate => self.handle_candidate(payload).await,
            SignalKind::Offer => self.handle_offer(payload).await,
            SignalKind::Answer => self.handle_answer(payload).await,
        }
    }

    /// Apply a remote candidate, buffering it while the remote description
    /// is not yet set. A full buffer rejects the newest candidate; the
    /// connection can still establish from the ones already queued.
    pub async fn handle_candidate(&self, payload: String) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_str(&payload)
            .map_err(|e| CallError::Negotiation(format!("invalid remote candidate: {e}")))?;

        if self.pc.remote_description().await.is_some() {
            self.pc.add_ice_candidate(init).await?;
            return Ok(());
        }

        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending {
            warn!(
                queued = pending.len(),
                "Pending candidate queue full, rejecting newest candidate"
            );
            return Err(CallError::Negotiation(
                "pending candidate queue full".to_string(),
            ));
        }
        debug!(queued = pending.len() + 1, "Buffering remote candidate");
        pending.push_back(init);
        Ok(())
    }

    /// Apply a remote offer and reply with an answer
    pub async fn handle_offer(&self, sdp: String) -> Result<()> {
        let _guard = self.guard.lock().await;
        let offer = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(offer).await?;
        self.drain_pending().await;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        self.send(SignalKind::Answer, answer.sdp).await?;

        self.lock.mark_first_done();
        Ok(())
    }

    /// Apply the remote answer to our outstanding offer
    pub async fn handle_answer(&self, sdp: String) -> Result<()> {
        let _guard = self.guard.lock().await;
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        self.drain_pending().await;

        if !self.lock.first_negotiation_done() {
            self.lock.mark_first_done();
        } else if self.lock.state() == LockState::HeldBySelf {
            self.lock.release().await;
        }
        Ok(())
    }

    /// Create and send a fresh offer. Renegotiations over the in-band
    /// path first acquire the cross-party lock, released when the answer
    /// arrives; offers falling back to the websocket go out unlocked.
    pub async fn renegotiate(&self) -> Result<()> {
        let locked =
            self.lock.first_negotiation_done() && self.inband_active.load(Ordering::SeqCst);
        if locked {
            self.lock.acquire(self.close_rx.clone()).await?;
        }

        let result = self.offer().await;
        if result.is_err() && locked {
            self.lock.release().await;
        }
        result
    }

    async fn offer(&self) -> Result<()> {
        let _guard = self.guard.lock().await;
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        self.send(SignalKind::Offer, offer.sdp).await
    }

    async fn drain_pending(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain(..).collect()
        };
        for init in drained {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!("Failed to apply buffered candidate: {e}");
            }
        }
    }

    async fn send(&self, kind: SignalKind, payload: String) -> Result<()> {
        self.signal_tx
            .send(SignalPayload { kind, payload })
            .await
            .map_err(|_| CallError::Negotiation("outbound signal channel closed".to_string()))
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::CallConfig;
    use crate::events::EventKind;
    use crate::peer::build_peer_connection;

    async fn test_engine(
        max_pending: usize,
        inband: bool,
    ) -> (
        Arc<NegotiationEngine>,
        mpsc::Receiver<SignalPayload>,
        Arc<EventBus>,
    ) {
        let pc = build_peer_connection(&CallConfig::default()).await.unwrap();
        let (lock_tx, _lock_rx) = mpsc::channel(8);
        let lock = Arc::new(NegotiationLock::new(
            lock_tx,
            Duration::from_millis(10),
            Duration::from_millis(100),
        ));
        let (signal_tx, signal_rx) = mpsc::channel(16);
        let (_close_tx, close_rx) = watch::channel(false);
        let bus = Arc::new(EventBus::new());
        let engine = Arc::new(NegotiationEngine::new(
            pc,
            lock,
            signal_tx,
            bus.clone(),
            Arc::new(AtomicBool::new(inband)),
            max_pending,
            close_rx,
        ));
        (engine, signal_rx, bus)
    }

    fn candidate_json(port: u16) -> String {
        let init = RTCIceCandidateInit {
            candidate: format!("candidate:1 1 udp 2130706431 127.0.0.1 {port} typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            ..Default::default()
        };
        serde_json::to_string(&init).unwrap()
    }

    #[tokio::test]
    async fn test_early_candidates_are_buffered() {
        let (engine, _signal_rx, _bus) = test_engine(8, true).await;
        engine.handle_candidate(candidate_json(5000)).await.unwrap();
        engine.handle_candidate(candidate_json(5001)).await.unwrap();
        assert_eq!(engine.pending_len(), 2);
    }

    #[tokio::test]
    async fn test_candidate_buffer_rejects_overflow() {
        let (engine, _signal_rx, _bus) = test_engine(2, true).await;
        engine.handle_candidate(candidate_json(5000)).await.unwrap();
        engine.handle_candidate(candidate_json(5001)).await.unwrap();
        match engine.handle_candidate(candidate_json(5002)).await {
            Err(CallError::Negotiation(msg)) => assert!(msg.contains("full")),
            other => panic!("expected negotiation error, got {other:?}"),
        }
        // Earlier candidates survive the overflow.
        assert_eq!(engine.pending_len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_candidate_is_rejected() {
        let (engine, _signal_rx, _bus) = test_engine(8, true).await;
        assert!(engine.handle_candidate("not json".to_string()).await.is_err());
        assert_eq!(engine.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_offer_produces_answer_and_drains_buffer() {
        let (engine, mut signal_rx, _bus) = test_engine(8, true).await;
        engine.handle_candidate(candidate_json(5000)).await.unwrap();

        let remote = build_peer_connection(&CallConfig::default()).await.unwrap();
        let _dc = remote.create_data_channel("signaling", None).await.unwrap();
        let offer = remote.create_offer(None).await.unwrap();
        remote.set_local_description(offer.clone()).await.unwrap();

        engine.handle_offer(offer.sdp).await.unwrap();

        let sent = signal_rx.recv().await.unwrap();
        assert_eq!(sent.kind, SignalKind::Answer);
        assert!(sent.payload.contains("v=0"));
        assert_eq!(engine.pending_len(), 0);
        assert!(engine.lock().first_negotiation_done());
        remote.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_offer_skips_lock_and_answer_completes_it() {
        let (engine, mut signal_rx, _bus) = test_engine(8, true).await;
        let _dc = crate::peer::create_signaling_channel(&engine.pc).await.unwrap();

        // No lock traffic happens on the first negotiation, so this returns
        // without any peer granting anything.
        engine.renegotiate().await.unwrap();
        let sent = signal_rx.recv().await.unwrap();
        assert_eq!(sent.kind, SignalKind::Offer);
        assert!(!engine.lock().first_negotiation_done());

        let remote = build_peer_connection(&CallConfig::default()).await.unwrap();
        let offer = RTCSessionDescription::offer(sent.payload).unwrap();
        remote.set_remote_description(offer).await.unwrap();
        let answer = remote.create_answer(None).await.unwrap();
        remote.set_local_description(answer.clone()).await.unwrap();

        engine.handle_answer(answer.sdp).await.unwrap();
        assert!(engine.lock().first_negotiation_done());
        remote.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_renegotiation_requires_lock_grant() {
        let (engine, _signal_rx, _bus) = test_engine(8, true).await;
        engine.lock().mark_first_done();
        // No peer ever grants the lock, so the attempt fails.
        match engine.renegotiate().await {
            Err(CallError::LockFailed(_)) => {}
            other => panic!("expected lock failure, got {other:?}"),
        }
        assert_eq!(engine.lock().state(), LockState::Free);
    }

    #[tokio::test]
    async fn test_renegotiation_unlocked_without_inband_path() {
        let (engine, mut signal_rx, _bus) = test_engine(8, false).await;
        let _dc = crate::peer::create_signaling_channel(&engine.pc).await.unwrap();
        engine.lock().mark_first_done();

        // No peer exists to grant the lock, yet the offer still goes out
        // because the websocket path does not use the lock protocol.
        engine.renegotiate().await.unwrap();
        let sent = signal_rx.recv().await.unwrap();
        assert_eq!(sent.kind, SignalKind::Offer);
        assert_eq!(engine.lock().state(), LockState::Free);

        let remote = build_peer_connection(&CallConfig::default()).await.unwrap();
        let offer = RTCSessionDescription::offer(sent.payload).unwrap();
        remote.set_remote_description(offer).await.unwrap();
        let answer = remote.create_answer(None).await.unwrap();
        remote.set_local_description(answer.clone()).await.unwrap();

        // The answer applies cleanly without a release round-trip.
        engine.handle_answer(answer.sdp).await.unwrap();
        assert_eq!(engine.lock().state(), LockState::Free);
        remote.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_reports_negotiation_failure() {
        let (engine, _signal_rx, bus) = test_engine(8, true).await;
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        bus.register(
            EventKind::Error,
            Box::new(move |event| {
                if let CallEvent::Error { message } = event {
                    let _ = err_tx.send(message.clone());
                }
            }),
        )
        .unwrap();

        engine.lock().mark_first_done();
        engine.start();
        // Adding the data channel fires negotiation-needed; the lock
        // acquisition fails and the driver must surface it as an event.
        let _dc = crate::peer::create_signaling_channel(&engine.pc).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
            .await
            .expect("timed out waiting for the error event")
            .unwrap();
        assert!(message.contains("negotiation failed"));
    }
}
