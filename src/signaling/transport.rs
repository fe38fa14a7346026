//! Signaling transport
//!
//! Wraps the persistent websocket to the call backend. Outbound messages
//! are framed with a monotonic per-client sequence number; the first
//! inbound message of every (re)connect must be a "hello" that establishes
//! the connection identity. Unexpected closures enter a reconnect loop with
//! additively growing, jittered backoff bounded by a total outage budget
//! (default 30s); once the budget is exhausted the transport gives up and
//! the session tears down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::wire::{action, Envelope, JoinPayload, ReconnectPayload, ServerEvent, ServerMessage};
use crate::config::{CallConfig, DEFAULT_BACKOFF_JITTER, DEFAULT_BACKOFF_STEP};
use crate::error::{CallError, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSource = SplitStream<WsStream>;
type WsSink = SplitSink<WsStream, Message>;

/// Additive backoff with bounded random jitter
///
/// Grows by `step` plus up to `jitter` after every failed attempt and
/// resets to zero on success.
pub(crate) struct Backoff {
    step: Duration,
    jitter: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(step: Duration, jitter: Duration) -> Self {
        Self {
            step,
            jitter,
            current: Duration::ZERO,
        }
    }

    pub(crate) fn advance(&mut self) -> Duration {
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.current += self.step + Duration::from_millis(jitter_ms);
        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = Duration::ZERO;
    }

    pub(crate) fn current(&self) -> Duration {
        self.current
    }
}

/// Persistent, authenticated signaling connection
pub struct SignalingTransport {
    url: String,
    channel: String,
    token: String,
    job_id: Option<String>,
    reconnect_timeout: Duration,
    seq: AtomicU64,
    writer: Mutex<Option<WsSink>>,
    current_conn_id: RwLock<Option<String>>,
    original_conn_id: RwLock<Option<String>>,
}

impl SignalingTransport {
    pub fn new(config: &CallConfig) -> Result<Self> {
        Ok(Self {
            url: config.signaling_url()?,
            channel: config.channel_id.clone(),
            token: config.token.clone(),
            job_id: config.job_id.clone(),
            reconnect_timeout: config.reconnect_timeout(),
            seq: AtomicU64::new(0),
            writer: Mutex::new(None),
            current_conn_id: RwLock::new(None),
            original_conn_id: RwLock::new(None),
        })
    }

    /// Connection id assigned by the most recent (re)connect
    pub fn current_conn_id(&self) -> Option<String> {
        self.current_conn_id.read().clone()
    }

    /// Connection id of the first connect, identifies the logical session
    pub fn original_conn_id(&self) -> Option<String> {
        self.original_conn_id.read().clone()
    }

    /// Send an `{action, seq, data}` envelope
    pub async fn send(&self, act: &str, data: serde_json::Value) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = Envelope::new(act, seq, data);
        let json = serde_json::to_string(&envelope)?;

        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => {
                sink.send(Message::Text(json.into())).await?;
                Ok(())
            }
            None => Err(CallError::Signaling("not connected".to_string())),
        }
    }

    /// Dial the backend and perform the join (or reconnect) handshake
    ///
    /// After `original_conn_id` is set, a new connection announces itself
    /// with a "reconnect" carrying the channel, original and previous
    /// connection ids so the backend resumes the existing call leg.
    pub async fn connect(&self) -> Result<WsSource> {
        let (ws, _response) = connect_async(&self.url).await?;
        let (sink, mut source) = ws.split();
        *self.writer.lock().await = Some(sink);

        let prev_conn_id = self.current_conn_id();
        match self.original_conn_id() {
            Some(original) => {
                let payload = ReconnectPayload {
                    channel: self.channel.clone(),
                    original_conn_id: original,
                    prev_conn_id: prev_conn_id.unwrap_or_default(),
                };
                self.send(action::RECONNECT, serde_json::to_value(payload)?)
                    .await?;
            }
            None => {
                let payload = JoinPayload {
                    token: self.token.clone(),
                    channel: self.channel.clone(),
                    job_id: self.job_id.clone(),
                };
                self.send(action::JOIN, serde_json::to_value(payload)?)
                    .await?;
            }
        }

        let conn_id = self.await_hello(&mut source).await?;
        {
            let mut original = self.original_conn_id.write();
            if original.is_none() {
                *original = Some(conn_id.clone());
            }
        }
        *self.current_conn_id.write() = Some(conn_id.clone());
        info!("Signaling connected, conn_id {}", conn_id);
        Ok(source)
    }

    /// The very first message must be a hello; anything else is a protocol
    /// error and fails the connection attempt.
    async fn await_hello(&self, source: &mut WsSource) -> Result<String> {
        while let Some(msg) = source.next().await {
            match msg? {
                Message::Text(text) => {
                    let parsed: ServerMessage = serde_json::from_str(text.as_str())
                        .map_err(|e| CallError::Protocol(format!("malformed hello: {e}")))?;
                    return match parsed.event {
                        ServerEvent::Hello { conn_id } => Ok(conn_id),
                        other => Err(CallError::Protocol(format!(
                            "expected hello, got {other:?}"
                        ))),
                    };
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => {
                    return Err(CallError::Signaling(
                        "connection closed during handshake".to_string(),
                    ))
                }
                other => {
                    return Err(CallError::Protocol(format!(
                        "unexpected frame before hello: {other:?}"
                    )))
                }
            }
        }
        Err(CallError::Signaling(
            "connection ended before hello".to_string(),
        ))
    }

    /// Drive the read loop until clean close or fatal failure
    ///
    /// Inbound events are forwarded through `events_tx`; an unexpected
    /// closure enters the reconnect loop and, on success, emits the new
    /// hello so the session observes exactly one reconnect-level
    /// "connected". Returns `Err` only for fatal conditions (reconnect
    /// budget exhausted); the caller is expected to tear the session down.
    pub async fn run(
        &self,
        mut source: WsSource,
        events_tx: mpsc::Sender<ServerEvent>,
        mut close_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let reason = loop {
                tokio::select! {
                    _ = close_rx.changed() => {
                        if *close_rx.borrow() {
                            self.close().await;
                            return Ok(());
                        }
                    }
                    next = source.next() => match next {
                        Some(Ok(msg)) => {
                            if let Some(event) = self.filter(msg) {
                                if events_tx.send(event).await.is_err() {
                                    // Router gone, session is tearing down
                                    return Ok(());
                                }
                            }
                        }
                        Some(Err(e)) => break e.to_string(),
                        None => break "connection closed by peer".to_string(),
                    }
                }
            };

            if *close_rx.borrow() {
                return Ok(());
            }
            warn!("Signaling connection lost: {}", reason);
            *self.writer.lock().await = None;

            source = self.reconnect(&mut close_rx).await?;
            let conn_id = self.current_conn_id().unwrap_or_default();
            if events_tx
                .send(ServerEvent::Hello { conn_id })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
    }

    /// Reconnect with additive jittered backoff until success or budget
    /// exhaustion (measured from the first disconnect).
    async fn reconnect(&self, close_rx: &mut watch::Receiver<bool>) -> Result<WsSource> {
        let first_disconnect = Instant::now();
        let mut backoff = Backoff::new(DEFAULT_BACKOFF_STEP, DEFAULT_BACKOFF_JITTER);

        loop {
            if *close_rx.borrow() {
                return Err(CallError::Closed);
            }
            match self.connect().await {
                Ok(source) => {
                    backoff.reset();
                    info!("Signaling reconnected");
                    return Ok(source);
                }
                Err(e) => {
                    if first_disconnect.elapsed() >= self.reconnect_timeout {
                        return Err(CallError::Signaling(format!(
                            "reconnect timed out after {:?}: {e}",
                            self.reconnect_timeout
                        )));
                    }
                    let delay = backoff.advance();
                    debug!("Reconnect attempt failed ({}), retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = close_rx.changed() => {
                            if *close_rx.borrow() {
                                return Err(CallError::Closed);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Parse and filter one inbound frame
    ///
    /// Malformed messages are logged and skipped (the loop continues);
    /// messages addressed to a different connection id are dropped.
    fn filter(&self, msg: Message) -> Option<ServerEvent> {
        let text = match msg {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => return None,
            other => {
                debug!("Ignoring non-text signaling frame: {other:?}");
                return None;
            }
        };
        let parsed: ServerMessage = match serde_json::from_str(text.as_str()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Malformed signaling message: {}", e);
                return None;
            }
        };
        if let Some(to) = &parsed.to {
            let current = self.current_conn_id.read();
            let original = self.original_conn_id.read();
            if Some(to) != current.as_ref() && Some(to) != original.as_ref() {
                debug!("Dropping message addressed to '{}'", to);
                return None;
            }
        }
        Some(parsed.event)
    }

    /// Best-effort leave + websocket close
    pub async fn close(&self) {
        let _ = self.send(action::LEAVE, serde_json::json!({})).await;
        let mut writer = self.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
    }
}
