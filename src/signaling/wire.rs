//! Signaling wire protocol
//!
//! Outbound messages are `{action, seq, data}` envelopes with a per-client
//! monotonic sequence number. Inbound messages are typed backend events,
//! optionally scoped to a connection id the client must filter on.
//! Session descriptions carried over this transport are zlib-compressed and
//! base64-encoded to keep envelopes small.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{CallError, Result};

/// Outbound actions
pub mod action {
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const RECONNECT: &str = "reconnect";
    pub const SIGNAL: &str = "signal";
    pub const MUTE: &str = "mute";
    pub const UNMUTE: &str = "unmute";
    pub const SCREEN_ON: &str = "screen_on";
    pub const SCREEN_OFF: &str = "screen_off";
    pub const RAISE_HAND: &str = "raise_hand";
    pub const LOWER_HAND: &str = "lower_hand";
}

/// Outbound request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    pub seq: u64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(action: &str, seq: u64, data: serde_json::Value) -> Self {
        Self {
            action: action.to_string(),
            seq,
            data,
        }
    }
}

/// Payload of the initial `join` action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub token: String,
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// Payload of the `reconnect` action
///
/// Carries the original and previous connection ids so the backend can
/// correlate session continuity instead of starting a new call leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPayload {
    pub channel: String,
    pub original_conn_id: String,
    pub prev_conn_id: String,
}

/// Kind of a relayed negotiation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Candidate,
    Offer,
    Answer,
}

/// Payload of the `signal` action (both directions)
///
/// For offers/answers `payload` is a compressed SDP; for candidates it is
/// the candidate JSON as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPayload {
    pub kind: SignalKind,
    pub payload: String,
}

/// Typed backend events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First message on every (re)connect, establishes the connection id
    Hello { conn_id: String },
    JobState { state: String },
    HostChanged { session_id: String },
    UserLeft { session_id: String },
    CallEnd {
        #[serde(default)]
        reason: String,
    },
    Mute { session_id: String },
    Unmute { session_id: String },
    RaiseHand { session_id: String },
    LowerHand { session_id: String },
    ScreenOn { session_id: String },
    ScreenOff { session_id: String },
    Signal {
        kind: SignalKind,
        payload: String,
    },
}

/// Inbound message wrapper: every backend event may be addressed (`to`) to
/// a specific connection id; messages for other connections are dropped by
/// the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(flatten)]
    pub event: ServerEvent,
}

/// Compress an SDP for the signaling envelope (zlib, then base64)
pub fn compress_sdp(sdp: &str) -> Result<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(sdp.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

/// Inverse of [`compress_sdp`]
pub fn decompress_sdp(data: &str) -> Result<String> {
    let compressed = BASE64
        .decode(data)
        .map_err(|e| CallError::Protocol(format!("invalid base64 in signal payload: {e}")))?;
    let mut decoder = ZlibDecoder::new(&compressed[..]);
    let mut sdp = String::new();
    decoder
        .read_to_string(&mut sdp)
        .map_err(|e| CallError::Protocol(format!("invalid zlib in signal payload: {e}")))?;
    Ok(sdp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let env = Envelope::new(
            action::SIGNAL,
            7,
            serde_json::to_value(SignalPayload {
                kind: SignalKind::Offer,
                payload: "x".to_string(),
            })
            .unwrap(),
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.action, "signal");
        assert_eq!(back.seq, 7);
    }

    #[test]
    fn test_server_message_parses_conn_scope() {
        let json = r#"{"event":"user_left","session_id":"s-9","to":"c-1"}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.to.as_deref(), Some("c-1"));
        assert!(matches!(msg.event, ServerEvent::UserLeft { ref session_id } if session_id == "s-9"));
    }

    #[test]
    fn test_hello_carries_conn_id() {
        let json = r#"{"event":"hello","conn_id":"c-1"}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg.event, ServerEvent::Hello { ref conn_id } if conn_id == "c-1"));
    }

    #[test]
    fn test_server_message_without_scope() {
        let json = r#"{"event":"call_end","reason":"host ended"}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert!(msg.to.is_none());
        assert!(matches!(msg.event, ServerEvent::CallEnd { ref reason } if reason == "host ended"));
    }

    #[test]
    fn test_unknown_event_is_error() {
        let json = r#"{"event":"no_such_event"}"#;
        assert!(serde_json::from_str::<ServerMessage>(json).is_err());
    }

    #[test]
    fn test_sdp_compression_round_trip() {
        let sdp = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\n";
        let packed = compress_sdp(sdp).unwrap();
        assert_ne!(packed, sdp);
        assert_eq!(decompress_sdp(&packed).unwrap(), sdp);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress_sdp("!!!not-base64!!!").is_err());
        let valid_b64_bad_zlib = BASE64.encode(b"definitely not zlib");
        assert!(decompress_sdp(&valid_b64_bad_zlib).is_err());
    }
}
