//! In-band data-channel messages
//!
//! Typed messages carried over the peer connection's data channel once it
//! is open: keepalive, the negotiation lock protocol, relayed SDP/candidate
//! signals, and media-quality telemetry. The engine only encodes/decodes
//! through this contract; the framing on the wire is line-delimited JSON.
//!
//! Lock/unlock requests are answered with a `LockResponse` on the same
//! channel; the channel is unreliable-ordered from the protocol's point of
//! view, so every lock message is safe to retry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::signaling::wire::SignalKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RtcMessage {
    Ping,
    Pong,
    /// Request the cross-party negotiation lock
    Lock,
    /// Release the negotiation lock (idempotent, best-effort)
    Unlock,
    /// Reply to a `Lock` request
    LockResponse { granted: bool },
    /// Relayed negotiation signal; `payload` is a plain SDP for
    /// offers/answers, candidate JSON for candidates
    Sdp { kind: SignalKind, payload: String },
    /// Outbound loss rate observed by the sender of this message
    LossRate { value: f32 },
    RoundTripTime { millis: f32 },
    Jitter { millis: f32 },
    /// Mapping from track id to media description
    MediaMap { entries: HashMap<String, String> },
    /// Codecs the sender can receive
    CodecSupportMap { codecs: Vec<String> },
}

/// Encode a message for the data channel
pub fn encode(msg: &RtcMessage) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode a message received from the data channel
pub fn decode(data: &[u8]) -> Result<RtcMessage> {
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_protocol_round_trip() {
        for msg in [
            RtcMessage::Lock,
            RtcMessage::Unlock,
            RtcMessage::LockResponse { granted: false },
        ] {
            let bytes = encode(&msg).unwrap();
            assert_eq!(decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_sdp_round_trip() {
        let msg = RtcMessage::Sdp {
            kind: SignalKind::Answer,
            payload: "v=0".to_string(),
        };
        let bytes = encode(&msg).unwrap();
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"{\"type\":\"martian\"}").is_err());
        assert!(decode(b"not json").is_err());
    }
}
