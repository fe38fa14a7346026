//! Session event types
//!
//! Defines the domain events a session emits toward the embedding
//! application through the event bus.

use std::str::FromStr;
use std::sync::Arc;

use webrtc::track::track_remote::TrackRemote;

use crate::error::CallError;
use crate::tracks::TrackType;

/// Event kinds the embedding application can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Signaling connected (initial join or successful reconnect)
    Connected,
    /// Session closed, emitted exactly once at the end of teardown
    Closed,
    /// Non-fatal internal error (negotiation failure, lost candidate, ...)
    Error,
    /// A remote track was admitted
    TrackAdded,
    /// A remote participant left the call
    UserLeft,
    /// The call host changed
    HostChanged,
    /// Backend job state transition
    JobState,
    /// A participant muted or unmuted
    MuteChanged,
    /// A participant raised or lowered their hand
    HandRaiseChanged,
    /// A participant started or stopped screen sharing
    ScreenShareChanged,
    /// The backend ended the call
    CallEnded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Closed => "closed",
            EventKind::Error => "error",
            EventKind::TrackAdded => "track_added",
            EventKind::UserLeft => "user_left",
            EventKind::HostChanged => "host_changed",
            EventKind::JobState => "job_state",
            EventKind::MuteChanged => "mute_changed",
            EventKind::HandRaiseChanged => "hand_raise_changed",
            EventKind::ScreenShareChanged => "screen_share_changed",
            EventKind::CallEnded => "call_ended",
        }
    }
}

impl FromStr for EventKind {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(EventKind::Connected),
            "closed" => Ok(EventKind::Closed),
            "error" => Ok(EventKind::Error),
            "track_added" => Ok(EventKind::TrackAdded),
            "user_left" => Ok(EventKind::UserLeft),
            "host_changed" => Ok(EventKind::HostChanged),
            "job_state" => Ok(EventKind::JobState),
            "mute_changed" => Ok(EventKind::MuteChanged),
            "hand_raise_changed" => Ok(EventKind::HandRaiseChanged),
            "screen_share_changed" => Ok(EventKind::ScreenShareChanged),
            "call_ended" => Ok(EventKind::CallEnded),
            other => Err(CallError::UnknownEvent(other.to_string())),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payloads delivered to registered handlers
#[derive(Clone)]
pub enum CallEvent {
    Connected {
        conn_id: String,
        /// True when this is a reconnect of an existing logical session
        reconnect: bool,
    },
    Closed,
    Error {
        message: String,
    },
    TrackAdded {
        track_type: TrackType,
        session_id: String,
        track: Arc<TrackRemote>,
    },
    UserLeft {
        session_id: String,
    },
    HostChanged {
        session_id: String,
    },
    JobState {
        state: String,
    },
    MuteChanged {
        session_id: String,
        muted: bool,
    },
    HandRaiseChanged {
        session_id: String,
        raised: bool,
    },
    ScreenShareChanged {
        session_id: String,
        active: bool,
    },
    CallEnded {
        reason: String,
    },
}

impl std::fmt::Debug for CallEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallEvent::TrackAdded {
                track_type,
                session_id,
                track,
            } => f
                .debug_struct("TrackAdded")
                .field("track_type", track_type)
                .field("session_id", session_id)
                .field("track_id", &track.id())
                .finish(),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

impl CallEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CallEvent::Connected { .. } => EventKind::Connected,
            CallEvent::Closed => EventKind::Closed,
            CallEvent::Error { .. } => EventKind::Error,
            CallEvent::TrackAdded { .. } => EventKind::TrackAdded,
            CallEvent::UserLeft { .. } => EventKind::UserLeft,
            CallEvent::HostChanged { .. } => EventKind::HostChanged,
            CallEvent::JobState { .. } => EventKind::JobState,
            CallEvent::MuteChanged { .. } => EventKind::MuteChanged,
            CallEvent::HandRaiseChanged { .. } => EventKind::HandRaiseChanged,
            CallEvent::ScreenShareChanged { .. } => EventKind::ScreenShareChanged,
            CallEvent::CallEnded { .. } => EventKind::CallEnded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            EventKind::Connected,
            EventKind::Closed,
            EventKind::Error,
            EventKind::TrackAdded,
            EventKind::UserLeft,
            EventKind::HostChanged,
            EventKind::JobState,
            EventKind::MuteChanged,
            EventKind::HandRaiseChanged,
            EventKind::ScreenShareChanged,
            EventKind::CallEnded,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(matches!(
            "totally_unknown".parse::<EventKind>(),
            Err(CallError::UnknownEvent(_))
        ));
    }
}
