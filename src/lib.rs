//! groupcall - client session engine for real-time group calls
//!
//! Connects to a call backend over a persistent websocket, negotiates a
//! WebRTC peer connection, manages local and remote media tracks, and
//! watches call health. The embedding application drives everything
//! through [`session::CallSession`] and receives notifications through
//! the typed event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod negotiation;
pub mod peer;
pub mod rest;
pub mod rtcmsg;
pub mod session;
pub mod signaling;
pub mod tracks;

pub use config::CallConfig;
pub use error::{CallError, Result};
pub use events::{CallEvent, EventKind};
pub use monitor::QualityReport;
pub use session::{CallSession, SessionState};
pub use tracks::TrackType;
