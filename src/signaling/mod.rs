//! Signaling connection to the call backend
//!
//! `wire` defines the envelope and event types, `transport` drives the
//! persistent websocket including the reconnection state machine.

pub mod transport;
pub mod wire;

pub use transport::SignalingTransport;
pub use wire::{ServerEvent, SignalKind};
