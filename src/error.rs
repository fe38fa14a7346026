use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session already initialized")]
    AlreadyInitialized,

    #[error("Session not initialized")]
    NotInitialized,

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Already subscribed to event: {0}")]
    AlreadySubscribed(String),

    #[error("Unknown event type: {0}")]
    UnknownEvent(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Negotiation lock failed: {0}")]
    LockFailed(String),

    #[error("Track error: {0}")]
    Track(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("REST error: {0}")]
    Rest(String),

    #[error("Session closed")]
    Closed,

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, CallError>;
