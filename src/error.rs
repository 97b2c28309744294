//! Error types for the voice relay

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::realtime::SessionState;

/// Result type alias for voice relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Upstream or client connection refused, dropped, or timed out
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream reported an explicit error message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Capture or playback device unavailable
    #[error("device error: {0}")]
    Device(String),

    /// Audio processing error
    #[error("audio error: {0}")]
    Audio(String),

    /// A request arrived while another was in flight
    #[error("sequencing error: {0}")]
    Sequencing(String),

    /// The session or its actor has shut down
    #[error("session closed")]
    Closed,

    /// Edge not present in the session state machine
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Caller-visible error taxonomy
///
/// Raw transport codes never leave the crate; everything is folded into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, dropped, or handshake timeout (recovered by reconnect)
    Transport,
    /// Explicit upstream error message (session returns to ready)
    Protocol,
    /// Capture or playback device unavailable (fatal to that side only)
    Device,
    /// Overlapping request (queued, never surfaced as a failure)
    Sequencing,
    /// Anything else
    Internal,
}

impl Error {
    /// Map this error onto the caller-visible taxonomy
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::WebSocket(_) | Self::Closed => ErrorKind::Transport,
            Self::Protocol(_) | Self::Serialization(_) => ErrorKind::Protocol,
            Self::Device(_) => ErrorKind::Device,
            Self::Sequencing(_) => ErrorKind::Sequencing,
            Self::Config(_)
            | Self::Audio(_)
            | Self::InvalidTransition { .. }
            | Self::Io(_)
            | Self::Toml(_) => ErrorKind::Internal,
        }
    }
}

/// Error payload delivered on a session's error channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeError {
    /// Taxonomy bucket
    pub kind: ErrorKind,
    /// Stable snake_case code
    pub code: String,
    /// Human-readable detail
    pub message: String,
}

impl BridgeError {
    /// Build an error payload
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Retries exhausted, voice is not reachable
    pub fn voice_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, "voice_unavailable", message)
    }

    /// Upstream reported an error
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, "upstream_error", message)
    }

    /// An in-flight request was lost to a disconnect and must be retried
    pub fn request_aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, "request_aborted", message)
    }

    /// Capture device could not be opened
    pub fn capture_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Device, "capture_unavailable", message)
    }

    /// Playback device could not be used
    pub fn playback_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Device, "playback_unavailable", message)
    }
}

impl From<&Error> for BridgeError {
    fn from(err: &Error) -> Self {
        let code = match err.kind() {
            ErrorKind::Transport => "transport_error",
            ErrorKind::Protocol => "upstream_error",
            ErrorKind::Device => "device_error",
            ErrorKind::Sequencing => "sequencing",
            ErrorKind::Internal => "internal_error",
        };
        Self::new(err.kind(), code, err.to_string())
    }
}
