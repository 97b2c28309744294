//! Per-session connection state machine
//!
//! ```text
//! Disconnected → Connecting → Configuring → Ready ⇄ Speaking
//!        ↑            │            │          │        │
//!        └────────────┴────────────┴──────────┴────────┘   (link lost / idle)
//!
//! any → Error, any → Closed (terminal)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a session's upstream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No upstream connection
    Disconnected,
    /// Connection attempt in flight
    Connecting,
    /// Voice configuration sent, waiting for acknowledgement
    Configuring,
    /// Idle and able to accept a request
    Ready,
    /// A text-to-speech request is in flight
    Speaking,
    /// Retries exhausted or unrecoverable failure
    Error,
    /// Explicitly closed; terminal
    Closed,
}

impl SessionState {
    /// Whether `self → next` is a legal edge
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Closed, _) => false,
            (_, Self::Closed | Self::Error)
            | (Self::Disconnected | Self::Error, Self::Connecting)
            | (Self::Connecting, Self::Configuring)
            | (Self::Configuring | Self::Speaking, Self::Ready)
            | (Self::Ready, Self::Speaking)
            | (
                Self::Connecting | Self::Configuring | Self::Ready | Self::Speaking | Self::Error,
                Self::Disconnected,
            ) => true,
            _ => false,
        }
    }

    /// Whether an upstream link is established
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Configuring | Self::Ready | Self::Speaking)
    }

    /// Whether the session can never be used again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Configuring => "configuring",
            Self::Ready => "ready",
            Self::Speaking => "speaking",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [Disconnected, Connecting, Configuring, Ready, Speaking, Ready, Closed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn error_and_closed_reachable_from_everywhere() {
        for state in [Disconnected, Connecting, Configuring, Ready, Speaking, Error] {
            assert!(state.can_transition_to(Closed));
            assert!(state.can_transition_to(Error));
        }
    }

    #[test]
    fn closed_is_terminal() {
        for state in [Disconnected, Connecting, Configuring, Ready, Speaking, Error, Closed] {
            assert!(!Closed.can_transition_to(state));
        }
        assert!(Closed.is_terminal());
    }

    #[test]
    fn cannot_skip_configuration() {
        assert!(!Connecting.can_transition_to(Ready));
        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Configuring.can_transition_to(Speaking));
        assert!(!Disconnected.can_transition_to(Speaking));
    }

    #[test]
    fn error_can_retry() {
        assert!(Error.can_transition_to(Connecting));
        assert!(Error.can_transition_to(Disconnected));
    }

    #[test]
    fn connected_states() {
        assert!(Configuring.is_connected());
        assert!(Speaking.is_connected());
        assert!(!Connecting.is_connected());
        assert_eq!(serde_json::to_string(&Speaking).unwrap(), "\"speaking\"");
    }
}
