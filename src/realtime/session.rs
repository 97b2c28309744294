//! Session record owned by the bridge

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::SessionState;
use crate::{Error, Result};

/// Opaque identifier of one logical conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Snapshot of a session for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    /// Id assigned by the upstream vendor, once known
    pub upstream_id: Option<String>,
    pub voice: String,
    pub state: SessionState,
    pub last_activity: DateTime<Utc>,
    pub pending_request: bool,
    pub queued_requests: usize,
}

/// One logical conversation with the upstream endpoint
///
/// At most one generate-response request is in flight at a time; further requests
/// wait in `queue` in arrival order.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    voice: String,
    state: SessionState,
    upstream_id: Option<String>,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    pending_request: bool,
    queue: VecDeque<String>,
}

impl Session {
    /// Create a disconnected session for `voice`
    #[must_use]
    pub fn new(voice: impl Into<String>) -> Self {
        Self {
            id: SessionId::generate(),
            voice: voice.into(),
            state: SessionState::Disconnected,
            upstream_id: None,
            last_activity: Instant::now(),
            last_activity_at: Utc::now(),
            pending_request: false,
            queue: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn voice(&self) -> &str {
        &self.voice
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn pending_request(&self) -> bool {
        self.pending_request
    }

    #[must_use]
    pub fn upstream_id(&self) -> Option<&str> {
        self.upstream_id.as_deref()
    }

    pub fn set_upstream_id(&mut self, id: Option<String>) {
        self.upstream_id = id;
    }

    /// Move to `next`, returning the previous state
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` if the edge is not in the state machine
    pub fn transition(&mut self, next: SessionState) -> Result<SessionState> {
        let previous = self.state;
        if previous == next {
            return Ok(previous);
        }
        if !previous.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: previous,
                to: next,
            });
        }
        self.state = next;
        tracing::debug!(
            session_id = %self.id,
            from = %previous,
            to = %next,
            "session state changed"
        );
        Ok(previous)
    }

    /// Record activity now
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    /// Time since the last recorded activity
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Queue a text-to-speech request
    pub fn enqueue(&mut self, text: String) {
        self.queue.push_back(text);
    }

    /// Number of requests waiting behind the in-flight one
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Take the next request if the session can start one
    ///
    /// Sets the pending flag; returns `None` while a request is in flight, when not
    /// ready, or when nothing is queued.
    pub fn begin_request(&mut self) -> Option<String> {
        if self.pending_request || self.state != SessionState::Ready {
            return None;
        }
        let text = self.queue.pop_front()?;
        self.pending_request = true;
        Some(text)
    }

    /// Clear the pending flag
    pub fn finish_request(&mut self) {
        self.pending_request = false;
    }

    /// Drop every queued request, returning how many were dropped
    pub fn clear_queue(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    /// Move queued requests out, used when the session is replaced
    pub fn take_queue(&mut self) -> VecDeque<String> {
        std::mem::take(&mut self.queue)
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            upstream_id: self.upstream_id.clone(),
            voice: self.voice.clone(),
            state: self.state,
            last_activity: self.last_activity_at,
            pending_request: self.pending_request,
            queued_requests: self.queue.len(),
        }
    }
}
