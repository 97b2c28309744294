//! Half-duplex arbitration of the audio device
//!
//! Capture and playback share one physical device. Ownership is a single token
//! ([`DeviceLease`]) held by at most one side; nothing else toggles the active side.

use std::fmt;

/// Which side of the device a lease grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceSide {
    Capture,
    Playback,
}

impl fmt::Display for DeviceSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => f.write_str("capture"),
            Self::Playback => f.write_str("playback"),
        }
    }
}

/// Exclusive ownership of the device
///
/// Not `Clone`: there is never more than one lease outstanding.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceLease {
    side: DeviceSide,
    id: u64,
}

impl DeviceLease {
    #[must_use]
    pub const fn side(&self) -> DeviceSide {
        self.side
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// Single-owner token plus the "resume capture later" bookkeeping
#[derive(Debug)]
pub struct ResourceArbiter {
    holder: Option<DeviceLease>,
    next_lease: u64,
    capture_enabled: bool,
    resume_capture: bool,
}

impl Default for ResourceArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceArbiter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            holder: None,
            next_lease: 0,
            capture_enabled: false,
            resume_capture: false,
        }
    }

    /// Side currently holding the device
    #[must_use]
    pub fn holder(&self) -> Option<DeviceSide> {
        self.holder.as_ref().map(DeviceLease::side)
    }

    #[must_use]
    pub fn capture_active(&self) -> bool {
        self.holder() == Some(DeviceSide::Capture)
    }

    #[must_use]
    pub fn playback_active(&self) -> bool {
        self.holder() == Some(DeviceSide::Playback)
    }

    /// Whether the caller wants capture on
    #[must_use]
    pub const fn capture_enabled(&self) -> bool {
        self.capture_enabled
    }

    /// Whether capture will come back after the current playback settles
    #[must_use]
    pub const fn resume_pending(&self) -> bool {
        self.resume_capture
    }

    /// Record the caller's capture preference
    ///
    /// Disabling also cancels any deferred resume.
    pub fn set_capture_enabled(&mut self, enabled: bool) {
        self.capture_enabled = enabled;
        if !enabled {
            self.resume_capture = false;
        }
    }

    fn grant(&mut self, side: DeviceSide) -> u64 {
        self.next_lease += 1;
        let id = self.next_lease;
        self.holder = Some(DeviceLease { side, id });
        id
    }

    /// Hand the device to capture
    ///
    /// Fails (returns `false`) if capture is disabled or the device is held.
    pub fn acquire_capture(&mut self) -> bool {
        if !self.capture_enabled || self.holder.is_some() {
            return false;
        }
        let id = self.grant(DeviceSide::Capture);
        tracing::trace!(lease = id, "capture acquired device");
        true
    }

    /// Give the device back from capture
    pub fn release_capture(&mut self) -> bool {
        if self.capture_active() {
            self.holder = None;
            return true;
        }
        false
    }

    /// Capture was enabled while playback holds the device; pick it up on settle
    pub fn defer_capture(&mut self) {
        if self.capture_enabled && self.holder.is_some() {
            self.resume_capture = true;
        }
    }

    /// Hand the device to playback
    ///
    /// Returns `true` if capture was holding it and must now be paused. A resume flag
    /// recorded by an earlier claim survives the settle window.
    pub fn claim_playback(&mut self) -> bool {
        match self.holder() {
            Some(DeviceSide::Playback) => false,
            Some(DeviceSide::Capture) => {
                self.resume_capture = true;
                self.grant(DeviceSide::Playback);
                true
            }
            None => {
                self.grant(DeviceSide::Playback);
                false
            }
        }
    }

    /// Playback finished or was halted
    pub fn release_playback(&mut self) -> bool {
        if self.playback_active() {
            self.holder = None;
            return true;
        }
        false
    }

    /// Called after the settle delay; returns whether capture should restart
    ///
    /// Restarts only if capture was active before playback, is still enabled, and
    /// nothing reclaimed the device in the meantime. The flag is consumed only when
    /// the device is free.
    pub fn settle(&mut self) -> bool {
        if self.holder.is_some() {
            return false;
        }
        let resume = self.resume_capture && self.capture_enabled;
        self.resume_capture = false;
        resume
    }
}
