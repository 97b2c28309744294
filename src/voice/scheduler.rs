//! Gapless playback scheduling
//!
//! Each session gets one worker that drains its buffers in arrival order and places
//! them on the device clock back-to-back. The next start time is advanced as soon as
//! a buffer is submitted, so a buffer arriving while the previous one is still
//! rendering lands exactly where that one ends.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::realtime::SessionId;

/// Output device as seen by the scheduler
///
/// Times are seconds on the device's own monotonic clock.
pub trait AudioSink: Send + Sync + 'static {
    /// Device sample rate (mono samples per second)
    fn sample_rate(&self) -> u32;

    /// Current device clock
    fn now(&self) -> f64;

    /// Queue `samples` to start rendering at `start_at`
    ///
    /// The receiver resolves once the buffer has fully rendered; it errors if the
    /// submission was cancelled by [`AudioSink::halt`].
    fn submit(&self, session: &SessionId, samples: Arc<[f32]>, start_at: f64)
    -> oneshot::Receiver<()>;

    /// Drop every not-yet-rendered submission for `session`
    fn halt(&self, session: &SessionId);
}

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum distance into the future for a start time
    pub min_lead: Duration,
    /// Pause inserted once after [`PlaybackScheduler::request_pause`]
    pub sentence_pause: Duration,
    /// Device submissions allowed in flight per session
    pub max_outstanding: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_lead: Duration::from_millis(5),
            sentence_pause: Duration::from_millis(500),
            max_outstanding: 2,
        }
    }
}

/// Per-session start-time bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackClock {
    next_play_time: f64,
    pending_pause: Option<f64>,
    min_lead: f64,
}

impl PlaybackClock {
    #[must_use]
    pub const fn new(min_lead: f64) -> Self {
        Self {
            next_play_time: 0.0,
            pending_pause: None,
            min_lead,
        }
    }

    /// End of the last scheduled buffer, zero if nothing has been scheduled
    #[must_use]
    pub const fn next_play_time(&self) -> f64 {
        self.next_play_time
    }

    /// Insert `pause` seconds before the next buffer, once
    pub const fn request_pause(&mut self, pause: f64) {
        self.pending_pause = Some(pause);
    }

    /// Start time for a buffer of `duration` seconds requested at `now`
    ///
    /// Never earlier than `now + min_lead`, never before the previous buffer ends.
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        let mut target = self.next_play_time;
        if let Some(pause) = self.pending_pause.take() {
            if target > 0.0 {
                target += pause;
            }
        }
        let start = target.max(now + self.min_lead);
        self.next_play_time = start + duration;
        start
    }

    /// Forget all scheduling state
    pub const fn reset(&mut self) {
        self.next_play_time = 0.0;
        self.pending_pause = None;
    }
}

struct Lane {
    tx: mpsc::UnboundedSender<Vec<f32>>,
    clock: Arc<Mutex<PlaybackClock>>,
    worker: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Orders decoded buffers onto an [`AudioSink`]
pub struct PlaybackScheduler {
    sink: Arc<dyn AudioSink>,
    config: SchedulerConfig,
    lanes: Mutex<HashMap<SessionId, Lane>>,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(sink: Arc<dyn AudioSink>, config: SchedulerConfig) -> Self {
        Self {
            sink,
            config,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Device sample rate buffers must already be resampled to
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sink.sample_rate()
    }

    /// Append a buffer to the session's queue
    ///
    /// Must be called from within a Tokio runtime; the session's worker is spawned on
    /// first use. Empty buffers are ignored.
    pub fn enqueue(&self, session: &SessionId, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        let mut lanes = lock(&self.lanes);
        let lane = lanes
            .entry(session.clone())
            .or_insert_with(|| self.spawn_lane(session.clone()));

        if let Err(mpsc::error::SendError(samples)) = lane.tx.send(samples) {
            // Worker died; replace it and keep the buffer
            tracing::warn!(session_id = %session, "playback worker gone, restarting");
            *lane = self.spawn_lane(session.clone());
            let _ = lane.tx.send(samples);
        }
    }

    /// Cancel everything queued or submitted for `session` and reset its clock
    pub fn stop(&self, session: &SessionId) {
        let lane = lock(&self.lanes).remove(session);
        if let Some(lane) = lane {
            lane.worker.abort();
            tracing::debug!(session_id = %session, "playback stopped");
        }
        self.sink.halt(session);
    }

    /// Insert the sentence pause before the session's next buffer
    pub fn request_pause(&self, session: &SessionId) {
        let pause = self.config.sentence_pause.as_secs_f64();
        if let Some(lane) = lock(&self.lanes).get(session) {
            lock(&lane.clock).request_pause(pause);
        }
    }

    /// Scheduled end of the session's audio on the device clock, zero if none
    #[must_use]
    pub fn next_play_time(&self, session: &SessionId) -> f64 {
        lock(&self.lanes)
            .get(session)
            .map_or(0.0, |lane| lock(&lane.clock).next_play_time())
    }

    /// Audio still scheduled to play for `session`
    #[must_use]
    pub fn remaining(&self, session: &SessionId) -> Duration {
        let left = self.next_play_time(session) - self.sink.now();
        if left > 0.0 {
            Duration::from_secs_f64(left)
        } else {
            Duration::ZERO
        }
    }

    fn spawn_lane(&self, session: SessionId) -> Lane {
        let (tx, rx) = mpsc::unbounded_channel();
        let clock = Arc::new(Mutex::new(PlaybackClock::new(
            self.config.min_lead.as_secs_f64(),
        )));
        let worker = tokio::spawn(drain(
            session,
            rx,
            Arc::clone(&clock),
            Arc::clone(&self.sink),
            self.config.max_outstanding.max(1),
        ));
        Lane { tx, clock, worker }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        for (_, lane) in lock(&self.lanes).drain() {
            lane.worker.abort();
        }
    }
}

#[allow(clippy::cast_precision_loss)]
async fn drain(
    session: SessionId,
    mut rx: mpsc::UnboundedReceiver<Vec<f32>>,
    clock: Arc<Mutex<PlaybackClock>>,
    sink: Arc<dyn AudioSink>,
    max_outstanding: usize,
) {
    let rate = f64::from(sink.sample_rate().max(1));
    let mut in_flight: VecDeque<oneshot::Receiver<()>> = VecDeque::new();

    while let Some(samples) = rx.recv().await {
        while in_flight.len() >= max_outstanding {
            if let Some(oldest) = in_flight.pop_front() {
                // Err means the device dropped it; either way the slot is free
                let _ = oldest.await;
            }
        }

        let duration = samples.len() as f64 / rate;
        let start_at = lock(&clock).schedule(sink.now(), duration);
        tracing::trace!(
            session_id = %session,
            start_at,
            duration,
            "buffer scheduled"
        );
        in_flight.push_back(sink.submit(&session, Arc::from(samples), start_at));
    }
}
