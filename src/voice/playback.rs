//! Audio playback to speakers
//!
//! The cpal stream lives on its own thread (streams are not `Send` on every host).
//! Scheduled buffers are mixed into the output callback at their start frame, so the
//! device's rendered-frame counter is the playback clock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use tokio::sync::oneshot;

use super::scheduler::AudioSink;
use crate::realtime::SessionId;
use crate::{Error, Result};

struct Scheduled {
    session: SessionId,
    start_frame: u64,
    samples: Arc<[f32]>,
    done: Option<oneshot::Sender<()>>,
}

/// Shared between the audio callback and the scheduler
#[derive(Default)]
struct Timeline {
    frames_rendered: AtomicU64,
    sample_rate: AtomicU32,
    queue: Mutex<Vec<Scheduled>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Timeline {
    /// Mix due entries into one interleaved output buffer
    #[allow(clippy::cast_possible_truncation)]
    fn render(&self, data: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = (data.len() / channels) as u64;
        let start = self.frames_rendered.load(Ordering::Acquire);
        let end = start + frames;
        data.fill(0.0);

        lock(&self.queue).retain_mut(|entry| {
            let entry_end = entry.start_frame + entry.samples.len() as u64;
            let from = entry.start_frame.max(start);
            let to = entry_end.min(end);
            for frame in from..to {
                let sample = entry.samples[(frame - entry.start_frame) as usize];
                let out = (frame - start) as usize * channels;
                for slot in &mut data[out..out + channels] {
                    *slot += sample;
                }
            }
            if entry_end <= end {
                if let Some(done) = entry.done.take() {
                    let _ = done.send(());
                }
                return false;
            }
            true
        });

        for slot in data.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }
        self.frames_rendered.fetch_add(frames, Ordering::Release);
    }

    #[allow(clippy::cast_precision_loss)]
    fn now(&self) -> f64 {
        let rate = self.sample_rate.load(Ordering::Acquire).max(1);
        self.frames_rendered.load(Ordering::Acquire) as f64 / f64::from(rate)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn push(&self, session: &SessionId, samples: Arc<[f32]>, start_at: f64) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        let rate = f64::from(self.sample_rate.load(Ordering::Acquire));
        lock(&self.queue).push(Scheduled {
            session: session.clone(),
            start_frame: (start_at.max(0.0) * rate).round() as u64,
            samples,
            done: Some(done),
        });
        rx
    }

    /// Pending senders are dropped, which cancels their receivers
    fn halt(&self, session: &SessionId) {
        lock(&self.queue).retain(|entry| &entry.session != session);
    }
}

/// Default output device as an [`AudioSink`]
pub struct DeviceOutput {
    timeline: Arc<Timeline>,
    shutdown: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceOutput {
    /// Open the default output device and start rendering silence
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if no usable output device is available
    pub fn open_default() -> Result<Self> {
        let timeline = Arc::new(Timeline::default());
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        let shared = Arc::clone(&timeline);
        let thread = std::thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || match build_stream(&shared) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Holds the stream until the owner drops
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Device("playback thread exited".to_string()))??;

        Ok(Self {
            timeline,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

fn build_stream(timeline: &Arc<Timeline>) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Device("no output device available".to_string()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| Error::Device(e.to_string()))?;
    if supported.sample_format() != SampleFormat::F32 {
        return Err(Error::Device(format!(
            "unsupported output sample format {:?}",
            supported.sample_format()
        )));
    }

    let config = supported.config();
    let channels = usize::from(config.channels);
    timeline
        .sample_rate
        .store(config.sample_rate.0, Ordering::Release);

    let shared = Arc::clone(timeline);
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                shared.render(data, channels);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))?;

    stream.play().map_err(|e| Error::Device(e.to_string()))?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels,
        "audio playback initialized"
    );
    Ok(stream)
}

impl AudioSink for DeviceOutput {
    fn sample_rate(&self) -> u32 {
        self.timeline.sample_rate.load(Ordering::Acquire)
    }

    fn now(&self) -> f64 {
        self.timeline.now()
    }

    fn submit(
        &self,
        session: &SessionId,
        samples: Arc<[f32]>,
        start_at: f64,
    ) -> oneshot::Receiver<()> {
        self.timeline.push(session, samples, start_at)
    }

    fn halt(&self, session: &SessionId) {
        self.timeline.halt(session);
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
