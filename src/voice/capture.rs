//! Audio capture from microphone
//!
//! Device callbacks are cut into fixed-size frames, near-silent frames are dropped
//! before encoding, and the rest are pushed into a bounded queue the bridge drains.
//! A gate shared with the callback is closed under its lock in [`CapturePipeline::stop`],
//! so once `stop` returns no further frame can be queued even if the device delivers
//! a late callback.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};
use tokio::sync::mpsc;

use super::codec::{AudioFrame, FrameCodec, WIRE_SAMPLE_RATE};
use crate::realtime::SessionId;
use crate::{Error, Result};

/// Callback receiving mono samples and the rate they were captured at
pub type SampleSink = Box<dyn FnMut(&[f32], u32) + Send>;

/// Source of microphone audio
pub trait CaptureDevice: Send {
    /// Open the device and start delivering samples to `sink`
    ///
    /// Returns the device sample rate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the device cannot be opened
    fn open(&mut self, device_id: Option<&str>, sink: SampleSink) -> Result<u32>;

    /// Stop delivering samples
    fn close(&mut self);
}

/// Turning capture on and off on behalf of the resource arbiter
pub trait CaptureControl: Send {
    /// Begin (or continue) sending frames for `session`
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the capture side is unavailable
    fn resume(&mut self, session: &SessionId) -> Result<()>;

    /// Stop sending frames
    fn pause(&mut self);

    /// Whether frames are currently being produced
    fn is_active(&self) -> bool;
}

/// Capture tuning
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Samples per emitted frame, at the device rate
    pub frame_size: usize,
    /// Frames whose peak is below this are dropped
    pub silence_threshold: f32,
    pub wire_rate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_size: 4096,
            silence_threshold: 0.01,
            wire_rate: WIRE_SAMPLE_RATE,
        }
    }
}

/// Peak absolute amplitude
#[must_use]
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0_f32, |acc, s| acc.max(s.abs()))
}

/// Whether a frame is quiet enough to skip
#[must_use]
pub fn is_silent(samples: &[f32], threshold: f32) -> bool {
    peak(samples) < threshold
}

/// Cuts a stream of callbacks into fixed-size frames
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    #[must_use]
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Append samples, returning every frame now complete
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let rest = self.pending.split_off(self.frame_size);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }
}

#[derive(Debug, Default)]
struct Gate {
    open: bool,
    epoch: u64,
    /// Kept across pause and resume so numbering continues within a session
    codec: Option<FrameCodec>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Microphone to wire frames
pub struct CapturePipeline<D> {
    device: D,
    device_id: Option<String>,
    config: CaptureConfig,
    frames: mpsc::Sender<AudioFrame>,
    gate: Arc<Mutex<Gate>>,
    active: bool,
}

impl<D: CaptureDevice> CapturePipeline<D> {
    /// Create a stopped pipeline that will push frames into `frames`
    pub fn new(device: D, config: CaptureConfig, frames: mpsc::Sender<AudioFrame>) -> Self {
        Self {
            device,
            device_id: None,
            config,
            frames,
            gate: Arc::new(Mutex::new(Gate::default())),
            active: false,
        }
    }

    /// Use a specific input device instead of the host default
    #[must_use]
    pub fn with_device_id(mut self, device_id: Option<String>) -> Self {
        self.device_id = device_id;
        self
    }

    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.active
    }

    /// Open the device and start emitting frames tagged with `session_id`
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the device cannot be opened
    pub fn start(&mut self, device_id: Option<&str>, session_id: &SessionId) -> Result<()> {
        if self.active {
            return Ok(());
        }

        let epoch = {
            let mut gate = lock(&self.gate);
            gate.epoch += 1;
            gate.open = true;
            match gate.codec.as_mut() {
                Some(codec) => codec.rebind(session_id),
                None => {
                    gate.codec = Some(FrameCodec::new(session_id.clone(), self.config.wire_rate));
                }
            }
            gate.epoch
        };

        let gate = Arc::clone(&self.gate);
        let frames = self.frames.clone();
        let threshold = self.config.silence_threshold;
        let mut assembler = FrameAssembler::new(self.config.frame_size);
        let session = session_id.clone();

        let sink: SampleSink = Box::new(move |data, device_rate| {
            for frame in assembler.push(data) {
                if is_silent(&frame, threshold) {
                    continue;
                }
                let mut gate = lock(&gate);
                if !gate.open || gate.epoch != epoch {
                    return;
                }
                let Some(encoded) = gate
                    .codec
                    .as_mut()
                    .and_then(|codec| codec.encode(&frame, device_rate))
                else {
                    continue;
                };
                match frames.try_send(encoded) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(dropped)) => {
                        tracing::warn!(
                            session_id = %session,
                            sequence = dropped.sequence(),
                            "capture queue full, dropping frame"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        });

        match self.device.open(device_id, sink) {
            Ok(rate) => {
                self.active = true;
                tracing::debug!(session_id = %session_id, device_rate = rate, "audio capture started");
                Ok(())
            }
            Err(e) => {
                lock(&self.gate).open = false;
                tracing::warn!(session_id = %session_id, error = %e, "audio capture failed to start");
                Err(e)
            }
        }
    }

    /// Close the device; no frame is queued after this returns
    pub fn stop(&mut self) {
        lock(&self.gate).open = false;
        if self.active {
            self.device.close();
            self.active = false;
            tracing::debug!("audio capture stopped");
        }
    }
}

impl<D: CaptureDevice> CaptureControl for CapturePipeline<D> {
    fn resume(&mut self, session: &SessionId) -> Result<()> {
        let device_id = self.device_id.clone();
        self.start(device_id.as_deref(), session)
    }

    fn pause(&mut self) {
        self.stop();
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl<D> Drop for CapturePipeline<D> {
    fn drop(&mut self) {
        lock(&self.gate).open = false;
    }
}

/// cpal input device, downmixed to mono
///
/// The stream is owned by a dedicated thread for the lifetime of one `open`.
#[derive(Default)]
pub struct CpalInput {
    shutdown: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalInput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureDevice for CpalInput {
    fn open(&mut self, device_id: Option<&str>, sink: SampleSink) -> Result<u32> {
        self.close();

        let device_id = device_id.map(str::to_string);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u32>>();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || match build_input(device_id.as_deref(), sink) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let rate = ready_rx
            .recv()
            .map_err(|_| Error::Device("capture thread exited".to_string()))??;

        self.shutdown = Some(shutdown_tx);
        self.thread = Some(thread);
        Ok(rate)
    }

    fn close(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_input(device_id: Option<&str>, mut sink: SampleSink) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = match device_id {
        Some(name) => host
            .input_devices()
            .map_err(|e| Error::Device(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| Error::Device(format!("input device not found: {name}")))?,
        None => host
            .default_input_device()
            .ok_or_else(|| Error::Device("no input device available".to_string()))?,
    };

    let supported = device
        .default_input_config()
        .map_err(|e| Error::Device(e.to_string()))?;
    if supported.sample_format() != SampleFormat::F32 {
        return Err(Error::Device(format!(
            "unsupported input sample format {:?}",
            supported.sample_format()
        )));
    }

    let config = supported.config();
    let channels = usize::from(config.channels).max(1);
    let rate = config.sample_rate.0;
    let mut mono = Vec::new();

    #[allow(clippy::cast_precision_loss)]
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if channels == 1 {
                    sink(data, rate);
                    return;
                }
                mono.clear();
                mono.extend(
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                );
                sink(&mono, rate);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))?;

    stream.play().map_err(|e| Error::Device(e.to_string()))?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = rate,
        channels,
        "audio capture initialized"
    );
    Ok((stream, rate))
}
