//! Voice processing module
//!
//! Handles the local audio path: PCM framing, gapless playback scheduling,
//! microphone capture, and arbitration of the shared device.

mod arbiter;
mod capture;
mod codec;
mod playback;
mod scheduler;
mod wav;

pub use arbiter::{DeviceLease, DeviceSide, ResourceArbiter};
pub use capture::{
    CaptureConfig, CaptureControl, CaptureDevice, CapturePipeline, CpalInput, FrameAssembler,
    SampleSink, is_silent, peak,
};
pub use codec::{
    AudioFrame, FrameCodec, WIRE_SAMPLE_RATE, decode, decode_pcm16, encode_pcm16, rates_differ,
    resample,
};
pub use playback::DeviceOutput;
pub use scheduler::{AudioSink, PlaybackClock, PlaybackScheduler, SchedulerConfig};
pub use wav::{samples_to_wav, write_wav};
