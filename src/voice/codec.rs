//! PCM16 frame codec
//!
//! Converts between the wire layout (16-bit little-endian linear PCM, mono, at the
//! vendor's fixed rate) and normalized `f32` samples at the local device rate.

use bytes::Bytes;

use crate::realtime::SessionId;

/// Sample rate mandated by the upstream realtime endpoint
pub const WIRE_SAMPLE_RATE: u32 = 24_000;

/// Rates closer than this are treated as equal and never resampled
const RATE_EPSILON_HZ: f64 = 1.0;

/// One buffer of wire PCM tagged with its session and position in the stream
///
/// Frames are immutable once built and consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    session_id: SessionId,
    sequence: u64,
    data: Bytes,
}

impl AudioFrame {
    /// Wrap raw wire bytes
    pub fn new(session_id: SessionId, sequence: u64, data: impl Into<Bytes>) -> Self {
        Self {
            session_id,
            sequence,
            data: data.into(),
        }
    }

    /// Session the frame belongs to
    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Monotonic position within the session's stream
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Raw PCM bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of 16-bit samples, counting a trailing odd byte as a padded sample
    #[must_use]
    pub const fn sample_count(&self) -> usize {
        self.data.len().div_ceil(2)
    }

    /// Whether the frame carries no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Take the underlying bytes
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Pack normalized samples as PCM16 little-endian
///
/// Samples are clamped to `[-1.0, 1.0]`; negative values scale by 32768 and positive
/// values by 32767 so both extremes land exactly on the `i16` range.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
        out.extend_from_slice(&(scaled.round() as i16).to_le_bytes());
    }
    out
}

/// Unpack PCM16 little-endian into normalized samples
///
/// A truncated final byte is zero-padded rather than rejected.
#[must_use]
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    let mut samples: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();

    if let [last] = bytes.chunks_exact(2).remainder() {
        samples.push(f32::from(i16::from_le_bytes([*last, 0])) / 32768.0);
    }

    samples
}

/// Whether two rates differ enough to need resampling
#[must_use]
pub fn rates_differ(from_rate: u32, to_rate: u32) -> bool {
    (f64::from(from_rate) - f64::from(to_rate)).abs() > RATE_EPSILON_HZ
}

/// Linear-interpolation resampler
///
/// Output length is `round(len * to / from)`; output sample `i` interpolates between
/// the floor and ceil neighbours of source position `i / ratio`.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 || !rates_differ(from_rate, to_rate)
    {
        return samples.to_vec();
    }

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let target_len = (samples.len() as f64 * ratio).round() as usize;
    let last = samples.len() - 1;

    (0..target_len)
        .map(|i| {
            let position = i as f64 / ratio;
            let lo = (position.floor() as usize).min(last);
            let hi = (lo + 1).min(last);
            let frac = (position - lo as f64) as f32;
            samples[lo] + (samples[hi] - samples[lo]) * frac
        })
        .collect()
}

/// Decode a wire frame into device-rate samples
#[must_use]
pub fn decode(frame: &AudioFrame, wire_rate: u32, device_rate: u32) -> Vec<f32> {
    let samples = decode_pcm16(frame.data());
    resample(&samples, wire_rate, device_rate)
}

/// Per-session codec that stamps frames with increasing sequence numbers
#[derive(Debug, Clone)]
pub struct FrameCodec {
    session_id: SessionId,
    wire_rate: u32,
    next_sequence: u64,
}

impl FrameCodec {
    /// Create a codec for one session's stream
    #[must_use]
    pub const fn new(session_id: SessionId, wire_rate: u32) -> Self {
        Self {
            session_id,
            wire_rate,
            next_sequence: 0,
        }
    }

    /// Wire sample rate this codec targets
    #[must_use]
    pub const fn wire_rate(&self) -> u32 {
        self.wire_rate
    }

    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Encode device samples into the next wire frame
    ///
    /// Returns `None` for empty input; empty frames are dropped, not sent.
    pub fn encode(&mut self, samples: &[f32], device_rate: u32) -> Option<AudioFrame> {
        if samples.is_empty() {
            return None;
        }
        let resampled = resample(samples, device_rate, self.wire_rate);
        let bytes = encode_pcm16(&resampled);
        self.stamp(Bytes::from(bytes))
    }

    /// Tag wire bytes received from the network with the next sequence number
    ///
    /// Returns `None` for empty payloads.
    pub fn stamp(&mut self, data: Bytes) -> Option<AudioFrame> {
        if data.is_empty() {
            return None;
        }
        let frame = AudioFrame::new(self.session_id.clone(), self.next_sequence, data);
        self.next_sequence += 1;
        Some(frame)
    }

    /// Decode a frame into device-rate samples
    #[must_use]
    pub fn decode(&self, frame: &AudioFrame, device_rate: u32) -> Vec<f32> {
        decode(frame, self.wire_rate, device_rate)
    }

    /// Restart numbering, used when the session is replaced
    pub fn reset(&mut self, session_id: SessionId) {
        self.session_id = session_id;
        self.next_sequence = 0;
    }

    /// Point the codec at `session_id`, keeping the numbering if it is unchanged
    pub fn rebind(&mut self, session_id: &SessionId) {
        if self.session_id != *session_id {
            self.reset(session_id.clone());
        }
    }
}
