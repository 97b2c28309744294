//! WAV encoding for recorded audio

use std::path::Path;

use super::codec::encode_pcm16;
use crate::{Error, Result};

fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn write_samples<W>(writer: &mut hound::WavWriter<W>, samples: &[f32]) -> Result<()>
where
    W: std::io::Write + std::io::Seek,
{
    // Same quantization as the wire codec
    for pair in encode_pcm16(samples).chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
            .map_err(|e| Error::Audio(e.to_string()))?;
    }
    Ok(())
}

/// Convert f32 samples to in-memory WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec(sample_rate))
            .map_err(|e| Error::Audio(e.to_string()))?;
        write_samples(&mut writer, samples)?;
        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Write f32 samples to a WAV file at `path`
///
/// # Errors
///
/// Returns error if the file cannot be created or written
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let mut writer = hound::WavWriter::create(path, wav_spec(sample_rate))
        .map_err(|e| Error::Audio(e.to_string()))?;
    write_samples(&mut writer, samples)?;
    writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    tracing::debug!(path = %path.display(), samples = samples.len(), "wav written");
    Ok(())
}
