//! PCM conversion and WAV helpers

use std::path::Path;

use super::Frame;
use crate::{Error, Result};

/// Decode little-endian signed 16-bit PCM into normalized samples
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn pcm16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Encode normalized samples as little-endian signed 16-bit PCM
#[must_use]
pub fn f32_to_pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Convert f32 [-1.0, 1.0] to i16
        #[allow(clippy::cast_possible_truncation)]
        let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&sample_i16.to_le_bytes());
    }
    out
}

/// RIFF/WAVE header for a PCM16 stream of unknown length
///
/// Size fields are set to `u32::MAX`, the usual marker for a streamed WAV
/// whose total length is not known when the header goes out.
#[must_use]
pub fn streaming_wav_header(sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let block_align = channels * (bits_per_sample / 8);
    let byte_rate = sample_rate * u32::from(block_align);

    let mut header = Vec::with_capacity(44);
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&u32::MAX.to_le_bytes());
    header.extend_from_slice(b"WAVE");
    header.extend_from_slice(b"fmt ");
    header.extend_from_slice(&16u32.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes());
    header.extend_from_slice(&channels.to_le_bytes());
    header.extend_from_slice(&sample_rate.to_le_bytes());
    header.extend_from_slice(&byte_rate.to_le_bytes());
    header.extend_from_slice(&block_align.to_le_bytes());
    header.extend_from_slice(&bits_per_sample.to_le_bytes());
    header.extend_from_slice(b"data");
    header.extend_from_slice(&u32::MAX.to_le_bytes());
    header
}

/// Read a WAV file and slice it into frames of `frame_ms`
///
/// # Errors
///
/// Returns error if the file cannot be opened or decoded
pub fn read_wav_frames(path: &Path, frame_ms: u32) -> Result<Vec<Frame>> {
    let mut reader = hound::WavReader::open(path).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        hound::SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(e.to_string()))?
        }
    };

    let per_frame = (spec.sample_rate as usize * usize::from(spec.channels) * frame_ms as usize)
        / 1000;
    if per_frame == 0 {
        return Err(Error::Audio(format!("frame of {frame_ms}ms holds no samples")));
    }

    tracing::debug!(
        path = %path.display(),
        sample_rate = spec.sample_rate,
        channels = spec.channels,
        samples = samples.len(),
        "decoded wav file"
    );

    Ok(samples
        .chunks(per_frame)
        .enumerate()
        .map(|(seq, chunk)| Frame::new(seq as u64, spec.sample_rate, spec.channels, chunk.to_vec()))
        .collect())
}
