//! Fixed-duration audio frames

use std::sync::Arc;
use std::time::Duration;

/// Default device sample rate (16kHz for speech)
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Default device channel count
pub const DEFAULT_CHANNELS: u16 = 1;

/// An immutable block of normalized samples
///
/// Samples are interleaved when `channels > 1`. Cloning is cheap, the sample
/// storage is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    seq: u64,
    sample_rate: u32,
    channels: u16,
    samples: Arc<[f32]>,
}

impl Frame {
    /// Build a frame, clamping samples into `[-1.0, 1.0]`
    ///
    /// Non-finite samples become silence.
    #[must_use]
    pub fn new(seq: u64, sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        let samples: Arc<[f32]> = samples
            .into_iter()
            .map(|s| if s.is_finite() { s.clamp(-1.0, 1.0) } else { 0.0 })
            .collect();

        Self {
            seq,
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            samples,
        }
    }

    /// Decode a little-endian PCM16 payload into a frame
    #[must_use]
    pub fn from_pcm16_le(seq: u64, sample_rate: u32, channels: u16, bytes: &[u8]) -> Self {
        Self::new(seq, sample_rate, channels, super::pcm16_le_to_f32(bytes))
    }

    /// Sequence number assigned by the producer
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Interleaved samples
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Whether the frame carries no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration of this frame
    #[must_use]
    pub fn duration(&self) -> Duration {
        let per_channel = self.samples.len() as u64 / u64::from(self.channels);
        Duration::from_micros(per_channel * 1_000_000 / u64::from(self.sample_rate))
    }

    /// Playback duration in whole milliseconds
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn duration_ms(&self) -> u32 {
        self.duration().as_millis().min(u128::from(u32::MAX)) as u32
    }

    /// Root-mean-square energy across all channels
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let sum_squares: f32 = self.samples.iter().map(|s| s * s).sum();
        (sum_squares / self.samples.len() as f32).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_from_sample_count() {
        let frame = Frame::new(0, 16_000, 1, vec![0.0; 320]);
        assert_eq!(frame.duration_ms(), 20);

        let stereo = Frame::new(0, 16_000, 2, vec![0.0; 640]);
        assert_eq!(stereo.duration_ms(), 20);
    }

    #[test]
    fn samples_are_clamped() {
        let frame = Frame::new(3, 16_000, 1, vec![2.0, -4.0, f32::NAN, 0.25]);
        assert_eq!(frame.samples(), &[1.0, -1.0, 0.0, 0.25]);
        assert_eq!(frame.seq(), 3);
    }

    #[test]
    fn rms_of_constant_signal() {
        let silence = Frame::new(0, 16_000, 1, vec![0.0; 100]);
        assert!(silence.rms() < 0.001);

        let loud = Frame::new(0, 16_000, 1, vec![0.5; 100]);
        assert!((loud.rms() - 0.5).abs() < 1e-6);
    }
}
