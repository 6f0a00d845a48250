//! Utterance buffering
//!
//! Frames between a segmentation start and end are packed into
//! recognizer-sized chunks and handed off as a single-consumer stream.

mod buffer;
mod preroll;

pub use buffer::UtteranceBuffer;
pub use preroll::PreRoll;

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::audio::f32_to_pcm16_le;

/// Lifecycle of an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UtteranceStatus {
    /// Still receiving frames
    Open,
    /// Ended normally, audio fully released
    Closed,
    /// Abandoned, audio must not be recognized
    Discarded,
}

/// Record of one utterance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Utterance {
    /// Session-scoped, monotonically increasing
    pub id: u64,
    /// Current status
    pub status: UtteranceStatus,
    /// Sequence number of the first frame
    pub first_seq: Option<u64>,
    /// Sequence number of the last frame
    pub last_seq: Option<u64>,
    /// Frames accepted
    pub frames: usize,
    /// Audio accepted
    pub duration_ms: u64,
}

/// A recognizer-sized block of utterance audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Utterance this chunk belongs to
    pub utterance_id: u64,
    /// Position within the utterance, from zero
    pub index: u32,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
    /// Interleaved normalized samples
    pub samples: Vec<f32>,
}

impl AudioChunk {
    /// Encode as little-endian PCM16
    #[must_use]
    pub fn to_pcm16_le(&self) -> Vec<u8> {
        f32_to_pcm16_le(&self.samples)
    }

    /// Playback duration in milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        let frames = self.samples.len() as u64 / u64::from(self.channels.max(1));
        frames * 1000 / u64::from(self.sample_rate.max(1))
    }
}

/// Audio of one utterance, consumed exactly once
///
/// Ends when the utterance closes or is discarded. A discarded utterance's
/// stream ends early; its consumer is cancelled alongside.
pub struct AudioStream {
    utterance_id: u64,
    sample_rate: u32,
    channels: u16,
    inner: ReceiverStream<AudioChunk>,
}

impl AudioStream {
    /// Wrap the receiving half of a chunk channel
    #[must_use]
    pub fn new(
        utterance_id: u64,
        sample_rate: u32,
        channels: u16,
        rx: mpsc::Receiver<AudioChunk>,
    ) -> Self {
        Self {
            utterance_id,
            sample_rate,
            channels,
            inner: ReceiverStream::new(rx),
        }
    }

    /// Utterance this audio belongs to
    #[must_use]
    pub const fn utterance_id(&self) -> u64 {
        self.utterance_id
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
}

impl Stream for AudioStream {
    type Item = AudioChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("utterance_id", &self.utterance_id)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}
