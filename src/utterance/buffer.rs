//! Bounded utterance buffer
//!
//! Packs frames into `chunk_ms` chunks and queues them for the recognizer.
//! The queue holds at most `capacity_ms` of audio; a recognizer that falls
//! further behind turns into [`Error::Overflow`] instead of unbounded growth.

use tokio::sync::mpsc::{self, error::TrySendError};

use super::{AudioChunk, AudioStream, Utterance, UtteranceStatus};
use crate::audio::Frame;
use crate::config::BufferConfig;
use crate::{Error, Result};

struct OpenUtterance {
    record: Utterance,
    tx: mpsc::Sender<AudioChunk>,
    pending: Vec<f32>,
    pending_ms: u32,
    sample_rate: u32,
    channels: u16,
    next_index: u32,
}

/// Accumulates the frames of at most one open utterance
pub struct UtteranceBuffer {
    config: BufferConfig,
    capacity_chunks: usize,
    next_id: u64,
    current: Option<OpenUtterance>,
}

impl UtteranceBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new(config: BufferConfig) -> Self {
        let chunk_ms = config.chunk_ms.max(1);
        let capacity_chunks = (config.capacity_ms / chunk_ms).max(1) as usize;
        Self {
            config,
            capacity_chunks,
            next_id: 1,
            current: None,
        }
    }

    /// Whether an utterance is open
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Snapshot of the open utterance
    #[must_use]
    pub fn current(&self) -> Option<&Utterance> {
        self.current.as_ref().map(|open| &open.record)
    }

    /// Open a new utterance and return its audio stream
    ///
    /// # Errors
    ///
    /// Returns `Error::Session` if an utterance is already open
    pub fn open(&mut self, sample_rate: u32, channels: u16) -> Result<AudioStream> {
        if let Some(open) = &self.current {
            return Err(Error::Session(format!(
                "utterance {} is still open",
                open.record.id
            )));
        }

        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = mpsc::channel(self.capacity_chunks);
        self.current = Some(OpenUtterance {
            record: Utterance {
                id,
                status: UtteranceStatus::Open,
                first_seq: None,
                last_seq: None,
                frames: 0,
                duration_ms: 0,
            },
            tx,
            pending: Vec::new(),
            pending_ms: 0,
            sample_rate,
            channels,
            next_index: 0,
        });

        tracing::debug!(utterance_id = id, "utterance opened");
        Ok(AudioStream::new(id, sample_rate, channels, rx))
    }

    /// Append a frame to the open utterance
    ///
    /// # Errors
    ///
    /// Returns `Error::Overflow` if the recognizer is too far behind,
    /// `Error::Transport` if the recognizer stopped consuming, and
    /// `Error::Session` if no utterance is open
    pub fn push(&mut self, frame: &Frame) -> Result<()> {
        let chunk_ms = self.config.chunk_ms;
        let capacity_ms = self.config.capacity_ms;
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| Error::Session("no open utterance".to_string()))?;

        // A format change mid-utterance starts a fresh chunk
        if !open.pending.is_empty()
            && (open.sample_rate != frame.sample_rate() || open.channels != frame.channels())
        {
            open.flush(capacity_ms)?;
        }
        open.sample_rate = frame.sample_rate();
        open.channels = frame.channels();

        let record = &mut open.record;
        record.first_seq.get_or_insert(frame.seq());
        record.last_seq = Some(frame.seq());
        record.frames += 1;
        record.duration_ms += u64::from(frame.duration_ms());

        open.pending.extend_from_slice(frame.samples());
        open.pending_ms = open.pending_ms.saturating_add(frame.duration_ms());

        if open.pending_ms >= chunk_ms {
            open.flush(capacity_ms)?;
        }
        Ok(())
    }

    /// End the open utterance, releasing any partial chunk
    ///
    /// Dropping the sender ends the audio stream.
    ///
    /// # Errors
    ///
    /// Returns the flush error if the final chunk cannot be queued; the
    /// utterance is discarded in that case
    pub fn close(&mut self) -> Result<Utterance> {
        let mut open = self
            .current
            .take()
            .ok_or_else(|| Error::Session("no open utterance".to_string()))?;

        if let Err(e) = open.flush(self.config.capacity_ms) {
            open.record.status = UtteranceStatus::Discarded;
            tracing::debug!(utterance_id = open.record.id, error = %e, "final chunk rejected");
            return Err(e);
        }

        open.record.status = UtteranceStatus::Closed;
        tracing::debug!(
            utterance_id = open.record.id,
            frames = open.record.frames,
            duration_ms = open.record.duration_ms,
            "utterance closed"
        );
        Ok(open.record)
    }

    /// Abandon the open utterance without releasing its pending audio
    pub fn discard(&mut self) -> Option<Utterance> {
        let mut open = self.current.take()?;
        open.record.status = UtteranceStatus::Discarded;
        tracing::debug!(utterance_id = open.record.id, "utterance discarded");
        Some(open.record)
    }
}

impl OpenUtterance {
    fn flush(&mut self, capacity_ms: u32) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let chunk = AudioChunk {
            utterance_id: self.record.id,
            index: self.next_index,
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples: std::mem::take(&mut self.pending),
        };
        let chunk_ms = self.pending_ms;
        self.pending_ms = 0;

        match self.tx.try_send(chunk) {
            Ok(()) => {
                self.next_index += 1;
                tracing::trace!(utterance_id = self.record.id, chunk_ms, "chunk queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(Error::Overflow {
                buffered_ms: u64::from(capacity_ms) + u64::from(chunk_ms),
            }),
            Err(TrySendError::Closed(_)) => Err(Error::transport(
                "recognition stopped consuming utterance audio",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::ErrorKind;

    fn config(chunk_ms: u32, capacity_ms: u32) -> BufferConfig {
        BufferConfig {
            chunk_ms,
            capacity_ms,
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, 16_000, 1, vec![0.25; 320])
    }

    #[tokio::test]
    async fn frames_are_packed_into_chunks() {
        let mut buffer = UtteranceBuffer::new(config(60, 1_000));
        let mut stream = buffer.open(16_000, 1).unwrap();

        for seq in 0..7 {
            buffer.push(&frame(seq)).unwrap();
        }
        let utterance = buffer.close().unwrap();
        assert_eq!(utterance.status, UtteranceStatus::Closed);
        assert_eq!(utterance.frames, 7);
        assert_eq!(utterance.duration_ms, 140);
        assert_eq!(utterance.first_seq, Some(0));
        assert_eq!(utterance.last_seq, Some(6));

        let chunks: Vec<AudioChunk> = stream.by_ref().collect().await;
        let sizes: Vec<u64> = chunks.iter().map(AudioChunk::duration_ms).collect();
        assert_eq!(sizes, vec![60, 60, 20]);
        assert_eq!(chunks[2].index, 2);
        assert!(chunks.iter().all(|c| c.utterance_id == utterance.id));
    }

    #[test]
    fn only_one_open_utterance() {
        let mut buffer = UtteranceBuffer::new(config(200, 1_000));
        let _stream = buffer.open(16_000, 1).unwrap();
        assert!(matches!(buffer.open(16_000, 1), Err(Error::Session(_))));

        buffer.discard();
        let next = buffer.open(16_000, 1).unwrap();
        assert_eq!(next.utterance_id(), 2);
    }

    #[test]
    fn slow_consumer_overflows() {
        let mut buffer = UtteranceBuffer::new(config(20, 60));
        let _stream = buffer.open(16_000, 1).unwrap();

        for seq in 0..3 {
            buffer.push(&frame(seq)).unwrap();
        }
        let err = buffer.push(&frame(3)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overflow);
    }

    #[test]
    fn dropped_consumer_is_transport_error() {
        let mut buffer = UtteranceBuffer::new(config(20, 200));
        let stream = buffer.open(16_000, 1).unwrap();
        drop(stream);

        let err = buffer.push(&frame(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn discard_ends_stream_without_pending_audio() {
        let mut buffer = UtteranceBuffer::new(config(200, 1_000));
        let stream = buffer.open(16_000, 1).unwrap();
        buffer.push(&frame(0)).unwrap();

        let record = buffer.discard().unwrap();
        assert_eq!(record.status, UtteranceStatus::Discarded);
        assert!(!buffer.is_open());

        let chunks: Vec<AudioChunk> = stream.collect().await;
        assert!(chunks.is_empty());
    }

    #[test]
    fn push_without_open_utterance_fails() {
        let mut buffer = UtteranceBuffer::new(BufferConfig::default());
        assert!(matches!(buffer.push(&frame(0)), Err(Error::Session(_))));
        assert!(buffer.close().is_err());
    }
}
