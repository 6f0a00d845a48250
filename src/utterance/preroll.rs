//! Audio retained from before an utterance onset

use std::collections::VecDeque;

use crate::audio::Frame;

/// Rolling window of the most recent frames
#[derive(Debug, Clone)]
pub struct PreRoll {
    frames: VecDeque<Frame>,
    held_ms: u32,
    max_ms: u32,
}

impl PreRoll {
    /// Keep at most `max_ms` of audio
    #[must_use]
    pub const fn new(max_ms: u32) -> Self {
        Self {
            frames: VecDeque::new(),
            held_ms: 0,
            max_ms,
        }
    }

    /// Add a frame, evicting the oldest ones beyond the window
    pub fn push(&mut self, frame: Frame) {
        if self.max_ms == 0 {
            return;
        }

        self.held_ms = self.held_ms.saturating_add(frame.duration_ms());
        self.frames.push_back(frame);

        while self.held_ms > self.max_ms {
            let Some(oldest) = self.frames.pop_front() else {
                break;
            };
            self.held_ms = self.held_ms.saturating_sub(oldest.duration_ms());
        }
    }

    /// Take every held frame, oldest first
    pub fn drain(&mut self) -> Vec<Frame> {
        self.held_ms = 0;
        self.frames.drain(..).collect()
    }

    /// Drop held audio
    pub fn clear(&mut self) {
        self.frames.clear();
        self.held_ms = 0;
    }

    /// Audio currently held
    #[must_use]
    pub const fn held_ms(&self) -> u32 {
        self.held_ms
    }

    /// Frames currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, 16_000, 1, vec![0.0; 320])
    }

    #[test]
    fn keeps_most_recent_window() {
        let mut preroll = PreRoll::new(100);
        for seq in 0..10 {
            preroll.push(frame(seq));
        }
        assert_eq!(preroll.held_ms(), 100);
        let seqs: Vec<u64> = preroll.drain().iter().map(Frame::seq).collect();
        assert_eq!(seqs, vec![5, 6, 7, 8, 9]);
        assert!(preroll.is_empty());
        assert_eq!(preroll.held_ms(), 0);
    }

    #[test]
    fn zero_window_holds_nothing() {
        let mut preroll = PreRoll::new(0);
        preroll.push(frame(0));
        assert!(preroll.is_empty());
    }
}
