//! Utterance segmentation state machine
//!
//! Consumes per-frame classifications and decides where utterances begin
//! and end. Windows are measured in milliseconds of audio so the machine is
//! independent of frame size. The machine is pure: identical input always
//! yields identical events.

use crate::config::VadConfig;

/// Segmentation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VadState {
    /// No utterance open
    Silence,
    /// Utterance open, last frame was speech
    SpeechActive,
    /// Utterance open, waiting to see if the pause is the end
    TrailingSilence,
}

/// Why an utterance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// End window of silence elapsed
    TrailingSilence,
    /// Hit the utterance duration ceiling
    MaxDuration,
    /// Input stream ended mid-utterance
    Flushed,
}

/// Summary attached to an utterance end
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct UtteranceEnd {
    /// What closed the utterance
    pub reason: EndReason,
    /// Milliseconds classified as speech
    pub speech_ms: u32,
    /// Total milliseconds from onset to end, pauses included
    pub total_ms: u32,
    /// Whether the utterance met the minimum viable speech duration
    pub viable: bool,
}

/// Segmentation event emitted by [`Segmenter::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SegmentEvent {
    /// Onset window satisfied, utterance opens with this frame
    Start,
    /// Frame belongs to the open utterance
    Continue,
    /// Frame closes the open utterance
    End(UtteranceEnd),
}

/// Segmentation windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmenterConfig {
    /// Consecutive speech required to open an utterance
    pub onset_ms: u32,
    /// Consecutive silence required to close an utterance
    pub end_window_ms: u32,
    /// Speech below this marks the utterance as not viable
    pub min_utterance_ms: u32,
    /// Hard ceiling on utterance length
    pub max_utterance_ms: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self::from(&VadConfig::default())
    }
}

impl From<&VadConfig> for SegmenterConfig {
    fn from(vad: &VadConfig) -> Self {
        Self {
            onset_ms: vad.onset_ms,
            end_window_ms: vad.end_window_ms,
            min_utterance_ms: vad.min_utterance_ms,
            max_utterance_ms: vad.max_utterance_ms,
        }
    }
}

/// Segmentation state machine
#[derive(Debug, Clone)]
pub struct Segmenter {
    config: SegmenterConfig,
    state: VadState,
    speech_run_ms: u32,
    silence_run_ms: u32,
    speech_ms: u32,
    total_ms: u32,
}

impl Segmenter {
    /// Create a segmenter in the `Silence` state
    #[must_use]
    pub const fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            state: VadState::Silence,
            speech_run_ms: 0,
            silence_run_ms: 0,
            speech_ms: 0,
            total_ms: 0,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> VadState {
        self.state
    }

    /// Active windows
    #[must_use]
    pub const fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Feed one frame's decision
    ///
    /// Returns `None` while no utterance is open and the onset window is not
    /// yet satisfied.
    pub fn push(&mut self, decision: super::Classification, frame_ms: u32) -> Option<SegmentEvent> {
        match self.state {
            VadState::Silence => {
                if !decision.is_speech {
                    self.speech_run_ms = 0;
                    return None;
                }

                self.speech_run_ms = self.speech_run_ms.saturating_add(frame_ms);
                if self.speech_run_ms < self.config.onset_ms.max(1) {
                    return None;
                }

                // The onset run becomes the head of the utterance
                self.state = VadState::SpeechActive;
                self.speech_ms = self.speech_run_ms;
                self.total_ms = self.speech_run_ms;
                self.speech_run_ms = 0;
                self.silence_run_ms = 0;
                tracing::debug!(onset_ms = self.speech_ms, "utterance start");

                if self.total_ms >= self.config.max_utterance_ms {
                    return Some(self.end(EndReason::MaxDuration));
                }
                Some(SegmentEvent::Start)
            }
            VadState::SpeechActive | VadState::TrailingSilence => {
                self.total_ms = self.total_ms.saturating_add(frame_ms);

                if decision.is_speech {
                    if self.state == VadState::TrailingSilence {
                        tracing::trace!(paused_ms = self.silence_run_ms, "speech resumed");
                    }
                    self.state = VadState::SpeechActive;
                    self.speech_ms = self.speech_ms.saturating_add(frame_ms);
                    self.silence_run_ms = 0;
                } else {
                    self.state = VadState::TrailingSilence;
                    self.silence_run_ms = self.silence_run_ms.saturating_add(frame_ms);
                    if self.silence_run_ms >= self.config.end_window_ms {
                        return Some(self.end(EndReason::TrailingSilence));
                    }
                }

                if self.total_ms >= self.config.max_utterance_ms {
                    return Some(self.end(EndReason::MaxDuration));
                }
                Some(SegmentEvent::Continue)
            }
        }
    }

    /// Close the open utterance at end of input
    pub fn flush(&mut self) -> Option<SegmentEvent> {
        self.speech_run_ms = 0;
        match self.state {
            VadState::Silence => None,
            VadState::SpeechActive | VadState::TrailingSilence => {
                Some(self.end(EndReason::Flushed))
            }
        }
    }

    /// Abandon any open utterance without emitting an end
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.speech_run_ms = 0;
        self.silence_run_ms = 0;
        self.speech_ms = 0;
        self.total_ms = 0;
    }

    fn end(&mut self, reason: EndReason) -> SegmentEvent {
        let end = UtteranceEnd {
            reason,
            speech_ms: self.speech_ms,
            total_ms: self.total_ms,
            viable: self.speech_ms >= self.config.min_utterance_ms,
        };
        tracing::debug!(
            reason = ?end.reason,
            speech_ms = end.speech_ms,
            total_ms = end.total_ms,
            viable = end.viable,
            "utterance end"
        );
        self.reset();
        SegmentEvent::End(end)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Classification;
    use super::*;

    const FRAME_MS: u32 = 20;

    fn config() -> SegmenterConfig {
        SegmenterConfig {
            onset_ms: 200,
            end_window_ms: 800,
            min_utterance_ms: 100,
            max_utterance_ms: 30_000,
        }
    }

    fn feed(seg: &mut Segmenter, speech: bool, ms: u32) -> Vec<SegmentEvent> {
        let decision = if speech {
            Classification::speech()
        } else {
            Classification::silence()
        };
        (0..ms / FRAME_MS)
            .filter_map(|_| seg.push(decision, FRAME_MS))
            .collect()
    }

    fn ends(events: &[SegmentEvent]) -> Vec<UtteranceEnd> {
        events
            .iter()
            .filter_map(|e| match e {
                SegmentEvent::End(end) => Some(*end),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn short_bursts_never_start() {
        let mut seg = Segmenter::new(config());
        for _ in 0..50 {
            assert!(feed(&mut seg, true, 180).is_empty());
            assert!(feed(&mut seg, false, 20).is_empty());
        }
        assert_eq!(seg.state(), VadState::Silence);
    }

    #[test]
    fn onset_then_end_window() {
        let mut seg = Segmenter::new(config());
        let mut events = feed(&mut seg, true, 300);
        assert_eq!(events.first(), Some(&SegmentEvent::Start));
        assert_eq!(seg.state(), VadState::SpeechActive);

        events.extend(feed(&mut seg, false, 900));
        let ends = ends(&events);
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].reason, EndReason::TrailingSilence);
        assert_eq!(ends[0].speech_ms, 300);
        assert_eq!(ends[0].total_ms, 1100);
        assert!(ends[0].viable);
        assert_eq!(seg.state(), VadState::Silence);
    }

    #[test]
    fn short_pause_does_not_split() {
        let mut seg = Segmenter::new(config());
        let mut events = feed(&mut seg, true, 400);
        events.extend(feed(&mut seg, false, 500));
        assert_eq!(seg.state(), VadState::TrailingSilence);
        events.extend(feed(&mut seg, true, 400));
        assert_eq!(seg.state(), VadState::SpeechActive);
        events.extend(feed(&mut seg, false, 800));

        let starts = events.iter().filter(|e| **e == SegmentEvent::Start).count();
        assert_eq!(starts, 1);
        assert_eq!(ends(&events).len(), 1);
        assert_eq!(ends(&events)[0].speech_ms, 800);
    }

    #[test]
    fn max_duration_forces_end() {
        let mut seg = Segmenter::new(SegmenterConfig {
            max_utterance_ms: 1_000,
            ..config()
        });
        let events = feed(&mut seg, true, 1_000);
        let ends = ends(&events);
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].reason, EndReason::MaxDuration);
        assert_eq!(ends[0].total_ms, 1_000);
    }

    #[test]
    fn below_minimum_is_not_viable() {
        let mut seg = Segmenter::new(SegmenterConfig {
            onset_ms: 40,
            min_utterance_ms: 100,
            ..config()
        });
        let mut events = feed(&mut seg, true, 60);
        events.extend(feed(&mut seg, false, 800));
        let ends = ends(&events);
        assert_eq!(ends.len(), 1);
        assert!(!ends[0].viable);
    }

    #[test]
    fn flush_closes_open_utterance() {
        let mut seg = Segmenter::new(config());
        feed(&mut seg, true, 300);
        match seg.flush() {
            Some(SegmentEvent::End(end)) => assert_eq!(end.reason, EndReason::Flushed),
            other => panic!("expected flushed end, got {other:?}"),
        }
        assert!(seg.flush().is_none());
    }

    #[test]
    fn replay_is_deterministic() {
        let pattern = [(true, 260), (false, 300), (true, 100), (false, 820), (true, 40)];
        let run = || {
            let mut seg = Segmenter::new(config());
            pattern
                .iter()
                .flat_map(|&(speech, ms)| feed(&mut seg, speech, ms))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
