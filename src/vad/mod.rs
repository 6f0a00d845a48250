//! Voice activity detection
//!
//! Per-frame speech/silence classification plus the segmentation state
//! machine that turns those decisions into utterance boundaries.

mod classifier;
mod segmenter;

pub use classifier::{Classification, DEFAULT_ENERGY_THRESHOLD, EnergyClassifier, SpeechClassifier};
pub use segmenter::{EndReason, SegmentEvent, Segmenter, SegmenterConfig, UtteranceEnd, VadState};

use std::sync::Arc;

use crate::audio::Frame;

/// Classifier and segmenter bound together for one session
pub struct VoiceActivityDetector {
    classifier: Arc<dyn SpeechClassifier>,
    segmenter: Segmenter,
}

impl VoiceActivityDetector {
    /// Create a detector from a classifier and segmentation settings
    #[must_use]
    pub fn new(classifier: Arc<dyn SpeechClassifier>, config: SegmenterConfig) -> Self {
        Self {
            classifier,
            segmenter: Segmenter::new(config),
        }
    }

    /// Classify a frame and advance the segmentation state machine
    pub fn process(&mut self, frame: &Frame) -> (Classification, Option<SegmentEvent>) {
        let classification = self.classifier.classify(frame);
        let event = self.segmenter.push(classification, frame.duration_ms());
        (classification, event)
    }

    /// End the stream, closing any open utterance
    pub fn flush(&mut self) -> Option<SegmentEvent> {
        self.segmenter.flush()
    }

    /// Current segmentation state
    #[must_use]
    pub const fn state(&self) -> VadState {
        self.segmenter.state()
    }

    /// Drop any in-progress utterance and return to silence
    pub fn reset(&mut self) {
        self.segmenter.reset();
    }
}
