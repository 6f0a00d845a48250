//! Per-frame speech classification

use crate::audio::Frame;

/// Default RMS threshold above which a frame counts as speech
pub const DEFAULT_ENERGY_THRESHOLD: f32 = 0.03;

/// Outcome of classifying a single frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    /// Whether the frame carries speech
    pub is_speech: bool,
    /// Confidence in the decision, `0.0..=1.0`
    pub confidence: f32,
}

impl Classification {
    /// A speech decision with full confidence
    #[must_use]
    pub const fn speech() -> Self {
        Self {
            is_speech: true,
            confidence: 1.0,
        }
    }

    /// A silence decision with full confidence
    #[must_use]
    pub const fn silence() -> Self {
        Self {
            is_speech: false,
            confidence: 1.0,
        }
    }
}

/// Stateless per-frame speech detector
///
/// Runs on the frame-arrival path, so implementations must be cheap and
/// must not block.
pub trait SpeechClassifier: Send + Sync {
    /// Classify one frame
    fn classify(&self, frame: &Frame) -> Classification;
}

/// RMS energy threshold detector
#[derive(Debug, Clone, Copy)]
pub struct EnergyClassifier {
    threshold: f32,
}

impl EnergyClassifier {
    /// Create a detector with the given RMS threshold
    #[must_use]
    pub fn new(threshold: f32) -> Self {
        let threshold = if threshold.is_finite() && threshold > 0.0 {
            threshold
        } else {
            DEFAULT_ENERGY_THRESHOLD
        };
        Self { threshold }
    }

    /// Configured threshold
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_ENERGY_THRESHOLD)
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn classify(&self, frame: &Frame) -> Classification {
        let energy = frame.rms();
        let ratio = energy / self.threshold;
        let is_speech = energy > self.threshold;

        // Confidence grows with distance from the threshold
        let confidence = if is_speech {
            1.0 - 1.0 / ratio
        } else {
            1.0 - ratio
        };

        tracing::trace!(seq = frame.seq(), energy, is_speech, "classified frame");

        Classification {
            is_speech,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}
