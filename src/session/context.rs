//! Per-session mutable state

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{SessionReport, SessionState};
use crate::config::Config;
use crate::utterance::{PreRoll, UtteranceBuffer};
use crate::vad::{SegmenterConfig, SpeechClassifier, VadState, VoiceActivityDetector};

/// Everything a coordinator mutates while frames flow
///
/// Owned by exactly one coordinator task, so nothing here is shared.
pub struct SessionContext {
    /// Unique per connection
    pub session_id: String,
    /// Device this session serves
    pub device_id: String,
    /// When the session was created
    pub started_at: DateTime<Utc>,
    /// Current lifecycle state
    pub state: SessionState,
    /// Classifier plus segmenter
    pub vad: VoiceActivityDetector,
    /// Audio of the open utterance
    pub buffer: UtteranceBuffer,
    /// Frames heard before the onset
    pub preroll: PreRoll,
    /// Root of every stage token
    pub cancel: CancellationToken,
    /// Swallowing the rest of an utterance that will not be recognized
    pub rejecting: bool,
    /// Last speech frame or completed stage
    pub last_activity: Instant,
    /// Running counters
    pub report: SessionReport,
}

impl SessionContext {
    /// Fresh context for `device_id`
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        config: &Config,
        classifier: Arc<dyn SpeechClassifier>,
    ) -> Self {
        let vad = config.vad;
        Self {
            session_id: Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            started_at: Utc::now(),
            state: SessionState::Idle,
            vad: VoiceActivityDetector::new(classifier, SegmenterConfig::from(&vad)),
            buffer: UtteranceBuffer::new(config.buffer),
            // The onset run always has to fit, whatever the configured pre-roll
            preroll: PreRoll::new(vad.preroll_ms.max(vad.onset_ms)),
            cancel: CancellationToken::new(),
            rejecting: false,
            last_activity: Instant::now(),
            report: SessionReport::default(),
        }
    }

    /// Move to `to`, returning the previous state
    ///
    /// Transitions the pipeline does not allow are refused and logged.
    pub fn transition(&mut self, to: SessionState) -> Option<SessionState> {
        let from = self.state;
        if from == to {
            return None;
        }
        if !from.can_transition_to(to) {
            tracing::warn!(
                session_id = %self.session_id,
                from = ?from,
                to = ?to,
                "refused session state transition"
            );
            return None;
        }

        self.state = to;
        if to == SessionState::AwaitingUtterance {
            self.last_activity = Instant::now();
        }
        tracing::debug!(session_id = %self.session_id, from = ?from, to = ?to, "session state");
        Some(from)
    }

    /// Whether the segmenter is inside an utterance
    #[must_use]
    pub const fn in_speech(&self) -> bool {
        !matches!(self.vad.state(), VadState::Silence)
    }
}
