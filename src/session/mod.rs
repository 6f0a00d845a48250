//! Device sessions
//!
//! One [`SessionCoordinator`] task per connected device wires
//! VAD → utterance buffer → recognition → response driver and owns
//! cancellation and timeout policy. [`SessionManager`] is the
//! process-scoped registry that creates and tears down coordinators.

mod context;
mod coordinator;
mod manager;

pub use context::SessionContext;
pub use coordinator::{SessionCoordinator, SessionParts};
pub use manager::{BackendProvider, RouterBackends, SessionHandle, SessionManager};

use serde::Serialize;

use crate::ErrorKind;
use crate::utterance::Utterance;
use crate::vad::SegmentEvent;

/// Lifecycle of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, not yet listening
    Idle,
    /// Listening for the next utterance
    AwaitingUtterance,
    /// An utterance is being recognized
    Recognizing,
    /// A response is being generated
    Generating,
    /// Torn down
    Closed,
}

impl SessionState {
    /// Whether the pipeline allows moving from `self` to `next`
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::AwaitingUtterance)
                | (Self::AwaitingUtterance, Self::Recognizing)
                | (Self::Recognizing, Self::Generating | Self::AwaitingUtterance)
                | (Self::Generating, Self::AwaitingUtterance)
                | (
                    Self::Idle | Self::AwaitingUtterance | Self::Recognizing | Self::Generating,
                    Self::Closed
                )
        )
    }
}

/// Pipeline stage run as a background task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Recognition,
    Generation,
}

impl Stage {
    /// Name used in logs and timeout errors
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Recognition => "recognition",
            Self::Generation => "generation",
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Disconnect or explicit cancellation
    Cancelled,
    /// The frame source ran dry
    EndOfStream,
    /// No speech for the idle timeout
    Idle,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::EndOfStream => write!(f, "end_of_stream"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// Control messages from the device edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Drop the open utterance and cancel the running stage
    Abort,
}

/// Observable session milestones
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Utterance boundary from the segmenter (starts and ends only)
    Segmentation { segment: SegmentEvent },
    UtteranceOpened { utterance_id: u64 },
    UtteranceClosed { utterance: Utterance },
    /// Audio dropped; `cause` is empty for utterances too short to keep
    UtteranceDiscarded {
        utterance: Utterance,
        cause: Option<ErrorKind>,
    },
    /// Speech onset refused because the previous utterance is still in flight
    UtteranceRejected { state: SessionState },
    PartialTranscript { utterance_id: u64, text: String },
    FinalTranscript { utterance_id: u64, text: String },
    StageFailed { stage: Stage, kind: ErrorKind },
    ResponseCompleted {
        utterance_id: u64,
        fragments: usize,
        fallback_used: bool,
    },
    Closed { reason: CloseReason },
}

/// Per-session counters, returned when the session ends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub frames: u64,
    pub utterances: u64,
    pub rejected: u64,
    pub discarded: u64,
    pub transcripts: u64,
    pub empty_transcripts: u64,
    pub recognition_failures: u64,
    pub responses: u64,
    pub generation_failures: u64,
    pub timeouts: u64,
    pub close_reason: Option<CloseReason>,
}
