//! Speech recognition
//!
//! Every engine implements [`RecognitionBackend`]: it pulls an
//! [`AudioStream`] and yields partial results followed by at most one final
//! result. [`RecognitionRouter`] picks the engine from configuration.

mod funasr;
mod router;
mod whisper;

pub use funasr::{FunAsrBackend, FunAsrConfig};
pub use router::RecognitionRouter;
pub use whisper::{WhisperBackend, WhisperConfig};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::utterance::AudioStream;

/// One transcript update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResult {
    /// Transcript so far
    pub text: String,
    /// Authoritative, no further results follow
    pub is_final: bool,
    /// Engine confidence, when reported
    pub confidence: Option<f32>,
}

impl RecognitionResult {
    /// A non-final result
    #[must_use]
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            confidence: None,
        }
    }

    /// The final result
    #[must_use]
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            confidence: None,
        }
    }
}

/// Ordered transcript updates for one utterance
pub type RecognitionStream = BoxStream<'static, Result<RecognitionResult>>;

/// A speech recognition engine
///
/// Implementations own their connection for the duration of one call. When
/// `cancel` fires they must release it promptly. A lower-level failure is
/// reported as an error item, never as a final result.
#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &'static str;

    /// Recognize one utterance
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be reached
    async fn recognize(
        &self,
        audio: AudioStream,
        cancel: CancellationToken,
    ) -> Result<RecognitionStream>;
}

/// End a result stream after its first final result or error
///
/// Engines that keep talking after finishing cannot break the
/// single-final-result contract through this wrapper.
#[must_use]
pub fn guard_finality(stream: RecognitionStream) -> RecognitionStream {
    stream
        .scan(false, |done, item| {
            if *done {
                return futures::future::ready(None);
            }
            *done = match &item {
                Ok(result) => result.is_final,
                Err(_) => true,
            };
            futures::future::ready(Some(item))
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn stream_stops_after_final() {
        let items = vec![
            Ok(RecognitionResult::partial("hel")),
            Ok(RecognitionResult::final_text("hello")),
            Ok(RecognitionResult::partial("late")),
            Ok(RecognitionResult::final_text("again")),
        ];
        let results: Vec<_> = guard_finality(futures::stream::iter(items).boxed())
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        let finals = results
            .iter()
            .filter(|r| r.as_ref().is_ok_and(|r| r.is_final))
            .count();
        assert_eq!(finals, 1);
    }

    #[tokio::test]
    async fn stream_stops_after_error() {
        let items = vec![
            Ok(RecognitionResult::partial("hel")),
            Err(Error::transport("reset")),
            Ok(RecognitionResult::final_text("made up")),
        ];
        let results: Vec<_> = guard_finality(futures::stream::iter(items).boxed())
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());
    }
}
