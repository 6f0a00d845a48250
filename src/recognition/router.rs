//! Recognition backend selection

use std::sync::Arc;

use super::{FunAsrBackend, FunAsrConfig, RecognitionBackend, WhisperBackend, WhisperConfig};
use crate::config::RecognitionSettings;
use crate::{Error, Result};

/// Builds the configured recognition backend
pub struct RecognitionRouter;

impl RecognitionRouter {
    /// Providers this router knows how to build
    pub const PROVIDERS: &'static [&'static str] = &["funasr", "whisper"];

    /// Build the backend named by `settings.provider`
    ///
    /// Loose options are normalized here, once; missing or mistyped optional
    /// values fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unknown provider or a missing required
    /// option
    pub fn build(settings: &RecognitionSettings) -> Result<Arc<dyn RecognitionBackend>> {
        let backend: Arc<dyn RecognitionBackend> = match settings.provider.as_str() {
            "funasr" => Arc::new(FunAsrBackend::new(FunAsrConfig::from_options(&settings.options))),
            "whisper" => Arc::new(WhisperBackend::new(WhisperConfig::from_options(
                &settings.options,
            )?)?),
            other => {
                tracing::error!(provider = other, "unknown recognition provider");
                return Err(Error::Config(format!(
                    "unknown recognition provider '{other}' (expected one of: {})",
                    Self::PROVIDERS.join(", ")
                )));
            }
        };

        tracing::debug!(provider = backend.name(), "recognition backend ready");
        Ok(backend)
    }
}
