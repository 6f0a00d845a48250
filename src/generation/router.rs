//! Generation backend selection

use std::sync::Arc;

use super::{GenerationBackend, OpenAiBackend, OpenAiConfig};
use crate::config::GenerationSettings;
use crate::{Error, Result};

/// Builds the configured generation backend
pub struct GenerationRouter;

impl GenerationRouter {
    /// Providers this router knows how to build
    pub const PROVIDERS: &'static [&'static str] = &["openai", "ollama"];

    /// Build the backend named by `settings.provider`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unknown provider or a missing required
    /// option
    pub fn build(settings: &GenerationSettings) -> Result<Arc<dyn GenerationBackend>> {
        let backend = match settings.provider.as_str() {
            "openai" => OpenAiBackend::new("openai", OpenAiConfig::openai(&settings.options)?)?,
            "ollama" => OpenAiBackend::new("ollama", OpenAiConfig::ollama(&settings.options))?,
            other => {
                tracing::error!(provider = other, "unknown generation provider");
                return Err(Error::Config(format!(
                    "unknown generation provider '{other}' (expected one of: {})",
                    Self::PROVIDERS.join(", ")
                )));
            }
        };

        tracing::debug!(
            provider = backend.name(),
            model = %backend.config().model,
            streamable = backend.config().streamable,
            "generation backend ready"
        );
        Ok(Arc::new(backend))
    }
}
