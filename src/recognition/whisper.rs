//! OpenAI-compatible cloud transcription
//!
//! Audio is uploaded as a streamed WAV part, so the request body is produced
//! while the utterance is still being pulled. The service answers once, with
//! the final transcript. The response deadline starts when the audio ends,
//! so long utterances are not cut short by their own speaking time.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{RecognitionBackend, RecognitionResult, RecognitionStream};
use crate::audio::streaming_wav_header;
use crate::config::OptionBag;
use crate::utterance::AudioStream;
use crate::{Error, Result};

/// Default API root
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Response from the transcription endpoint
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Validated Whisper options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhisperConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub language: Option<String>,
    pub timeout: Duration,
}

impl WhisperConfig {
    /// Normalize a loose option bag
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `api_key` is missing
    pub fn from_options(options: &OptionBag) -> Result<Self> {
        let api_key = options
            .string("api_key")
            .ok_or_else(|| Error::Config("OpenAI API key required for Whisper".to_string()))?;

        Ok(Self {
            api_key,
            base_url: options
                .string_any(&["base_url", "url"])
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: options.string_or("model", "whisper-1"),
            language: options.string("language"),
            timeout: Duration::from_secs(options.u64_or("timeout", 30)),
        })
    }
}

/// Whisper recognition backend
pub struct WhisperBackend {
    client: reqwest::Client,
    config: WhisperConfig,
}

impl WhisperBackend {
    /// Create a backend from validated options
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: WhisperConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Active options
    #[must_use]
    pub const fn config(&self) -> &WhisperConfig {
        &self.config
    }

    async fn transcribe(&self, audio: AudioStream) -> Result<String> {
        let utterance_id = audio.utterance_id();
        tracing::debug!(utterance_id, model = %self.config.model, "starting Whisper transcription");

        let header = streaming_wav_header(audio.sample_rate(), audio.channels());
        let (audio_done, audio_ended) = oneshot::channel::<()>();
        let body = futures::stream::once(async move { header })
            .chain(audio.map(|chunk| chunk.to_pcm16_le()))
            .chain(futures::stream::once(async move {
                let _ = audio_done.send(());
                Vec::new()
            }))
            .map(Ok::<_, std::io::Error>);

        let file = reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(body))
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| Error::Config(e.to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.config.model.clone())
            .text("response_format", "json");
        if let Some(language) = &self.config.language {
            form = form.text("language", language.clone());
        }

        let request = self
            .client
            .post(format!("{}/audio/transcriptions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .multipart(form);

        let timeout = self.config.timeout;
        let deadline = async move {
            // A dropped sender means the body was abandoned and the request is failing
            let _ = audio_ended.await;
            tokio::time::sleep(timeout).await;
        };

        tokio::select! {
            result = Self::exchange(request, utterance_id) => result,
            () = deadline => {
                tracing::warn!(utterance_id, ?timeout, "Whisper response timed out");
                Err(Error::Timeout {
                    stage: "recognition",
                    elapsed_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    async fn exchange(request: reqwest::RequestBuilder, utterance_id: u64) -> Result<String> {
        let response = request.send().await.map_err(|e| {
            tracing::warn!(utterance_id, error = %e, "Whisper request failed");
            Error::transport(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(utterance_id, status = %status, body = %body, "Whisper API error");
            return Err(Error::transport(format!("Whisper API error {status}: {body}")));
        }

        let result: TranscriptionResponse = response.json().await.map_err(|e| {
            tracing::warn!(utterance_id, error = %e, "failed to parse Whisper response");
            Error::transport(e)
        })?;

        tracing::debug!(utterance_id, chars = result.text.len(), "Whisper transcription complete");
        Ok(result.text.trim().to_string())
    }
}

#[async_trait]
impl RecognitionBackend for WhisperBackend {
    fn name(&self) -> &'static str {
        "whisper"
    }

    async fn recognize(
        &self,
        audio: AudioStream,
        cancel: CancellationToken,
    ) -> Result<RecognitionStream> {
        let text = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            text = self.transcribe(audio) => text?,
        };

        Ok(futures::stream::once(async move { Ok(RecognitionResult::final_text(text)) }).boxed())
    }
}
