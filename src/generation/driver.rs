//! Response driver
//!
//! Runs one dialogue turn: streams the model's response to the transcript
//! and republishes each fragment to the device as it arrives. The turn
//! enters history only once it is answered. A streaming failure that happens before anything reached the
//! device gets exactly one single-shot retry.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{
    ChatMessage, DialogueHistory, GenerationBackend, GenerationFragment, GenerationRequest,
    ToolCall, ToolDefinition,
};
use crate::transport::{DevicePayload, DeviceTransport};
use crate::{Error, Result};

/// What one turn produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseOutcome {
    /// Content published to the device
    pub content: String,
    /// Tool calls published to the device
    pub tool_calls: Vec<ToolCall>,
    /// Fragments handed to the transport
    pub fragments_published: usize,
    /// Whether the single-shot fallback produced this response
    pub fallback_used: bool,
}

/// Drives generation for one session
pub struct ResponseDriver {
    backend: Arc<dyn GenerationBackend>,
    transport: Arc<dyn DeviceTransport>,
    history: DialogueHistory,
    tools: Vec<ToolDefinition>,
}

impl ResponseDriver {
    #[must_use]
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        transport: Arc<dyn DeviceTransport>,
        history: DialogueHistory,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        Self {
            backend,
            transport,
            history,
            tools,
        }
    }

    /// Dialogue so far
    #[must_use]
    pub const fn history(&self) -> &DialogueHistory {
        &self.history
    }

    /// Respond to a final transcript
    ///
    /// On failure, or if the call is dropped mid-turn, history is left as it
    /// was and the device receives no error payload.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the streaming call, or of the fallback
    /// when one was attempted
    pub async fn respond(
        &mut self,
        transcript: &str,
        cancel: &CancellationToken,
    ) -> Result<ResponseOutcome> {
        let user = ChatMessage::user(transcript);
        let request = GenerationRequest {
            messages: self.history.request_with(&user),
            tools: self.tools.clone(),
        };

        let outcome = self.generate(request, cancel).await?;
        self.history.commit_turn(
            user,
            ChatMessage::assistant(outcome.content.clone(), outcome.tool_calls.clone()),
        );
        // End marker is best-effort; the response itself went out
        if let Err(e) = self.transport.publish(DevicePayload::ResponseEnd).await {
            tracing::warn!(error = %e, "failed to publish response end");
        }
        Ok(outcome)
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<ResponseOutcome> {
        let backend = self.backend.name();
        if !self.backend.streamable() {
            return self.single_shot(request, cancel, false).await;
        }

        let mut outcome = ResponseOutcome::default();
        match self.stream(request.clone(), cancel, &mut outcome).await {
            Ok(()) => Ok(outcome),
            Err(e) if outcome.fragments_published == 0 && e.allows_fallback() => {
                tracing::warn!(backend, error = %e, "streaming generation failed, falling back");
                self.single_shot(request, cancel, true).await
            }
            Err(e) => {
                tracing::warn!(
                    backend,
                    error = %e,
                    published = outcome.fragments_published,
                    "streaming generation failed"
                );
                Err(e)
            }
        }
    }

    async fn stream(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
        outcome: &mut ResponseOutcome,
    ) -> Result<()> {
        let mut fragments = self.backend.stream(request, cancel.child_token()).await?;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                next = fragments.next() => next,
            };
            let Some(fragment) = next else {
                break;
            };

            match fragment? {
                GenerationFragment::Content(content) => {
                    outcome.fragments_published += 1;
                    outcome.content.push_str(&content);
                    self.transport
                        .publish(DevicePayload::ResponseText { content })
                        .await?;
                }
                GenerationFragment::ToolCall(call) => {
                    outcome.fragments_published += 1;
                    outcome.tool_calls.push(call.clone());
                    self.transport.publish(call.into()).await?;
                }
            }
        }

        if outcome.fragments_published == 0 {
            return Err(Error::Generation("empty response".to_string()));
        }
        Ok(())
    }

    async fn single_shot(
        &self,
        request: GenerationRequest,
        cancel: &CancellationToken,
        fallback_used: bool,
    ) -> Result<ResponseOutcome> {
        let completion = self.backend.complete(request, cancel.child_token()).await?;

        let mut outcome = ResponseOutcome {
            fallback_used,
            ..ResponseOutcome::default()
        };
        if !completion.content.is_empty() {
            outcome.fragments_published += 1;
            outcome.content.clone_from(&completion.content);
            self.transport
                .publish(DevicePayload::ResponseText {
                    content: completion.content,
                })
                .await?;
        }
        for call in completion.tool_calls {
            outcome.fragments_published += 1;
            outcome.tool_calls.push(call.clone());
            self.transport.publish(call.into()).await?;
        }
        Ok(outcome)
    }
}
