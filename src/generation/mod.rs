//! Response generation
//!
//! A [`GenerationBackend`] turns dialogue history into an ordered stream of
//! [`GenerationFragment`]s. Content and tool calls share one stream so their
//! relative order is never lost. [`ResponseDriver`] runs one turn and
//! republishes fragments to the device.

mod driver;
mod history;
mod openai;
mod router;
mod think;

pub use driver::{ResponseDriver, ResponseOutcome};
pub use history::DialogueHistory;
pub use openai::{OpenAiBackend, OpenAiConfig};
pub use router::GenerationRouter;
pub use think::ThinkFilter;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Speaker of a dialogue message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One dialogue message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Call answered by a tool message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    #[must_use]
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::with_role(Role::Tool, content)
        }
    }
}

/// A complete tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, as produced by the model
    pub arguments: String,
}

/// A tool the model may call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments
    #[serde(default = "empty_parameters")]
    pub parameters: serde_json::Value,
}

fn empty_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// One streamed piece of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationFragment {
    /// Text for the device
    Content(String),
    /// A fully assembled tool call
    ToolCall(ToolCall),
}

/// Input to one generation call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// Result of a single-shot generation call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Ordered fragments of one response
pub type FragmentStream = BoxStream<'static, Result<GenerationFragment>>;

/// A language model endpoint
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Whether streaming should be attempted at all
    fn streamable(&self) -> bool {
        true
    }

    /// Start a streaming generation
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be started
    async fn stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream>;

    /// Run a single-shot generation
    ///
    /// # Errors
    ///
    /// Returns error if the call fails or yields nothing usable
    async fn complete(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<Completion>;
}
