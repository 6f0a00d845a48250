//! OpenAI-compatible chat completions
//!
//! Serves both the hosted API and local OpenAI-compatible servers such as
//! Ollama. Streaming uses server-sent events: `data:` lines carrying JSON
//! deltas, terminated by `data: [DONE]`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{
    ChatMessage, Completion, FragmentStream, GenerationBackend, GenerationFragment,
    GenerationRequest, Role, ThinkFilter, ToolCall, ToolDefinition,
};
use crate::config::OptionBag;
use crate::{Error, Result};

/// Hosted OpenAI API root
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Local Ollama OpenAI-compatible root
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

/// Validated generation options
#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub streamable: bool,
    pub connect_timeout: Duration,
}

impl OpenAiConfig {
    /// Options for the hosted API
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `api_key` is missing
    pub fn openai(options: &OptionBag) -> Result<Self> {
        let config = Self::from_options(options, OPENAI_BASE_URL, "gpt-4o-mini");
        if config.api_key.is_none() {
            return Err(Error::Config(
                "OpenAI API key required for generation".to_string(),
            ));
        }
        Ok(config)
    }

    /// Options for a local Ollama server
    #[must_use]
    pub fn ollama(options: &OptionBag) -> Self {
        Self::from_options(options, OLLAMA_BASE_URL, "llama3.2")
    }

    fn from_options(options: &OptionBag, default_base_url: &str, default_model: &str) -> Self {
        let max_tokens = u32::try_from(options.u64_or("max_tokens", 500)).unwrap_or(500);
        Self {
            api_key: options.string("api_key"),
            base_url: options
                .string_any(&["base_url", "url"])
                .unwrap_or_else(|| default_base_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: options
                .string_any(&["model_name", "model"])
                .unwrap_or_else(|| default_model.to_string()),
            max_tokens,
            temperature: options.f64_opt("temperature"),
            streamable: options.bool_or("streamable", true),
            connect_timeout: Duration::from_secs(options.u64_or("connect_timeout", 10)),
        }
    }
}

// Wire types

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize)]
struct WireToolCall<'a> {
    id: &'a str,
    r#type: &'static str,
    function: WireFunctionCall<'a>,
}

#[derive(Serialize)]
struct WireFunctionCall<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Serialize)]
struct WireTool<'a> {
    r#type: &'static str,
    function: &'a ToolDefinition,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(message: &'a ChatMessage) -> Self {
        Self {
            role: message.role,
            content: &message.content,
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: &call.id,
                    r#type: "function",
                    function: WireFunctionCall {
                        name: &call.name,
                        arguments: &call.arguments,
                    },
                })
                .collect(),
            tool_call_id: message.tool_call_id.as_deref(),
        }
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct Delta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Deserialize)]
struct CompletionToolCall {
    #[serde(default)]
    id: String,
    function: CompletionFunction,
}

#[derive(Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Tool call assembled from streaming deltas
#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Assembles tool-call deltas by index
///
/// Providers stream calls one index at a time, so a call is complete once a
/// higher index appears or the choice finishes.
#[derive(Debug, Default)]
struct ToolCallAssembler {
    pending: BTreeMap<u32, PendingToolCall>,
}

impl ToolCallAssembler {
    fn apply(&mut self, delta: ToolCallDelta) -> Vec<ToolCall> {
        let ready = self.take_below(delta.index);

        let call = self.pending.entry(delta.index).or_default();
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            call.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                call.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                call.arguments.push_str(&arguments);
            }
        }
        ready
    }

    fn finish(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .filter_map(|(i, call)| complete(i, call))
            .collect()
    }

    fn take_below(&mut self, index: u32) -> Vec<ToolCall> {
        let rest = self.pending.split_off(&index);
        std::mem::replace(&mut self.pending, rest)
            .into_iter()
            .filter_map(|(i, call)| complete(i, call))
            .collect()
    }
}

fn complete(index: u32, call: PendingToolCall) -> Option<ToolCall> {
    if call.name.is_empty() {
        tracing::warn!(index, "dropping tool call without a name");
        return None;
    }
    Some(ToolCall {
        id: if call.id.is_empty() {
            format!("call_{index}")
        } else {
            call.id
        },
        name: call.name,
        arguments: if call.arguments.trim().is_empty() {
            "{}".to_string()
        } else {
            call.arguments
        },
    })
}

/// Parses SSE bytes into fragments
#[derive(Default)]
struct SseDecoder {
    line: Vec<u8>,
    think: ThinkFilter,
    tools: ToolCallAssembler,
    finished: bool,
}

impl SseDecoder {
    /// Feed raw bytes; fragments go to `out`
    fn feed(&mut self, bytes: &[u8], out: &mut Vec<Result<GenerationFragment>>) {
        for &byte in bytes {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                self.line_complete(&String::from_utf8_lossy(&line), out);
            } else {
                self.line.push(byte);
            }
        }
    }

    fn line_complete(&mut self, line: &str, out: &mut Vec<Result<GenerationFragment>>) {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim_start();

        if data == "[DONE]" {
            self.finish(out);
            return;
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable stream chunk");
                return;
            }
        };

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                let visible = self.think.push(&content);
                if !visible.is_empty() {
                    out.push(Ok(GenerationFragment::Content(visible)));
                }
            }
            for delta in choice.delta.tool_calls {
                out.extend(
                    self.tools
                        .apply(delta)
                        .into_iter()
                        .map(|c| Ok(GenerationFragment::ToolCall(c))),
                );
            }
            if choice.finish_reason.is_some() {
                self.finish(out);
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<Result<GenerationFragment>>) {
        let tail = self.think.finish();
        if !tail.is_empty() {
            out.push(Ok(GenerationFragment::Content(tail)));
        }
        out.extend(
            self.tools
                .finish()
                .into_iter()
                .map(|c| Ok(GenerationFragment::ToolCall(c))),
        );
        self.finished = true;
    }
}

/// OpenAI-compatible generation backend
pub struct OpenAiBackend {
    name: &'static str,
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiBackend {
    /// Create a backend
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(name: &'static str, config: OpenAiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            name,
            client,
            config,
        })
    }

    /// Active options
    #[must_use]
    pub const fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    async fn send(&self, request: &GenerationRequest, stream: bool) -> Result<reqwest::Response> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: request.messages.iter().map(WireMessage::from).collect(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream,
            tools: request
                .tools
                .iter()
                .map(|function| WireTool {
                    r#type: "function",
                    function,
                })
                .collect(),
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(backend = self.name, error = %e, "chat request failed");
            Error::transport(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(backend = self.name, status = %status, body = %body, "chat API error");
            return Err(Error::Generation(format!("chat API error {status}: {body}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn streamable(&self) -> bool {
        self.config.streamable
    }

    async fn stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream> {
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            response = self.send(&request, true) => response?,
        };

        let (tx, rx) = mpsc::channel(32);
        let backend = self.name;
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            let mut out = Vec::new();

            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!(backend, "generation stream cancelled");
                        return;
                    }
                    next = bytes.next() => next,
                };

                let ended = next.is_none();
                match next {
                    Some(Ok(chunk)) => decoder.feed(&chunk, &mut out),
                    Some(Err(e)) => {
                        tracing::warn!(backend, error = %e, "generation stream failed");
                        out.push(Err(Error::transport(e)));
                    }
                    None if !decoder.finished => {
                        out.push(Err(Error::transport("stream ended before completion")));
                    }
                    None => {}
                }

                let failed = out.iter().any(Result::is_err);
                for item in out.drain(..) {
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
                if failed || ended || decoder.finished {
                    return;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn complete(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<Completion> {
        let call = async {
            let response = self.send(&request, false).await?;
            let parsed: CompletionResponse = response.json().await.map_err(Error::transport)?;
            Ok::<_, Error>(parsed)
        };
        let parsed = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            parsed = call => parsed?,
        };

        let message = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Generation("completion has no choices".to_string()))?
            .message;

        let content = ThinkFilter::strip(message.content.as_deref().unwrap_or_default())
            .trim()
            .to_string();
        let tool_calls: Vec<ToolCall> = message
            .tool_calls
            .into_iter()
            .enumerate()
            .filter_map(|(i, call)| {
                complete(
                    u32::try_from(i).unwrap_or(u32::MAX),
                    PendingToolCall {
                        id: call.id,
                        name: call.function.name,
                        arguments: call.function.arguments,
                    },
                )
            })
            .collect();

        if content.is_empty() && tool_calls.is_empty() {
            return Err(Error::Generation("empty completion".to_string()));
        }
        Ok(Completion {
            content,
            tool_calls,
        })
    }
}
