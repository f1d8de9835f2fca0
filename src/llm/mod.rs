use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

mod mock;
mod retry;

pub use mock::{MockLlm, ScriptedFailure};
pub use retry::{RetryPolicy, RetryingLlm};

use crate::error::{AgentError, ErrorKind};
use crate::tools::ToolSchema;
use crate::types::TokenUsage;

/// Message roles understood by the chat contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role:    Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// A completion request, provider-neutral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages:    Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens:  u32,
    pub model:       Option<String>,
    pub stop:        Option<Vec<String>>,
    pub top_p:       Option<f64>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: 0.7,
            max_tokens:  2048,
            model:       None,
            stop:        None,
            top_p:       None,
        }
    }

    pub fn with_temperature(mut self, t: f64) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content:       String,
    pub model:         String,
    pub finish_reason: FinishReason,
    pub usage:         TokenUsage,
}

/// One native tool call requested by a tool-calling provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id:        String,
    pub name:      String,
    pub arguments: HashMap<String, Value>,
}

/// Response from [`LlmClient::generate_with_tools`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub content:    String,
    pub tool_calls: Vec<LlmToolCall>,
    pub usage:      TokenUsage,
}

/// The single interface between the engine and any LLM provider.
///
/// # Contract
/// - Must be `Send + Sync` (used behind `Arc<dyn LlmClient>`).
/// - Failures use the engine taxonomy: `rate-limited` (with a `retry_after`
///   context entry when known), `timeout`, `llm-request` for transport
///   problems, `llm-response` for malformed replies, `invalid-config` /
///   `invalid-input` for caller mistakes. The first three are retryable.
/// - `generate_with_tools` is optional; providers without native tool
///   calling keep the default and the loop falls back to the text protocol.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        ctx: &CancellationToken,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, AgentError>;

    /// Convenience wrapper: a plain chat turn with default options.
    async fn chat(
        &self,
        ctx: &CancellationToken,
        messages: Vec<ChatMessage>,
    ) -> Result<CompletionResponse, AgentError> {
        self.complete(ctx, CompletionRequest::new(messages)).await
    }

    /// Token stream for one request. The default emits the whole completion
    /// as a single chunk; streaming providers override it.
    fn stream<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        request: CompletionRequest,
    ) -> BoxStream<'a, Result<String, AgentError>> {
        Box::pin(async_stream::stream! {
            match self.complete(ctx, request).await {
                Ok(resp) => yield Ok(resp.content),
                Err(err) => yield Err(err),
            }
        })
    }

    /// Native tool-calling entry point.
    async fn generate_with_tools(
        &self,
        _ctx: &CancellationToken,
        _request: CompletionRequest,
        _tools: &[ToolSchema],
    ) -> Result<ToolCallResponse, AgentError> {
        Err(AgentError::new(
            ErrorKind::InvalidConfig,
            "llm",
            "generate_with_tools",
            format!("provider '{}' does not support native tool calls", self.provider()),
        ))
    }

    /// Whether [`LlmClient::generate_with_tools`] is implemented.
    fn supports_tool_calls(&self) -> bool {
        false
    }

    /// Provider identity, e.g. `"openai"`, `"anthropic"`, `"mock"`.
    fn provider(&self) -> &str;

    /// Liveness probe. Defaults to available.
    async fn is_available(&self) -> bool {
        true
    }
}
