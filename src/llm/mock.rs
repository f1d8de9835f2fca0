use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    CompletionRequest, CompletionResponse, FinishReason, LlmClient, ToolCallResponse,
};
use crate::error::{AgentError, ErrorKind};
use crate::tools::ToolSchema;
use crate::types::TokenUsage;

/// Failure kinds the mock can inject before serving its script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    RateLimited,
    Timeout,
    ServerError,
    InvalidRequest,
}

impl ScriptedFailure {
    fn to_error(self) -> AgentError {
        match self {
            ScriptedFailure::RateLimited => {
                AgentError::new(ErrorKind::RateLimited, "llm", "complete", "429 too many requests")
                    .with_context("retry_after", "0")
            }
            ScriptedFailure::Timeout => AgentError::timeout("llm", "complete"),
            ScriptedFailure::ServerError => {
                AgentError::new(ErrorKind::LlmRequest, "llm", "complete", "500 upstream error")
            }
            ScriptedFailure::InvalidRequest => {
                AgentError::new(ErrorKind::InvalidInput, "llm", "complete", "bad request")
            }
        }
    }
}

/// A scripted LLM for tests and demos: no network, fully deterministic.
///
/// Responses are consumed in order; an exhausted script is an
/// `llm-response` error so a runaway loop fails loudly instead of spinning.
pub struct MockLlm {
    responses:      Mutex<VecDeque<String>>,
    tool_responses: Mutex<VecDeque<ToolCallResponse>>,
    failures_left:  Mutex<u32>,
    failure_kind:   ScriptedFailure,
    call_log:       Mutex<Vec<CompletionRequest>>,
    usage_per_call: TokenUsage,
    supports_tools: bool,
}

impl MockLlm {
    pub fn scripted(responses: Vec<String>) -> Self {
        Self {
            responses:      Mutex::new(responses.into()),
            tool_responses: Mutex::new(VecDeque::new()),
            failures_left:  Mutex::new(0),
            failure_kind:   ScriptedFailure::ServerError,
            call_log:       Mutex::new(Vec::new()),
            usage_per_call: TokenUsage::new(10, 5),
            supports_tools: false,
        }
    }

    /// Script native tool-call turns. Enables `supports_tool_calls`.
    pub fn with_tool_turns(mut self, turns: Vec<ToolCallResponse>) -> Self {
        self.tool_responses = Mutex::new(turns.into());
        self.supports_tools = true;
        self
    }

    /// Fail the first `n` calls with the given kind before serving the
    /// script.
    pub fn failing_first(mut self, n: u32, kind: ScriptedFailure) -> Self {
        self.failures_left = Mutex::new(n);
        self.failure_kind = kind;
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage_per_call = usage;
        self
    }

    /// Number of calls made so far (failures included).
    pub fn call_count(&self) -> usize {
        self.call_log.lock().unwrap().len()
    }

    /// The request observed on the nth call (0-indexed).
    pub fn request_for_call(&self, n: usize) -> Option<CompletionRequest> {
        self.call_log.lock().unwrap().get(n).cloned()
    }

    fn record_call(&self, request: &CompletionRequest) {
        self.call_log.lock().unwrap().push(request.clone());
    }

    fn take_failure(&self) -> Option<AgentError> {
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            Some(self.failure_kind.to_error())
        } else {
            None
        }
    }

    fn next_text(&self) -> Result<String, AgentError> {
        self.responses.lock().unwrap().pop_front().ok_or_else(|| {
            AgentError::new(
                ErrorKind::LlmResponse,
                "llm",
                "complete",
                "mock: no more scripted responses",
            )
        })
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(
        &self,
        ctx: &CancellationToken,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, AgentError> {
        if ctx.is_cancelled() {
            return Err(AgentError::canceled("llm", "complete"));
        }
        self.record_call(&request);
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(CompletionResponse {
            content:       self.next_text()?,
            model:         request.model.unwrap_or_else(|| "mock-model".to_string()),
            finish_reason: FinishReason::Stop,
            usage:         self.usage_per_call,
        })
    }

    fn stream<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        request: CompletionRequest,
    ) -> BoxStream<'a, Result<String, AgentError>> {
        Box::pin(async_stream::stream! {
            match self.complete(ctx, request).await {
                Ok(resp) => {
                    for token in resp.content.split_inclusive(' ') {
                        yield Ok(token.to_string());
                    }
                }
                Err(err) => yield Err(err),
            }
        })
    }

    async fn generate_with_tools(
        &self,
        ctx: &CancellationToken,
        request: CompletionRequest,
        _tools: &[ToolSchema],
    ) -> Result<ToolCallResponse, AgentError> {
        if ctx.is_cancelled() {
            return Err(AgentError::canceled("llm", "generate_with_tools"));
        }
        self.record_call(&request);
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        if let Some(turn) = self.tool_responses.lock().unwrap().pop_front() {
            return Ok(turn);
        }
        // Fall through to the text script: a content-only turn.
        Ok(ToolCallResponse {
            content:    self.next_text()?,
            tool_calls: Vec::new(),
            usage:      self.usage_per_call,
        })
    }

    fn supports_tool_calls(&self) -> bool {
        self.supports_tools
    }

    fn provider(&self) -> &str {
        "mock"
    }
}
