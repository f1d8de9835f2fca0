use async_trait::async_trait;
use futures::stream::BoxStream;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{CompletionRequest, CompletionResponse, LlmClient, ToolCallResponse};
use crate::error::{AgentError, ErrorKind};
use crate::tools::ToolSchema;

/// Exponential backoff with jitter.
///
/// Delay for attempt `n` (0-based) is `base * 2^n`, jittered ±50% and capped
/// at `max_delay`. Tests inject a ~10ms base to keep latency down.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay:   Duration,
    pub max_delay:    Duration,
    /// Jitter fraction applied symmetrically (0.5 → ±50%).
    pub jitter:       f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay:   Duration::from_millis(500),
            max_delay:    Duration::from_secs(60),
            jitter:       0.5,
        }
    }
}

impl RetryPolicy {
    /// Policy for test environments: same shape, ~10ms base.
    pub fn fast() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay:  Duration::from_millis(100),
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self
    }

    /// Backoff delay before retrying after the given 0-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shifted = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = shifted.min(self.max_delay);
        if self.jitter <= 0.0 {
            return capped;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        capped.mul_f64(factor.max(0.0))
    }
}

/// Wraps any [`LlmClient`] with retry on transient failures.
///
/// Only errors the taxonomy classifies as retryable (`rate-limited`,
/// `timeout`, `llm-request`) are re-attempted; everything else surfaces
/// immediately. The final failure carries the attempt count in its context.
pub struct RetryingLlm {
    inner:  Arc<dyn LlmClient>,
    policy: RetryPolicy,
}

impl RetryingLlm {
    pub fn new(inner: Arc<dyn LlmClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn backoff(&self, ctx: &CancellationToken, attempt: u32) -> Result<(), AgentError> {
        let delay = self.policy.delay_for(attempt);
        tracing::warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "LLM transient error, backing off");
        tokio::select! {
            _ = ctx.cancelled() => Err(AgentError::canceled("llm", "retry_backoff")),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn run_with_retry<T, F, Fut>(
        &self,
        ctx: &CancellationToken,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, AgentError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, AgentError>>,
    {
        let max = self.policy.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 0..max {
            match call(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    last_err = Some(err);
                    if attempt + 1 < max {
                        self.backoff(ctx, attempt).await?;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        let err = last_err.unwrap_or_else(|| {
            AgentError::new(ErrorKind::Internal, "llm", operation, "retry loop without attempts")
        });
        Err(err.with_context("attempts", max.to_string()))
    }
}

#[async_trait]
impl LlmClient for RetryingLlm {
    async fn complete(
        &self,
        ctx: &CancellationToken,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, AgentError> {
        self.run_with_retry(ctx, "complete", |_| {
            let req = request.clone();
            async move { self.inner.complete(ctx, req).await }
        })
        .await
    }

    async fn generate_with_tools(
        &self,
        ctx: &CancellationToken,
        request: CompletionRequest,
        tools: &[ToolSchema],
    ) -> Result<ToolCallResponse, AgentError> {
        self.run_with_retry(ctx, "generate_with_tools", |_| {
            let req = request.clone();
            async move { self.inner.generate_with_tools(ctx, req, tools).await }
        })
        .await
    }

    fn stream<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        request: CompletionRequest,
    ) -> BoxStream<'a, Result<String, AgentError>> {
        // Retrying mid-stream would need chunk accumulation and replay;
        // the initial connection failure is the inner client's to report.
        self.inner.stream(ctx, request)
    }

    fn supports_tool_calls(&self) -> bool {
        self.inner.supports_tool_calls()
    }

    fn provider(&self) -> &str {
        self.inner.provider()
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }
}
