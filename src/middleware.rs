use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::RunnableConfig;
use crate::error::{AgentError, ErrorKind};
use crate::runnable::{try_invoke_fast, BoxAgent, FastInvoker, Runnable};
use crate::types::{TaskInput, TaskOutput};

/// What a `before` hook decides.
pub enum MiddlewareAction {
    /// Proceed with the (possibly rewritten) input.
    Continue(TaskInput),
    /// Skip the wrapped agent and return this output directly. The `after`
    /// chain is not run for short-circuits.
    ShortCircuit(TaskOutput),
}

/// Pre/post-processing around an agent invocation.
///
/// `before` hooks run in wrapping order, `after` hooks in reverse order.
/// `on_error` observes failures without altering them.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn before(
        &self,
        _ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<MiddlewareAction, AgentError> {
        Ok(MiddlewareAction::Continue(input))
    }

    async fn after(
        &self,
        _ctx: &CancellationToken,
        _input: &TaskInput,
        output: TaskOutput,
    ) -> Result<TaskOutput, AgentError> {
        Ok(output)
    }

    async fn on_error(&self, _err: &AgentError) {}
}

/// An agent wrapped in middleware layers.
///
/// The slow path traverses every layer; the fast path
/// ([`FastInvoker::invoke_fast`]) bypasses all of them and goes straight to
/// the wrapped agent, per the fast-path contract.
pub struct MiddlewareAgent {
    inner:  BoxAgent,
    layers: Vec<Arc<dyn Middleware>>,
    config: RunnableConfig,
}

impl MiddlewareAgent {
    pub fn new(inner: BoxAgent) -> Self {
        Self {
            inner,
            layers: Vec::new(),
            config: RunnableConfig::new(),
        }
    }

    pub fn layer(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.layers.push(middleware);
        self
    }

    pub fn with_config(mut self, config: RunnableConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl Runnable for MiddlewareAgent {
    type Input = TaskInput;
    type Output = TaskOutput;

    async fn invoke(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<TaskOutput, AgentError> {
        let mut current = input;
        for layer in &self.layers {
            match layer.before(ctx, current).await? {
                MiddlewareAction::Continue(next) => current = next,
                MiddlewareAction::ShortCircuit(output) => {
                    tracing::debug!(layer = layer.name(), "middleware short-circuit");
                    return Ok(output);
                }
            }
        }

        let settled_input = current.clone();
        let mut output = match self.inner.invoke(ctx, current).await {
            Ok(output) => output,
            Err(err) => {
                for layer in self.layers.iter().rev() {
                    layer.on_error(&err).await;
                }
                return Err(err);
            }
        };

        for layer in self.layers.iter().rev() {
            output = layer.after(ctx, &settled_input, output).await?;
        }
        Ok(output)
    }

    fn config(&self) -> &RunnableConfig {
        &self.config
    }

    fn as_fast(&self) -> Option<&dyn FastInvoker<Input = TaskInput, Output = TaskOutput>> {
        Some(self)
    }
}

#[async_trait]
impl FastInvoker for MiddlewareAgent {
    async fn invoke_fast(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<TaskOutput, AgentError> {
        try_invoke_fast(self.inner.as_ref(), ctx, input).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in layers
// ─────────────────────────────────────────────────────────────────────────────

/// Computes the instruction from the task at call time.
pub struct DynamicPromptMiddleware {
    prompt: Arc<dyn Fn(&TaskInput) -> String + Send + Sync>,
}

impl DynamicPromptMiddleware {
    pub fn new(prompt: impl Fn(&TaskInput) -> String + Send + Sync + 'static) -> Self {
        Self { prompt: Arc::new(prompt) }
    }
}

#[async_trait]
impl Middleware for DynamicPromptMiddleware {
    fn name(&self) -> &str {
        "dynamic_prompt"
    }

    async fn before(
        &self,
        _ctx: &CancellationToken,
        mut input: TaskInput,
    ) -> Result<MiddlewareAction, AgentError> {
        input.instruction = (self.prompt)(&input);
        Ok(MiddlewareAction::Continue(input))
    }
}

/// Narrows `allowed_tools` per task.
pub struct ToolSelectionMiddleware {
    selector: Arc<dyn Fn(&TaskInput) -> Vec<String> + Send + Sync>,
}

impl ToolSelectionMiddleware {
    pub fn new(selector: impl Fn(&TaskInput) -> Vec<String> + Send + Sync + 'static) -> Self {
        Self { selector: Arc::new(selector) }
    }
}

#[async_trait]
impl Middleware for ToolSelectionMiddleware {
    fn name(&self) -> &str {
        "tool_selection"
    }

    async fn before(
        &self,
        _ctx: &CancellationToken,
        mut input: TaskInput,
    ) -> Result<MiddlewareAction, AgentError> {
        input.options.allowed_tools = Some((self.selector)(&input));
        Ok(MiddlewareAction::Continue(input))
    }
}

/// Fixed-window rate limiting. Exceeding the window is a `rate-limited`
/// error, not a queue.
pub struct RateLimitMiddleware {
    max_calls: u32,
    interval:  Duration,
    window:    Mutex<(Instant, u32)>,
}

impl RateLimitMiddleware {
    pub fn new(max_calls: u32, interval: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            interval,
            window: Mutex::new((Instant::now(), 0)),
        }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn before(
        &self,
        _ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<MiddlewareAction, AgentError> {
        let mut window = self.window.lock().expect("rate limit lock poisoned");
        if window.0.elapsed() >= self.interval {
            *window = (Instant::now(), 0);
        }
        if window.1 >= self.max_calls {
            return Err(AgentError::new(
                ErrorKind::RateLimited,
                "middleware",
                "rate_limit",
                format!("exceeded {} calls per {:?}", self.max_calls, self.interval),
            ));
        }
        window.1 += 1;
        Ok(MiddlewareAction::Continue(input))
    }
}

/// Rejects malformed inputs before any LLM spend.
pub struct ValidationMiddleware {
    max_task_len: usize,
}

impl ValidationMiddleware {
    pub fn new(max_task_len: usize) -> Self {
        Self { max_task_len }
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    async fn before(
        &self,
        _ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<MiddlewareAction, AgentError> {
        if input.task.trim().is_empty() {
            return Err(AgentError::invalid_input("middleware", "task must be non-empty"));
        }
        if input.task.len() > self.max_task_len {
            return Err(AgentError::invalid_input(
                "middleware",
                format!("task exceeds {} characters", self.max_task_len),
            )
            .with_context("task_len", input.task.len().to_string()));
        }
        let t = input.options.temperature;
        if !(0.0..=2.0).contains(&t) {
            return Err(AgentError::invalid_input(
                "middleware",
                format!("temperature {} outside 0.0–2.0", t),
            ));
        }
        Ok(MiddlewareAction::Continue(input))
    }
}

/// Caches successful outputs by task/instruction/model for a TTL.
pub struct CacheMiddleware {
    ttl:     Duration,
    entries: Mutex<HashMap<String, (TaskOutput, Instant)>>,
}

impl CacheMiddleware {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    fn key(input: &TaskInput) -> String {
        let mut hasher = Sha256::new();
        hasher.update(input.task.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(input.instruction.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(input.options.model.as_deref().unwrap_or("").as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    fn name(&self) -> &str {
        "cache"
    }

    async fn before(
        &self,
        _ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<MiddlewareAction, AgentError> {
        let key = Self::key(&input);
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some((output, stored_at)) = entries.get(&key) {
            if stored_at.elapsed() < self.ttl {
                let mut hit = output.clone();
                hit.metadata.insert("cache_hit".to_string(), json!(true));
                return Ok(MiddlewareAction::ShortCircuit(hit));
            }
            entries.remove(&key);
        }
        Ok(MiddlewareAction::Continue(input))
    }

    async fn after(
        &self,
        _ctx: &CancellationToken,
        input: &TaskInput,
        output: TaskOutput,
    ) -> Result<TaskOutput, AgentError> {
        if output.status == crate::types::TaskStatus::Success {
            self.entries
                .lock()
                .expect("cache lock poisoned")
                .insert(Self::key(input), (output.clone(), Instant::now()));
        }
        Ok(output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Trips open after `failure_threshold` consecutive failures; stays open for
/// `cooldown`, then lets one probe call through.
pub struct CircuitBreakerMiddleware {
    failure_threshold: u32,
    cooldown:          Duration,
    state:             Mutex<(BreakerState, u32, Instant)>,
}

impl CircuitBreakerMiddleware {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new((BreakerState::Closed, 0, Instant::now())),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().expect("breaker lock poisoned").0 == BreakerState::Open
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    async fn before(
        &self,
        _ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<MiddlewareAction, AgentError> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.0 {
            BreakerState::Open if state.2.elapsed() < self.cooldown => {
                Err(AgentError::new(
                    ErrorKind::Internal,
                    "middleware",
                    "circuit_breaker",
                    "circuit open, call rejected",
                )
                .with_context("cooldown_ms", self.cooldown.as_millis().to_string()))
            }
            BreakerState::Open => {
                state.0 = BreakerState::HalfOpen;
                Ok(MiddlewareAction::Continue(input))
            }
            _ => Ok(MiddlewareAction::Continue(input)),
        }
    }

    async fn after(
        &self,
        _ctx: &CancellationToken,
        _input: &TaskInput,
        output: TaskOutput,
    ) -> Result<TaskOutput, AgentError> {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        *state = (BreakerState::Closed, 0, Instant::now());
        Ok(output)
    }

    async fn on_error(&self, _err: &AgentError) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.1 += 1;
        if state.1 >= self.failure_threshold || state.0 == BreakerState::HalfOpen {
            *state = (BreakerState::Open, state.1, Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::FnRunnable;
    use serde_json::Value;

    fn echo_agent() -> BoxAgent {
        Arc::new(FnRunnable::new(|input: TaskInput| {
            Ok(TaskOutput::success(
                Value::String(format!("did: {}", input.task)),
                "ok",
            ))
        }))
    }

    fn failing_agent() -> BoxAgent {
        Arc::new(FnRunnable::new(|_: TaskInput| {
            Err(AgentError::internal("inner", "kaput"))
        }))
    }

    #[tokio::test]
    async fn dynamic_prompt_rewrites_instruction() {
        let seen = Arc::new(Mutex::new(String::new()));
        let probe = Arc::clone(&seen);
        let inner: BoxAgent = Arc::new(FnRunnable::new(move |input: TaskInput| {
            *probe.lock().unwrap() = input.instruction.clone();
            Ok(TaskOutput::success(Value::Null, "ok"))
        }));
        let agent = MiddlewareAgent::new(inner).layer(Arc::new(DynamicPromptMiddleware::new(
            |input| format!("be brief about {}", input.task),
        )));

        let ctx = CancellationToken::new();
        agent.invoke(&ctx, TaskInput::new("rust")).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), "be brief about rust");
    }

    #[tokio::test]
    async fn validation_rejects_empty_task() {
        let agent = MiddlewareAgent::new(echo_agent())
            .layer(Arc::new(ValidationMiddleware::new(1000)));
        let ctx = CancellationToken::new();
        let err = agent.invoke(&ctx, TaskInput::new("   ")).await.unwrap_err();
        assert!(err.is_code(ErrorKind::InvalidInput));
    }

    #[tokio::test]
    async fn rate_limit_trips_after_budget() {
        let agent = MiddlewareAgent::new(echo_agent())
            .layer(Arc::new(RateLimitMiddleware::new(2, Duration::from_secs(60))));
        let ctx = CancellationToken::new();

        agent.invoke(&ctx, TaskInput::new("a")).await.unwrap();
        agent.invoke(&ctx, TaskInput::new("b")).await.unwrap();
        let err = agent.invoke(&ctx, TaskInput::new("c")).await.unwrap_err();
        assert!(err.is_code(ErrorKind::RateLimited));
    }

    #[tokio::test]
    async fn cache_short_circuits_second_call() {
        let calls = Arc::new(Mutex::new(0u32));
        let probe = Arc::clone(&calls);
        let inner: BoxAgent = Arc::new(FnRunnable::new(move |_: TaskInput| {
            *probe.lock().unwrap() += 1;
            Ok(TaskOutput::success(Value::String("computed".into()), "ok"))
        }));
        let agent = MiddlewareAgent::new(inner)
            .layer(Arc::new(CacheMiddleware::new(Duration::from_secs(60))));
        let ctx = CancellationToken::new();

        let first = agent.invoke(&ctx, TaskInput::new("q")).await.unwrap();
        assert!(first.metadata.get("cache_hit").is_none());
        let second = agent.invoke(&ctx, TaskInput::new("q")).await.unwrap();
        assert_eq!(second.metadata.get("cache_hit"), Some(&json!(true)));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_threshold() {
        let agent = MiddlewareAgent::new(failing_agent()).layer(Arc::new(
            CircuitBreakerMiddleware::new(2, Duration::from_secs(60)),
        ));
        let ctx = CancellationToken::new();

        // Two real failures trip the breaker.
        assert!(agent.invoke(&ctx, TaskInput::new("1")).await.is_err());
        assert!(agent.invoke(&ctx, TaskInput::new("2")).await.is_err());
        // Third call is rejected by the breaker itself.
        let err = agent.invoke(&ctx, TaskInput::new("3")).await.unwrap_err();
        assert_eq!(err.operation(), "circuit_breaker");
    }

    #[tokio::test]
    async fn fast_path_bypasses_middleware() {
        let agent = MiddlewareAgent::new(echo_agent())
            .layer(Arc::new(ValidationMiddleware::new(1000)));
        let ctx = CancellationToken::new();

        // Empty task fails validation on the slow path but sails through the
        // fast path, which skips every layer.
        assert!(agent.invoke(&ctx, TaskInput::new(" ")).await.is_err());
        let out = try_invoke_fast(&agent, &ctx, TaskInput::new(" ")).await.unwrap();
        assert_eq!(out.message, "ok");
    }
}
