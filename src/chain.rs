use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::callbacks::CallbackSet;
use crate::config::RunnableConfig;
use crate::error::AgentError;
use crate::runnable::{try_invoke_fast, BoxAgent, FastInvoker, Runnable};
use crate::types::{TaskInput, TaskOutput};

/// Synthesize the next child's input from the previous child's output: same
/// task and session, context becomes the previous output's metadata plus
/// `"previous_result"`, instruction overridable via the metadata key
/// `"instruction"`, timestamp refreshed.
pub(crate) fn synthesize_input(previous: &TaskOutput, template: &TaskInput) -> TaskInput {
    let mut context = previous.metadata.clone();
    context.insert("previous_result".to_string(), previous.result.clone());
    let instruction = previous
        .metadata
        .get("instruction")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| template.instruction.clone());

    TaskInput {
        task:        template.task.clone(),
        instruction,
        context,
        options:     template.options.clone(),
        session_id:  template.session_id.clone(),
        timestamp:   Utc::now(),
    }
}

/// Sequential multi-agent pipeline: each child's output becomes the next
/// child's input.
///
/// Children are always invoked through [`try_invoke_fast`], so only the
/// chain's own boundary is observable; inner callbacks stay silent. An
/// empty chain succeeds with the message `"no agents"`.
pub struct Chain {
    name:   String,
    agents: Vec<BoxAgent>,
    config: RunnableConfig,
}

impl Chain {
    pub fn new(name: impl Into<String>, agents: Vec<BoxAgent>) -> Self {
        Self {
            name: name.into(),
            agents,
            config: RunnableConfig::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn with_config(mut self, config: RunnableConfig) -> Self {
        self.config = config;
        self
    }

    /// Consuming append. `Chain::new("c", vec![a]).pipe(b).pipe(c)` is the
    /// same chain as `Chain::new("c", vec![a, b, c])`.
    pub fn pipe(mut self, next: BoxAgent) -> Self {
        self.agents.push(next);
        self
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
        callbacks: &CallbackSet,
    ) -> Result<TaskOutput, AgentError> {
        if let Err(cb_err) = callbacks.start(&input).await {
            callbacks.error(&cb_err).await;
            return Err(cb_err);
        }

        if self.agents.is_empty() {
            let mut output = TaskOutput::success(Value::Null, "no agents");
            output
                .metadata
                .insert("chain".to_string(), json!(self.name));
            if let Err(cb_err) = callbacks.agent_finish(&output).await {
                callbacks.error(&cb_err).await;
                return Err(cb_err);
            }
            return Ok(output);
        }

        let template = input.clone();
        let mut current = input;
        let mut trace: Vec<Value> = Vec::new();
        let mut last_output = None;

        for (index, agent) in self.agents.iter().enumerate() {
            tracing::debug!(chain = %self.name, index, "chain step");
            let output = match try_invoke_fast(agent.as_ref(), ctx, current).await {
                Ok(output) => output,
                Err(err) => {
                    // First failing child short-circuits the chain.
                    callbacks.error(&err).await;
                    return Err(err);
                }
            };
            trace.push(json!({
                "index": index,
                "status": output.status,
                "message": output.message,
            }));
            current = synthesize_input(&output, &template);
            last_output = Some(output);
        }

        let mut output = last_output.expect("non-empty chain produced output");
        output
            .metadata
            .insert("chain".to_string(), json!(self.name));
        output
            .metadata
            .insert("chain_trace".to_string(), Value::Array(trace));

        if let Err(cb_err) = callbacks.agent_finish(&output).await {
            callbacks.error(&cb_err).await;
            return Err(cb_err.with_partial_output(output));
        }
        Ok(output)
    }
}

#[async_trait]
impl Runnable for Chain {
    type Input = TaskInput;
    type Output = TaskOutput;

    async fn invoke(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<TaskOutput, AgentError> {
        let callbacks = CallbackSet::new(self.config.callbacks().to_vec());
        self.run(ctx, input, &callbacks).await
    }

    fn config(&self) -> &RunnableConfig {
        &self.config
    }

    fn as_fast(&self) -> Option<&dyn FastInvoker<Input = TaskInput, Output = TaskOutput>> {
        Some(self)
    }
}

#[async_trait]
impl FastInvoker for Chain {
    /// Children already run fast; the fast path just drops the chain's own
    /// boundary callbacks.
    async fn invoke_fast(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<TaskOutput, AgentError> {
        self.run(ctx, input, &CallbackSet::empty()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::FnRunnable;
    use crate::types::TaskStatus;
    use std::sync::Arc;

    /// An agent that reads `previous_result` from context and transforms it.
    fn uppercaser() -> BoxAgent {
        Arc::new(FnRunnable::new(|input: TaskInput| {
            let prev = input
                .context
                .get("previous_result")
                .and_then(|v| v.as_str())
                .unwrap_or(&input.task)
                .to_string();
            Ok(TaskOutput::success(
                Value::String(prev.to_uppercase()),
                "uppercased",
            ))
        }))
    }

    fn greeter() -> BoxAgent {
        Arc::new(FnRunnable::new(|_input: TaskInput| {
            Ok(TaskOutput::success(
                Value::String("uppercase: hello".to_string()),
                "greeted",
            ))
        }))
    }

    #[tokio::test]
    async fn threads_output_into_next_input() {
        let chain = Chain::new("demo", vec![greeter(), uppercaser()]);
        let ctx = CancellationToken::new();
        let out = chain.invoke(&ctx, TaskInput::new("greet")).await.unwrap();
        assert_eq!(out.result_text(), "UPPERCASE: HELLO");
        assert!(out.metadata.contains_key("chain_trace"));
    }

    #[tokio::test]
    async fn empty_chain_returns_no_agents_success() {
        let chain = Chain::new("empty", vec![]);
        let ctx = CancellationToken::new();
        let out = chain.invoke(&ctx, TaskInput::new("anything")).await.unwrap();
        assert_eq!(out.status, TaskStatus::Success);
        assert_eq!(out.message, "no agents");
    }

    #[tokio::test]
    async fn first_error_short_circuits() {
        let failing: BoxAgent = Arc::new(FnRunnable::new(|_: TaskInput| {
            Err(AgentError::invalid_input("first", "refused"))
        }));
        let never: BoxAgent = Arc::new(FnRunnable::new(|_: TaskInput| {
            panic!("second child must not run");
        }));
        let chain = Chain::new("sc", vec![failing, never]);
        let ctx = CancellationToken::new();
        let err = chain.invoke(&ctx, TaskInput::new("t")).await.unwrap_err();
        assert_eq!(err.component(), "first");
    }

    #[tokio::test]
    async fn pipe_appends_equivalently() {
        let ctx = CancellationToken::new();
        let direct = Chain::new("c", vec![greeter(), uppercaser()]);
        let piped = Chain::new("c", vec![greeter()]).pipe(uppercaser());

        let a = direct.invoke(&ctx, TaskInput::new("t")).await.unwrap();
        let b = piped.invoke(&ctx, TaskInput::new("t")).await.unwrap();
        assert_eq!(a.result, b.result);
        assert_eq!(a.status, b.status);
    }
}
