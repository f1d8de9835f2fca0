use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::callbacks::CallbackSet;
use crate::checkpoint::Checkpointer;
use crate::config::RunnableConfig;
use crate::error::{AgentError, ErrorKind};
use crate::llm::{ChatMessage, CompletionRequest, LlmClient, RetryPolicy, RetryingLlm};
use crate::parser::{ParsedResponse, ResponseParser};
use crate::runnable::{try_invoke_fast, FastInvoker, Runnable, StreamChunk};
use crate::runtime::Runtime;
use crate::scratchpad::{Scratchpad, ScratchpadEntry};
use crate::state::State;
use crate::store::Store;
use crate::stream::{
    dispatch_tool, EventSink, MultiModeStream, StreamMode, ToolTask,
    ParallelToolExecutor,
};
use crate::tools::{Tool, ToolRegistry};
use crate::types::{
    ReasoningStep, TaskInput, TaskOutput, TaskStatus, TokenUsage, ToolCallRecord,
};

/// What one LLM turn resolved to.
enum TurnOutcome {
    Final(String),
    Actions(Vec<PlannedCall>),
    ParseFailure(AgentError),
}

struct PlannedCall {
    thought: String,
    tool:    String,
    args:    HashMap<String, Value>,
}

/// The ReAct agent: drives an LLM through reason→act→observe cycles until a
/// final answer, an iteration bound, or cancellation.
///
/// Construct with [`ReActAgent::builder`]. The agent is cheap to clone
/// (everything heavy is behind an `Arc`) and immutable once built;
/// [`ReActAgent::with_config`] and [`ReActAgent::with_callbacks`] return
/// modified copies.
#[derive(Clone)]
pub struct ReActAgent {
    name:               String,
    description:        String,
    llm:                Arc<dyn LlmClient>,
    tools:              Arc<ToolRegistry>,
    system_prompt:      String,
    config:             RunnableConfig,
    parser:             ResponseParser,
    max_iterations:     usize,
    max_parse_failures: usize,
    scratchpad_window:  usize,
    tool_concurrency:   usize,
    tool_retry_base:    Duration,
    store:              Option<Arc<dyn Store>>,
    checkpointer:       Option<Arc<dyn Checkpointer>>,
}

impl std::fmt::Debug for ReActAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReActAgent")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("max_iterations", &self.max_iterations)
            .field("max_parse_failures", &self.max_parse_failures)
            .field("scratchpad_window", &self.scratchpad_window)
            .field("tool_concurrency", &self.tool_concurrency)
            .field("tool_retry_base", &self.tool_retry_base)
            .finish()
    }
}

impl ReActAgent {
    pub fn builder(name: impl Into<String>) -> ReActAgentBuilder {
        ReActAgentBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Copy-on-modify config replacement; the original agent is unchanged.
    pub fn with_config(&self, config: RunnableConfig) -> Self {
        let mut agent = self.clone();
        agent.config = config;
        agent
    }

    /// Copy-on-modify callback replacement.
    pub fn with_callbacks(
        &self,
        callbacks: Vec<Arc<dyn crate::callbacks::AgentCallback>>,
    ) -> Self {
        let mut agent = self.clone();
        agent.config = agent.config.with_callbacks(callbacks);
        agent
    }

    /// Run with a multi-mode event stream attached.
    ///
    /// Returns the stream (subscribe to any subset of `modes`) and the join
    /// handle resolving to the final output. The stream closes when the run
    /// completes or is canceled.
    pub fn stream_multi(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
        modes: &[StreamMode],
        capacity: usize,
    ) -> (MultiModeStream, tokio::task::JoinHandle<Result<TaskOutput, AgentError>>) {
        let stream = MultiModeStream::new(modes, capacity);
        let sink = stream.sink();
        let agent = self.clone();
        let ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            let callbacks = CallbackSet::new(agent.config.callbacks().to_vec());
            let result = agent.run_loop(&ctx, input, callbacks, sink.clone()).await;
            sink.close();
            result
        });
        (stream, handle)
    }

    // ─────────────────────────────────────────────────────────────────────
    // The loop
    // ─────────────────────────────────────────────────────────────────────

    async fn run_loop(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
        callbacks: CallbackSet,
        sink: EventSink,
    ) -> Result<TaskOutput, AgentError> {
        let started = Instant::now();
        let mut output = TaskOutput::empty();
        let options = input.options.clone();

        if let Err(cb_err) = callbacks.start(&input).await {
            callbacks.error(&cb_err).await;
            return Err(self.fail(&mut output, started, cb_err));
        }

        // Effective deadline: the caller's token is the outer bound, the
        // option timeout cancels a child of it.
        let run_ctx = ctx.child_token();
        let mut watchdog = None;
        if let Some(timeout) = options.timeout {
            // A zero deadline cancels up front; the loop's first check turns
            // it into the usual partial result, finish callbacks included.
            if timeout.is_zero() {
                run_ctx.cancel();
            } else {
                let token = run_ctx.clone();
                watchdog = Some(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    token.cancel();
                }));
            }
        }

        let state = match self.load_state(&input, &options).await {
            Ok(state) => Arc::new(state),
            Err(err) => {
                callbacks.error(&err).await;
                return Err(self.fail(&mut output, started, err));
            }
        };
        let mut runtime = Runtime::new(Arc::clone(&state), input.session_id.clone())
            .with_sink(sink.clone());
        if let Some(store) = &self.store {
            runtime = runtime.with_store(Arc::clone(store));
        }
        if let Some(cp) = &self.checkpointer {
            runtime = runtime.with_checkpointer(Arc::clone(cp));
        }

        let mut scratchpad = Scratchpad::new(self.scratchpad_window);
        let mut usage_total = TokenUsage::default();
        let mut consecutive_parse_failures = 0usize;
        let mut iteration = 0usize;

        let result = loop {
            iteration += 1;
            tracing::info!(agent = %self.name, iteration, "react loop tick");

            if run_ctx.is_cancelled() {
                self.append_cancellation_step(&mut output, &scratchpad);
                self.mark_canceled(&mut output, "execution canceled");
                break Ok(());
            }
            if iteration > self.max_iterations {
                output.status = TaskStatus::Partial;
                output.message = "iteration limit reached".to_string();
                output.result = scratchpad
                    .last_observation()
                    .map(|o| Value::String(o.to_string()))
                    .unwrap_or(Value::Null);
                output
                    .metadata
                    .insert("error_kind".to_string(), json!("iteration-limit"));
                break Ok(());
            }

            if sink.is_active(StreamMode::Values) {
                sink.emit(
                    StreamMode::Values,
                    "before_step",
                    json!({ "iteration": iteration, "state": state.snapshot() }),
                )
                .await;
            }

            // 1. Build the prompt from preamble + catalogue + task + scratchpad.
            let messages = self.build_messages(&input, &options, &scratchpad);
            let prompts: Vec<String> = messages.iter().map(|m| m.content.clone()).collect();
            if let Err(cb_err) = callbacks.llm_start(&prompts).await {
                callbacks.error(&cb_err).await;
                break Err(cb_err);
            }

            // 2. Call the LLM.
            let step_started = Instant::now();
            let outcome = match self
                .llm_turn(&run_ctx, &options, messages, &callbacks, &sink, &mut usage_total)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) if err.is_code(ErrorKind::Canceled) => {
                    self.append_cancellation_step(&mut output, &scratchpad);
                    self.mark_canceled(&mut output, "execution canceled");
                    break Ok(());
                }
                Err(err) => {
                    callbacks.error(&err).await;
                    break Err(err);
                }
            };

            // 3. Act on the parsed turn.
            match outcome {
                TurnOutcome::Final(answer) => {
                    consecutive_parse_failures = 0;
                    self.append_step(
                        &mut output,
                        "final_answer",
                        "model produced a final answer",
                        answer.clone(),
                        step_started.elapsed(),
                        true,
                        None,
                    );
                    output.result = Value::String(answer);
                    output.status = TaskStatus::Success;
                    output.message = "task completed".to_string();
                    break Ok(());
                }
                TurnOutcome::ParseFailure(parse_err) => {
                    consecutive_parse_failures += 1;
                    tracing::debug!(
                        agent = %self.name,
                        consecutive = consecutive_parse_failures,
                        error = %parse_err,
                        "unparseable model output"
                    );
                    let observation = "output could not be parsed".to_string();
                    scratchpad.push(ScratchpadEntry {
                        thought:     String::new(),
                        action:      "none".to_string(),
                        input:       "{}".to_string(),
                        observation: observation.clone(),
                    });
                    self.append_step(
                        &mut output,
                        "parse_failure",
                        "model output did not match the tool protocol",
                        observation,
                        step_started.elapsed(),
                        false,
                        Some(parse_err.to_string()),
                    );
                    if consecutive_parse_failures >= self.max_parse_failures {
                        let err = AgentError::new(
                            ErrorKind::ParserFailed,
                            "agent",
                            "run",
                            format!(
                                "{} consecutive unparseable responses",
                                consecutive_parse_failures
                            ),
                        )
                        .with_context("consecutive", consecutive_parse_failures.to_string())
                        .with_source(parse_err);
                        callbacks.error(&err).await;
                        break Err(err);
                    }
                }
                TurnOutcome::Actions(calls) => {
                    consecutive_parse_failures = 0;
                    match self
                        .dispatch_calls(
                            &run_ctx, &options, calls, &runtime, &callbacks, &sink,
                            &mut output, &mut scratchpad,
                        )
                        .await
                    {
                        Ok(LoopSignal::Continue) => {}
                        Ok(LoopSignal::Stop) => break Ok(()),
                        Err(err) => {
                            callbacks.error(&err).await;
                            break Err(err);
                        }
                    }
                }
            }

            if sink.is_active(StreamMode::Values) {
                sink.emit(
                    StreamMode::Values,
                    "after_step",
                    json!({ "iteration": iteration, "state": state.snapshot() }),
                )
                .await;
            }
        };

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        match result {
            Ok(()) => {
                if let Err(err) = self.save_memory(&input, &options, &state, &output).await {
                    tracing::warn!(error = %err, "history save failed");
                }
                self.finalize(&mut output, started, &usage_total);
                if let Err(cb_err) = callbacks.agent_finish(&output).await {
                    callbacks.error(&cb_err).await;
                    return Err(cb_err.with_partial_output(output));
                }
                Ok(output)
            }
            Err(err) => Err(self.fail(&mut output, started, err)),
        }
    }

    /// One LLM call, native or text protocol, with token/usage bookkeeping.
    async fn llm_turn(
        &self,
        ctx: &CancellationToken,
        options: &crate::types::ExecutionOptions,
        messages: Vec<ChatMessage>,
        callbacks: &CallbackSet,
        sink: &EventSink,
        usage_total: &mut TokenUsage,
    ) -> Result<TurnOutcome, AgentError> {
        let mut request = CompletionRequest::new(messages)
            .with_temperature(options.temperature)
            .with_max_tokens(options.max_tokens);
        if let Some(model) = &options.model {
            request = request.with_model(model.clone());
        }

        let use_native =
            options.enable_tools && !self.tools.is_empty() && self.llm.supports_tool_calls();

        if use_native {
            let catalogue = self.tools.catalogue();
            let resp = tokio::select! {
                r = self.llm.generate_with_tools(ctx, request, &catalogue) => r?,
                _ = ctx.cancelled() => return Err(AgentError::canceled("agent", "llm_turn")),
            };
            usage_total.add(resp.usage);
            callbacks.llm_end(&resp.content, &resp.usage).await?;
            self.emit_tokens(sink, &resp.content).await;
            if resp.tool_calls.is_empty() {
                return Ok(TurnOutcome::Final(resp.content));
            }
            let thought = resp.content;
            return Ok(TurnOutcome::Actions(
                resp.tool_calls
                    .into_iter()
                    .map(|call| PlannedCall {
                        thought: thought.clone(),
                        tool:    call.name,
                        args:    call.arguments,
                    })
                    .collect(),
            ));
        }

        let resp = tokio::select! {
            r = self.llm.complete(ctx, request) => r?,
            _ = ctx.cancelled() => return Err(AgentError::canceled("agent", "llm_turn")),
        };
        usage_total.add(resp.usage);
        callbacks.llm_end(&resp.content, &resp.usage).await?;
        self.emit_tokens(sink, &resp.content).await;

        match self.parser.parse(&resp.content) {
            Ok(ParsedResponse::FinalAnswer(answer)) => Ok(TurnOutcome::Final(answer)),
            Ok(ParsedResponse::Action { thought, tool, input }) => {
                Ok(TurnOutcome::Actions(vec![PlannedCall { thought, tool, args: input }]))
            }
            Err(parse_err) => Ok(TurnOutcome::ParseFailure(parse_err)),
        }
    }

    async fn emit_tokens(&self, sink: &EventSink, content: &str) {
        if !sink.is_active(StreamMode::Messages) {
            return;
        }
        for token in content.split_inclusive(' ') {
            sink.emit(StreamMode::Messages, "token", json!(token)).await;
        }
    }

    /// Validate and execute the planned calls, appending observations,
    /// records and steps. Returns whether the loop should continue.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_calls(
        &self,
        ctx: &CancellationToken,
        options: &crate::types::ExecutionOptions,
        calls: Vec<PlannedCall>,
        runtime: &Runtime,
        callbacks: &CallbackSet,
        sink: &EventSink,
        output: &mut TaskOutput,
        scratchpad: &mut Scratchpad,
    ) -> Result<LoopSignal, AgentError> {
        // Split into dispatchable calls and synthetic observations for
        // unknown / disallowed tools.
        let mut dispatchable: Vec<PlannedCall> = Vec::new();
        let mut budget_exhausted = false;

        for call in calls {
            let synthetic = if !options.enable_tools || !self.tools.has(&call.tool) {
                Some(format!("tool not found: {}", call.tool))
            } else if let Some(allowed) = &options.allowed_tools {
                (!allowed.contains(&call.tool))
                    .then(|| format!("tool not permitted: {}", call.tool))
            } else {
                None
            };

            if let Some(observation) = synthetic {
                tracing::debug!(agent = %self.name, tool = %call.tool, "rejected tool request");
                scratchpad.push(ScratchpadEntry {
                    thought:     call.thought.clone(),
                    action:      call.tool.clone(),
                    input:       serde_json::to_string(&call.args).unwrap_or_default(),
                    observation: observation.clone(),
                });
                self.append_step(
                    output,
                    &call.tool,
                    "requested tool was not available",
                    observation,
                    Duration::ZERO,
                    false,
                    None,
                );
                continue;
            }

            if output.tool_calls.len() + dispatchable.len() >= options.max_tool_calls {
                budget_exhausted = true;
                break;
            }
            dispatchable.push(call);
        }

        if dispatchable.len() == 1 {
            let call = dispatchable.pop().expect("checked length");
            let stop = self
                .dispatch_single(ctx, call, runtime, callbacks, sink, output, scratchpad)
                .await?;
            if stop {
                return Ok(LoopSignal::Stop);
            }
        } else if !dispatchable.is_empty() {
            self.dispatch_parallel(
                ctx, dispatchable, runtime, callbacks, sink, output, scratchpad,
            )
            .await?;
        }

        if budget_exhausted {
            output.status = TaskStatus::Partial;
            output.message = "tool call limit reached".to_string();
            output.result = scratchpad
                .last_observation()
                .map(|o| Value::String(o.to_string()))
                .unwrap_or(Value::Null);
            output
                .metadata
                .insert("error_kind".to_string(), json!("tool-call-limit"));
            return Ok(LoopSignal::Stop);
        }
        Ok(LoopSignal::Continue)
    }

    async fn dispatch_single(
        &self,
        ctx: &CancellationToken,
        call: PlannedCall,
        runtime: &Runtime,
        callbacks: &CallbackSet,
        sink: &EventSink,
        output: &mut TaskOutput,
        scratchpad: &mut Scratchpad,
    ) -> Result<bool, AgentError> {
        let tool = Arc::clone(self.tools.get(&call.tool).expect("validated by caller"));
        callbacks.tool_start(&call.tool, &call.args).await?;

        let call_runtime = runtime.for_tool_call(uuid::Uuid::new_v4().to_string());
        let call_started = Instant::now();
        let dispatched = dispatch_tool(
            &tool,
            ctx,
            &call.args,
            &call_runtime,
            tool.timeout(),
            tool.max_retries(),
            self.tool_retry_base,
        )
        .await;
        let duration = call_started.elapsed();

        let (observation, success, error) = match dispatched {
            Ok(result) => {
                callbacks.tool_end(&call.tool, &result).await?;
                (result, true, None)
            }
            Err(err) if err.is_code(ErrorKind::Canceled) => {
                self.append_cancellation_step(output, scratchpad);
                self.mark_canceled(output, "execution canceled");
                return Ok(true);
            }
            Err(err) => {
                callbacks.tool_error(&call.tool, &err).await?;
                (format!("error: {}", err), false, Some(err.to_string()))
            }
        };

        self.record_tool_call(
            output, sink, &call.tool, &call.args, &observation, duration, success, error.clone(),
        )
        .await;
        scratchpad.push(ScratchpadEntry {
            thought:     call.thought,
            action:      call.tool.clone(),
            input:       serde_json::to_string(&call.args).unwrap_or_default(),
            observation: observation.clone(),
        });
        self.append_step(
            output,
            &call.tool,
            "tool dispatched",
            observation,
            duration,
            success,
            error,
        );
        Ok(false)
    }

    /// Parallel tool calls from one turn: run through the bounded executor,
    /// merge observations in input order.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_parallel(
        &self,
        ctx: &CancellationToken,
        calls: Vec<PlannedCall>,
        runtime: &Runtime,
        callbacks: &CallbackSet,
        sink: &EventSink,
        output: &mut TaskOutput,
        scratchpad: &mut Scratchpad,
    ) -> Result<(), AgentError> {
        for call in &calls {
            callbacks.tool_start(&call.tool, &call.args).await?;
        }

        let tasks: Vec<ToolTask> = calls
            .iter()
            .enumerate()
            .map(|(i, call)| {
                ToolTask::new(format!("call-{}", i), call.tool.clone(), call.args.clone())
            })
            .collect();

        let executor = ParallelToolExecutor::new(Arc::clone(&self.tools), self.tool_concurrency)
            .with_retry_base(self.tool_retry_base);
        let results = executor.run(ctx, tasks, runtime).await?;

        for (call, result) in calls.into_iter().zip(results) {
            let success = result.is_success();
            let observation = result
                .output
                .clone()
                .unwrap_or_else(|| format!("error: {}", result.error.clone().unwrap_or_default()));
            if success {
                callbacks.tool_end(&call.tool, &observation).await?;
            } else {
                let err = AgentError::new(
                    ErrorKind::ToolExecution,
                    "tool",
                    "invoke",
                    result.error.clone().unwrap_or_default(),
                );
                callbacks.tool_error(&call.tool, &err).await?;
            }
            self.record_tool_call(
                output,
                sink,
                &call.tool,
                &call.args,
                &observation,
                result.duration,
                success,
                result.error.clone(),
            )
            .await;
            scratchpad.push(ScratchpadEntry {
                thought:     call.thought,
                action:      call.tool.clone(),
                input:       serde_json::to_string(&call.args).unwrap_or_default(),
                observation: observation.clone(),
            });
            self.append_step(
                output,
                &call.tool,
                "tool dispatched (parallel)",
                observation,
                result.duration,
                success,
                result.error,
            );
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Bookkeeping helpers
    // ─────────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn record_tool_call(
        &self,
        output: &mut TaskOutput,
        sink: &EventSink,
        tool: &str,
        args: &HashMap<String, Value>,
        observation: &str,
        duration: Duration,
        success: bool,
        error: Option<String>,
    ) {
        let record = ToolCallRecord {
            tool_name: tool.to_string(),
            input:     args.clone(),
            output:    observation.to_string(),
            duration,
            success,
            error,
        };
        if sink.is_active(StreamMode::Updates) {
            sink.emit(
                StreamMode::Updates,
                "tool_call",
                serde_json::to_value(&record).unwrap_or(Value::Null),
            )
            .await;
        }
        output.tool_calls.push(record);
    }

    #[allow(clippy::too_many_arguments)]
    fn append_step(
        &self,
        output: &mut TaskOutput,
        action: &str,
        description: &str,
        result: String,
        duration: Duration,
        success: bool,
        error: Option<String>,
    ) {
        output.reasoning_steps.push(ReasoningStep {
            step: output.reasoning_steps.len() + 1,
            action: action.to_string(),
            description: description.to_string(),
            result,
            duration,
            success,
            error,
        });
    }

    fn append_cancellation_step(&self, output: &mut TaskOutput, scratchpad: &Scratchpad) {
        let last = scratchpad.last_observation().unwrap_or("").to_string();
        self.append_step(
            output,
            "canceled",
            "run canceled before completion",
            last,
            Duration::ZERO,
            false,
            Some("context canceled".to_string()),
        );
    }

    fn mark_canceled(&self, output: &mut TaskOutput, message: &str) {
        output.status = TaskStatus::Partial;
        output.message = message.to_string();
        output
            .metadata
            .insert("error_kind".to_string(), json!(ErrorKind::Canceled));
        if output.result.is_null() {
            if let Some(step) = output.reasoning_steps.last() {
                output.result = Value::String(step.result.clone());
            }
        }
    }

    fn finalize(&self, output: &mut TaskOutput, started: Instant, usage: &TokenUsage) {
        output.latency = started.elapsed();
        output.timestamp = chrono::Utc::now();
        output
            .metadata
            .insert("agent".to_string(), json!(self.name));
        output.metadata.insert(
            "tokens_used".to_string(),
            serde_json::to_value(usage).unwrap_or(Value::Null),
        );
    }

    fn fail(&self, output: &mut TaskOutput, started: Instant, err: AgentError) -> AgentError {
        output.status = TaskStatus::Failed;
        if output.message.is_empty() {
            output.message = format!("run failed: {}", err.message());
        }
        output
            .metadata
            .insert("error_kind".to_string(), json!(err.kind()));
        self.finalize(output, started, &TokenUsage::default());
        err.with_partial_output(std::mem::replace(output, TaskOutput::empty()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Prompt assembly & memory
    // ─────────────────────────────────────────────────────────────────────

    fn build_messages(
        &self,
        input: &TaskInput,
        options: &crate::types::ExecutionOptions,
        scratchpad: &Scratchpad,
    ) -> Vec<ChatMessage> {
        let mut system = if self.system_prompt.is_empty() {
            "You are a capable agent. Work the task step by step.".to_string()
        } else {
            self.system_prompt.clone()
        };

        if options.enable_tools && !self.tools.is_empty() && !self.llm.supports_tool_calls() {
            system.push_str("\n\nAvailable tools:\n");
            for schema in self.tools.catalogue() {
                system.push_str(&format!(
                    "- {}: {}\n  arguments: {}\n",
                    schema.name, schema.description, schema.input_schema
                ));
            }
            system.push_str(
                "\nRespond with either:\n\
                 Thought: <your reasoning>\n\
                 Action: <tool name>\n\
                 Action Input: <JSON arguments>\n\n\
                 or, once you can answer:\n\
                 Final Answer: <the answer>",
            );
        } else if !self.llm.supports_tool_calls() {
            system.push_str(
                "\n\nWhen you can answer, respond with:\nFinal Answer: <the answer>",
            );
        }

        let mut user = format!("Task: {}", input.task);
        if !input.instruction.is_empty() {
            user.push_str(&format!("\n\nInstruction: {}", input.instruction));
        }
        if !input.context.is_empty() {
            user.push_str("\n\nContext:");
            let mut keys: Vec<&String> = input.context.keys().collect();
            keys.sort();
            for key in keys {
                user.push_str(&format!("\n- {}: {}", key, input.context[key]));
            }
        }
        if !scratchpad.is_empty() {
            user.push_str("\n\nProgress so far:\n\n");
            user.push_str(&scratchpad.render());
            user.push_str("Continue.");
        }

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }

    async fn load_state(
        &self,
        input: &TaskInput,
        options: &crate::types::ExecutionOptions,
    ) -> Result<State, AgentError> {
        if options.enable_memory && options.load_history {
            if let Some(cp) = &self.checkpointer {
                if let Some(state) = cp.load(&input.session_id).await.map_err(|e| {
                    AgentError::new(ErrorKind::StateLoad, "agent", "load_state", "history load failed")
                        .with_source(e)
                })? {
                    return Ok(state);
                }
            }
        }
        Ok(State::new())
    }

    async fn save_memory(
        &self,
        input: &TaskInput,
        options: &crate::types::ExecutionOptions,
        state: &Arc<State>,
        output: &TaskOutput,
    ) -> Result<(), AgentError> {
        if !(options.enable_memory && options.save_to_memory) {
            return Ok(());
        }
        let Some(cp) = &self.checkpointer else {
            return Ok(());
        };

        let mut history = state
            .get("history")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        history.push(json!({
            "task": input.task,
            "result": output.result,
            "status": output.status,
        }));
        let keep = options.max_history_length.max(1);
        if history.len() > keep {
            history.drain(..history.len() - keep);
        }
        state.set("history", Value::Array(history));

        cp.save(&input.session_id, state).await.map_err(|e| {
            AgentError::new(ErrorKind::StateSave, "agent", "save_memory", "history save failed")
                .with_source(e)
        })
    }
}

enum LoopSignal {
    Continue,
    Stop,
}

#[async_trait]
impl Runnable for ReActAgent {
    type Input = TaskInput;
    type Output = TaskOutput;

    async fn invoke(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<TaskOutput, AgentError> {
        let callbacks = CallbackSet::new(self.config.callbacks().to_vec());
        self.run_loop(ctx, input, callbacks, EventSink::disconnected())
            .await
    }

    /// Streams the run as serialized stream events, closing with the final
    /// output chunk.
    fn stream<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        input: TaskInput,
    ) -> BoxStream<'a, StreamChunk<TaskOutput>> {
        Box::pin(async_stream::stream! {
            let (stream, handle) = self.stream_multi(ctx, input, &StreamMode::ALL, 256);
            let subscribers: Vec<_> = StreamMode::ALL
                .iter()
                .filter_map(|m| stream.subscribe(*m))
                .map(|s| s.into_stream())
                .collect();
            let mut merged = futures::stream::select_all(subscribers);
            while let Some(event) = merged.next().await {
                yield StreamChunk::data(serde_json::to_value(&event).unwrap_or(Value::Null));
            }
            match handle.await {
                Ok(Ok(out)) => yield StreamChunk::finished(out),
                Ok(Err(err)) => yield StreamChunk::failed(err.to_string()),
                Err(join_err) => yield StreamChunk::failed(join_err.to_string()),
            }
        })
    }

    fn config(&self) -> &RunnableConfig {
        &self.config
    }

    fn as_fast(&self) -> Option<&dyn FastInvoker<Input = TaskInput, Output = TaskOutput>> {
        Some(self)
    }
}

#[async_trait]
impl FastInvoker for ReActAgent {
    /// Same loop, no callback emissions. Used by composition parents.
    async fn invoke_fast(
        &self,
        ctx: &CancellationToken,
        input: TaskInput,
    ) -> Result<TaskOutput, AgentError> {
        self.run_loop(ctx, input, CallbackSet::empty(), EventSink::disconnected())
            .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`ReActAgent`]. `build()` validates the wiring: an LLM is
/// required, tool names must be unique, and agent-as-tool cycles are
/// rejected.
pub struct ReActAgentBuilder {
    name:               String,
    description:        String,
    llm:                Option<Arc<dyn LlmClient>>,
    retry:              Option<RetryPolicy>,
    tools:              Vec<Arc<dyn Tool>>,
    system_prompt:      String,
    config:             RunnableConfig,
    max_iterations:     usize,
    max_parse_failures: usize,
    scratchpad_window:  usize,
    tool_concurrency:   usize,
    tool_retry_base:    Duration,
    store:              Option<Arc<dyn Store>>,
    checkpointer:       Option<Arc<dyn Checkpointer>>,
}

impl ReActAgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name:               name.into(),
            description:        String::new(),
            llm:                None,
            retry:              None,
            tools:              Vec::new(),
            system_prompt:      String::new(),
            config:             RunnableConfig::new(),
            max_iterations:     15,
            max_parse_failures: 3,
            scratchpad_window:  8,
            tool_concurrency:   4,
            tool_retry_base:    Duration::from_millis(50),
            store:              None,
            checkpointer:       None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Wrap the LLM with retry on transient errors at build time.
    pub fn retry_on_error(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Expose another agent as a tool of this one.
    pub fn subagent(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        agent: Arc<ReActAgent>,
    ) -> Self {
        self.tools.push(Arc::new(AgentTool::new(name, description, agent)));
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn config(mut self, config: RunnableConfig) -> Self {
        self.config = config;
        self
    }

    pub fn callback(mut self, callback: Arc<dyn crate::callbacks::AgentCallback>) -> Self {
        self.config = self.config.with_callback(callback);
        self
    }

    pub fn max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n.max(1);
        self
    }

    /// Consecutive unparseable responses tolerated before the run fails.
    pub fn max_parse_failures(mut self, n: usize) -> Self {
        self.max_parse_failures = n.max(1);
        self
    }

    /// Number of most recent steps kept verbatim in the rendered scratchpad.
    pub fn scratchpad_window(mut self, n: usize) -> Self {
        self.scratchpad_window = n.max(1);
        self
    }

    pub fn tool_concurrency(mut self, n: usize) -> Self {
        self.tool_concurrency = n.max(1);
        self
    }

    pub fn tool_retry_base(mut self, base: Duration) -> Self {
        self.tool_retry_base = base;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn build(self) -> Result<ReActAgent, AgentError> {
        if self.name.is_empty() {
            return Err(AgentError::new(
                ErrorKind::InvalidConfig,
                "agent",
                "build",
                "agent name must be non-empty",
            ));
        }
        let llm = self.llm.ok_or_else(|| {
            AgentError::new(
                ErrorKind::InvalidConfig,
                "agent",
                "build",
                "an LLM client is required",
            )
        })?;
        let llm: Arc<dyn LlmClient> = match self.retry {
            Some(policy) => Arc::new(RetryingLlm::new(llm, policy)),
            None => llm,
        };

        let mut registry = ToolRegistry::new();
        for tool in self.tools {
            if tool.wrapped_agents().iter().any(|n| n == &self.name) {
                return Err(AgentError::new(
                    ErrorKind::InvalidConfig,
                    "agent",
                    "build",
                    format!(
                        "agent-as-tool cycle: '{}' reaches itself through tool '{}'",
                        self.name,
                        tool.name()
                    ),
                ));
            }
            registry.register(tool)?;
        }

        Ok(ReActAgent {
            name:               self.name,
            description:        self.description,
            llm,
            tools:              Arc::new(registry),
            system_prompt:      self.system_prompt,
            config:             self.config,
            parser:             ResponseParser::new(),
            max_iterations:     self.max_iterations,
            max_parse_failures: self.max_parse_failures,
            scratchpad_window:  self.scratchpad_window,
            tool_concurrency:   self.tool_concurrency,
            tool_retry_base:    self.tool_retry_base,
            store:              self.store,
            checkpointer:       self.checkpointer,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent-as-tool
// ─────────────────────────────────────────────────────────────────────────────

/// Exposes an agent as a tool so supervisors and parent agents can delegate.
///
/// Delegated runs take the fast path: the wrapped agent's callbacks do not
/// fire inside the parent's invocation. The wrapper records every agent
/// reachable through it, which lets builders reject cyclic wirings.
pub struct AgentTool {
    name:        String,
    description: String,
    agent:       Arc<ReActAgent>,
    reachable:   Vec<String>,
}

impl AgentTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        agent: Arc<ReActAgent>,
    ) -> Self {
        let mut reachable = vec![agent.name().to_string()];
        for tool in agent.tool_registry().all() {
            reachable.extend(tool.wrapped_agents());
        }
        Self {
            name: name.into(),
            description: description.into(),
            agent,
            reachable,
        }
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn args_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "Task to delegate" },
                "instruction": { "type": "string", "description": "Optional steering instruction" }
            },
            "required": ["task"]
        })
    }

    async fn invoke(
        &self,
        ctx: &CancellationToken,
        args: &HashMap<String, Value>,
    ) -> Result<String, AgentError> {
        let task = args
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AgentError::invalid_input("agent_tool", "missing required 'task' argument")
            })?;
        let mut input = TaskInput::new(task);
        if let Some(instruction) = args.get("instruction").and_then(|v| v.as_str()) {
            input = input.with_instruction(instruction);
        }
        let output = try_invoke_fast(self.agent.as_ref(), ctx, input).await?;
        Ok(output.result_text())
    }

    fn wrapped_agents(&self) -> Vec<String> {
        self.reachable.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::tools::FunctionTool;

    fn weather_tool() -> Arc<dyn Tool> {
        Arc::new(
            FunctionTool::new("weather", "Look up weather for a city")
                .param("city", "string", "City name")
                .call(|args| {
                    Ok(format!(
                        "{{\"{}\": \"sunny\"}}",
                        args.get("city").and_then(|v| v.as_str()).unwrap_or("sf")
                    ))
                }),
        )
    }

    #[tokio::test]
    async fn cycle_in_agent_tools_is_rejected_at_build() {
        let inner = Arc::new(
            ReActAgent::builder("helper")
                .llm(Arc::new(MockLlm::scripted(vec![])))
                .build()
                .unwrap(),
        );
        // "outer" wrapping a tool that reaches "outer" must be rejected.
        let outer_as_tool = AgentTool::new("loopback", "delegates", Arc::new(
            ReActAgent::builder("outer")
                .llm(Arc::new(MockLlm::scripted(vec![])))
                .subagent("helper", "inner helper", inner)
                .build()
                .unwrap(),
        ));
        let err = ReActAgent::builder("outer")
            .llm(Arc::new(MockLlm::scripted(vec![])))
            .tool(Arc::new(outer_as_tool))
            .build()
            .unwrap_err();
        assert!(err.is_code(ErrorKind::InvalidConfig));
        assert!(err.message().contains("cycle"));
    }

    #[tokio::test]
    async fn subagent_delegation_takes_the_fast_path() {
        use crate::callbacks::AgentCallback;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counter(AtomicUsize);
        #[async_trait]
        impl AgentCallback for Counter {
            async fn on_start(&self, _input: &TaskInput) -> Result<(), AgentError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let child_counter = Arc::new(Counter(AtomicUsize::new(0)));
        let child = Arc::new(
            ReActAgent::builder("calc")
                .llm(Arc::new(MockLlm::scripted(vec![
                    "Final Answer: the result is 42".to_string(),
                ])))
                .callback(Arc::clone(&child_counter) as Arc<dyn AgentCallback>)
                .build()
                .unwrap(),
        );

        let parent = ReActAgent::builder("parent")
            .llm(Arc::new(MockLlm::scripted(vec![
                "Thought: delegate\nAction: calc\nAction Input: {\"task\": \"add 20 and 22\"}"
                    .to_string(),
                "Final Answer: the calculator said 42".to_string(),
            ])))
            .subagent("calc", "a calculator agent", child)
            .build()
            .unwrap();

        let ctx = CancellationToken::new();
        let output = parent.invoke(&ctx, TaskInput::new("ask the calc")).await.unwrap();

        assert_eq!(output.status, TaskStatus::Success);
        assert!(output.result_text().contains("42"));
        assert_eq!(output.tool_calls.len(), 1);
        assert_eq!(output.tool_calls[0].tool_name, "calc");
        assert!(output.tool_calls[0].output.contains("42"));
        // Child callbacks never fired: the nested call was fast-path.
        assert_eq!(child_counter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reasoning_steps_are_strictly_numbered() {
        let agent = ReActAgent::builder("stepper")
            .llm(Arc::new(MockLlm::scripted(vec![
                "Thought: check\nAction: weather\nAction Input: {\"city\": \"sf\"}".to_string(),
                "gibberish without protocol markers".to_string(),
                "Final Answer: sunny in sf".to_string(),
            ])))
            .tool(weather_tool())
            .build()
            .unwrap();

        let ctx = CancellationToken::new();
        let output = agent.invoke(&ctx, TaskInput::new("weather in sf")).await.unwrap();

        assert_eq!(output.status, TaskStatus::Success);
        for (i, step) in output.reasoning_steps.iter().enumerate() {
            assert_eq!(step.step, i + 1);
        }
        let total: Duration = output.reasoning_steps.iter().map(|s| s.duration).sum();
        assert!(output.latency >= total);
    }
}
