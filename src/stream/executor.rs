use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, ErrorKind};
use crate::runtime::Runtime;
use crate::tools::{Tool, ToolRegistry};

/// One unit of work for the executor.
#[derive(Debug, Clone)]
pub struct ToolTask {
    pub id:          String,
    pub name:        String,
    pub args:        HashMap<String, Value>,
    /// Higher runs earlier when slots are contended.
    pub priority:    i32,
    pub timeout:     Option<Duration>,
    pub max_retries: u32,
    /// Ids that must complete before this task starts. Ordering only: a
    /// failed dependency does not skip its dependents.
    pub depends_on:  Vec<String>,
}

impl ToolTask {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: HashMap<String, Value>) -> Self {
        Self {
            id:          id.into(),
            name:        name.into(),
            args,
            priority:    0,
            timeout:     None,
            max_retries: 0,
            depends_on:  Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }
}

/// Outcome of one task. Exactly one of `output` / `error` is set.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskResult {
    pub id:       String,
    pub output:   Option<String>,
    pub error:    Option<String>,
    pub duration: Duration,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.output.is_some()
    }

    fn failure(id: String, error: impl Into<String>, duration: Duration) -> Self {
        Self { id, output: None, error: Some(error.into()), duration }
    }
}

/// Scheduling variants.
#[derive(Debug, Clone, Copy)]
pub enum ExecutorMode {
    /// Dependency levels run as groups with a barrier between them.
    Batch,
    /// The concurrency ceiling self-tunes between `min` and `max`: after
    /// each window the rolling latency below `target` halves the ceiling,
    /// above it doubles the ceiling.
    Adaptive {
        min:    usize,
        max:    usize,
        window: Duration,
        target: Duration,
    },
    /// Default scheduling, with every result also emitted as a `custom`
    /// stream event as it arrives.
    Streaming,
}

/// Executes a batch of tool calls under a bounded concurrency ceiling.
///
/// Dependencies are topologically ordered (a cycle is an `invalid-input`
/// error), independent calls run in parallel, and the result vector always
/// matches the input order regardless of completion order.
pub struct ParallelToolExecutor {
    tools:           Arc<ToolRegistry>,
    concurrency:     usize,
    cancel_on_error: bool,
    mode:            ExecutorMode,
    retry_base:      Duration,
}

impl ParallelToolExecutor {
    pub fn new(tools: Arc<ToolRegistry>, concurrency: usize) -> Self {
        Self {
            tools,
            concurrency: concurrency.max(1),
            cancel_on_error: false,
            mode: ExecutorMode::Streaming,
            retry_base: Duration::from_millis(50),
        }
    }

    pub fn with_mode(mut self, mode: ExecutorMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cancel_on_error(mut self, yes: bool) -> Self {
        self.cancel_on_error = yes;
        self
    }

    /// Injectable retry base delay, mainly for tests.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub async fn run(
        &self,
        ctx: &CancellationToken,
        tasks: Vec<ToolTask>,
        runtime: &Runtime,
    ) -> Result<Vec<TaskResult>, AgentError> {
        let input_order: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let levels = topo_levels(&tasks)?;

        let mut by_id: HashMap<String, ToolTask> =
            tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        let mut results: HashMap<String, TaskResult> = HashMap::new();

        match self.mode {
            ExecutorMode::Batch => {
                // Each level is a barrier: the next starts only when the
                // whole group has settled.
                for level in levels {
                    let group: Vec<ToolTask> = level
                        .iter()
                        .filter_map(|id| by_id.remove(id))
                        .collect();
                    self.run_group(ctx, group, runtime, &mut results).await;
                    if self.cancel_on_error
                        && results.values().any(|r| !r.is_success())
                    {
                        break;
                    }
                }
            }
            _ => {
                let all: Vec<ToolTask> = levels
                    .into_iter()
                    .flatten()
                    .filter_map(|id| by_id.remove(&id))
                    .collect();
                self.run_group(ctx, all, runtime, &mut results).await;
            }
        }

        // Anything never scheduled (cancelation, barrier break) reports as
        // canceled, keeping the result vector aligned with the input.
        Ok(input_order
            .into_iter()
            .map(|id| {
                results.remove(&id).unwrap_or_else(|| {
                    TaskResult::failure(id, "canceled before start", Duration::ZERO)
                })
            })
            .collect())
    }

    /// Dependency-aware scheduler for one task set.
    async fn run_group(
        &self,
        ctx: &CancellationToken,
        tasks: Vec<ToolTask>,
        runtime: &Runtime,
        results: &mut HashMap<String, TaskResult>,
    ) {
        let streaming = matches!(self.mode, ExecutorMode::Streaming);
        let (mut ceiling, adaptive) = match self.mode {
            ExecutorMode::Adaptive { min, max, .. } => {
                (self.concurrency.clamp(min.max(1), max.max(1)), Some((min.max(1), max.max(1))))
            }
            _ => (self.concurrency, None),
        };
        let (window, target) = match self.mode {
            ExecutorMode::Adaptive { window, target, .. } => (window, target),
            _ => (Duration::from_millis(100), Duration::ZERO),
        };

        let ids_in_group: std::collections::HashSet<&str> =
            tasks.iter().map(|t| t.id.as_str()).collect();
        let mut pending_deps: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for task in &tasks {
            let in_group = task
                .depends_on
                .iter()
                .filter(|d| ids_in_group.contains(d.as_str()) && !results.contains_key(*d))
                .count();
            pending_deps.insert(task.id.clone(), in_group);
            for dep in &task.depends_on {
                dependents.entry(dep.clone()).or_default().push(task.id.clone());
            }
        }

        let mut waiting: HashMap<String, ToolTask> = HashMap::new();
        let mut ready: Vec<ToolTask> = Vec::new();
        for task in tasks {
            if pending_deps[&task.id] == 0 {
                ready.push(task);
            } else {
                waiting.insert(task.id.clone(), task);
            }
        }
        ready.sort_by_key(|t| std::cmp::Reverse(t.priority));

        let child = ctx.child_token();
        let mut join_set: JoinSet<(String, TaskResult)> = JoinSet::new();
        let mut in_flight = 0usize;
        let mut scheduled = 0usize;
        let total = ready.len() + waiting.len();
        let mut halted = false;

        let mut window_start = Instant::now();
        let mut window_latencies: Vec<Duration> = Vec::new();

        while scheduled < total || in_flight > 0 {
            while in_flight < ceiling && !halted && !ready.is_empty() {
                let task = ready.remove(0);
                scheduled += 1;
                in_flight += 1;
                let tools = Arc::clone(&self.tools);
                let runtime = runtime.for_tool_call(task.id.clone());
                let token = child.clone();
                let retry_base = self.retry_base;
                join_set.spawn(async move {
                    let id = task.id.clone();
                    let result = execute_task(tools, runtime, token, task, retry_base, streaming).await;
                    (id, result)
                });
            }

            if in_flight == 0 {
                break;
            }

            let joined = join_set.join_next().await;
            in_flight -= 1;
            let (id, result) = match joined {
                Some(Ok(pair)) => pair,
                Some(Err(join_err)) => {
                    tracing::error!(error = %join_err, "tool task panicked");
                    continue;
                }
                None => break,
            };

            if self.cancel_on_error && !result.is_success() && !halted {
                halted = true;
                child.cancel();
            }

            if let Some((min, max)) = adaptive {
                window_latencies.push(result.duration);
                if window_start.elapsed() >= window {
                    let mean = window_latencies
                        .iter()
                        .sum::<Duration>()
                        .checked_div(window_latencies.len() as u32)
                        .unwrap_or(Duration::ZERO);
                    ceiling = if mean < target {
                        (ceiling / 2).max(min)
                    } else {
                        (ceiling * 2).min(max)
                    };
                    tracing::debug!(mean_ms = mean.as_millis() as u64, ceiling, "adaptive ceiling window");
                    window_start = Instant::now();
                    window_latencies.clear();
                }
            }

            for dependent in dependents.remove(&id).unwrap_or_default() {
                if let Some(count) = pending_deps.get_mut(&dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        if let Some(task) = waiting.remove(&dependent) {
                            let pos = ready
                                .iter()
                                .position(|t| t.priority < task.priority)
                                .unwrap_or(ready.len());
                            ready.insert(pos, task);
                        }
                    }
                }
            }

            results.insert(id, result);
        }

        // Ready/waiting tasks stranded by a halt report as canceled.
        for task in ready.into_iter().chain(waiting.into_values()) {
            results.insert(
                task.id.clone(),
                TaskResult::failure(task.id, "canceled before start", Duration::ZERO),
            );
        }
    }
}

/// Kahn's algorithm over the dependency edges. Returns ids grouped by depth;
/// unknown dependency ids and cycles are `invalid-input` errors.
fn topo_levels(tasks: &[ToolTask]) -> Result<Vec<Vec<String>>, AgentError> {
    let ids: std::collections::HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    if ids.len() != tasks.len() {
        return Err(AgentError::new(
            ErrorKind::InvalidInput,
            "executor",
            "run",
            "duplicate task ids",
        ));
    }
    for task in tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(AgentError::new(
                    ErrorKind::InvalidInput,
                    "executor",
                    "run",
                    format!("task '{}' depends on unknown id '{}'", task.id, dep),
                ));
            }
        }
    }

    let mut indegree: HashMap<&str, usize> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.depends_on {
            dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
        }
    }

    // Preserve input order within a level.
    let mut current: Vec<&str> = tasks
        .iter()
        .filter(|t| indegree[t.id.as_str()] == 0)
        .map(|t| t.id.as_str())
        .collect();
    let mut levels = Vec::new();
    let mut seen = 0usize;

    while !current.is_empty() {
        seen += current.len();
        let mut next = Vec::new();
        for id in &current {
            for dependent in dependents.remove(*id).unwrap_or_default() {
                let count = indegree.get_mut(dependent).expect("known id");
                *count -= 1;
                if *count == 0 {
                    next.push(dependent);
                }
            }
        }
        levels.push(current.iter().map(|s| s.to_string()).collect());
        current = next;
    }

    if seen != tasks.len() {
        return Err(AgentError::new(
            ErrorKind::InvalidInput,
            "executor",
            "run",
            "dependency cycle detected",
        ));
    }
    Ok(levels)
}

/// Dispatch one tool honoring its capabilities, the task timeout, and the
/// retry budget. Shared by the executor and the single-call loop path.
pub(crate) async fn dispatch_tool(
    tool: &Arc<dyn Tool>,
    ctx: &CancellationToken,
    args: &HashMap<String, Value>,
    runtime: &Runtime,
    timeout: Option<Duration>,
    max_retries: u32,
    retry_base: Duration,
) -> Result<String, AgentError> {
    let attempts = max_retries + 1;
    let mut last_err = None;

    for attempt in 0..attempts {
        let fut = invoke_by_capability(tool, ctx, args, runtime);
        let outcome = match timeout {
            Some(t) => tokio::select! {
                result = fut => result,
                _ = tokio::time::sleep(t) => Err(
                    AgentError::new(ErrorKind::ToolTimeout, "tool", "invoke", "tool deadline exceeded")
                        .with_context("tool", tool.name().to_string()),
                ),
                _ = ctx.cancelled() => Err(AgentError::canceled("tool", "invoke")),
            },
            None => tokio::select! {
                result = fut => result,
                _ = ctx.cancelled() => Err(AgentError::canceled("tool", "invoke")),
            },
        };

        match outcome {
            Ok(output) => return Ok(output),
            Err(err) if err.is_code(ErrorKind::Canceled) => return Err(err),
            Err(err) => {
                tracing::warn!(tool = tool.name(), attempt = attempt + 1, error = %err, "tool attempt failed");
                last_err = Some(err);
                if attempt + 1 < attempts {
                    let delay = retry_base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    let err = last_err.unwrap_or_else(|| AgentError::internal("tool", "empty retry loop"));
    if max_retries > 0 {
        Err(AgentError::new(
            ErrorKind::ToolRetryExhausted,
            "tool",
            "invoke",
            format!("tool '{}' failed after {} attempts", tool.name(), attempts),
        )
        .with_context("attempts", attempts.to_string())
        .with_source(err))
    } else {
        Err(err)
    }
}

async fn invoke_by_capability(
    tool: &Arc<dyn Tool>,
    ctx: &CancellationToken,
    args: &HashMap<String, Value>,
    runtime: &Runtime,
) -> Result<String, AgentError> {
    if let Some(streaming) = tool.as_streaming_tool() {
        use futures::StreamExt;
        let mut chunks = streaming.invoke_streaming(ctx, args, runtime);
        let mut assembled = String::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            runtime.emit_custom(
                "tool_chunk",
                json!({ "tool": tool.name(), "chunk": chunk }),
            );
            assembled.push_str(&chunk);
        }
        return Ok(assembled);
    }
    if let Some(runtime_tool) = tool.as_runtime_tool() {
        return runtime_tool.invoke_with_runtime(ctx, args, runtime).await;
    }
    tool.invoke(ctx, args).await
}

async fn execute_task(
    tools: Arc<ToolRegistry>,
    runtime: Runtime,
    ctx: CancellationToken,
    task: ToolTask,
    retry_base: Duration,
    streaming: bool,
) -> TaskResult {
    let start = Instant::now();
    let tool = match tools.get(&task.name) {
        Some(t) => Arc::clone(t),
        None => {
            return TaskResult::failure(
                task.id,
                format!("tool not found: {}", task.name),
                start.elapsed(),
            )
        }
    };

    let timeout = task.timeout.or_else(|| tool.timeout());
    let retries = task.max_retries.max(tool.max_retries());
    let outcome = dispatch_tool(&tool, &ctx, &task.args, &runtime, timeout, retries, retry_base).await;
    let duration = start.elapsed();

    let result = match outcome {
        Ok(output) => TaskResult {
            id: task.id.clone(),
            output: Some(output),
            error: None,
            duration,
        },
        Err(err) => TaskResult::failure(task.id.clone(), err.to_string(), duration),
    };

    if streaming {
        runtime.emit_custom(
            "tool_result",
            json!({
                "id": result.id,
                "tool": task.name,
                "success": result.is_success(),
                "output": result.output,
                "error": result.error,
                "duration_ms": duration.as_millis() as u64,
            }),
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;
    use crate::tools::FunctionTool;

    fn sleepy_registry() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        for (name, ms) in [("fast", 20u64), ("medium", 40), ("slow", 60)] {
            reg.register(Arc::new(
                FunctionTool::new(name, "sleeps then answers").call(move |_| {
                    std::thread::sleep(Duration::from_millis(ms));
                    Ok(format!("{} done", name))
                }),
            ))
            .unwrap();
        }
        reg.register(Arc::new(
            FunctionTool::new("fails", "always errors").call(|_| Err("nope".to_string())),
        ))
        .unwrap();
        Arc::new(reg)
    }

    fn runtime() -> Runtime {
        Runtime::new(Arc::new(State::new()), "exec-test")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn results_keep_input_order() {
        let exec = ParallelToolExecutor::new(sleepy_registry(), 3);
        let ctx = CancellationToken::new();
        let tasks = vec![
            ToolTask::new("t1", "slow", HashMap::new()),
            ToolTask::new("t2", "fast", HashMap::new()),
            ToolTask::new("t3", "medium", HashMap::new()),
        ];
        let results = exec.run(&ctx, tasks, &runtime()).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
        assert!(results.iter().all(|r| r.is_success()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_failure_does_not_cancel_siblings() {
        let exec = ParallelToolExecutor::new(sleepy_registry(), 2);
        let ctx = CancellationToken::new();
        let tasks = vec![
            ToolTask::new("bad", "fails", HashMap::new()),
            ToolTask::new("good", "fast", HashMap::new()),
        ];
        let results = exec.run(&ctx, tasks, &runtime()).await.unwrap();
        assert!(!results[0].is_success());
        assert!(results[1].is_success());
    }

    #[tokio::test]
    async fn dependencies_run_in_topological_order() {
        let done: Arc<std::sync::Mutex<Vec<&'static str>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        for name in ["a", "b", "c"] {
            let done = Arc::clone(&done);
            reg.register(Arc::new(
                FunctionTool::new(name, "records completion").call(move |_| {
                    done.lock().unwrap().push(name);
                    Ok(name.to_string())
                }),
            ))
            .unwrap();
        }
        let exec = ParallelToolExecutor::new(Arc::new(reg), 3);
        let ctx = CancellationToken::new();
        let tasks = vec![
            ToolTask::new("c", "c", HashMap::new()).after("b"),
            ToolTask::new("a", "a", HashMap::new()),
            ToolTask::new("b", "b", HashMap::new()).after("a"),
        ];
        let results = exec.run(&ctx, tasks, &runtime()).await.unwrap();
        assert!(results.iter().all(|r| r.is_success()));
        assert_eq!(done.lock().unwrap().clone(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cycle_is_invalid_input() {
        let exec = ParallelToolExecutor::new(sleepy_registry(), 2);
        let ctx = CancellationToken::new();
        let tasks = vec![
            ToolTask::new("x", "fast", HashMap::new()).after("y"),
            ToolTask::new("y", "fast", HashMap::new()).after("x"),
        ];
        let err = exec.run(&ctx, tasks, &runtime()).await.unwrap_err();
        assert!(err.is_code(ErrorKind::InvalidInput));
    }

    #[tokio::test]
    async fn cancel_on_error_halts_pending_work() {
        let exec = ParallelToolExecutor::new(sleepy_registry(), 1).with_cancel_on_error(true);
        let ctx = CancellationToken::new();
        let tasks = vec![
            ToolTask::new("bad", "fails", HashMap::new()),
            ToolTask::new("later", "fast", HashMap::new()).after("bad"),
        ];
        let results = exec.run(&ctx, tasks, &runtime()).await.unwrap();
        assert!(!results[0].is_success());
        assert_eq!(results[1].error.as_deref(), Some("canceled before start"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_ceiling_bounds_parallelism() {
        // With a ceiling of 1 the three sleeps serialize; with 3 they overlap.
        let exec = ParallelToolExecutor::new(sleepy_registry(), 3);
        let ctx = CancellationToken::new();
        let tasks = vec![
            ToolTask::new("t1", "fast", HashMap::new()),
            ToolTask::new("t2", "medium", HashMap::new()),
            ToolTask::new("t3", "slow", HashMap::new()),
        ];
        let start = Instant::now();
        exec.run(&ctx, tasks, &runtime()).await.unwrap();
        let parallel = start.elapsed();
        assert!(parallel < Duration::from_millis(115), "expected overlap, took {:?}", parallel);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn streaming_mode_emits_results_as_custom_events() {
        use crate::stream::{MultiModeStream, StreamMode};
        let stream = MultiModeStream::new(&[StreamMode::Custom], 16);
        let rt = runtime().with_sink(stream.sink());

        let exec = ParallelToolExecutor::new(sleepy_registry(), 2)
            .with_mode(ExecutorMode::Streaming);
        let ctx = CancellationToken::new();
        let tasks = vec![
            ToolTask::new("t1", "fast", HashMap::new()),
            ToolTask::new("t2", "medium", HashMap::new()),
        ];
        exec.run(&ctx, tasks, &rt).await.unwrap();
        stream.close();

        let sub = stream.subscribe(StreamMode::Custom).unwrap();
        let mut events = Vec::new();
        while let Some(e) = sub.recv().await {
            events.push(e);
        }
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == "tool_result"));
    }

    #[tokio::test]
    async fn retry_budget_is_honored_then_exhausted() {
        let calls = Arc::new(std::sync::Mutex::new(0u32));
        let mut reg = ToolRegistry::new();
        let counter = Arc::clone(&calls);
        reg.register(Arc::new(
            FunctionTool::new("flaky", "fails forever").call(move |_| {
                *counter.lock().unwrap() += 1;
                Err("still broken".to_string())
            }),
        ))
        .unwrap();

        let exec = ParallelToolExecutor::new(Arc::new(reg), 1)
            .with_retry_base(Duration::from_millis(1));
        let ctx = CancellationToken::new();
        let tasks = vec![ToolTask::new("t", "flaky", HashMap::new()).with_retries(2)];
        let results = exec.run(&ctx, tasks, &runtime()).await.unwrap();

        assert!(!results[0].is_success());
        assert!(results[0].error.as_ref().unwrap().contains("tool-retry-exhausted"));
        assert_eq!(*calls.lock().unwrap(), 3);
    }
}
