//! ReAct loop integration tests.
//!
//! All tests use `MockLlm` — no network calls are made.
//! Run with: `cargo test`

use agentcore::llm::{MockLlm, ScriptedFailure};
use agentcore::{
    default_options, AgentCallback, AgentError, ErrorKind, FastInvoker, FunctionTool, ReActAgent,
    RetryPolicy, Runnable, TaskInput, TaskOutput, TaskStatus, TokenUsage,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ─────────────────────────────────────────────────────────────────────────────
// Test helpers
// ─────────────────────────────────────────────────────────────────────────────

fn ctx() -> CancellationToken {
    CancellationToken::new()
}

fn weather_tool() -> Arc<FunctionTool> {
    Arc::new(
        FunctionTool::new("weather", "Look up the weather for a city")
            .param("city", "string", "City to check")
            .call(|_args| Ok("{\"sf\": \"sunny\"}".to_string())),
    )
}

fn action(tool: &str, args: &str) -> String {
    format!("Thought: use the tool\nAction: {}\nAction Input: {}", tool, args)
}

fn agent_with(llm: MockLlm) -> ReActAgent {
    ReActAgent::builder("test-agent")
        .llm(Arc::new(llm))
        .tool(weather_tool())
        .build()
        .expect("builder should succeed")
}

/// Records callback event labels in arrival order.
struct Recorder(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl AgentCallback for Recorder {
    async fn on_start(&self, _input: &TaskInput) -> Result<(), AgentError> {
        self.0.lock().unwrap().push("start".into());
        Ok(())
    }
    async fn on_llm_start(&self, _prompts: &[String]) -> Result<(), AgentError> {
        self.0.lock().unwrap().push("llm_start".into());
        Ok(())
    }
    async fn on_llm_end(&self, _text: &str, _usage: &TokenUsage) -> Result<(), AgentError> {
        self.0.lock().unwrap().push("llm_end".into());
        Ok(())
    }
    async fn on_tool_start(
        &self,
        name: &str,
        _args: &HashMap<String, serde_json::Value>,
    ) -> Result<(), AgentError> {
        self.0.lock().unwrap().push(format!("tool_start:{}", name));
        Ok(())
    }
    async fn on_tool_end(&self, name: &str, _result: &str) -> Result<(), AgentError> {
        self.0.lock().unwrap().push(format!("tool_end:{}", name));
        Ok(())
    }
    async fn on_agent_finish(&self, _output: &TaskOutput) -> Result<(), AgentError> {
        self.0.lock().unwrap().push("finish".into());
        Ok(())
    }
    async fn on_error(&self, _err: &AgentError) -> Result<(), AgentError> {
        self.0.lock().unwrap().push("error".into());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario 1: pure reasoning, no tools
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn pure_reasoning_makes_one_llm_call_and_no_tool_calls() {
    let llm = MockLlm::scripted(vec!["Final Answer: 4".to_string()]);
    let llm = Arc::new(llm);
    let agent = ReActAgent::builder("math")
        .llm(Arc::clone(&llm) as Arc<dyn agentcore::LlmClient>)
        .build()
        .unwrap();

    let input = TaskInput::new("what is 2+2").with_options(
        default_options()
            .with_tools_enabled(false)
            .with_max_tool_calls(0),
    );
    let output = agent.invoke(&ctx(), input).await.unwrap();

    assert_eq!(output.status, TaskStatus::Success);
    assert!(output.tool_calls.is_empty());
    assert!(!output.reasoning_steps.is_empty());
    assert!(output.result_text().contains('4'));
    assert_eq!(llm.call_count(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario 2: single tool dispatch
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_tool_dispatch_records_the_call() {
    let agent = agent_with(MockLlm::scripted(vec![
        action("weather", "{\"city\": \"SF\"}"),
        "Final Answer: it is sunny in SF".to_string(),
    ]));

    let input = TaskInput::new("weather in SF").with_options(
        default_options().with_allowed_tools(vec!["weather".to_string()]),
    );
    let output = agent.invoke(&ctx(), input).await.unwrap();

    assert_eq!(output.status, TaskStatus::Success);
    assert_eq!(output.tool_calls.len(), 1);
    assert_eq!(output.tool_calls[0].tool_name, "weather");
    assert!(output.tool_calls[0].success);
    assert!(output.result_text().contains("sunny"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario 3: retry exhaustion
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rate_limit_exhaustion_fails_with_attempt_count() {
    let agent = ReActAgent::builder("limited")
        .llm(Arc::new(
            MockLlm::scripted(vec!["unreached".to_string()])
                .failing_first(4, ScriptedFailure::RateLimited),
        ))
        .retry_on_error(RetryPolicy::fast())
        .build()
        .unwrap();

    let err = agent.invoke(&ctx(), TaskInput::new("anything")).await.unwrap_err();

    assert!(err.is_code(ErrorKind::RateLimited));
    assert_eq!(err.context().get("attempts").map(String::as_str), Some("3"));
    let partial = err.partial_output().expect("partial output attached");
    assert_eq!(partial.status, TaskStatus::Failed);
    assert!(partial.tool_calls.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Boundary behaviors
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn zero_timeout_yields_immediate_partial() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let agent = ReActAgent::builder("instant")
        .llm(Arc::new(MockLlm::scripted(vec!["Final Answer: never".to_string()])))
        .tool(weather_tool())
        .callback(Arc::new(Recorder(Arc::clone(&log))))
        .build()
        .unwrap();
    let input =
        TaskInput::new("t").with_options(default_options().with_timeout(Duration::ZERO));
    let output = agent.invoke(&ctx(), input).await.unwrap();

    assert_eq!(output.status, TaskStatus::Partial);
    assert_eq!(output.metadata.get("error_kind"), Some(&json!("canceled")));
    assert!(output.tool_calls.is_empty());
    // The finish callback still fires on this boundary: no LLM or tool
    // events, but start and finish bracket the partial result as usual.
    assert_eq!(log.lock().unwrap().clone(), vec!["start", "finish"]);
}

#[tokio::test]
async fn max_iterations_one_allows_at_most_one_tool_call() {
    let agent = ReActAgent::builder("short")
        .llm(Arc::new(MockLlm::scripted(vec![
            action("weather", "{\"city\": \"SF\"}"),
            action("weather", "{\"city\": \"LA\"}"),
        ])))
        .tool(weather_tool())
        .max_iterations(1)
        .build()
        .unwrap();

    let output = agent.invoke(&ctx(), TaskInput::new("t")).await.unwrap();
    assert_eq!(output.status, TaskStatus::Partial);
    assert_eq!(output.message, "iteration limit reached");
    assert!(output.tool_calls.len() <= 1);
}

#[tokio::test]
async fn max_tool_calls_is_a_hard_upper_bound() {
    let responses: Vec<String> = (0..6)
        .map(|_| action("weather", "{\"city\": \"SF\"}"))
        .collect();
    let agent = agent_with(MockLlm::scripted(responses));

    let input = TaskInput::new("t").with_options(default_options().with_max_tool_calls(2));
    let output = agent.invoke(&ctx(), input).await.unwrap();

    assert!(output.tool_calls.len() <= 2);
    assert_eq!(output.status, TaskStatus::Partial);
    assert_eq!(output.message, "tool call limit reached");
}

#[tokio::test]
async fn unknown_tool_becomes_synthetic_observation_and_continues() {
    let agent = agent_with(MockLlm::scripted(vec![
        action("teleport", "{}"),
        "Final Answer: fell back to reasoning".to_string(),
    ]));

    let output = agent.invoke(&ctx(), TaskInput::new("t")).await.unwrap();
    assert_eq!(output.status, TaskStatus::Success);
    // No registry dispatch happened, so no tool-call record.
    assert!(output.tool_calls.is_empty());
    let step = &output.reasoning_steps[0];
    assert!(step.result.contains("tool not found: teleport"));
}

#[tokio::test]
async fn disallowed_tool_is_not_dispatched() {
    let agent = agent_with(MockLlm::scripted(vec![
        action("weather", "{\"city\": \"SF\"}"),
        "Final Answer: done without tools".to_string(),
    ]));

    let input =
        TaskInput::new("t").with_options(default_options().with_allowed_tools(vec![]));
    let output = agent.invoke(&ctx(), input).await.unwrap();
    assert!(output.tool_calls.is_empty());
    assert!(output.reasoning_steps[0].result.contains("tool not permitted"));
}

#[tokio::test]
async fn consecutive_parse_failures_fail_the_run() {
    let agent = agent_with(MockLlm::scripted(vec![
        "nonsense one".to_string(),
        "nonsense two".to_string(),
        "nonsense three".to_string(),
        "Final Answer: unreached".to_string(),
    ]));

    let err = agent.invoke(&ctx(), TaskInput::new("t")).await.unwrap_err();
    assert!(err.is_code(ErrorKind::ParserFailed));
    let partial = err.partial_output().unwrap();
    assert_eq!(partial.reasoning_steps.len(), 3);
    assert!(partial.reasoning_steps.iter().all(|s| !s.success));
}

#[tokio::test]
async fn one_parse_failure_recovers_via_synthetic_observation() {
    let agent = agent_with(MockLlm::scripted(vec![
        "nonsense".to_string(),
        "Final Answer: recovered".to_string(),
    ]));

    let output = agent.invoke(&ctx(), TaskInput::new("t")).await.unwrap();
    assert_eq!(output.status, TaskStatus::Success);
    assert!(output.reasoning_steps[0]
        .result
        .contains("output could not be parsed"));
}

#[tokio::test]
async fn tool_error_becomes_observation_and_loop_continues() {
    let broken = Arc::new(
        FunctionTool::new("broken", "always fails").call(|_| Err("exploded".to_string())),
    );
    let agent = ReActAgent::builder("resilient")
        .llm(Arc::new(MockLlm::scripted(vec![
            action("broken", "{}"),
            "Final Answer: coped with the failure".to_string(),
        ])))
        .tool(broken)
        .build()
        .unwrap();

    let output = agent.invoke(&ctx(), TaskInput::new("t")).await.unwrap();
    assert_eq!(output.status, TaskStatus::Success);
    assert_eq!(output.tool_calls.len(), 1);
    assert!(!output.tool_calls[0].success);
    assert!(output.tool_calls[0].error.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_mid_loop_yields_partial_within_grace() {
    let slow = Arc::new(FunctionTool::new("slow", "sleeps").call(|_| {
        std::thread::sleep(Duration::from_millis(400));
        Ok("slept".to_string())
    }));
    let agent = ReActAgent::builder("cancelable")
        .llm(Arc::new(MockLlm::scripted(vec![
            action("slow", "{}"),
            "Final Answer: unreached".to_string(),
        ])))
        .tool(slow)
        .build()
        .unwrap();

    let token = ctx();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let output = agent.invoke(&token, TaskInput::new("t")).await.unwrap();
    assert_eq!(output.status, TaskStatus::Partial);
    assert_eq!(output.metadata.get("error_kind"), Some(&json!("canceled")));
    assert!(started.elapsed() < Duration::from_secs(1), "grace window exceeded");
    // The final step marks the cancellation.
    let last = output.reasoning_steps.last().unwrap();
    assert_eq!(last.action, "canceled");
}

// ─────────────────────────────────────────────────────────────────────────────
// Callback boundary
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn callbacks_fire_in_lifecycle_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let agent = ReActAgent::builder("observed")
        .llm(Arc::new(MockLlm::scripted(vec![
            action("weather", "{\"city\": \"SF\"}"),
            "Final Answer: sunny".to_string(),
        ])))
        .tool(weather_tool())
        .callback(Arc::new(Recorder(Arc::clone(&log))))
        .build()
        .unwrap();

    agent.invoke(&ctx(), TaskInput::new("t")).await.unwrap();

    let events = log.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "start",
            "llm_start",
            "llm_end",
            "tool_start:weather",
            "tool_end:weather",
            "llm_start",
            "llm_end",
            "finish",
        ]
    );
}

#[tokio::test]
async fn fast_path_elides_all_callbacks() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let agent = ReActAgent::builder("quiet")
        .llm(Arc::new(MockLlm::scripted(vec!["Final Answer: ok".to_string()])))
        .callback(Arc::new(Recorder(Arc::clone(&log))))
        .build()
        .unwrap();

    let output = agent.invoke_fast(&ctx(), TaskInput::new("t")).await.unwrap();
    assert_eq!(output.status, TaskStatus::Success);
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn fast_and_slow_paths_produce_equal_results() {
    let script = vec![
        action("weather", "{\"city\": \"SF\"}"),
        "Final Answer: sunny".to_string(),
    ];
    let slow_agent = agent_with(MockLlm::scripted(script.clone()));
    let fast_agent = agent_with(MockLlm::scripted(script));

    let slow = slow_agent.invoke(&ctx(), TaskInput::new("t")).await.unwrap();
    let fast = fast_agent.invoke_fast(&ctx(), TaskInput::new("t")).await.unwrap();

    // Structurally equal ignoring timestamps and latency.
    assert_eq!(slow.result, fast.result);
    assert_eq!(slow.status, fast.status);
    assert_eq!(slow.message, fast.message);
    assert_eq!(slow.reasoning_steps.len(), fast.reasoning_steps.len());
    assert_eq!(slow.tool_calls.len(), fast.tool_calls.len());
    assert_eq!(slow.tool_calls[0].output, fast.tool_calls[0].output);
}

// ─────────────────────────────────────────────────────────────────────────────
// Native tool-calling path
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn native_parallel_tool_calls_merge_in_input_order() {
    use agentcore::llm::{LlmToolCall, ToolCallResponse};

    let llm = MockLlm::scripted(vec!["Final Answer: both checked".to_string()])
        .with_tool_turns(vec![ToolCallResponse {
            content: "checking both".to_string(),
            tool_calls: vec![
                LlmToolCall {
                    id:        "a".to_string(),
                    name:      "weather".to_string(),
                    arguments: HashMap::from([("city".to_string(), json!("SF"))]),
                },
                LlmToolCall {
                    id:        "b".to_string(),
                    name:      "weather".to_string(),
                    arguments: HashMap::from([("city".to_string(), json!("LA"))]),
                },
            ],
            usage: TokenUsage::new(10, 10),
        }]);

    let agent = agent_with(llm);
    let output = agent.invoke(&ctx(), TaskInput::new("weather in SF and LA")).await.unwrap();

    assert_eq!(output.status, TaskStatus::Success);
    assert_eq!(output.tool_calls.len(), 2);
    assert_eq!(output.tool_calls[0].input.get("city"), Some(&json!("SF")));
    assert_eq!(output.tool_calls[1].input.get("city"), Some(&json!("LA")));
}

// ─────────────────────────────────────────────────────────────────────────────
// Output invariants
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn latency_dominates_step_durations_and_steps_are_sequential() {
    let agent = agent_with(MockLlm::scripted(vec![
        action("weather", "{\"city\": \"SF\"}"),
        action("weather", "{\"city\": \"LA\"}"),
        "Final Answer: done".to_string(),
    ]));

    let output = agent.invoke(&ctx(), TaskInput::new("t")).await.unwrap();

    for (i, step) in output.reasoning_steps.iter().enumerate() {
        assert_eq!(step.step, i + 1, "step numbers must be 1-based and dense");
    }
    let step_total: Duration = output.reasoning_steps.iter().map(|s| s.duration).sum();
    assert!(output.latency >= step_total);
    assert!(output.metadata.contains_key("tokens_used"));
}
