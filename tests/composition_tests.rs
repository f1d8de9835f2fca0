//! Chain / supervisor composition tests, including the fast-path
//! propagation guarantees.

use agentcore::llm::MockLlm;
use agentcore::runnable::FnRunnable;
use agentcore::{
    AgentCallback, AgentError, BoxAgent, Chain, ErrorKind, LlmRouter, ReActAgent, Runnable,
    Supervisor, TaskInput, TaskOutput, TaskStatus, try_invoke_fast,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn ctx() -> CancellationToken {
    CancellationToken::new()
}

/// Counts `on_start` deliveries, the probe for callback elision.
struct StartCounter(Arc<AtomicUsize>);

#[async_trait]
impl AgentCallback for StartCounter {
    async fn on_start(&self, _input: &TaskInput) -> Result<(), AgentError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn scripted_agent(name: &str, answer: &str, counter: Arc<AtomicUsize>) -> Arc<ReActAgent> {
    Arc::new(
        ReActAgent::builder(name)
            .llm(Arc::new(MockLlm::scripted(vec![format!("Final Answer: {}", answer)])))
            .callback(Arc::new(StartCounter(counter)))
            .build()
            .unwrap(),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario 4: chain composition
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn chain_of_two_agents_transforms_through_both() {
    let first: BoxAgent = Arc::new(FnRunnable::new(|_: TaskInput| {
        Ok(TaskOutput::success(
            Value::String("uppercase: hello".to_string()),
            "produced",
        ))
    }));
    let second: BoxAgent = Arc::new(FnRunnable::new(|input: TaskInput| {
        let prev = input
            .context
            .get("previous_result")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(TaskOutput::success(
            Value::String(prev.to_uppercase()),
            "uppercased",
        ))
    }));

    let chain = Chain::new("transform", vec![first, second]);
    let out = chain.invoke(&ctx(), TaskInput::new("say hello")).await.unwrap();

    assert_eq!(out.result_text(), "UPPERCASE: HELLO");
    // Metadata carries both agents' traces.
    let trace = out.metadata.get("chain_trace").unwrap().as_array().unwrap();
    assert_eq!(trace.len(), 2);
}

#[tokio::test]
async fn chain_children_run_on_the_fast_path() {
    let child_starts = Arc::new(AtomicUsize::new(0));
    let a = scripted_agent("a", "first", Arc::clone(&child_starts));
    let b = scripted_agent("b", "second", Arc::clone(&child_starts));

    let chain = Chain::new("quiet", vec![a as BoxAgent, b as BoxAgent]);
    let out = chain.invoke(&ctx(), TaskInput::new("t")).await.unwrap();

    assert_eq!(out.status, TaskStatus::Success);
    // Both children executed, neither fired its own boundary callbacks.
    assert_eq!(child_starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn chain_equals_pipe_composition() {
    fn stages() -> (BoxAgent, BoxAgent, BoxAgent) {
        let a: BoxAgent = Arc::new(FnRunnable::new(|_: TaskInput| {
            Ok(TaskOutput::success(json!("seed"), "a"))
        }));
        let b: BoxAgent = Arc::new(FnRunnable::new(|input: TaskInput| {
            let prev = input.context.get("previous_result").cloned().unwrap_or(Value::Null);
            Ok(TaskOutput::success(json!(format!("{}+b", prev.as_str().unwrap_or(""))), "b"))
        }));
        let c: BoxAgent = Arc::new(FnRunnable::new(|input: TaskInput| {
            let prev = input.context.get("previous_result").cloned().unwrap_or(Value::Null);
            Ok(TaskOutput::success(json!(format!("{}+c", prev.as_str().unwrap_or(""))), "c"))
        }));
        (a, b, c)
    }

    let (a1, b1, c1) = stages();
    let (a2, b2, c2) = stages();

    let direct = Chain::new("x", vec![a1, b1, c1]);
    let piped = Chain::new("x", vec![a2]).pipe(b2).pipe(c2);

    let lhs = direct.invoke(&ctx(), TaskInput::new("t")).await.unwrap();
    let rhs = piped.invoke(&ctx(), TaskInput::new("t")).await.unwrap();
    assert_eq!(lhs.result, rhs.result);
    assert_eq!(lhs.result, json!("seed+b+c"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario 5: supervisor routing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn supervisor_routes_via_llm_router_and_tags_metadata() {
    let calendar: BoxAgent = Arc::new(FnRunnable::new(|_: TaskInput| {
        Ok(TaskOutput::success(json!("meeting booked"), "ok"))
    }));
    let email: BoxAgent = Arc::new(FnRunnable::new(|_: TaskInput| {
        Ok(TaskOutput::success(json!("mail sent"), "ok"))
    }));

    // Router mock always picks `calendar`.
    let router = LlmRouter::new(Arc::new(MockLlm::scripted(vec!["calendar".to_string()])));
    let sup = Supervisor::new("assistant", Box::new(router))
        .agent("calendar", "handles scheduling", calendar)
        .agent("email", "handles correspondence", email);

    let out = sup.invoke(&ctx(), TaskInput::new("book a slot tomorrow")).await.unwrap();
    assert_eq!(out.metadata.get("sub_agent"), Some(&json!("calendar")));
    assert_eq!(out.result_text(), "meeting booked");
}

#[tokio::test]
async fn supervisor_children_run_on_the_fast_path() {
    let child_starts = Arc::new(AtomicUsize::new(0));
    let child = scripted_agent("worker", "done", Arc::clone(&child_starts));

    let router = LlmRouter::new(Arc::new(MockLlm::scripted(vec!["worker".to_string()])));
    let sup = Supervisor::new("boss", Box::new(router)).agent(
        "worker",
        "does the work",
        child as BoxAgent,
    );

    sup.invoke(&ctx(), TaskInput::new("t")).await.unwrap();
    assert_eq!(child_starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn llm_router_unknown_reply_is_routing_failed() {
    let router = LlmRouter::new(Arc::new(MockLlm::scripted(vec!["plumber".to_string()])));
    let sup = Supervisor::new("s", Box::new(router)).agent(
        "calendar",
        "scheduling",
        Arc::new(FnRunnable::new(|_: TaskInput| {
            Ok(TaskOutput::success(Value::Null, "ok"))
        })) as BoxAgent,
    );

    let err = sup.invoke(&ctx(), TaskInput::new("t")).await.unwrap_err();
    assert!(err.is_code(ErrorKind::RoutingFailed));
}

// ─────────────────────────────────────────────────────────────────────────────
// Middleware around a real agent
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn middleware_wraps_a_react_agent() {
    use agentcore::middleware::{DynamicPromptMiddleware, ValidationMiddleware};
    use agentcore::MiddlewareAgent;

    let inner = Arc::new(
        ReActAgent::builder("guarded")
            .llm(Arc::new(MockLlm::scripted(vec![
                "Final Answer: summarized".to_string(),
            ])))
            .build()
            .unwrap(),
    );
    let agent = MiddlewareAgent::new(inner as BoxAgent)
        .layer(Arc::new(ValidationMiddleware::new(200)))
        .layer(Arc::new(DynamicPromptMiddleware::new(|input| {
            format!("summarize briefly: {}", input.task)
        })));

    // The validation layer rejects a blank task before any LLM spend.
    let err = agent.invoke(&ctx(), TaskInput::new("  ")).await.unwrap_err();
    assert!(err.is_code(ErrorKind::InvalidInput));

    // A valid task flows through both layers into the wrapped agent.
    let out = agent.invoke(&ctx(), TaskInput::new("the meeting notes")).await.unwrap();
    assert_eq!(out.status, TaskStatus::Success);
    assert_eq!(out.result_text(), "summarized");

    // The fast path skips every layer: the blank task that validation
    // rejected above reaches the agent, which still answers from its script.
    let inner2 = Arc::new(
        ReActAgent::builder("guarded")
            .llm(Arc::new(MockLlm::scripted(vec![
                "Final Answer: unguarded".to_string(),
            ])))
            .build()
            .unwrap(),
    );
    let agent2 = MiddlewareAgent::new(inner2 as BoxAgent)
        .layer(Arc::new(ValidationMiddleware::new(200)));
    let out = try_invoke_fast(&agent2, &ctx(), TaskInput::new("  ")).await.unwrap();
    assert_eq!(out.result_text(), "unguarded");
}

// ─────────────────────────────────────────────────────────────────────────────
// try_invoke_fast law
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn try_invoke_fast_matches_capability() {
    // Without the capability: falls back to invoke.
    let plain = FnRunnable::new(|n: i64| Ok(n + 1));
    assert_eq!(try_invoke_fast(&plain, &ctx(), 1).await.unwrap(), 2);

    // With the capability: equals invoke_fast, which equals invoke modulo
    // callback side effects.
    let starts = Arc::new(AtomicUsize::new(0));
    let agent = scripted_agent("fastable", "same answer", Arc::clone(&starts));

    let via_fast = try_invoke_fast(agent.as_ref(), &ctx(), TaskInput::new("t"))
        .await
        .unwrap();
    assert_eq!(via_fast.result_text(), "same answer");
    assert_eq!(starts.load(Ordering::SeqCst), 0, "fast path must skip callbacks");

    let fresh = scripted_agent("fastable", "same answer", Arc::clone(&starts));
    let via_slow = fresh.invoke(&ctx(), TaskInput::new("t")).await.unwrap();
    assert_eq!(via_slow.result, via_fast.result);
    assert_eq!(starts.load(Ordering::SeqCst), 1, "slow path fires callbacks");
}
