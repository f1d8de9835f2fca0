//! Minimal end-to-end run: one agent, one tool, scripted LLM.
//!
//! Run with: `cargo run --example basic_react`

use agentcore::llm::MockLlm;
use agentcore::{FunctionTool, ReActAgent, Runnable, TaskInput};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // A scripted LLM keeps the demo deterministic and offline. Swap in any
    // `LlmClient` implementation for real runs.
    let llm = MockLlm::scripted(vec![
        "Thought: I should check the calculator\nAction: calculator\nAction Input: {\"a\": 123, \"b\": 456}"
            .to_string(),
        "Final Answer: 123 + 456 = 579".to_string(),
    ]);

    let agent = ReActAgent::builder("arithmetic")
        .description("adds numbers with a calculator tool")
        .llm(Arc::new(llm))
        .tool(Arc::new(
            FunctionTool::new("calculator", "Adds two numbers")
                .param("a", "number", "First number")
                .param("b", "number", "Second number")
                .call(|args| {
                    let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    Ok((a + b).to_string())
                }),
        ))
        .build()?;

    let ctx = CancellationToken::new();
    let output = agent.invoke(&ctx, TaskInput::new("add 123 and 456")).await?;

    println!("status : {:?}", output.status);
    println!("answer : {}", output.result_text());
    println!("steps  :");
    for step in &output.reasoning_steps {
        println!(
            "  {}. [{}] {} ({:?})",
            step.step, step.action, step.result, step.duration
        );
    }
    println!("tools  : {} call(s)", output.tool_calls.len());
    Ok(())
}
