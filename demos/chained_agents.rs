//! Composition demo: a two-stage chain behind a supervisor with a rule
//! router.
//!
//! Run with: `cargo run --example chained_agents`

use agentcore::llm::MockLlm;
use agentcore::{BoxAgent, Chain, ReActAgent, RuleRouter, Runnable, Supervisor, TaskInput};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn scripted(name: &str, answer: &str) -> BoxAgent {
    Arc::new(
        ReActAgent::builder(name)
            .llm(Arc::new(MockLlm::scripted(vec![format!("Final Answer: {}", answer)])))
            .build()
            .expect("agent builds"),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let ctx = CancellationToken::new();

    // Sequential pipeline: drafting feeds review.
    let pipeline = Chain::new(
        "write-then-review",
        vec![
            scripted("drafter", "draft: release notes v1"),
            scripted("reviewer", "reviewed and approved"),
        ],
    );
    let out = pipeline
        .invoke(&ctx, TaskInput::new("write the release notes"))
        .await?;
    println!("chain result : {}", out.result_text());
    println!("chain trace  : {}", out.metadata["chain_trace"]);

    // Rule-routed supervisor over two specialists.
    let supervisor = Supervisor::new(
        "assistant",
        Box::new(
            RuleRouter::new()
                .keyword_rule(&["meeting", "schedule"], "calendar")
                .fallback("email"),
        ),
    )
    .agent("calendar", "books meetings", scripted("calendar", "meeting booked"))
    .agent("email", "writes email", scripted("email", "email sent"));

    for task in ["schedule a sync with the team", "tell bob the build is green"] {
        let out = supervisor.invoke(&ctx, TaskInput::new(task)).await?;
        println!(
            "'{}' → {} (by {})",
            task,
            out.result_text(),
            out.metadata["sub_agent"]
        );
    }
    Ok(())
}
