//! Multi-mode streaming demo: subscribe to token, update, and value events
//! while an agent runs.
//!
//! Run with: `cargo run --example streaming_modes`

use agentcore::llm::MockLlm;
use agentcore::{FunctionTool, ReActAgent, StreamMode, TaskInput};
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let agent = ReActAgent::builder("narrator")
        .llm(Arc::new(MockLlm::scripted(vec![
            "Thought: check the time\nAction: clock\nAction Input: {}".to_string(),
            "Final Answer: all events delivered, task complete".to_string(),
        ])))
        .tool(Arc::new(
            FunctionTool::new("clock", "Tells the time").call(|_| Ok("12:00".to_string())),
        ))
        .build()?;

    let ctx = CancellationToken::new();
    let (stream, handle) = agent.stream_multi(
        &ctx,
        TaskInput::new("what time is it?"),
        &[StreamMode::Messages, StreamMode::Updates, StreamMode::Values],
        128,
    );

    // Token printer on the messages mode.
    let tokens = stream.subscribe(StreamMode::Messages).expect("mode selected");
    let printer = tokio::spawn(async move {
        while let Some(event) = tokens.recv().await {
            if let Some(token) = event.payload.as_str() {
                print!("{}", token);
                let _ = std::io::stdout().flush();
            }
        }
        println!();
    });

    // Update watcher on the updates mode.
    let updates = stream.subscribe(StreamMode::Updates).expect("mode selected");
    let watcher = tokio::spawn(async move {
        while let Some(event) = updates.recv().await {
            println!("\n[update] {} → {}", event.event_type, event.payload);
        }
    });

    let output = handle.await??;
    printer.await?;
    watcher.await?;

    println!("\nfinal  : {}", output.result_text());
    println!("values dropped: {}", stream.dropped(StreamMode::Values));
    Ok(())
}
