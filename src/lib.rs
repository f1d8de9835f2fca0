//! # agentcore
//!
//! An autonomous-agent execution engine: a ReAct reasoning loop over a
//! uniform [`Runnable`] contract, with chain/supervisor composition, a
//! callback-elided fast path for nested calls, and a multi-mode streaming
//! layer (`messages | updates | custom | values`).
//!
//! ```no_run
//! use agentcore::{ReActAgent, TaskInput, Runnable};
//! use agentcore::llm::MockLlm;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main] async fn main() -> Result<(), agentcore::AgentError> {
//! let agent = ReActAgent::builder("demo")
//!     .llm(Arc::new(MockLlm::scripted(vec!["Final Answer: 4".into()])))
//!     .build()?;
//! let output = agent.invoke(&CancellationToken::new(), TaskInput::new("what is 2+2")).await?;
//! assert!(output.result_text().contains("4"));
//! # Ok(()) }
//! ```

pub mod agent;
pub mod callbacks;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod llm;
pub mod middleware;
pub mod parser;
pub mod runnable;
pub mod runtime;
pub mod scratchpad;
pub mod state;
pub mod store;
pub mod stream;
pub mod supervisor;
pub mod tools;
pub mod types;

// Convenience re-exports at crate root
pub use agent::{AgentTool, ReActAgent, ReActAgentBuilder};
pub use callbacks::AgentCallback;
pub use chain::Chain;
pub use checkpoint::{Checkpointer, FileCheckpointer, MemoryCheckpointer, SqliteCheckpointer};
pub use config::RunnableConfig;
pub use error::{is_code, root_cause, AgentError, ErrorKind};
pub use llm::{LlmClient, MockLlm, RetryPolicy, RetryingLlm};
pub use middleware::{Middleware, MiddlewareAgent};
pub use runnable::{
    try_invoke_fast, BoxAgent, FastInvoker, FnRunnable, Piped, Runnable, RunnableExt, StreamChunk,
};
pub use runtime::Runtime;
pub use state::State;
pub use store::{InMemoryStore, Namespace, SqliteStore, Store};
pub use stream::{
    BackpressurePolicy, EventSink, ExecutorMode, FlushPolicy, MultiModeStream,
    ParallelToolExecutor, StreamEvent, StreamMode, ToolTask,
};
pub use supervisor::{
    AggregationPolicy, LlmRouter, RoundRobinRouter, RouteDecision, Router, RuleRouter, Supervisor,
};
pub use tools::{FunctionTool, Tool, ToolRegistry};
pub use types::{
    default_options, ExecutionOptions, ReasoningStep, TaskInput, TaskOutput, TaskStatus,
    TokenUsage, ToolCallRecord,
};
