use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, ErrorKind};
use crate::runtime::Runtime;

/// The tool contract.
///
/// # Contract
/// - `name()` must be unique within one agent's registry.
/// - `invoke()` never panics; all failures come back as `Err` with kind
///   `tool-execution`.
/// - Tools declare their own retry budget (`max_retries`) and optional
///   per-call timeout; the loop enforces both.
/// - Capability probes (`as_runtime_tool`, `as_streaming_tool`) replace
///   downcasting; override them to opt in.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-Schema object describing the accepted arguments.
    fn args_schema(&self) -> Value;

    async fn invoke(
        &self,
        ctx: &CancellationToken,
        args: &HashMap<String, Value>,
    ) -> Result<String, AgentError>;

    /// Per-call timeout enforced by the loop. `None` leaves only the
    /// invocation-level deadline.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Tool-declared retry budget for transient failures.
    fn max_retries(&self) -> u32 {
        0
    }

    /// Capability: receives a [`Runtime`] for state/store access and custom
    /// stream events.
    fn as_runtime_tool(&self) -> Option<&dyn RuntimeTool> {
        None
    }

    /// Capability: produces chunked output.
    fn as_streaming_tool(&self) -> Option<&dyn StreamingTool> {
        None
    }

    /// Names of agents reachable through this tool (agent-as-tool wrappers).
    /// Used to reject cyclic wirings at construction time.
    fn wrapped_agents(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Tools that read/write durable data or emit custom stream events.
#[async_trait]
pub trait RuntimeTool: Tool {
    async fn invoke_with_runtime(
        &self,
        ctx: &CancellationToken,
        args: &HashMap<String, Value>,
        runtime: &Runtime,
    ) -> Result<String, AgentError>;
}

/// Tools whose output arrives in chunks. Each chunk is surfaced as a
/// `custom` stream event; the concatenation becomes the observation.
pub trait StreamingTool: Tool {
    fn invoke_streaming<'a>(
        &'a self,
        ctx: &'a CancellationToken,
        args: &'a HashMap<String, Value>,
        runtime: &'a Runtime,
    ) -> BoxStream<'a, Result<String, AgentError>>;
}

/// Serializable descriptor used for the prompt catalogue and native
/// tool-calling providers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSchema {
    pub name:         String,
    pub description:  String,
    pub input_schema: Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// FunctionTool — closure-backed tool with a schema builder
// ─────────────────────────────────────────────────────────────────────────────

type Handler = Arc<dyn Fn(&HashMap<String, Value>) -> Result<String, String> + Send + Sync>;

/// A tool backed by a plain closure, with an ergonomic parameter builder.
///
/// ```no_run
/// # use agentcore::tools::FunctionTool;
/// let tool = FunctionTool::new("search", "Search the web")
///     .param("query", "string", "The search query")
///     .call(|args| Ok(format!("results for {}", args["query"])));
/// ```
#[derive(Clone)]
pub struct FunctionTool {
    name:        String,
    description: String,
    properties:  serde_json::Map<String, Value>,
    required:    Vec<String>,
    handler:     Option<Handler>,
    timeout:     Option<Duration>,
    max_retries: u32,
}

impl FunctionTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name:        name.into(),
            description: description.into(),
            properties:  serde_json::Map::new(),
            required:    Vec::new(),
            handler:     None,
            timeout:     None,
            max_retries: 0,
        }
    }

    /// Add a required parameter to the schema.
    pub fn param(
        mut self,
        name: impl Into<String>,
        ty: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.properties.insert(
            name.clone(),
            json!({ "type": ty.into(), "description": description.into() }),
        );
        self.required.push(name);
        self
    }

    /// Add an optional parameter to the schema.
    pub fn optional_param(
        mut self,
        name: impl Into<String>,
        ty: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.properties.insert(
            name.into(),
            json!({ "type": ty.into(), "description": description.into() }),
        );
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

    /// Attach the implementation.
    pub fn call(
        mut self,
        f: impl Fn(&HashMap<String, Value>) -> Result<String, String> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(f));
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn args_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": Value::Object(self.properties.clone()),
            "required": self.required,
        })
    }

    async fn invoke(
        &self,
        _ctx: &CancellationToken,
        args: &HashMap<String, Value>,
    ) -> Result<String, AgentError> {
        let handler = self.handler.as_ref().ok_or_else(|| {
            AgentError::new(
                ErrorKind::InvalidConfig,
                "tool",
                "invoke",
                format!("tool '{}' has no handler", self.name),
            )
        })?;
        handler(args).map_err(|msg| {
            AgentError::new(ErrorKind::ToolExecution, "tool", "invoke", msg)
                .with_context("tool", self.name.clone())
        })
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ToolRegistry
// ─────────────────────────────────────────────────────────────────────────────

/// The agent's tool set. Populated during construction, immutable afterwards
/// — lookups after build are lock-free map reads.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Duplicate names are a configuration error.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let name = tool.name().to_string();
        if name.is_empty() {
            return Err(AgentError::new(
                ErrorKind::InvalidConfig,
                "tool_registry",
                "register",
                "tool name must be non-empty",
            ));
        }
        if self.tools.contains_key(&name) {
            return Err(AgentError::new(
                ErrorKind::InvalidConfig,
                "tool_registry",
                "register",
                format!("duplicate tool name '{}'", name),
            ));
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registration-ordered tool list.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.order.iter().filter_map(|n| self.tools.get(n))
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Descriptors for every tool; the prompt catalogue and the native
    /// tool-calling payload both render from this.
    pub fn catalogue(&self) -> Vec<ToolSchema> {
        self.all()
            .map(|t| ToolSchema {
                name:         t.name().to_string(),
                description:  t.description().to_string(),
                input_schema: t.args_schema(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
