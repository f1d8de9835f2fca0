use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Terminal status of a task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// The loop reached a final answer.
    Success,
    /// An unrecoverable failure; see the error and the accumulated records.
    Failed,
    /// The loop was stopped early (iteration limit, timeout, cancellation)
    /// with usable work accumulated.
    Partial,
}

/// Per-invocation execution options.
///
/// Immutable record with builder-style updates: every `with_*` returns a new
/// copy, there are no global mutable defaults. Start from
/// [`default_options`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Sampling temperature forwarded to the LLM (0.0–2.0).
    pub temperature:        f64,
    /// Completion token cap forwarded to the LLM.
    pub max_tokens:         u32,
    /// Model override; `None` lets the client pick its own default.
    pub model:              Option<String>,
    /// Master switch for tool dispatch.
    pub enable_tools:       bool,
    /// When set, only these tool names may be invoked.
    pub allowed_tools:      Option<Vec<String>>,
    /// Upper bound on recorded tool calls per invocation.
    pub max_tool_calls:     usize,
    /// Load/save session history through the configured checkpointer.
    pub enable_memory:      bool,
    pub load_history:       bool,
    pub save_to_memory:     bool,
    /// Cap on retained history entries when saving.
    pub max_history_length: usize,
    /// Whole-call deadline. `None` means unbounded; `Some(0)` cancels
    /// immediately and yields a partial output.
    pub timeout:            Option<Duration>,
}

/// Factory for the default option set.
pub fn default_options() -> ExecutionOptions {
    ExecutionOptions {
        temperature:        0.7,
        max_tokens:         2048,
        model:              None,
        enable_tools:       true,
        allowed_tools:      None,
        max_tool_calls:     5,
        enable_memory:      false,
        load_history:       false,
        save_to_memory:     false,
        max_history_length: 10,
        timeout:            None,
    }
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        default_options()
    }
}

impl ExecutionOptions {
    pub fn with_temperature(mut self, t: f64) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools_enabled(mut self, enabled: bool) -> Self {
        self.enable_tools = enabled;
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = Some(tools);
        self
    }

    pub fn with_max_tool_calls(mut self, n: usize) -> Self {
        self.max_tool_calls = n;
        self
    }

    pub fn with_memory(mut self, load: bool, save: bool) -> Self {
        self.enable_memory = load || save;
        self.load_history = load;
        self.save_to_memory = save;
        self
    }

    pub fn with_max_history_length(mut self, n: usize) -> Self {
        self.max_history_length = n;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a caller hands to an agent. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    /// The task description driving the run.
    pub task:        String,
    /// Free-form steering instruction, appended after the task.
    pub instruction: String,
    /// Arbitrary key/value context visible to prompt assembly and middleware.
    pub context:     HashMap<String, Value>,
    pub options:     ExecutionOptions,
    pub session_id:  String,
    pub timestamp:   DateTime<Utc>,
}

impl TaskInput {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task:        task.into(),
            instruction: String::new(),
            context:     HashMap::new(),
            options:     default_options(),
            session_id:  uuid::Uuid::new_v4().to_string(),
            timestamp:   Utc::now(),
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

/// One loop iteration, as recorded in the output.
///
/// Step numbers are 1-based and strictly increasing within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub step:        usize,
    /// Action label: a tool name, `"final_answer"`, `"parse_failure"`, …
    pub action:      String,
    pub description: String,
    pub result:      String,
    pub duration:    Duration,
    pub success:     bool,
    pub error:       Option<String>,
}

/// A completed tool dispatch, mirrored into the `updates` stream mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub input:     HashMap<String, Value>,
    pub output:    String,
    pub duration:  Duration,
    pub success:   bool,
    pub error:     Option<String>,
}

/// What an agent hands back. Built incrementally during a run, returned once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub result:          Value,
    pub status:          TaskStatus,
    /// Human-readable outcome summary.
    pub message:         String,
    pub reasoning_steps: Vec<ReasoningStep>,
    pub tool_calls:      Vec<ToolCallRecord>,
    /// Finish − start, measured monotonically.
    pub latency:         Duration,
    pub timestamp:       DateTime<Utc>,
    pub metadata:        HashMap<String, Value>,
}

impl TaskOutput {
    /// An empty shell to accumulate into. Latency is stamped at finish time.
    pub fn empty() -> Self {
        Self {
            result:          Value::Null,
            status:          TaskStatus::Partial,
            message:         String::new(),
            reasoning_steps: Vec::new(),
            tool_calls:      Vec::new(),
            latency:         Duration::ZERO,
            timestamp:       Utc::now(),
            metadata:        HashMap::new(),
        }
    }

    pub fn success(result: Value, message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            result,
            message: message.into(),
            ..Self::empty()
        }
    }

    /// The result as display text (strings render bare, other values as JSON).
    pub fn result_text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            v => v.to_string(),
        }
    }
}

/// Token accounting for a single LLM call or a whole session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens:     u32,
    pub completion_tokens: u32,
    pub total_tokens:      u32,
}

impl TokenUsage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt_tokens:     prompt,
            completion_tokens: completion,
            total_tokens:      prompt + completion,
        }
    }

    /// Accumulate usage from another call.
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_are_copy_on_modify() {
        let base = default_options();
        let tuned = base.clone().with_temperature(0.1).with_max_tool_calls(2);
        assert_eq!(base.temperature, 0.7);
        assert_eq!(base.max_tool_calls, 5);
        assert_eq!(tuned.temperature, 0.1);
        assert_eq!(tuned.max_tool_calls, 2);
    }

    #[test]
    fn token_usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(TokenUsage::new(10, 20));
        total.add(TokenUsage::new(5, 15));
        assert_eq!(total.prompt_tokens, 15);
        assert_eq!(total.completion_tokens, 35);
        assert_eq!(total.total_tokens, 50);
    }

    #[test]
    fn result_text_renders_strings_bare() {
        let out = TaskOutput::success(Value::String("sunny".into()), "done");
        assert_eq!(out.result_text(), "sunny");
        let out = TaskOutput::success(serde_json::json!({"sf": "sunny"}), "done");
        assert!(out.result_text().contains("sunny"));
    }
}
