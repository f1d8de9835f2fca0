use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use crate::types::TaskOutput;

/// The finite error taxonomy. Every failure surfaced by the engine carries
/// exactly one of these kinds, so consumers can branch with
/// [`AgentError::is_code`] instead of substring matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    // ── Input / configuration ───────────────────────────
    InvalidInput,
    InvalidConfig,
    NotFound,

    // ── Control flow ────────────────────────────────────
    Timeout,
    Canceled,

    // ── LLM ─────────────────────────────────────────────
    RateLimited,
    LlmRequest,
    LlmResponse,

    // ── Tools ───────────────────────────────────────────
    ToolExecution,
    ToolTimeout,
    ToolRetryExhausted,

    // ── Parsing ─────────────────────────────────────────
    ParserFailed,
    ParserInvalidJson,
    ParserMissingField,

    // ── State & persistence ─────────────────────────────
    StateLoad,
    StateSave,
    StateCheckpoint,
    StoreConnection,
    StoreSerialization,
    StoreNotFound,

    // ── Composition ─────────────────────────────────────
    RoutingFailed,
    ConsensusFailed,

    Internal,
}

impl ErrorKind {
    /// Kinds the retry machinery is allowed to re-attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Timeout | ErrorKind::LlmRequest
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // kebab-case, matching the serde representation
        let s = serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self));
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// The one error type of the engine.
///
/// Carries the taxonomy kind, the component and operation that raised it, a
/// free-form context map, and the wrapped cause. When a run fails after doing
/// work, the reasoning/tool records accumulated so far travel along in
/// `partial_output`; `invoke` never silently discards progress.
#[derive(Debug, thiserror::Error)]
#[error("[{kind}] {component}/{operation}: {message}")]
pub struct AgentError {
    kind:      ErrorKind,
    component: String,
    operation: String,
    message:   String,
    context:   HashMap<String, String>,
    #[source]
    source:    Option<Box<dyn StdError + Send + Sync>>,
    partial:   Option<Box<TaskOutput>>,
}

impl AgentError {
    pub fn new(
        kind:      ErrorKind,
        component: impl Into<String>,
        operation: impl Into<String>,
        message:   impl Into<String>,
    ) -> Self {
        Self {
            kind,
            component: component.into(),
            operation: operation.into(),
            message:   message.into(),
            context:   HashMap::new(),
            source:    None,
            partial:   None,
        }
    }

    /// Attach a context key/value. Chainable.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Wrap an underlying cause. The cause is retained, never replaced;
    /// [`AgentError::root_cause`] walks the full chain.
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach the output accumulated before the failure.
    pub fn with_partial_output(mut self, output: TaskOutput) -> Self {
        self.partial = Some(Box::new(output));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Work completed before the failure, if any. Status is `Failed` or
    /// `Partial`; reasoning steps and tool-call records are intact.
    pub fn partial_output(&self) -> Option<&TaskOutput> {
        self.partial.as_deref()
    }

    pub fn into_partial_output(self) -> Option<TaskOutput> {
        self.partial.map(|b| *b)
    }

    /// Type-checked code test: the supported alternative to matching on
    /// display strings.
    pub fn is_code(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// The deepest cause in the wrap chain (`self` when nothing is wrapped).
    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        let mut cur: &(dyn StdError + 'static) = self;
        while let Some(next) = cur.source() {
            cur = next;
        }
        cur
    }

    // ── Convenience constructors for the common sites ───────────────────────

    pub fn invalid_input(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, component, "invoke", message)
    }

    pub fn canceled(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, component, operation, "context canceled")
    }

    pub fn timeout(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, component, operation, "deadline exceeded")
    }

    pub fn internal(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, component, "internal", message)
    }
}

/// Free-function form of [`AgentError::is_code`].
pub fn is_code(err: &AgentError, kind: ErrorKind) -> bool {
    err.is_code(kind)
}

/// Free-function form of [`AgentError::root_cause`].
pub fn root_cause(err: &AgentError) -> &(dyn StdError + 'static) {
    err.root_cause()
}
