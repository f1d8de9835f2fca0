use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AgentError;
use crate::types::{TaskInput, TaskOutput, TokenUsage};

/// Lifecycle observer for an invocation.
///
/// # Contract
/// - Events are delivered synchronously, in registration order, before the
///   event's observable effect is returned to the caller.
/// - Returning an error aborts the operation with that error; later callbacks
///   for the same event are not invoked.
/// - Callbacks must not block indefinitely; they run on the invocation's
///   own budget.
///
/// Every method defaults to a no-op so implementors pick only the events
/// they care about.
#[async_trait]
pub trait AgentCallback: Send + Sync {
    async fn on_start(&self, _input: &TaskInput) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_llm_start(&self, _prompts: &[String]) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_llm_end(&self, _text: &str, _usage: &TokenUsage) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_tool_start(
        &self,
        _name: &str,
        _args: &HashMap<String, Value>,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_tool_end(&self, _name: &str, _result: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_tool_error(&self, _name: &str, _err: &AgentError) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_agent_finish(&self, _output: &TaskOutput) -> Result<(), AgentError> {
        Ok(())
    }

    async fn on_error(&self, _err: &AgentError) -> Result<(), AgentError> {
        Ok(())
    }
}

/// An ordered callback list with short-circuit dispatch.
///
/// The fast path is an empty set: every dispatch method is a cheap no-op
/// when no callbacks are registered.
#[derive(Clone, Default)]
pub struct CallbackSet {
    listeners: Vec<Arc<dyn AgentCallback>>,
}

impl CallbackSet {
    pub fn new(listeners: Vec<Arc<dyn AgentCallback>>) -> Self {
        Self { listeners }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub async fn start(&self, input: &TaskInput) -> Result<(), AgentError> {
        for cb in &self.listeners {
            cb.on_start(input).await?;
        }
        Ok(())
    }

    pub async fn llm_start(&self, prompts: &[String]) -> Result<(), AgentError> {
        for cb in &self.listeners {
            cb.on_llm_start(prompts).await?;
        }
        Ok(())
    }

    pub async fn llm_end(&self, text: &str, usage: &TokenUsage) -> Result<(), AgentError> {
        for cb in &self.listeners {
            cb.on_llm_end(text, usage).await?;
        }
        Ok(())
    }

    pub async fn tool_start(
        &self,
        name: &str,
        args: &HashMap<String, Value>,
    ) -> Result<(), AgentError> {
        for cb in &self.listeners {
            cb.on_tool_start(name, args).await?;
        }
        Ok(())
    }

    pub async fn tool_end(&self, name: &str, result: &str) -> Result<(), AgentError> {
        for cb in &self.listeners {
            cb.on_tool_end(name, result).await?;
        }
        Ok(())
    }

    pub async fn tool_error(&self, name: &str, err: &AgentError) -> Result<(), AgentError> {
        for cb in &self.listeners {
            cb.on_tool_error(name, err).await?;
        }
        Ok(())
    }

    pub async fn agent_finish(&self, output: &TaskOutput) -> Result<(), AgentError> {
        for cb in &self.listeners {
            cb.on_agent_finish(output).await?;
        }
        Ok(())
    }

    /// `on_error` is best-effort notification: listener errors here are
    /// swallowed, the original failure is what propagates.
    pub async fn error(&self, err: &AgentError) {
        for cb in &self.listeners {
            let _ = cb.on_error(err).await;
        }
    }
}

impl std::fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CallbackSet({} listeners)", self.listeners.len())
    }
}
