use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::callbacks::AgentCallback;

/// Per-Runnable configuration: callbacks, metadata, tags, and the
/// cancellation handle.
///
/// Immutable by convention: all `with_*` methods are copy-on-modify, so a
/// config shared between runnables can never change under one of them.
#[derive(Clone, Default)]
pub struct RunnableConfig {
    callbacks:    Vec<Arc<dyn AgentCallback>>,
    metadata:     HashMap<String, Value>,
    tags:         Vec<String>,
    cancellation: CancellationToken,
}

impl RunnableConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(mut self, callback: Arc<dyn AgentCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Vec<Arc<dyn AgentCallback>>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Registration-ordered callback list.
    pub fn callbacks(&self) -> &[Arc<dyn AgentCallback>] {
        &self.callbacks
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl std::fmt::Debug for RunnableConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableConfig")
            .field("callbacks", &self.callbacks.len())
            .field("metadata", &self.metadata)
            .field("tags", &self.tags)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}
