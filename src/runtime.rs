use serde_json::{json, Value};
use std::sync::Arc;

use crate::checkpoint::Checkpointer;
use crate::state::State;
use crate::store::Store;
use crate::stream::{EventSink, StreamMode};

/// Per-invocation context handed to tools.
///
/// Created once per top-level invocation; tools use it to read/write durable
/// data and to emit `custom` stream events. Cloning is cheap, everything
/// inside is shared.
#[derive(Clone)]
pub struct Runtime {
    state:        Arc<State>,
    store:        Option<Arc<dyn Store>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    tool_call_id: String,
    session_id:   String,
    sink:         EventSink,
}

impl Runtime {
    pub fn new(state: Arc<State>, session_id: impl Into<String>) -> Self {
        Self {
            state,
            store: None,
            checkpointer: None,
            tool_call_id: String::new(),
            session_id: session_id.into(),
            sink: EventSink::disconnected(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = sink;
        self
    }

    /// A copy of this runtime scoped to one tool call.
    pub fn for_tool_call(&self, tool_call_id: impl Into<String>) -> Self {
        let mut rt = self.clone();
        rt.tool_call_id = tool_call_id.into();
        rt
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub fn store(&self) -> Option<&Arc<dyn Store>> {
        self.store.as_ref()
    }

    pub fn checkpointer(&self) -> Option<&Arc<dyn Checkpointer>> {
        self.checkpointer.as_ref()
    }

    pub fn tool_call_id(&self) -> &str {
        &self.tool_call_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Write a state key and mirror the mutation into the `updates` mode.
    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let old = self.state.set(key.clone(), value.clone());
        self.sink.try_emit(
            StreamMode::Updates,
            "state_update",
            json!({
                "key": key,
                "old_value": old,
                "new_value": value,
                "tool_call_id": self.tool_call_id,
            }),
        );
    }

    /// Emit a free-form progress event into the `custom` mode. Opaque to the
    /// engine; dropped when no subscriber selected the mode.
    pub fn emit_custom(&self, event_type: &str, payload: Value) {
        self.sink.try_emit(StreamMode::Custom, event_type, payload);
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("session_id", &self.session_id)
            .field("tool_call_id", &self.tool_call_id)
            .field("has_store", &self.store.is_some())
            .field("has_checkpointer", &self.checkpointer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MultiModeStream;

    #[tokio::test]
    async fn set_state_mirrors_into_updates_mode() {
        let stream = MultiModeStream::new(&[StreamMode::Updates], 8);
        let state = Arc::new(State::new());
        let rt = Runtime::new(Arc::clone(&state), "sess-1")
            .with_sink(stream.sink())
            .for_tool_call("call-1");

        rt.set_state("progress", json!(50));
        stream.close();

        let sub = stream.subscribe(StreamMode::Updates).unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, "state_update");
        assert_eq!(event.payload["key"], json!("progress"));
        assert_eq!(event.payload["old_value"], Value::Null);
        assert_eq!(event.payload["new_value"], json!(50));
        assert_eq!(state.get("progress"), Some(json!(50)));
    }

    #[test]
    fn emit_custom_without_sink_is_a_noop() {
        let rt = Runtime::new(Arc::new(State::new()), "sess-2");
        rt.emit_custom("status", json!({"status": "searching", "progress": 30}));
    }
}
