use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Thread-safe key/value state for one invocation.
///
/// Concurrent readers are permitted, writers are serialized. A `State` is
/// owned by the invocation that creates it and shared by reference (via
/// `Arc`) with the [`crate::runtime::Runtime`] handed to tools. It is never
/// shared across unrelated calls.
#[derive(Debug, Default)]
pub struct State {
    inner: RwLock<HashMap<String, Value>>,
}

/// One key change, as produced by [`State::diff`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StateChange {
    pub key: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HashMap<String, Value>) -> Self {
        Self { inner: RwLock::new(map) }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().expect("state lock poisoned").get(key).cloned()
    }

    /// Set a key, returning the previous value if any.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner
            .write()
            .expect("state lock poisoned")
            .insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().expect("state lock poisoned").remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().expect("state lock poisoned").contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().expect("state lock poisoned").keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("state lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A point-in-time copy of the whole mapping.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().expect("state lock poisoned").clone()
    }

    /// An independent copy: mutations on either side are invisible to the
    /// other.
    pub fn clone_state(&self) -> State {
        State::from_map(self.snapshot())
    }

    /// Replace the whole mapping atomically.
    pub fn replace(&self, map: HashMap<String, Value>) {
        *self.inner.write().expect("state lock poisoned") = map;
    }

    /// Key-level differences from `older` to `self`.
    pub fn diff(&self, older: &HashMap<String, Value>) -> Vec<StateChange> {
        let current = self.snapshot();
        let mut changes = Vec::new();
        for (key, new) in &current {
            match older.get(key) {
                Some(old) if old == new => {}
                old => changes.push(StateChange {
                    key: key.clone(),
                    old: old.cloned(),
                    new: Some(new.clone()),
                }),
            }
        }
        for (key, old) in older {
            if !current.contains_key(key) {
                changes.push(StateChange {
                    key: key.clone(),
                    old: Some(old.clone()),
                    new: None,
                });
            }
        }
        changes.sort_by(|a, b| a.key.cmp(&b.key));
        changes
    }
}
