use serde::{Deserialize, Serialize};

/// One completed reason-act-observe cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchpadEntry {
    pub thought:     String,
    pub action:      String,
    pub input:       String,
    pub observation: String,
}

/// The ordered log conditioning each LLM turn.
///
/// Rendering is stable within a call:
///
/// ```text
/// Thought: ...
/// Action: ...
/// Action Input: ...
/// Observation: ...
/// ```
///
/// with blank lines between steps. When the log outgrows `window`, the
/// oldest steps collapse into a single visible elision line; the task and
/// the most recent observations always survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scratchpad {
    entries: Vec<ScratchpadEntry>,
    window:  usize,
}

impl Scratchpad {
    pub fn new(window: usize) -> Self {
        Self { entries: Vec::new(), window: window.max(1) }
    }

    pub fn push(&mut self, entry: ScratchpadEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ScratchpadEntry] {
        &self.entries
    }

    pub fn last_observation(&self) -> Option<&str> {
        self.entries.last().map(|e| e.observation.as_str())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let elided = self.entries.len().saturating_sub(self.window);
        if elided > 0 {
            out.push_str(&format!("[… {} earlier steps elided]\n\n", elided));
        }
        for entry in &self.entries[elided..] {
            out.push_str(&format!(
                "Thought: {}\nAction: {}\nAction Input: {}\nObservation: {}\n\n",
                entry.thought, entry.action, entry.input, entry.observation
            ));
        }
        out
    }
}
