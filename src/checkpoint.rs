use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{AgentError, ErrorKind};
use crate::state::State;

/// A point-in-time snapshot of one thread's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id:  String,
    pub state:      HashMap<String, Value>,
    pub metadata:   HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing entry: everything but the snapshot itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub thread_id:  String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-thread state snapshot service for resumable execution.
///
/// Threads are independent; `save` is an atomic replacement of the thread's
/// previous snapshot. Implementations must be thread-safe.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn save(&self, thread_id: &str, state: &State) -> Result<(), AgentError>;

    /// The saved snapshot as a fresh, independent [`State`].
    async fn load(&self, thread_id: &str) -> Result<Option<State>, AgentError>;

    async fn list(&self) -> Result<Vec<CheckpointInfo>, AgentError>;

    async fn delete(&self, thread_id: &str) -> Result<(), AgentError>;
}

fn checkpoint_err(op: &'static str, msg: &'static str) -> AgentError {
    AgentError::new(ErrorKind::StateCheckpoint, "checkpointer", op, msg)
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory checkpointer
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory checkpointer for tests and short-lived sessions.
#[derive(Default)]
pub struct MemoryCheckpointer {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save(&self, thread_id: &str, state: &State) -> Result<(), AgentError> {
        let mut checkpoints = self.checkpoints.lock().expect("checkpoint lock poisoned");
        let now = Utc::now();
        let created_at = checkpoints
            .get(thread_id)
            .map(|c| c.created_at)
            .unwrap_or(now);
        checkpoints.insert(
            thread_id.to_string(),
            Checkpoint {
                thread_id: thread_id.to_string(),
                state: state.snapshot(),
                metadata: HashMap::new(),
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<State>, AgentError> {
        let checkpoints = self.checkpoints.lock().expect("checkpoint lock poisoned");
        Ok(checkpoints
            .get(thread_id)
            .map(|c| State::from_map(c.state.clone())))
    }

    async fn list(&self) -> Result<Vec<CheckpointInfo>, AgentError> {
        let checkpoints = self.checkpoints.lock().expect("checkpoint lock poisoned");
        let mut infos: Vec<CheckpointInfo> = checkpoints
            .values()
            .map(|c| CheckpointInfo {
                thread_id:  c.thread_id.clone(),
                created_at: c.created_at,
                updated_at: c.updated_at,
            })
            .collect();
        infos.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        Ok(infos)
    }

    async fn delete(&self, thread_id: &str) -> Result<(), AgentError> {
        self.checkpoints
            .lock()
            .expect("checkpoint lock poisoned")
            .remove(thread_id);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File checkpointer
// ─────────────────────────────────────────────────────────────────────────────

/// One JSON file per thread in a base directory. The save writes to a
/// temporary sibling and renames over, so a crashed save never corrupts the
/// previous snapshot.
pub struct FileCheckpointer {
    base_path: std::path::PathBuf,
}

impl FileCheckpointer {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Result<Self, AgentError> {
        let path = path.into();
        std::fs::create_dir_all(&path)
            .map_err(|e| checkpoint_err("new", "create dir failed").with_source(e))?;
        Ok(Self { base_path: path })
    }

    fn thread_path(&self, thread_id: &str) -> std::path::PathBuf {
        self.base_path.join(format!("{}.json", thread_id))
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn save(&self, thread_id: &str, state: &State) -> Result<(), AgentError> {
        let path = self.thread_path(thread_id);
        let now = Utc::now();
        let created_at = std::fs::read_to_string(&path)
            .ok()
            .and_then(|data| serde_json::from_str::<Checkpoint>(&data).ok())
            .map(|c| c.created_at)
            .unwrap_or(now);

        let checkpoint = Checkpoint {
            thread_id: thread_id.to_string(),
            state: state.snapshot(),
            metadata: HashMap::new(),
            created_at,
            updated_at: now,
        };
        let data = serde_json::to_string_pretty(&checkpoint)
            .map_err(|e| checkpoint_err("save", "serialize failed").with_source(e))?;

        let tmp = self.base_path.join(format!(".{}.tmp", thread_id));
        std::fs::write(&tmp, data)
            .map_err(|e| checkpoint_err("save", "write failed").with_source(e))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| checkpoint_err("save", "rename failed").with_source(e))?;
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<State>, AgentError> {
        let path = self.thread_path(thread_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)
            .map_err(|e| checkpoint_err("load", "read failed").with_source(e))?;
        let checkpoint: Checkpoint = serde_json::from_str(&data)
            .map_err(|e| checkpoint_err("load", "parse failed").with_source(e))?;
        Ok(Some(State::from_map(checkpoint.state)))
    }

    async fn list(&self) -> Result<Vec<CheckpointInfo>, AgentError> {
        let entries = std::fs::read_dir(&self.base_path)
            .map_err(|e| checkpoint_err("list", "read dir failed").with_source(e))?;
        let mut infos = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| checkpoint_err("list", "read entry failed").with_source(e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read_to_string(&path)
                .map_err(|e| checkpoint_err("list", "read failed").with_source(e))?;
            if let Ok(c) = serde_json::from_str::<Checkpoint>(&data) {
                infos.push(CheckpointInfo {
                    thread_id:  c.thread_id,
                    created_at: c.created_at,
                    updated_at: c.updated_at,
                });
            }
        }
        infos.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        Ok(infos)
    }

    async fn delete(&self, thread_id: &str) -> Result<(), AgentError> {
        let path = self.thread_path(thread_id);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| checkpoint_err("delete", "remove failed").with_source(e))?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite checkpointer
// ─────────────────────────────────────────────────────────────────────────────

/// Checkpoints in a SQLite database, one row per thread.
pub struct SqliteCheckpointer {
    path: std::path::PathBuf,
}

impl SqliteCheckpointer {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Result<Self, AgentError> {
        let path = path.into();
        let conn = rusqlite::Connection::open(&path)
            .map_err(|e| checkpoint_err("new", "open failed").with_source(e))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id  TEXT PRIMARY KEY,
                state      TEXT NOT NULL,
                metadata   TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| checkpoint_err("new", "create table failed").with_source(e))?;
        Ok(Self { path })
    }

    fn conn(&self) -> Result<rusqlite::Connection, AgentError> {
        rusqlite::Connection::open(&self.path)
            .map_err(|e| checkpoint_err("conn", "open failed").with_source(e))
    }
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn save(&self, thread_id: &str, state: &State) -> Result<(), AgentError> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let state_json = serde_json::to_string(&state.snapshot())
            .map_err(|e| checkpoint_err("save", "serialize failed").with_source(e))?;
        conn.execute(
            "INSERT INTO checkpoints (thread_id, state, metadata, created_at, updated_at)
             VALUES (?1, ?2, '{}', ?3, ?3)
             ON CONFLICT(thread_id) DO UPDATE SET state = ?2, updated_at = ?3",
            rusqlite::params![thread_id, state_json, now],
        )
        .map_err(|e| checkpoint_err("save", "insert failed").with_source(e))?;
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<State>, AgentError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT state FROM checkpoints WHERE thread_id = ?1")
            .map_err(|e| checkpoint_err("load", "prepare failed").with_source(e))?;
        let mut rows = stmt
            .query(rusqlite::params![thread_id])
            .map_err(|e| checkpoint_err("load", "query failed").with_source(e))?;
        match rows
            .next()
            .map_err(|e| checkpoint_err("load", "row failed").with_source(e))?
        {
            Some(row) => {
                let state_json: String = row
                    .get(0)
                    .map_err(|e| checkpoint_err("load", "column failed").with_source(e))?;
                let map: HashMap<String, Value> = serde_json::from_str(&state_json)
                    .map_err(|e| checkpoint_err("load", "parse failed").with_source(e))?;
                Ok(Some(State::from_map(map)))
            }
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<CheckpointInfo>, AgentError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT thread_id, created_at, updated_at FROM checkpoints ORDER BY thread_id")
            .map_err(|e| checkpoint_err("list", "prepare failed").with_source(e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| checkpoint_err("list", "query failed").with_source(e))?;

        let mut infos = Vec::new();
        for row in rows {
            let (thread_id, created, updated) =
                row.map_err(|e| checkpoint_err("list", "row failed").with_source(e))?;
            let parse = |s: &str| {
                DateTime::parse_from_rfc3339(s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| checkpoint_err("list", "bad timestamp").with_source(e))
            };
            infos.push(CheckpointInfo {
                thread_id,
                created_at: parse(&created)?,
                updated_at: parse(&updated)?,
            });
        }
        Ok(infos)
    }

    async fn delete(&self, thread_id: &str) -> Result<(), AgentError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM checkpoints WHERE thread_id = ?1",
            rusqlite::params![thread_id],
        )
        .map_err(|e| checkpoint_err("delete", "delete failed").with_source(e))?;
        Ok(())
    }
}
