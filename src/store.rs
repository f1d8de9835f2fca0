use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{AgentError, ErrorKind};

/// An ordered namespace path. Two identical keys under different namespaces
/// are distinct entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace(pub Vec<String>);

impl Namespace {
    pub fn new<S: Into<String>>(parts: impl IntoIterator<Item = S>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Flat representation used as a storage key: `"users/alice/memories"`.
    pub fn joined(&self) -> String {
        self.0.join("/")
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.joined())
    }
}

impl<S: Into<String>> FromIterator<S> for Namespace {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// A stored entry with its payload and bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    pub payload:    Value,
    pub metadata:   HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub namespace:  Namespace,
    pub key:        String,
}

/// Long-term, namespaced key-value persistence.
///
/// Implementations must be thread-safe; the engine adds no locking of its
/// own around them. `search` matches entries whose payload object fields or
/// metadata fields equal every entry of the filter.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put(&self, ns: &Namespace, key: &str, value: Value) -> Result<(), AgentError>;

    async fn put_with_metadata(
        &self,
        ns: &Namespace,
        key: &str,
        value: Value,
        metadata: HashMap<String, Value>,
    ) -> Result<(), AgentError>;

    async fn get(&self, ns: &Namespace, key: &str) -> Result<Option<StoredValue>, AgentError>;

    async fn delete(&self, ns: &Namespace, key: &str) -> Result<(), AgentError>;

    async fn list(&self, ns: &Namespace) -> Result<Vec<String>, AgentError>;

    async fn search(
        &self,
        ns: &Namespace,
        filter: &HashMap<String, Value>,
    ) -> Result<Vec<StoredValue>, AgentError>;

    async fn clear(&self, ns: &Namespace) -> Result<(), AgentError>;
}

fn matches_filter(value: &StoredValue, filter: &HashMap<String, Value>) -> bool {
    filter.iter().all(|(k, expected)| {
        value.payload.get(k) == Some(expected)
            || value.metadata.get(k) == Some(expected)
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

/// A simple in-memory store for tests and short-lived sessions.
#[derive(Default)]
pub struct InMemoryStore {
    // namespace.joined() → key → value
    entries: Mutex<HashMap<String, HashMap<String, StoredValue>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put(&self, ns: &Namespace, key: &str, value: Value) -> Result<(), AgentError> {
        self.put_with_metadata(ns, key, value, HashMap::new()).await
    }

    async fn put_with_metadata(
        &self,
        ns: &Namespace,
        key: &str,
        value: Value,
        metadata: HashMap<String, Value>,
    ) -> Result<(), AgentError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let bucket = entries.entry(ns.joined()).or_default();
        let now = Utc::now();
        let created_at = bucket.get(key).map(|v| v.created_at).unwrap_or(now);
        bucket.insert(
            key.to_string(),
            StoredValue {
                payload: value,
                metadata,
                created_at,
                updated_at: now,
                namespace: ns.clone(),
                key: key.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, ns: &Namespace, key: &str) -> Result<Option<StoredValue>, AgentError> {
        let entries = self.entries.lock().expect("store lock poisoned");
        Ok(entries.get(&ns.joined()).and_then(|b| b.get(key)).cloned())
    }

    async fn delete(&self, ns: &Namespace, key: &str) -> Result<(), AgentError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        if let Some(bucket) = entries.get_mut(&ns.joined()) {
            bucket.remove(key);
        }
        Ok(())
    }

    async fn list(&self, ns: &Namespace) -> Result<Vec<String>, AgentError> {
        let entries = self.entries.lock().expect("store lock poisoned");
        let mut keys: Vec<String> = entries
            .get(&ns.joined())
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    async fn search(
        &self,
        ns: &Namespace,
        filter: &HashMap<String, Value>,
    ) -> Result<Vec<StoredValue>, AgentError> {
        let entries = self.entries.lock().expect("store lock poisoned");
        let mut hits: Vec<StoredValue> = entries
            .get(&ns.joined())
            .map(|b| {
                b.values()
                    .filter(|v| matches_filter(v, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(hits)
    }

    async fn clear(&self, ns: &Namespace) -> Result<(), AgentError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.remove(&ns.joined());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite store
// ─────────────────────────────────────────────────────────────────────────────

/// A store backed by a SQLite database file.
pub struct SqliteStore {
    path: std::path::PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Result<Self, AgentError> {
        let path = path.into();
        let conn = rusqlite::Connection::open(&path).map_err(sqlite_err("open"))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                namespace  TEXT NOT NULL,
                key        TEXT NOT NULL,
                payload    TEXT NOT NULL,
                metadata   TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            )",
            [],
        )
        .map_err(sqlite_err("create"))?;
        Ok(Self { path })
    }

    fn conn(&self) -> Result<rusqlite::Connection, AgentError> {
        rusqlite::Connection::open(&self.path).map_err(sqlite_err("open"))
    }

    fn row_to_value(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, String, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn decode(
        (ns, key, payload, metadata, created, updated): (String, String, String, String, String, String),
    ) -> Result<StoredValue, AgentError> {
        let parse_time = |s: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    AgentError::new(ErrorKind::StoreSerialization, "store", "decode", "bad timestamp")
                        .with_source(e)
                })
        };
        Ok(StoredValue {
            payload: serde_json::from_str(&payload).map_err(serde_err("payload"))?,
            metadata: serde_json::from_str(&metadata).map_err(serde_err("metadata"))?,
            created_at: parse_time(&created)?,
            updated_at: parse_time(&updated)?,
            namespace: Namespace(ns.split('/').map(str::to_string).collect()),
            key,
        })
    }
}

fn sqlite_err(op: &'static str) -> impl FnOnce(rusqlite::Error) -> AgentError {
    move |e| {
        AgentError::new(ErrorKind::StoreConnection, "store", op, "sqlite error").with_source(e)
    }
}

fn serde_err(field: &'static str) -> impl FnOnce(serde_json::Error) -> AgentError {
    move |e| {
        AgentError::new(ErrorKind::StoreSerialization, "store", "decode", field).with_source(e)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn put(&self, ns: &Namespace, key: &str, value: Value) -> Result<(), AgentError> {
        self.put_with_metadata(ns, key, value, HashMap::new()).await
    }

    async fn put_with_metadata(
        &self,
        ns: &Namespace,
        key: &str,
        value: Value,
        metadata: HashMap<String, Value>,
    ) -> Result<(), AgentError> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let payload = serde_json::to_string(&value).map_err(serde_err("payload"))?;
        let metadata = serde_json::to_string(&metadata).map_err(serde_err("metadata"))?;
        conn.execute(
            "INSERT INTO kv_entries (namespace, key, payload, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(namespace, key) DO UPDATE SET
                payload = ?3, metadata = ?4, updated_at = ?5",
            rusqlite::params![ns.joined(), key, payload, metadata, now],
        )
        .map_err(sqlite_err("put"))?;
        Ok(())
    }

    async fn get(&self, ns: &Namespace, key: &str) -> Result<Option<StoredValue>, AgentError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT namespace, key, payload, metadata, created_at, updated_at
                 FROM kv_entries WHERE namespace = ?1 AND key = ?2",
            )
            .map_err(sqlite_err("get"))?;
        let mut rows = stmt
            .query(rusqlite::params![ns.joined(), key])
            .map_err(sqlite_err("get"))?;
        match rows.next().map_err(sqlite_err("get"))? {
            Some(row) => {
                let raw = Self::row_to_value(row).map_err(sqlite_err("get"))?;
                Ok(Some(Self::decode(raw)?))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, ns: &Namespace, key: &str) -> Result<(), AgentError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
            rusqlite::params![ns.joined(), key],
        )
        .map_err(sqlite_err("delete"))?;
        Ok(())
    }

    async fn list(&self, ns: &Namespace) -> Result<Vec<String>, AgentError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT key FROM kv_entries WHERE namespace = ?1 ORDER BY key")
            .map_err(sqlite_err("list"))?;
        let rows = stmt
            .query_map(rusqlite::params![ns.joined()], |row| row.get::<_, String>(0))
            .map_err(sqlite_err("list"))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(key.map_err(sqlite_err("list"))?);
        }
        Ok(keys)
    }

    async fn search(
        &self,
        ns: &Namespace,
        filter: &HashMap<String, Value>,
    ) -> Result<Vec<StoredValue>, AgentError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT namespace, key, payload, metadata, created_at, updated_at
                 FROM kv_entries WHERE namespace = ?1 ORDER BY key",
            )
            .map_err(sqlite_err("search"))?;
        let rows = stmt
            .query_map(rusqlite::params![ns.joined()], Self::row_to_value)
            .map_err(sqlite_err("search"))?;

        let mut hits = Vec::new();
        for raw in rows {
            let value = Self::decode(raw.map_err(sqlite_err("search"))?)?;
            if matches_filter(&value, filter) {
                hits.push(value);
            }
        }
        Ok(hits)
    }

    async fn clear(&self, ns: &Namespace) -> Result<(), AgentError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM kv_entries WHERE namespace = ?1",
            rusqlite::params![ns.joined()],
        )
        .map_err(sqlite_err("clear"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns(parts: &[&str]) -> Namespace {
        Namespace::new(parts.iter().copied())
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryStore::new();
        let n = ns(&["users", "alice"]);
        store.put(&n, "pref", json!({"theme": "dark"})).await.unwrap();

        let got = store.get(&n, "pref").await.unwrap().unwrap();
        assert_eq!(got.payload, json!({"theme": "dark"}));
        assert_eq!(got.key, "pref");
        assert_eq!(got.namespace, n);
    }

    #[tokio::test]
    async fn same_key_in_different_namespaces_is_distinct() {
        let store = InMemoryStore::new();
        store.put(&ns(&["a"]), "k", json!(1)).await.unwrap();
        store.put(&ns(&["b"]), "k", json!(2)).await.unwrap();

        assert_eq!(store.get(&ns(&["a"]), "k").await.unwrap().unwrap().payload, json!(1));
        assert_eq!(store.get(&ns(&["b"]), "k").await.unwrap().unwrap().payload, json!(2));
    }

    #[tokio::test]
    async fn search_matches_payload_and_metadata_fields() {
        let store = InMemoryStore::new();
        let n = ns(&["notes"]);
        store.put(&n, "one", json!({"topic": "rust", "body": "..."})).await.unwrap();
        store.put(&n, "two", json!({"topic": "go", "body": "..."})).await.unwrap();
        store
            .put_with_metadata(&n, "three", json!("raw"), HashMap::from([("topic".to_string(), json!("rust"))]))
            .await
            .unwrap();

        let filter = HashMap::from([("topic".to_string(), json!("rust"))]);
        let hits = store.search(&n, &filter).await.unwrap();
        let keys: Vec<&str> = hits.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["one", "three"]);
    }

    #[tokio::test]
    async fn clear_empties_only_the_namespace() {
        let store = InMemoryStore::new();
        store.put(&ns(&["a"]), "k", json!(1)).await.unwrap();
        store.put(&ns(&["b"]), "k", json!(2)).await.unwrap();

        store.clear(&ns(&["a"])).await.unwrap();
        assert!(store.get(&ns(&["a"]), "k").await.unwrap().is_none());
        assert!(store.get(&ns(&["b"]), "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sqlite_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("store.db")).unwrap();
        let n = ns(&["sessions", "s1"]);

        store.put(&n, "greeting", json!({"text": "hello"})).await.unwrap();
        let got = store.get(&n, "greeting").await.unwrap().unwrap();
        assert_eq!(got.payload, json!({"text": "hello"}));

        assert_eq!(store.list(&n).await.unwrap(), vec!["greeting"]);
        store.delete(&n, "greeting").await.unwrap();
        assert!(store.get(&n, "greeting").await.unwrap().is_none());
    }
}
