//! Key-value JSON persistence
//!
//! The delivery engine treats persistence as an external collaborator with
//! `get`/`put` semantics over JSON documents. Two backends are provided: an
//! in-memory map for tests and ephemeral runs, and a single-file JSON
//! document for local deployments.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Key-value store holding JSON documents
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the document stored under `key`
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Replace the document stored under `key`
    async fn put(&self, key: &str, value: Value) -> StoreResult<()>;
}

/// In-memory key-value store
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: DashMap<String, Value>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: Value) -> StoreResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// Key-value store persisted as one JSON object on disk.
///
/// Writes go to a sibling temp file that is renamed over the original, so a
/// crash mid-write leaves the previous document intact.
pub struct FileKeyValueStore {
    path: PathBuf,
    // Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl FileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> StoreResult<Map<String, Value>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }

        match serde_json::from_slice(&bytes)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::Corrupt(format!(
                "expected a JSON object at {}, found {}",
                self.path.display(),
                type_name(&other)
            ))),
        }
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        Ok(document.remove(key))
    }

    async fn put(&self, key: &str, value: Value) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await?;
        document.insert(key.to_string(), value);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&Value::Object(document))?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), key = %key, "Persisted key-value document");
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
