// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Legacy flat id→value sources.
//!
//! A legacy value is either a bare state string (`"hidden"`) or an object
//! `{ "state": "dimmed", "title": "..." }`. Entries are read in id order so a
//! numeric cursor stays meaningful across restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::record::VisibilityState;
use crate::storage::traits::StorageError;

#[derive(Debug, Clone, PartialEq)]
pub struct LegacyEntry {
    pub id: String,
    pub value: Value,
}

/// Decoded legacy value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyValue {
    pub state: VisibilityState,
    pub title: String,
}

/// Decode a legacy value. `Ok(None)` means "normal", which has nothing to migrate.
pub fn parse_legacy_value(value: &Value) -> Result<Option<LegacyValue>, String> {
    let (state, title) = match value {
        Value::String(s) => (s.as_str(), ""),
        Value::Object(map) => {
            let state = map
                .get("state")
                .and_then(Value::as_str)
                .ok_or_else(|| "object without a string 'state'".to_string())?;
            let title = map.get("title").and_then(Value::as_str).unwrap_or("");
            (state, title)
        }
        other => return Err(format!("unsupported legacy value {}", other)),
    };
    let state = VisibilityState::parse(state).ok_or_else(|| format!("unknown state '{}'", state))?;
    if !state.is_persistent() {
        return Ok(None);
    }
    Ok(Some(LegacyValue {
        state,
        title: title.to_string(),
    }))
}

#[async_trait]
pub trait LegacySource: Send + Sync {
    /// Name used in logs and progress.
    fn name(&self) -> &str;

    /// Up to `limit` entries starting at position `cursor`, in id order.
    async fn read_batch(&self, cursor: usize, limit: usize) -> Result<Vec<LegacyEntry>, StorageError>;

    async fn contains(&self, id: &str) -> Result<bool, StorageError>;

    async fn len(&self) -> Result<usize, StorageError>;

    /// Remove all legacy data. Called once migration has completed.
    async fn clear(&self) -> Result<(), StorageError>;
}

fn slice(map: &BTreeMap<String, Value>, cursor: usize, limit: usize) -> Vec<LegacyEntry> {
    map.iter()
        .skip(cursor)
        .take(limit)
        .map(|(id, value)| LegacyEntry {
            id: id.clone(),
            value: value.clone(),
        })
        .collect()
}

/// In-memory legacy map.
pub struct MemoryLegacySource {
    name: String,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryLegacySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_entries<I, K>(name: impl Into<String>, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let source = Self::new(name);
        {
            let mut map = source.entries.lock();
            for (id, value) in entries {
                map.insert(id.into(), value);
            }
        }
        source
    }

    pub fn insert(&self, id: impl Into<String>, value: Value) {
        self.entries.lock().insert(id.into(), value);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl LegacySource for MemoryLegacySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_batch(&self, cursor: usize, limit: usize) -> Result<Vec<LegacyEntry>, StorageError> {
        Ok(slice(&self.entries.lock(), cursor, limit))
    }

    async fn contains(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.entries.lock().contains_key(id))
    }

    async fn len(&self) -> Result<usize, StorageError> {
        Ok(self.entries.lock().len())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.entries.lock().clear();
        Ok(())
    }
}

/// Legacy map stored as one JSON object in a file. A missing file is empty.
pub struct JsonFileLegacySource {
    name: String,
    path: PathBuf,
    loaded: tokio::sync::Mutex<Option<BTreeMap<String, Value>>>,
}

impl JsonFileLegacySource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            path,
            loaded: tokio::sync::Mutex::new(None),
        }
    }

    async fn with_map<R>(&self, f: impl FnOnce(&BTreeMap<String, Value>) -> R) -> Result<R, StorageError> {
        let mut loaded = self.loaded.lock().await;
        if loaded.is_none() {
            *loaded = Some(self.load().await?);
        }
        match loaded.as_ref() {
            Some(map) => Ok(f(map)),
            None => Ok(f(&BTreeMap::new())),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, Value>, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No legacy file");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(StorageError::Transient(format!("read {}: {}", self.path.display(), e))),
        };
        let map: BTreeMap<String, Value> = serde_json::from_slice(&bytes).map_err(|e| {
            StorageError::Validation(format!("legacy file {} is not a JSON object: {}", self.path.display(), e))
        })?;
        info!(path = %self.path.display(), entries = map.len(), "Loaded legacy file");
        Ok(map)
    }
}

#[async_trait]
impl LegacySource for JsonFileLegacySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_batch(&self, cursor: usize, limit: usize) -> Result<Vec<LegacyEntry>, StorageError> {
        self.with_map(|map| slice(map, cursor, limit)).await
    }

    async fn contains(&self, id: &str) -> Result<bool, StorageError> {
        self.with_map(|map| map.contains_key(id)).await
    }

    async fn len(&self) -> Result<usize, StorageError> {
        self.with_map(BTreeMap::len).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut loaded = self.loaded.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Transient(format!("remove {}: {}", self.path.display(), e))),
        }
        *loaded = Some(BTreeMap::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_parse_bare_and_object_values() {
        let v = parse_legacy_value(&json!("Hidden")).unwrap().unwrap();
        assert_eq!(v.state, VisibilityState::Hidden);
        assert_eq!(v.title, "");

        let v = parse_legacy_value(&json!({"state": "dimmed", "title": "A thing"})).unwrap().unwrap();
        assert_eq!(v.state, VisibilityState::Dimmed);
        assert_eq!(v.title, "A thing");

        assert_eq!(parse_legacy_value(&json!("normal")).unwrap(), None);
        assert!(parse_legacy_value(&json!("blocked")).is_err());
        assert!(parse_legacy_value(&json!(42)).is_err());
        assert!(parse_legacy_value(&json!({"title": "x"})).is_err());
    }

    #[tokio::test]
    async fn test_memory_source_reads_in_id_order() {
        let source = MemoryLegacySource::with_entries(
            "mem",
            vec![("c", json!("hidden")), ("a", json!("hidden")), ("b", json!("dimmed"))],
        );
        let first = source.read_batch(0, 2).await.unwrap();
        assert_eq!(first.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        let rest = source.read_batch(2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "c");
        assert!(source.read_batch(3, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_file_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        tokio::fs::write(&path, r#"{"x": "hidden", "y": {"state": "dimmed", "title": "t"}}"#)
            .await
            .unwrap();

        let source = JsonFileLegacySource::new(&path);
        assert_eq!(source.len().await.unwrap(), 2);
        assert!(source.contains("y").await.unwrap());

        source.clear().await.unwrap();
        assert_eq!(source.len().await.unwrap(), 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let source = JsonFileLegacySource::new(dir.path().join("absent.json"));
        assert_eq!(source.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_file_is_validation_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "[1,2,3]").await.unwrap();
        let err = JsonFileLegacySource::new(&path).len().await.unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }
}
