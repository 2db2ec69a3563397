// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable migration progress.
//!
//! Stored as one JSON document under [`PROGRESS_KEY`] in the sidecar. The
//! in-progress marker is written before a batch reaches the store and cleared
//! after it commits, so a dangling marker on startup means "crashed mid-batch".

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::record::now_millis;
use crate::storage::sidecar::Sidecar;
use crate::storage::traits::StorageError;

pub const PROGRESS_KEY: &str = "migration_progress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Idle,
    BatchInProgress,
    Completed,
}

/// A record the in-flight batch intends to write, by position in its batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerEntry {
    pub offset: usize,
    pub id: String,
}

/// Batch that was checkpointed but not yet committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMarker {
    pub source: usize,
    pub cursor_before: usize,
    pub ordinal_start: u64,
    /// Entries read for the batch
    pub len: usize,
    pub writes: Vec<MarkerEntry>,
}

impl BatchMarker {
    /// How far the cursor may advance given which of the batch's writes are present:
    /// up to the first missing write, or the whole batch.
    #[must_use]
    pub fn committed_prefix(&self, present: impl Fn(&str) -> bool) -> usize {
        self.writes
            .iter()
            .find(|entry| !present(&entry.id))
            .map_or(self.len, |entry| entry.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    pub run_id: String,
    /// Synthetic timestamps count down from here
    pub origin: i64,
    /// Next position to read, per source
    pub cursors: Vec<usize>,
    /// Ordinal of the next entry read; an entry's timestamp is `origin - ordinal`
    pub next_ordinal: u64,
    #[serde(default)]
    pub in_progress: Option<BatchMarker>,
    #[serde(default)]
    pub completed: bool,
    pub started_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub migrated: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub errors: u64,
}

impl MigrationProgress {
    pub fn new(origin: i64, sources: usize) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            origin,
            cursors: vec![0; sources],
            next_ordinal: 0,
            in_progress: None,
            completed: false,
            started_at: now_millis(),
            completed_at: None,
            migrated: 0,
            skipped: 0,
            errors: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> MigrationState {
        if self.completed {
            MigrationState::Completed
        } else if self.in_progress.is_some() {
            MigrationState::BatchInProgress
        } else {
            MigrationState::Idle
        }
    }

    /// Synthetic timestamp for the entry with `ordinal`. Never negative.
    #[must_use]
    pub fn timestamp_for(&self, ordinal: u64) -> i64 {
        self.origin.saturating_sub(ordinal as i64).max(0)
    }
}

/// Load/save for [`MigrationProgress`].
#[derive(Clone)]
pub struct ProgressStore {
    sidecar: Arc<Sidecar>,
}

impl ProgressStore {
    pub fn new(sidecar: Arc<Sidecar>) -> Self {
        Self { sidecar }
    }

    pub async fn load(&self) -> Result<Option<MigrationProgress>, StorageError> {
        match self.sidecar.load_state(PROGRESS_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StorageError::Corruption(format!("migration progress unreadable: {}", e))),
            None => Ok(None),
        }
    }

    pub async fn save(&self, progress: &MigrationProgress) -> Result<(), StorageError> {
        let raw = serde_json::to_string(progress)
            .map_err(|e| StorageError::Permanent(format!("encode migration progress: {}", e)))?;
        self.sidecar.save_state(PROGRESS_KEY, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker() -> BatchMarker {
        BatchMarker {
            source: 0,
            cursor_before: 10,
            ordinal_start: 10,
            len: 5,
            writes: vec![
                MarkerEntry { offset: 0, id: "a".into() },
                MarkerEntry { offset: 2, id: "c".into() },
                MarkerEntry { offset: 3, id: "d".into() },
            ],
        }
    }

    #[test]
    fn test_committed_prefix() {
        let m = marker();
        assert_eq!(m.committed_prefix(|_| false), 0);
        assert_eq!(m.committed_prefix(|id| id == "a"), 2);
        assert_eq!(m.committed_prefix(|id| id != "d"), 3);
        assert_eq!(m.committed_prefix(|_| true), 5);
    }

    #[test]
    fn test_state_and_timestamps() {
        let mut p = MigrationProgress::new(1_000, 2);
        assert_eq!(p.state(), MigrationState::Idle);
        assert_eq!(p.timestamp_for(0), 1_000);
        assert_eq!(p.timestamp_for(999), 1);
        assert_eq!(p.timestamp_for(5_000), 0);

        p.in_progress = Some(marker());
        assert_eq!(p.state(), MigrationState::BatchInProgress);
        p.completed = true;
        assert_eq!(p.state(), MigrationState::Completed);
    }

    #[tokio::test]
    async fn test_progress_persists() {
        let sidecar = Arc::new(Sidecar::open_in_memory().await.unwrap());
        let store = ProgressStore::new(sidecar);
        assert_eq!(store.load().await.unwrap(), None);

        let mut p = MigrationProgress::new(5_000, 2);
        p.in_progress = Some(marker());
        store.save(&p).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(p));
    }
}
