// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the visibility store engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::gateway::GatewayState;
use crate::migration::{LegacySource, MigrationState};
use crate::overflow::NotificationSink;
use crate::record::{Record, VisibilityState};
use crate::storage::sidecar::Sidecar;
use crate::storage::traits::{SortKey, StorageError, StoreFactory};

/// Result of [`super::VisibilityStore::set_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum SetOutcome {
    /// Record is (or will be, if queued) the visible state
    Stored { record: Record },
    /// Item is back to normal; its record is gone
    Removed { id: String },
}

/// One page of records in recency order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Record>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Store counts plus what is waiting in the fallback area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatsReport {
    pub total: u64,
    pub hidden: u64,
    pub dimmed: u64,
    pub pending_fallback: u64,
}

impl StoreStatsReport {
    #[must_use]
    pub fn count_for(&self, state: VisibilityState) -> u64 {
        match state {
            VisibilityState::Hidden => self.hidden,
            VisibilityState::Dimmed => self.dimmed,
            VisibilityState::Normal => 0,
        }
    }
}

/// How an import treats ids that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStrategy {
    /// Keep the existing record
    Skip,
    /// Replace the existing record
    Overwrite,
    /// Replace only when the imported record is strictly newer
    MergeByNewerTimestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportIssue {
    pub index: usize,
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<ImportIssue>,
}

/// Point-in-time health, without I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub gateway: GatewayState,
    pub in_flight: usize,
    pub resets: u64,
    pub cache_entries: usize,
    pub fallback_pending: u64,
    pub fallback_max: u64,
    pub fallback_tier: u8,
    pub recovering: bool,
    pub batch_pending: usize,
    /// `None` when no legacy sources were configured
    pub migration: Option<MigrationState>,
    pub accepting_writes: bool,
}

/// Collaborators that replace the config-driven defaults.
#[derive(Default, Clone)]
pub struct OpenOptions {
    /// Overrides `store_path`
    pub store_factory: Option<Arc<dyn StoreFactory>>,
    /// Overrides `sidecar_path`
    pub sidecar: Option<Arc<Sidecar>>,
    /// Defaults to [`crate::overflow::LogSink`]
    pub notification_sink: Option<Arc<dyn NotificationSink>>,
    /// Legacy maps to migrate on open, earlier sources win on duplicate ids
    pub legacy_sources: Vec<Arc<dyn LegacySource>>,
    /// Fixed origin for synthetic migration timestamps
    pub migration_origin: Option<i64>,
}

/// Decoded pagination cursor. On the wire it is hex-encoded JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PageCursor {
    #[serde(rename = "s")]
    pub state: Option<VisibilityState>,
    #[serde(rename = "t")]
    pub updated_at: i64,
    #[serde(rename = "i")]
    pub id: String,
}

impl PageCursor {
    pub fn after(state: Option<VisibilityState>, record: &Record) -> Self {
        Self {
            state,
            updated_at: record.updated_at,
            id: record.id.clone(),
        }
    }

    pub fn encode(&self) -> String {
        // Serializing a struct of plain fields cannot fail
        hex::encode(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Decode `token` and check it belongs to a scan with the same state filter.
    pub fn decode(token: &str, state: Option<VisibilityState>) -> Result<Self, StorageError> {
        let bytes = hex::decode(token).map_err(|_| StorageError::Validation("malformed page cursor".into()))?;
        let cursor: Self =
            serde_json::from_slice(&bytes).map_err(|_| StorageError::Validation("malformed page cursor".into()))?;
        if cursor.state != state {
            return Err(StorageError::Validation(
                "page cursor belongs to a different state filter".into(),
            ));
        }
        Ok(cursor)
    }

    pub fn sort_key(&self) -> SortKey {
        SortKey {
            updated_at: self.updated_at,
            id: self.id.clone(),
        }
    }
}
