// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One-time, resumable migration of legacy id→value maps into records.
//!
//! # States
//!
//! ```text
//! Idle ──checkpoint──► BatchInProgress ──commit──► Idle ──…──► Completed
//! ```
//!
//! Sources are processed in order; an id found in an earlier source is
//! skipped in later ones. Legacy values carry no timestamp, so each entry gets
//! `origin - ordinal`, where the ordinal counts entries across all sources.
//! The ordinal depends only on an entry's position, so re-running a batch after
//! a crash reproduces exactly the timestamps of an uninterrupted run.
//!
//! Records are written with [`WriteMode::IfAbsent`]: anything already in the
//! store is newer than legacy data.

pub mod legacy;
pub mod progress;

pub use legacy::{parse_legacy_value, JsonFileLegacySource, LegacyEntry, LegacySource, LegacyValue, MemoryLegacySource};
pub use progress::{BatchMarker, MarkerEntry, MigrationProgress, MigrationState, ProgressStore};

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::VisibilityConfig;
use crate::gateway::{AccessMode, StoreGateway};
use crate::metrics;
use crate::overflow::{OverflowManager, QuotaEventKind};
use crate::record::{now_millis, Record};
use crate::storage::sidecar::Sidecar;
use crate::storage::traits::{StorageError, WriteMode};

/// Outcome of [`MigrationEngine::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub state: MigrationState,
    pub migrated: u64,
    pub skipped: u64,
    pub errors: u64,
    /// Batches committed by this run
    pub batches: usize,
    /// Whether a dangling batch from an earlier run was recovered
    pub resumed: bool,
    pub pruned: usize,
}

pub struct MigrationEngine {
    gateway: Arc<StoreGateway>,
    overflow: Arc<OverflowManager>,
    progress: ProgressStore,
    sources: Vec<Arc<dyn LegacySource>>,
    batch_size: usize,
    max_records: u64,
    prune_target: u64,
    origin: Option<i64>,
}

impl MigrationEngine {
    pub fn new(
        gateway: Arc<StoreGateway>,
        overflow: Arc<OverflowManager>,
        sidecar: Arc<Sidecar>,
        sources: Vec<Arc<dyn LegacySource>>,
        config: &VisibilityConfig,
    ) -> Self {
        Self {
            gateway,
            overflow,
            progress: ProgressStore::new(sidecar),
            sources,
            batch_size: config.migration_batch_size.max(1),
            max_records: config.max_records,
            prune_target: config.prune_target,
            origin: None,
        }
    }

    /// Fix the timestamp origin of a fresh run instead of using the clock.
    #[must_use]
    pub fn with_origin(mut self, origin: i64) -> Self {
        self.origin = Some(origin);
        self
    }

    pub async fn state(&self) -> Result<MigrationState, StorageError> {
        Ok(self
            .progress
            .load()
            .await?
            .map_or(MigrationState::Idle, |p| p.state()))
    }

    /// Run (or resume) the migration to completion.
    #[tracing::instrument(skip(self), fields(sources = self.sources.len()))]
    pub async fn run(&self) -> Result<MigrationReport, StorageError> {
        let mut progress = match self.progress.load().await? {
            Some(progress) => progress,
            None => {
                let progress = MigrationProgress::new(self.origin.unwrap_or_else(now_millis), self.sources.len());
                info!(run_id = %progress.run_id, origin = progress.origin, "Starting legacy migration");
                progress
            }
        };
        let mut report = MigrationReport {
            state: progress.state(),
            migrated: progress.migrated,
            skipped: progress.skipped,
            errors: progress.errors,
            batches: 0,
            resumed: false,
            pruned: 0,
        };
        if progress.completed {
            debug!("Legacy migration already completed");
            return Ok(report);
        }
        progress.cursors.resize(self.sources.len(), 0);

        if let Some(marker) = progress.in_progress.take() {
            self.recover(&mut progress, marker).await?;
            self.progress.save(&progress).await?;
            report.resumed = true;
        }

        for source in 0..self.sources.len() {
            loop {
                if !self.run_batch(&mut progress, source).await? {
                    break;
                }
                report.batches += 1;
                tokio::task::yield_now().await;
            }
        }

        report.pruned = self.complete(&mut progress).await?;
        report.state = progress.state();
        report.migrated = progress.migrated;
        report.skipped = progress.skipped;
        report.errors = progress.errors;
        Ok(report)
    }

    /// Probe which records of a dangling batch reached the store and move the
    /// cursor past the committed prefix.
    async fn recover(&self, progress: &mut MigrationProgress, marker: BatchMarker) -> Result<(), StorageError> {
        let ids: Vec<String> = marker.writes.iter().map(|entry| entry.id.clone()).collect();
        let present: HashSet<String> = if ids.is_empty() {
            HashSet::new()
        } else {
            let ids = &ids;
            self.gateway
                .with_store(AccessMode::Read, "migration_lookup", |store| async move {
                    store.get_many(ids).await
                })
                .await?
                .into_iter()
                .map(|record| record.id)
                .collect()
        };
        let advance = marker.committed_prefix(|id| present.contains(id));

        warn!(
            source = marker.source,
            cursor = marker.cursor_before,
            batch = marker.len,
            present = present.len(),
            advance,
            "Recovering interrupted migration batch"
        );
        if let Some(cursor) = progress.cursors.get_mut(marker.source) {
            *cursor = marker.cursor_before + advance;
        }
        progress.next_ordinal = marker.ordinal_start + advance as u64;
        Ok(())
    }

    /// Process one batch of `source`. Returns false once the source is exhausted.
    async fn run_batch(&self, progress: &mut MigrationProgress, source: usize) -> Result<bool, StorageError> {
        let Some(legacy) = self.sources.get(source) else {
            return Ok(false);
        };
        let cursor = progress.cursors.get(source).copied().unwrap_or(0);
        let entries = legacy.read_batch(cursor, self.batch_size).await?;
        if entries.is_empty() {
            return Ok(false);
        }

        let ordinal_start = progress.next_ordinal;
        let mut records = Vec::with_capacity(entries.len());
        let mut writes = Vec::with_capacity(entries.len());
        let mut skipped = 0u64;
        let mut errors = 0u64;
        for (offset, entry) in entries.iter().enumerate() {
            if self.shadowed(source, &entry.id).await? {
                skipped += 1;
                continue;
            }
            match legacy::parse_legacy_value(&entry.value) {
                Ok(Some(value)) => {
                    let record = Record::with_timestamp(
                        entry.id.clone(),
                        value.state,
                        value.title,
                        progress.timestamp_for(ordinal_start + offset as u64),
                    );
                    if let Err(e) = record.validate() {
                        warn!(id = %entry.id, error = %e, "Skipping invalid legacy entry");
                        errors += 1;
                        continue;
                    }
                    writes.push(MarkerEntry {
                        offset,
                        id: entry.id.clone(),
                    });
                    records.push(record);
                }
                Ok(None) => skipped += 1,
                Err(reason) => {
                    warn!(id = %entry.id, reason = %reason, "Skipping unreadable legacy entry");
                    errors += 1;
                }
            }
        }

        // Checkpoint before the store sees the batch
        progress.in_progress = Some(BatchMarker {
            source,
            cursor_before: cursor,
            ordinal_start,
            len: entries.len(),
            writes,
        });
        self.progress.save(progress).await?;

        let written = match self.write_batch(&records).await {
            Ok(written) => written,
            Err(e) => {
                metrics::record_migration_batch(records.len(), false);
                error!(source = legacy.name(), cursor, error = %e, "Migration batch failed");
                return Err(e);
            }
        };

        if let Some(c) = progress.cursors.get_mut(source) {
            *c = cursor + entries.len();
        }
        progress.next_ordinal = ordinal_start + entries.len() as u64;
        progress.in_progress = None;
        progress.migrated += written as u64;
        progress.skipped += skipped + (records.len() - written) as u64;
        progress.errors += errors;
        self.progress.save(progress).await?;

        metrics::record_migration_batch(written, true);
        debug!(source = legacy.name(), cursor, read = entries.len(), written, "Migration batch committed");
        Ok(true)
    }

    /// Whether an earlier source owns `id`.
    async fn shadowed(&self, source: usize, id: &str) -> Result<bool, StorageError> {
        for earlier in &self.sources[..source] {
            if earlier.contains(id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn write_batch(&self, records: &[Record]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let result = self
            .gateway
            .with_store(AccessMode::Write, "migration_put", |store| async move {
                store.put_many(records, WriteMode::IfAbsent).await
            })
            .await;
        match result {
            Ok(written) => {
                self.gateway.cache().invalidate(&ids);
                Ok(written)
            }
            Err(e) if e.is_quota() => {
                let recovery = self.overflow.handle_quota_failure(records, WriteMode::IfAbsent).await;
                self.gateway.cache().invalidate(&ids);
                if recovery.success || recovery.in_fallback {
                    Ok(records.len())
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn complete(&self, progress: &mut MigrationProgress) -> Result<usize, StorageError> {
        for source in &self.sources {
            source.clear().await?;
        }
        progress.completed = true;
        progress.completed_at = Some(now_millis());
        self.progress.save(progress).await?;

        let pruned = self.gateway.prune_if_over(self.max_records, self.prune_target).await?;
        if pruned > 0 {
            self.overflow
                .quota_log()
                .record(QuotaEventKind::Pruned, json!({ "deleted": pruned, "reason": "migration" }))
                .await;
        }
        info!(
            migrated = progress.migrated,
            skipped = progress.skipped,
            errors = progress.errors,
            pruned,
            "Legacy migration completed"
        );
        Ok(pruned)
    }
}
