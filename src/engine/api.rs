// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service operations of the visibility store.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::batching::FlushReason;
use crate::cache::Lookup;
use crate::gateway::AccessMode;
use crate::metrics::{self, LatencyTimer};
use crate::overflow::QuotaEventKind;
use crate::record::{truncate_title, validate_id, ExportDump, Record, VisibilityState};
use crate::storage::traits::{PageQuery, SortKey, StorageError, WriteMode};

use super::types::PageCursor;
use super::{ConflictStrategy, ImportIssue, ImportReport, Page, SetOutcome, StoreStatsReport, VisibilityStore};
use super::PRUNE_CHECK_INTERVAL;

/// Records per scan during export.
const EXPORT_PAGE: usize = 1_000;

/// Records per lookup/write round during import.
const IMPORT_CHUNK: usize = 1_000;

impl VisibilityStore {
    /// Look up records by id. Ids in the normal state are simply absent.
    ///
    /// Pending batched writes win, then the cache, then the store. Entries
    /// waiting in the fallback area are merged in when newer.
    #[tracing::instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, Record>, StorageError> {
        let _timer = LatencyTimer::new("get_many");
        let mut found = HashMap::new();
        let mut unique = Vec::with_capacity(ids.len());
        let mut batched = HashSet::new();
        let mut unknown = Vec::new();

        let mut seen = HashSet::new();
        for id in ids {
            validate_id(id)?;
            if !seen.insert(id.as_str()) {
                continue;
            }
            unique.push(id.clone());
            if let Some(pending) = self.batcher.as_ref().and_then(|b| b.pending(id)) {
                batched.insert(id.clone());
                if pending.state.is_persistent() {
                    found.insert(id.clone(), pending);
                }
                continue;
            }
            match self.cache.get(id) {
                Lookup::Value(record) => {
                    found.insert(id.clone(), record);
                }
                Lookup::Absent => {}
                Lookup::Unknown => unknown.push(id.clone()),
            }
        }

        if !unknown.is_empty() {
            let fetched = {
                let unknown = &unknown;
                self.gateway
                    .with_store(AccessMode::Read, "get_many", |store| async move {
                        store.get_many(unknown).await
                    })
                    .await?
            };
            let mut by_id: HashMap<String, Record> = fetched.into_iter().map(|r| (r.id.clone(), r)).collect();
            for id in &unknown {
                let fetched = by_id.remove(id);
                let freshness = fetched.as_ref().map_or(0, |r| r.updated_at);
                if self.cache.merge_fetched(id, fetched.clone(), freshness) {
                    if let Some(record) = fetched {
                        found.insert(id.clone(), record);
                    }
                    continue;
                }
                // A local write landed while we were fetching; it wins.
                match self.cache.get(id) {
                    Lookup::Value(record) => {
                        found.insert(id.clone(), record);
                    }
                    Lookup::Absent => {}
                    Lookup::Unknown => {
                        if let Some(record) = fetched {
                            found.insert(id.clone(), record);
                        }
                    }
                }
            }
        }

        if self.overflow.fallback().has_pending() {
            let queued = self.overflow.pending_for(&unique).await?;
            for (id, record) in queued {
                if batched.contains(&id) {
                    continue;
                }
                match found.get(&id) {
                    Some(current) if current.updated_at >= record.updated_at => {}
                    _ => {
                        found.insert(id, record);
                    }
                }
            }
        }

        debug!(requested = ids.len(), found = found.len(), fetched = unknown.len(), "get_many");
        Ok(found)
    }

    /// Set an item's visibility. `Normal` removes its record.
    #[tracing::instrument(skip(self, title))]
    pub async fn set_state(&self, id: &str, state: VisibilityState, title: &str) -> Result<SetOutcome, StorageError> {
        let _timer = LatencyTimer::new("set_state");
        validate_id(id)?;
        if state.is_persistent() {
            self.overflow.admit_write().await?;
        }
        let record = Record::new(id, state, title);

        match &self.batcher {
            Some(batcher) => {
                // Journaled before the ack; replayed at open after a forced close.
                self.sidecar.journal_put(&record).await?;
                self.cache
                    .set(id, state.is_persistent().then(|| record.clone()), record.updated_at);
                if batcher.enqueue(record.clone()).is_some() {
                    if let Err(e) = self.flush_batch(FlushReason::Count).await {
                        // Still pending; the next flush retries it.
                        warn!(error = %e, "Batch flush failed");
                    }
                }
            }
            None => {
                self.write_records(std::slice::from_ref(&record), WriteMode::Overwrite)
                    .await?;
            }
        }

        metrics::record_operation("set_state", "success");
        self.maybe_prune().await;
        Ok(if state.is_persistent() {
            SetOutcome::Stored { record }
        } else {
            SetOutcome::Removed { id: id.to_string() }
        })
    }

    /// One page in recency order (newest first), optionally filtered by state.
    #[tracing::instrument(skip(self, cursor))]
    pub async fn get_page(
        &self,
        state: Option<VisibilityState>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page, StorageError> {
        let _timer = LatencyTimer::new("get_page");
        if state == Some(VisibilityState::Normal) {
            return Err(StorageError::Validation("normal items have no records to page".into()));
        }
        let limit = limit.clamp(1, self.config.page_max.max(1));
        let after = match cursor {
            Some(token) => Some(PageCursor::decode(token, state)?.sort_key()),
            None => None,
        };
        self.flush_pending().await;

        let query = PageQuery {
            state,
            after,
            limit: limit + 1,
        };
        let mut items = {
            let query = &query;
            self.gateway
                .with_store(AccessMode::Scan, "page", |store| async move { store.page(query).await })
                .await?
        };
        let has_more = items.len() > limit;
        items.truncate(limit);
        let next_cursor = if has_more {
            items.last().map(|last| PageCursor::after(state, last).encode())
        } else {
            None
        };
        Ok(Page {
            items,
            has_more,
            next_cursor,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_stats(&self) -> Result<StoreStatsReport, StorageError> {
        self.flush_pending().await;
        let stats = self.gateway.stats().await?;
        Ok(StoreStatsReport {
            total: stats.total,
            hidden: stats.hidden,
            dimmed: stats.dimmed,
            pending_fallback: self.overflow.fallback().len(),
        })
    }

    /// Remove every record, pending batched write and fallback entry.
    #[tracing::instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<(), StorageError> {
        let discarded = self.batcher.as_ref().map_or(0, |b| b.discard());
        self.sidecar.journal_clear().await?;
        self.gateway
            .with_store(AccessMode::Scan, "clear", |store| async move { store.clear().await })
            .await?;
        self.cache.clear();
        self.overflow.clear().await?;
        info!(discarded, "All visibility records cleared");
        Ok(())
    }

    /// Full dump, newest first, including entries still in the fallback area.
    #[tracing::instrument(skip(self))]
    pub async fn export_all(&self) -> Result<ExportDump, StorageError> {
        let _timer = LatencyTimer::new("export_all");
        self.flush_pending().await;

        let mut records = Vec::new();
        let mut after: Option<SortKey> = None;
        loop {
            let query = PageQuery {
                state: None,
                after: after.clone(),
                limit: EXPORT_PAGE,
            };
            let page = {
                let query = &query;
                self.gateway
                    .with_store(AccessMode::Scan, "export_page", |store| async move { store.page(query).await })
                    .await?
            };
            let done = page.len() < EXPORT_PAGE;
            after = page.last().map(SortKey::of);
            records.extend(page);
            if done {
                break;
            }
            tokio::task::yield_now().await;
        }

        let queued = self.overflow.fallback().snapshot().await?;
        if !queued.is_empty() {
            let mut by_id: HashMap<String, Record> = records.into_iter().map(|r| (r.id.clone(), r)).collect();
            for record in queued {
                match by_id.entry(record.id.clone()) {
                    Entry::Occupied(mut existing) => {
                        if record.updated_at > existing.get().updated_at {
                            existing.insert(record);
                        }
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(record);
                    }
                }
            }
            records = by_id.into_values().collect();
            records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| b.id.cmp(&a.id)));
        }

        info!(records = records.len(), "Export built");
        Ok(ExportDump::new(records))
    }

    /// Import records under a conflict strategy.
    ///
    /// Invalid records are reported individually. The whole import is rejected
    /// when too many records share one timestamp, which indicates data that
    /// was stamped in bulk rather than exported.
    #[tracing::instrument(skip(self, records), fields(count = records.len()))]
    pub async fn import_records(
        &self,
        records: Vec<Record>,
        strategy: ConflictStrategy,
    ) -> Result<ImportReport, StorageError> {
        let _timer = LatencyTimer::new("import_records");
        self.check_duplicate_timestamps(&records)?;
        self.overflow.admit_write().await?;
        self.flush_pending().await;

        let mut report = ImportReport::default();
        let mut newest: HashMap<String, Record> = HashMap::new();
        for (index, mut record) in records.into_iter().enumerate() {
            record.title = truncate_title(&record.title);
            if let Err(e) = record.validate() {
                report.errors.push(ImportIssue {
                    index,
                    id: record.id.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
            match newest.entry(record.id.clone()) {
                Entry::Occupied(mut existing) => {
                    report.skipped += 1;
                    if record.updated_at > existing.get().updated_at {
                        existing.insert(record);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            }
        }

        let mut candidates: Vec<Record> = newest.into_values().collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let mode = match strategy {
            ConflictStrategy::Skip => WriteMode::IfAbsent,
            ConflictStrategy::Overwrite => WriteMode::Overwrite,
            ConflictStrategy::MergeByNewerTimestamp => WriteMode::IfNewer,
        };

        for chunk in candidates.chunks(IMPORT_CHUNK) {
            let ids: Vec<String> = chunk.iter().map(|r| r.id.clone()).collect();
            let existing: HashMap<String, Record> = {
                let ids = &ids;
                self.gateway
                    .with_store(AccessMode::Read, "import_lookup", |store| async move {
                        store.get_many(ids).await
                    })
                    .await?
                    .into_iter()
                    .map(|r| (r.id.clone(), r))
                    .collect()
            };

            let mut to_write = Vec::with_capacity(chunk.len());
            for record in chunk {
                match (existing.get(&record.id), strategy) {
                    (None, _) => {
                        report.added += 1;
                        to_write.push(record.clone());
                    }
                    (Some(_), ConflictStrategy::Overwrite) => {
                        report.updated += 1;
                        to_write.push(record.clone());
                    }
                    (Some(old), ConflictStrategy::MergeByNewerTimestamp) if record.updated_at > old.updated_at => {
                        report.updated += 1;
                        to_write.push(record.clone());
                    }
                    (Some(_), _) => report.skipped += 1,
                }
            }
            self.write_records(&to_write, mode).await?;
            tokio::task::yield_now().await;
        }

        self.prune().await;
        info!(
            added = report.added,
            updated = report.updated,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Import finished"
        );
        Ok(report)
    }

    fn check_duplicate_timestamps(&self, records: &[Record]) -> Result<(), StorageError> {
        if records.is_empty() || records.len() < self.config.import_duplicate_min_records {
            return Ok(());
        }
        let mut counts: HashMap<i64, usize> = HashMap::new();
        for record in records {
            *counts.entry(record.updated_at).or_default() += 1;
        }
        if let Some((timestamp, count)) = counts.into_iter().max_by_key(|(_, count)| *count) {
            let ratio = count as f64 / records.len() as f64;
            if ratio >= self.config.import_duplicate_ratio {
                warn!(count, total = records.len(), timestamp, "Rejecting import with duplicate timestamps");
                return Err(StorageError::Validation(format!(
                    "suspicious duplicate-timestamp pattern: {} of {} records share updatedAt {}",
                    count,
                    records.len(),
                    timestamp
                )));
            }
        }
        Ok(())
    }

    // ----- internal write path -----

    /// Write records; `Normal` records are deletes. Capacity failures go
    /// through the overflow protocol and never surface raw.
    pub(super) async fn write_records(&self, records: &[Record], mode: WriteMode) -> Result<usize, StorageError> {
        let (puts, deletes): (Vec<&Record>, Vec<&Record>) = records.iter().partition(|r| r.state.is_persistent());
        let mut written = 0;

        if !deletes.is_empty() {
            let ids: Vec<String> = deletes.iter().map(|r| r.id.clone()).collect();
            {
                let ids = &ids;
                self.gateway
                    .with_store(AccessMode::Write, "delete_many", |store| async move {
                        store.delete_many(ids).await
                    })
                    .await?;
            }
            for record in &deletes {
                self.cache.set(&record.id, None, record.updated_at);
            }
            self.supersede(&ids).await;
            written += deletes.len();
        }

        if !puts.is_empty() {
            let puts: Vec<Record> = puts.into_iter().cloned().collect();
            written += self.put_records(&puts, mode).await?;
        }
        Ok(written)
    }

    async fn put_records(&self, records: &[Record], mode: WriteMode) -> Result<usize, StorageError> {
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let result = self
            .gateway
            .with_store(AccessMode::Write, "put_many", |store| async move {
                store.put_many(records, mode).await
            })
            .await;

        match result {
            Ok(written) => {
                self.cache_written(records, &ids, mode);
                if mode == WriteMode::Overwrite {
                    self.supersede(&ids).await;
                }
                Ok(written)
            }
            Err(e) if e.is_quota() => {
                let recovery = self.overflow.handle_quota_failure(records, mode).await;
                if recovery.success {
                    self.cache_written(records, &ids, mode);
                    return Ok(records.len());
                }
                if recovery.in_fallback {
                    // Reads merge the fallback entries until replay lands them.
                    self.cache.invalidate(&ids);
                    warn!(records = records.len(), "Write preserved in fallback area");
                    return Ok(0);
                }
                let fallback = self.overflow.fallback();
                if fallback.len() >= fallback.max_entries() {
                    Err(StorageError::FallbackFull {
                        pending: fallback.len(),
                        max: fallback.max_entries(),
                    })
                } else {
                    Err(StorageError::Permanent(format!(
                        "write could be neither stored nor preserved: {}",
                        e
                    )))
                }
            }
            Err(e) => Err(e),
        }
    }

    fn cache_written(&self, records: &[Record], ids: &[String], mode: WriteMode) {
        match mode {
            WriteMode::Overwrite => {
                for record in records {
                    self.cache.set(&record.id, Some(record.clone()), record.updated_at);
                }
            }
            // The store may have kept what it had
            WriteMode::IfNewer | WriteMode::IfAbsent => self.cache.invalidate(ids),
        }
    }

    async fn supersede(&self, ids: &[String]) {
        if !self.overflow.fallback().has_pending() {
            return;
        }
        if let Err(e) = self.overflow.supersede(ids).await {
            warn!(error = %e, "Failed to drop superseded fallback entries");
        }
    }

    pub(super) async fn flush_batch(&self, reason: FlushReason) -> Result<usize, StorageError> {
        let Some(batcher) = &self.batcher else {
            return Ok(0);
        };
        batcher
            .flush(reason, |items| async move {
                self.write_records(&items, WriteMode::Overwrite).await?;
                if let Err(e) = self.sidecar.journal_remove(&items).await {
                    // Leftovers are replayed with IfNewer at open.
                    warn!(error = %e, count = items.len(), "Failed to trim batch journal");
                }
                Ok(())
            })
            .await
    }

    /// Flush batched writes before reads that bypass the pending map.
    async fn flush_pending(&self) {
        if self.batcher.as_ref().is_some_and(|b| !b.is_empty()) {
            if let Err(e) = self.flush_batch(FlushReason::Manual).await {
                warn!(error = %e, "Batch flush before scan failed");
            }
        }
    }

    async fn maybe_prune(&self) {
        let writes = self.writes_since_prune_check.fetch_add(1, Ordering::Relaxed) + 1;
        if writes < PRUNE_CHECK_INTERVAL {
            return;
        }
        self.writes_since_prune_check.store(0, Ordering::Relaxed);
        self.prune().await;
    }

    /// Shrink the store to `prune_target` when it holds more than `max_records`.
    pub async fn prune(&self) -> usize {
        match self
            .gateway
            .prune_if_over(self.config.max_records, self.config.prune_target)
            .await
        {
            Ok(0) => 0,
            Ok(deleted) => {
                self.overflow
                    .quota_log()
                    .record(QuotaEventKind::Pruned, json!({ "deleted": deleted, "reason": "capacity" }))
                    .await;
                deleted
            }
            Err(e) => {
                warn!(error = %e, "Pruning failed");
                0
            }
        }
    }
}
