// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded fallback queue for writes the primary store refused for capacity.
//!
//! This is NOT a tier - it's a durability buffer. Entries are "in flight" to
//! the primary store and replayed oldest-first with newer-wins semantics, so a
//! stale queued write can never roll back state committed after it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::gateway::{AccessMode, StoreGateway};
use crate::metrics;
use crate::record::{now_millis, Record};
use crate::storage::sidecar::{QueuedRecord, Sidecar};
use crate::storage::traits::{StorageError, WriteMode};

/// Fallback state for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackStats {
    /// Entries currently queued
    pub pending: u64,
    /// Configured bound
    pub max: u64,
    /// Entries queued since open
    pub total_queued: u64,
    /// Entries replayed into the primary store since open
    pub total_replayed: u64,
    /// Whether a replay is running
    pub replaying: bool,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Entries removed from the queue (applied or superseded)
    pub drained: usize,
    /// Entries still queued afterwards
    pub remaining: u64,
    /// Whether replay stopped on a capacity failure
    pub blocked_by_quota: bool,
}

pub struct FallbackQueue {
    sidecar: Arc<Sidecar>,
    max_entries: u64,
    pending: AtomicU64,
    total_queued: AtomicU64,
    total_replayed: AtomicU64,
    replaying: AtomicBool,
}

impl FallbackQueue {
    /// Attach to the sidecar, picking up entries left by a previous run.
    pub async fn open(sidecar: Arc<Sidecar>, max_entries: u64) -> Result<Self, StorageError> {
        let pending = sidecar.fallback_count().await?;
        if pending > 0 {
            warn!(pending, "Fallback queue has entries from previous run, will replay");
        }
        metrics::set_fallback_depth(pending);
        Ok(Self {
            sidecar,
            max_entries,
            pending: AtomicU64::new(pending),
            total_queued: AtomicU64::new(0),
            total_replayed: AtomicU64::new(0),
            replaying: AtomicBool::new(false),
        })
    }

    /// Queue records. The whole batch is rejected with `FallbackFull` if it does not fit.
    pub async fn push(&self, records: &[Record]) -> Result<Vec<i64>, StorageError> {
        let seqs = self.sidecar.fallback_push(records, now_millis(), self.max_entries).await?;
        let pending = self.pending.fetch_add(seqs.len() as u64, Ordering::AcqRel) + seqs.len() as u64;
        self.total_queued.fetch_add(seqs.len() as u64, Ordering::Relaxed);
        metrics::set_fallback_depth(pending);
        Ok(seqs)
    }

    pub async fn remove_seqs(&self, seqs: &[i64]) -> Result<usize, StorageError> {
        let removed = self.sidecar.fallback_remove_seqs(seqs).await?;
        self.sub_pending(removed as u64);
        Ok(removed)
    }

    /// Drop queued entries for ids whose state was committed directly.
    pub async fn remove_ids(&self, ids: &[String]) -> Result<usize, StorageError> {
        if !self.has_pending() {
            return Ok(0);
        }
        let removed = self.sidecar.fallback_remove_ids(ids).await?;
        if removed > 0 {
            debug!(removed, "Superseded fallback entries dropped");
        }
        self.sub_pending(removed as u64);
        Ok(removed)
    }

    fn sub_pending(&self, n: u64) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(n)));
        metrics::set_fallback_depth(self.len());
    }

    /// Newest queued record per id among `ids`.
    pub async fn lookup(&self, ids: &[String]) -> Result<HashMap<String, Record>, StorageError> {
        let mut newest: HashMap<String, Record> = HashMap::new();
        if !self.has_pending() {
            return Ok(newest);
        }
        for queued in self.sidecar.fallback_for_ids(ids).await? {
            merge_newer(&mut newest, queued.record);
        }
        Ok(newest)
    }

    /// Every queued record, newest per id.
    pub async fn snapshot(&self) -> Result<Vec<Record>, StorageError> {
        let mut newest: HashMap<String, Record> = HashMap::new();
        for queued in self.sidecar.fallback_peek(self.max_entries as usize).await? {
            merge_newer(&mut newest, queued.record);
        }
        let mut records: Vec<Record> = newest.into_values().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| b.id.cmp(&a.id)));
        Ok(records)
    }

    pub async fn peek(&self, limit: usize) -> Result<Vec<QueuedRecord>, StorageError> {
        self.sidecar.fallback_peek(limit).await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.sidecar.fallback_clear().await?;
        self.pending.store(0, Ordering::Release);
        metrics::set_fallback_depth(0);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.len() > 0
    }

    #[must_use]
    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    #[must_use]
    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            pending: self.len(),
            max: self.max_entries,
            total_queued: self.total_queued.load(Ordering::Relaxed),
            total_replayed: self.total_replayed.load(Ordering::Relaxed),
            replaying: self.replaying.load(Ordering::Acquire),
        }
    }

    /// Replay queued entries oldest-first into the primary store.
    ///
    /// Writes use [`WriteMode::IfNewer`], so entries older than the stored
    /// record are simply dropped. Stops at the first capacity failure and
    /// leaves the rest queued. A concurrent call returns immediately.
    pub async fn replay_into(&self, gateway: &StoreGateway, batch_size: usize) -> Result<ReplayOutcome, StorageError> {
        if self.replaying.swap(true, Ordering::AcqRel) {
            return Ok(ReplayOutcome { remaining: self.len(), ..Default::default() });
        }
        let _guard = ReplayGuard(&self.replaying);

        let mut outcome = ReplayOutcome::default();
        // Bound the pass to what was queued when it started
        let mut budget = self.len() as usize;
        if budget == 0 {
            return Ok(outcome);
        }
        info!(pending = budget, batch_size, "Replaying fallback queue");

        while budget > 0 {
            let batch = self.peek(batch_size.min(budget)).await?;
            if batch.is_empty() {
                break;
            }
            let records: Vec<Record> = batch.iter().map(|q| q.record.clone()).collect();
            let records = &records;
            let written = gateway
                .with_store(AccessMode::Write, "fallback_replay", |store| async move {
                    store.put_many(records, WriteMode::IfNewer).await
                })
                .await;

            match written {
                Ok(applied) => {
                    let seqs: Vec<i64> = batch.iter().map(|q| q.seq).collect();
                    let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
                    self.remove_seqs(&seqs).await?;
                    gateway.cache().invalidate(&ids);
                    self.total_replayed.fetch_add(applied as u64, Ordering::Relaxed);
                    outcome.drained += seqs.len();
                    budget = budget.saturating_sub(seqs.len());
                    debug!(applied, batch = seqs.len(), "Fallback batch replayed");
                }
                Err(e) if e.is_quota() => {
                    outcome.blocked_by_quota = true;
                    metrics::record_fallback_replay(outcome.drained, false);
                    warn!(drained = outcome.drained, remaining = self.len(), "Fallback replay blocked by capacity");
                    outcome.remaining = self.len();
                    return Ok(outcome);
                }
                Err(e) => {
                    metrics::record_fallback_replay(outcome.drained, false);
                    return Err(e);
                }
            }
        }

        outcome.remaining = self.len();
        metrics::record_fallback_replay(outcome.drained, true);
        info!(drained = outcome.drained, remaining = outcome.remaining, "Fallback replay complete");
        Ok(outcome)
    }
}

fn merge_newer(into: &mut HashMap<String, Record>, record: Record) {
    match into.get(&record.id) {
        Some(existing) if existing.updated_at > record.updated_at => {}
        _ => {
            into.insert(record.id.clone(), record);
        }
    }
}

/// RAII guard to reset the replaying flag.
struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ReadCache;
    use crate::gateway::GatewayConfig;
    use crate::record::VisibilityState;
    use crate::storage::memory::{InMemoryRecordStore, MemoryStoreFactory};
    use crate::storage::traits::RecordStore;
    use std::time::Duration;
    use tempfile::tempdir;

    fn rec(id: &str, ts: i64) -> Record {
        Record::with_timestamp(id, VisibilityState::Hidden, "t", ts)
    }

    async fn queue(max: u64) -> FallbackQueue {
        let sidecar = Arc::new(Sidecar::open_in_memory().await.unwrap());
        FallbackQueue::open(sidecar, max).await.unwrap()
    }

    async fn gateway(store: Arc<InMemoryRecordStore>) -> StoreGateway {
        let cache = Arc::new(ReadCache::new(100, Duration::from_secs(60)));
        StoreGateway::open(
            Arc::new(MemoryStoreFactory::from_store(store)),
            cache,
            GatewayConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_push_and_stats() {
        let q = queue(10).await;
        q.push(&[rec("a", 1), rec("b", 2)]).await.unwrap();
        let stats = q.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.total_queued, 2);
        assert!(q.has_pending());
    }

    #[tokio::test]
    async fn test_bound_rejects_batch() {
        let q = queue(2).await;
        q.push(&[rec("a", 1)]).await.unwrap();
        let err = q.push(&[rec("b", 1), rec("c", 1)]).await.unwrap_err();
        assert!(matches!(err, StorageError::FallbackFull { pending: 1, max: 2 }));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_and_snapshot_newest_wins() {
        let q = queue(10).await;
        q.push(&[rec("a", 5), rec("a", 3), rec("b", 1)]).await.unwrap();

        let found = q.lookup(&["a".into(), "z".into()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["a"].updated_at, 5);

        let snapshot = q.snapshot().await.unwrap();
        let ids: Vec<_> = snapshot.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_remove_ids_supersedes() {
        let q = queue(10).await;
        q.push(&[rec("a", 1), rec("b", 1), rec("a", 2)]).await.unwrap();
        assert_eq!(q.remove_ids(&["a".into()]).await.unwrap(), 2);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_replay_newer_wins() {
        let store = Arc::new(InMemoryRecordStore::new());
        store
            .put_many(&[rec("a", 100)], WriteMode::Overwrite)
            .await
            .unwrap();
        let gw = gateway(store.clone()).await;

        let q = queue(10).await;
        q.push(&[rec("a", 50), rec("b", 60)]).await.unwrap();

        let outcome = q.replay_into(&gw, 1).await.unwrap();
        assert_eq!(outcome.drained, 2);
        assert_eq!(outcome.remaining, 0);
        assert!(!outcome.blocked_by_quota);

        let got = store.get_many(&["a".into(), "b".into()]).await.unwrap();
        let a = got.iter().find(|r| r.id == "a").unwrap();
        assert_eq!(a.updated_at, 100);
        assert!(got.iter().any(|r| r.id == "b"));
    }

    #[tokio::test]
    async fn test_replay_stops_on_quota() {
        let store = Arc::new(InMemoryRecordStore::with_capacity(1));
        store.put_many(&[rec("full", 1)], WriteMode::Overwrite).await.unwrap();
        let gw = gateway(store).await;

        let q = queue(10).await;
        q.push(&[rec("a", 2)]).await.unwrap();
        let outcome = q.replay_into(&gw, 10).await.unwrap();
        assert!(outcome.blocked_by_quota);
        assert_eq!(outcome.remaining, 1);
    }

    #[tokio::test]
    async fn test_pending_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sidecar.db");
        {
            let sidecar = Arc::new(Sidecar::open(&path).await.unwrap());
            let q = FallbackQueue::open(sidecar.clone(), 10).await.unwrap();
            q.push(&[rec("persist-1", 1), rec("persist-2", 2)]).await.unwrap();
            sidecar.close().await;
        }
        let sidecar = Arc::new(Sidecar::open(&path).await.unwrap());
        let q = FallbackQueue::open(sidecar, 10).await.unwrap();
        assert_eq!(q.len(), 2);
    }
}
