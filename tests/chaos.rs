// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos testing for the visibility store.
//!
//! A [`FailingStore`] wraps the in-memory store and injects failures with
//! precision: a queue of errors consumed one per call, a "capacity always
//! exceeded" switch, and an artificial delay. The engine must turn each of
//! them into the documented outcome without losing a write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use visibility_store::overflow::{QuotaEventKind, RecordingSink};
use visibility_store::storage::memory::{InMemoryRecordStore, MemoryStoreFactory};
use visibility_store::storage::traits::{PageQuery, RecordStore, StoreFactory, StoreStats};
use visibility_store::{
    OpenOptions, Record, SetOutcome, StorageError, VisibilityConfig, VisibilityState, VisibilityStore, WriteMode,
};

// =============================================================================
// Failing Store Wrappers - Precise Error Injection
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Get,
    Put,
}

/// Faults shared by every store handle the factory opens.
#[derive(Default)]
struct FaultPlan {
    get_faults: Mutex<VecDeque<StorageError>>,
    put_faults: Mutex<VecDeque<StorageError>>,
    /// Every put fails with QuotaExceeded while set
    quota_always: AtomicBool,
    get_delay_ms: AtomicU64,
    put_calls: AtomicU64,
}

impl FaultPlan {
    fn fail_next(&self, op: Op, errors: impl IntoIterator<Item = StorageError>) {
        let queue = match op {
            Op::Get => &self.get_faults,
            Op::Put => &self.put_faults,
        };
        queue.lock().extend(errors);
    }

    fn next_fault(&self, op: Op) -> Option<StorageError> {
        match op {
            Op::Get => self.get_faults.lock().pop_front(),
            Op::Put => self.put_faults.lock().pop_front(),
        }
    }
}

struct FailingStore {
    inner: Arc<dyn RecordStore>,
    plan: Arc<FaultPlan>,
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn get_many(&self, ids: &[String]) -> Result<Vec<Record>, StorageError> {
        let delay = self.plan.get_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(err) = self.plan.next_fault(Op::Get) {
            return Err(err);
        }
        self.inner.get_many(ids).await
    }

    async fn put_many(&self, records: &[Record], mode: WriteMode) -> Result<usize, StorageError> {
        self.plan.put_calls.fetch_add(1, Ordering::Relaxed);
        if self.plan.quota_always.load(Ordering::Relaxed) {
            return Err(StorageError::QuotaExceeded("injected".into()));
        }
        if let Some(err) = self.plan.next_fault(Op::Put) {
            return Err(err);
        }
        self.inner.put_many(records, mode).await
    }

    async fn delete_many(&self, ids: &[String]) -> Result<usize, StorageError> {
        self.inner.delete_many(ids).await
    }

    async fn delete_oldest(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        self.inner.delete_oldest(limit).await
    }

    async fn page(&self, query: &PageQuery) -> Result<Vec<Record>, StorageError> {
        self.inner.page(query).await
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        self.inner.stats().await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    fn close_now(&self) {
        self.inner.close_now();
    }
}

struct FailingFactory {
    inner: MemoryStoreFactory,
    plan: Arc<FaultPlan>,
}

#[async_trait]
impl StoreFactory for FailingFactory {
    async fn open(&self) -> Result<Arc<dyn RecordStore>, StorageError> {
        let inner = self.inner.open().await?;
        Ok(Arc::new(FailingStore {
            inner,
            plan: self.plan.clone(),
        }))
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        self.inner.destroy().await
    }

    fn describe(&self) -> String {
        format!("failing({})", self.inner.describe())
    }
}

struct Harness {
    engine: Arc<VisibilityStore>,
    plan: Arc<FaultPlan>,
    factory: Arc<FailingFactory>,
    sink: Arc<RecordingSink>,
}

impl Harness {
    async fn open(config: VisibilityConfig, store: InMemoryRecordStore) -> Self {
        let plan = Arc::new(FaultPlan::default());
        let factory = Arc::new(FailingFactory {
            inner: MemoryStoreFactory::from_store(Arc::new(store)),
            plan: plan.clone(),
        });
        let sink = Arc::new(RecordingSink::new());
        let engine = VisibilityStore::open_with(
            config,
            OpenOptions {
                store_factory: Some(factory.clone()),
                notification_sink: Some(sink.clone()),
                ..Default::default()
            },
        )
        .await
        .expect("open");
        Self {
            engine: Arc::new(engine),
            plan,
            factory,
            sink,
        }
    }

    /// The store currently behind the factory (changes after a reset).
    fn store(&self) -> Arc<InMemoryRecordStore> {
        self.factory.inner.store()
    }
}

fn fast_config() -> VisibilityConfig {
    VisibilityConfig {
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 5,
        reset_drain_timeout_ms: 200,
        ..Default::default()
    }
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Transient and timeout failures
// =============================================================================

#[tokio::test]
async fn test_transient_put_failures_are_retried() {
    let h = Harness::open(fast_config(), InMemoryRecordStore::new()).await;
    h.plan.fail_next(
        Op::Put,
        [
            StorageError::Transient("busy".into()),
            StorageError::Transient("busy".into()),
        ],
    );

    h.engine.set_state("a", VisibilityState::Hidden, "").await.unwrap();
    assert_eq!(h.plan.put_calls.load(Ordering::Relaxed), 3);
    assert_eq!(h.store().len(), 1);
}

#[tokio::test]
async fn test_transient_failures_past_budget_surface() {
    let h = Harness::open(fast_config(), InMemoryRecordStore::new()).await;
    h.plan.fail_next(Op::Put, (0..10).map(|_| StorageError::Transient("down".into())));

    let err = h.engine.set_state("a", VisibilityState::Hidden, "").await.unwrap_err();
    assert!(matches!(err, StorageError::Transient(_)));
    assert!(h.store().is_empty());
}

#[tokio::test]
async fn test_slow_reads_time_out() {
    let config = VisibilityConfig {
        op_timeout_ms: 20,
        max_retries: 1,
        ..fast_config()
    };
    let h = Harness::open(config, InMemoryRecordStore::new()).await;
    h.plan.get_delay_ms.store(200, Ordering::Relaxed);

    let err = h.engine.get_many(&ids(&["a"])).await.unwrap_err();
    assert!(matches!(err, StorageError::Timeout { budget_ms: 20, .. }));

    // Abandoned attempts release their admission slot
    assert_eq!(h.engine.gateway().in_flight(), 0);
}

#[tokio::test]
async fn test_admission_limit_rejects_excess() {
    let config = VisibilityConfig {
        max_in_flight: 1,
        ..fast_config()
    };
    let h = Harness::open(config, InMemoryRecordStore::new()).await;
    h.plan.get_delay_ms.store(200, Ordering::Relaxed);

    let engine = h.engine.clone();
    let slow = tokio::spawn(async move { engine.get_many(&ids(&["slow"])).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = h.engine.get_many(&ids(&["other"])).await.unwrap_err();
    assert!(matches!(err, StorageError::Overloaded { max: 1, .. }));
    assert!(slow.await.unwrap().is_ok());
}

// =============================================================================
// Corruption
// =============================================================================

#[tokio::test]
async fn test_corruption_resets_store_and_service_continues() {
    let h = Harness::open(fast_config(), InMemoryRecordStore::new()).await;
    h.engine.set_state("before", VisibilityState::Hidden, "").await.unwrap();
    h.engine.cache().clear();

    h.plan.fail_next(Op::Get, [StorageError::Corruption("bad page".into())]);
    let err = h.engine.get_many(&ids(&["before"])).await.unwrap_err();
    assert!(matches!(err, StorageError::Corruption(_)));

    let health = h.engine.health().await;
    assert_eq!(health.resets, 1);
    assert_eq!(health.gateway, visibility_store::GatewayState::Ready);

    // Recreated empty and usable
    assert!(h.engine.get_many(&ids(&["before"])).await.unwrap().is_empty());
    h.engine.set_state("after", VisibilityState::Dimmed, "").await.unwrap();
    assert_eq!(h.store().len(), 1);
}

// =============================================================================
// Capacity exhaustion
// =============================================================================

#[tokio::test]
async fn test_quota_recovery_deletes_oldest_and_writes() {
    let config = VisibilityConfig {
        cleanup_min_records: 2,
        ..fast_config()
    };
    let store = InMemoryRecordStore::with_capacity(10);
    let old: Vec<Record> = (0..10)
        .map(|i| Record::with_timestamp(format!("old-{}", i), VisibilityState::Hidden, "", 100 + i))
        .collect();
    store.put_many(&old, WriteMode::Overwrite).await.unwrap();
    let h = Harness::open(config, store).await;

    let outcome = h.engine.set_state("new", VisibilityState::Dimmed, "fresh").await.unwrap();
    assert!(matches!(outcome, SetOutcome::Stored { .. }));

    let found = h.engine.get_many(&ids(&["new", "old-0", "old-9"])).await.unwrap();
    assert!(found.contains_key("new"));
    assert!(!found.contains_key("old-0"));
    assert!(found.contains_key("old-9"));
    assert!(h.engine.overflow().fallback().is_empty());

    let kinds: Vec<QuotaEventKind> = h
        .engine
        .overflow()
        .quota_log()
        .recent(20)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&QuotaEventKind::QuotaExceeded));
    assert!(kinds.contains(&QuotaEventKind::RecoverySucceeded));
}

#[tokio::test]
async fn test_unrecoverable_quota_preserves_write_in_fallback() {
    let h = Harness::open(fast_config(), InMemoryRecordStore::new()).await;
    h.plan.quota_always.store(true, Ordering::Relaxed);

    // Accepted: the write is durable in the fallback area
    h.engine.set_state("queued", VisibilityState::Hidden, "keep me").await.unwrap();
    assert!(h.store().is_empty());
    assert_eq!(h.engine.get_stats().await.unwrap().pending_fallback, 1);

    let found = h.engine.get_many(&ids(&["queued"])).await.unwrap();
    assert_eq!(found["queued"].title, "keep me");

    // Capacity returns; maintenance replays the queue
    h.plan.quota_always.store(false, Ordering::Relaxed);
    h.engine.tick().await;

    assert!(h.engine.overflow().fallback().is_empty());
    assert_eq!(h.store().len(), 1);
    let found = h.engine.get_many(&ids(&["queued"])).await.unwrap();
    assert_eq!(found["queued"].title, "keep me");
}

#[tokio::test]
async fn test_newer_direct_write_supersedes_queued_entry() {
    let h = Harness::open(fast_config(), InMemoryRecordStore::new()).await;
    h.plan.quota_always.store(true, Ordering::Relaxed);
    h.engine.set_state("x", VisibilityState::Hidden, "queued").await.unwrap();
    assert_eq!(h.engine.overflow().fallback().len(), 1);

    h.plan.quota_always.store(false, Ordering::Relaxed);
    h.engine.set_state("x", VisibilityState::Normal, "").await.unwrap();
    assert!(h.engine.overflow().fallback().is_empty());

    h.engine.tick().await;
    assert!(h.engine.get_many(&ids(&["x"])).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_full_fallback_refuses_writes() {
    let config = VisibilityConfig {
        fallback_max_entries: 4,
        ..fast_config()
    };
    let h = Harness::open(config, InMemoryRecordStore::new()).await;
    h.plan.quota_always.store(true, Ordering::Relaxed);

    let mut refused = 0;
    for i in 0..8 {
        match h.engine.set_state(&format!("w{}", i), VisibilityState::Hidden, "").await {
            Ok(_) => {}
            Err(StorageError::FallbackFull { max: 4, .. }) => refused += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(refused > 0);
    assert!(h.engine.overflow().fallback().len() <= 4);
    assert!(!h.engine.health().await.accepting_writes);
    assert!(!h.sink.messages().is_empty());

    // Removals are never gated
    h.engine.set_state("w0", VisibilityState::Normal, "").await.unwrap();
}

// =============================================================================
// Abrupt termination
// =============================================================================

#[tokio::test]
async fn test_close_now_rejects_further_work() {
    let h = Harness::open(fast_config(), InMemoryRecordStore::new()).await;
    h.engine.set_state("a", VisibilityState::Hidden, "").await.unwrap();

    h.engine.close_now();
    let err = h.engine.get_many(&ids(&["zzz"])).await.unwrap_err();
    assert!(matches!(err, StorageError::Closed));
    // Committed data is untouched
    assert_eq!(h.store().len(), 1);
}
