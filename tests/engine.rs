// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end tests of the visibility store façade.
//!
//! Everything here runs against the in-memory store or SQLite files in a
//! temp directory, so no external services are needed.

use std::collections::HashSet;
use std::sync::Arc;

use tempfile::TempDir;

use visibility_store::storage::memory::{InMemoryRecordStore, MemoryStoreFactory};
use visibility_store::storage::traits::RecordStore;
use visibility_store::{
    ConflictStrategy, OpenOptions, Record, SetOutcome, StorageError, VisibilityConfig, VisibilityState,
    VisibilityStore, WriteMode,
};

// =============================================================================
// Helpers
// =============================================================================

async fn memory_engine(config: VisibilityConfig) -> (VisibilityStore, Arc<InMemoryRecordStore>) {
    let factory = Arc::new(MemoryStoreFactory::new());
    let store = factory.store();
    let engine = VisibilityStore::open_with(
        config,
        OpenOptions {
            store_factory: Some(factory),
            ..Default::default()
        },
    )
    .await
    .expect("open");
    (engine, store)
}

fn file_config(dir: &TempDir) -> VisibilityConfig {
    VisibilityConfig {
        store_path: Some(dir.path().join("records.db").to_string_lossy().into_owned()),
        sidecar_path: Some(dir.path().join("sidecar.db").to_string_lossy().into_owned()),
        ..Default::default()
    }
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Read/write round trips
// =============================================================================

#[tokio::test]
async fn test_set_then_get_returns_exact_record() {
    let (engine, _) = memory_engine(VisibilityConfig::default()).await;

    let outcome = engine.set_state("abc", VisibilityState::Hidden, "t").await.unwrap();
    let SetOutcome::Stored { record } = outcome else {
        panic!("expected a stored record");
    };
    assert_eq!(record.id, "abc");
    assert_eq!(record.state, VisibilityState::Hidden);
    assert_eq!(record.title, "t");

    let found = engine.get_many(&ids(&["abc", "missing"])).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found["abc"], record);
}

#[tokio::test]
async fn test_normal_removes_record() {
    let (engine, store) = memory_engine(VisibilityConfig::default()).await;

    engine.set_state("abc", VisibilityState::Dimmed, "").await.unwrap();
    let outcome = engine.set_state("abc", VisibilityState::Normal, "").await.unwrap();
    assert_eq!(outcome, SetOutcome::Removed { id: "abc".into() });

    assert!(engine.get_many(&ids(&["abc"])).await.unwrap().is_empty());
    assert!(store.is_empty());

    // Idempotent: removing again is fine
    engine.set_state("abc", VisibilityState::Normal, "").await.unwrap();
    assert_eq!(engine.get_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn test_repeated_set_is_idempotent() {
    let (engine, store) = memory_engine(VisibilityConfig::default()).await;

    for _ in 0..3 {
        engine.set_state("x", VisibilityState::Hidden, "same").await.unwrap();
    }
    assert_eq!(store.len(), 1);
    let stats = engine.get_stats().await.unwrap();
    assert_eq!((stats.total, stats.hidden, stats.dimmed), (1, 1, 0));
}

#[tokio::test]
async fn test_invalid_ids_rejected() {
    let (engine, _) = memory_engine(VisibilityConfig::default()).await;

    let err = engine.set_state("  ", VisibilityState::Hidden, "").await.unwrap_err();
    assert!(matches!(err, StorageError::Validation(_)));

    let long = "x".repeat(1_000);
    assert!(engine.get_many(&[long]).await.is_err());
}

#[tokio::test]
async fn test_cache_agrees_with_store() {
    let (engine, store) = memory_engine(VisibilityConfig::default()).await;

    // Miss populates a tombstone
    assert!(engine.get_many(&ids(&["a"])).await.unwrap().is_empty());

    engine.set_state("a", VisibilityState::Hidden, "one").await.unwrap();
    let found = engine.get_many(&ids(&["a"])).await.unwrap();
    assert_eq!(found["a"].title, "one");

    // Cache stays consistent with what the engine wrote
    let in_store = store.get_many(&ids(&["a"])).await.unwrap();
    assert_eq!(in_store, vec![found["a"].clone()]);
    assert!(engine.cache().validate_consistency().is_consistent());
}

#[tokio::test]
async fn test_duplicate_ids_in_request_are_collapsed() {
    let (engine, _) = memory_engine(VisibilityConfig::default()).await;
    engine.set_state("a", VisibilityState::Dimmed, "").await.unwrap();

    let found = engine.get_many(&ids(&["a", "a", "a"])).await.unwrap();
    assert_eq!(found.len(), 1);
}

// =============================================================================
// Pagination
// =============================================================================

#[tokio::test]
async fn test_pagination_visits_each_record_once_in_recency_order() {
    let (engine, store) = memory_engine(VisibilityConfig::default()).await;

    let records: Vec<Record> = (0..57)
        .map(|i| {
            let state = if i % 3 == 0 { VisibilityState::Dimmed } else { VisibilityState::Hidden };
            // Every pair shares a timestamp to exercise the id tie-break
            Record::with_timestamp(format!("item-{:02}", i), state, "", 1_000 + (i / 2) as i64)
        })
        .collect();
    store.put_many(&records, WriteMode::Overwrite).await.unwrap();

    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = engine.get_page(None, cursor.as_deref(), 10).await.unwrap();
        assert!(page.items.len() <= 10);
        seen.extend(page.items);
        if !page.has_more {
            assert!(page.next_cursor.is_none());
            break;
        }
        cursor = page.next_cursor;
    }

    assert_eq!(seen.len(), 57);
    let unique: HashSet<_> = seen.iter().map(|r| r.id.clone()).collect();
    assert_eq!(unique.len(), 57);
    for pair in seen.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!((a.updated_at, &a.id) > (b.updated_at, &b.id));
    }
}

#[tokio::test]
async fn test_pagination_by_state() {
    let (engine, _) = memory_engine(VisibilityConfig::default()).await;
    for i in 0..12 {
        let state = if i % 2 == 0 { VisibilityState::Hidden } else { VisibilityState::Dimmed };
        engine.set_state(&format!("i{}", i), state, "").await.unwrap();
    }

    let first = engine.get_page(Some(VisibilityState::Dimmed), None, 4).await.unwrap();
    assert_eq!(first.items.len(), 4);
    assert!(first.has_more);
    assert!(first.items.iter().all(|r| r.state == VisibilityState::Dimmed));

    let cursor = first.next_cursor.unwrap();
    let second = engine
        .get_page(Some(VisibilityState::Dimmed), Some(&cursor), 4)
        .await
        .unwrap();
    assert_eq!(second.items.len(), 2);
    assert!(!second.has_more);

    // A cursor only works with the filter it was issued for
    let err = engine.get_page(Some(VisibilityState::Hidden), Some(&cursor), 4).await.unwrap_err();
    assert!(matches!(err, StorageError::Validation(_)));
    assert!(engine.get_page(Some(VisibilityState::Normal), None, 4).await.is_err());
}

// =============================================================================
// Capacity ceiling
// =============================================================================

#[tokio::test]
async fn test_import_over_ceiling_prunes_oldest() {
    let (engine, _) = memory_engine(VisibilityConfig::default()).await;

    let records: Vec<Record> = (0..250_000i64)
        .map(|i| Record::with_timestamp(format!("item-{:06}", i), VisibilityState::Hidden, "", 1 + i))
        .collect();
    let report = engine.import_records(records, ConflictStrategy::Skip).await.unwrap();
    assert_eq!(report.added, 250_000);
    assert!(report.errors.is_empty());

    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.total, 180_000);

    let found = engine
        .get_many(&ids(&["item-000000", "item-069999", "item-070000", "item-249999"]))
        .await
        .unwrap();
    assert!(!found.contains_key("item-000000"));
    assert!(!found.contains_key("item-069999"));
    assert!(found.contains_key("item-070000"));
    assert!(found.contains_key("item-249999"));

    let events = engine.overflow().quota_log().recent(10).await.unwrap();
    assert!(events.iter().any(|e| e.kind == visibility_store::overflow::QuotaEventKind::Pruned));
}

// =============================================================================
// Import / export
// =============================================================================

#[tokio::test]
async fn test_import_rejects_duplicate_timestamp_pattern() {
    let (engine, store) = memory_engine(VisibilityConfig::default()).await;

    let records: Vec<Record> = (0..1_000)
        .map(|i| Record::with_timestamp(format!("dup-{}", i), VisibilityState::Dimmed, "", 1_700_000_000_000))
        .collect();
    let err = engine.import_records(records, ConflictStrategy::Overwrite).await.unwrap_err();
    let StorageError::Validation(reason) = err else {
        panic!("expected a validation error");
    };
    assert!(reason.contains("duplicate-timestamp"));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_import_strategies() {
    let (engine, store) = memory_engine(VisibilityConfig::default()).await;
    store
        .put_many(
            &[
                Record::with_timestamp("a", VisibilityState::Hidden, "old a", 100),
                Record::with_timestamp("b", VisibilityState::Hidden, "old b", 300),
            ],
            WriteMode::Overwrite,
        )
        .await
        .unwrap();

    let incoming = || {
        vec![
            Record::with_timestamp("a", VisibilityState::Dimmed, "new a", 200),
            Record::with_timestamp("b", VisibilityState::Dimmed, "new b", 200),
            Record::with_timestamp("c", VisibilityState::Dimmed, "c", 200),
        ]
    };

    let report = engine.import_records(incoming(), ConflictStrategy::Skip).await.unwrap();
    assert_eq!((report.added, report.updated, report.skipped), (1, 0, 2));

    let report = engine
        .import_records(incoming(), ConflictStrategy::MergeByNewerTimestamp)
        .await
        .unwrap();
    assert_eq!((report.added, report.updated, report.skipped), (0, 1, 2));
    let found = engine.get_many(&ids(&["a", "b"])).await.unwrap();
    assert_eq!(found["a"].title, "new a");
    assert_eq!(found["b"].title, "old b");

    let report = engine.import_records(incoming(), ConflictStrategy::Overwrite).await.unwrap();
    assert_eq!(report.updated, 3);
    let found = engine.get_many(&ids(&["b"])).await.unwrap();
    assert_eq!(found["b"].title, "new b");
}

#[tokio::test]
async fn test_import_reports_invalid_records() {
    let (engine, _) = memory_engine(VisibilityConfig::default()).await;
    let records = vec![
        Record::with_timestamp("ok", VisibilityState::Hidden, "", 10),
        Record::with_timestamp("", VisibilityState::Hidden, "", 11),
        Record::with_timestamp("normal", VisibilityState::Normal, "", 12),
        Record::with_timestamp("neg", VisibilityState::Hidden, "", -5),
    ];
    let report = engine.import_records(records, ConflictStrategy::Overwrite).await.unwrap();
    assert_eq!(report.added, 1);
    let bad: Vec<usize> = report.errors.iter().map(|e| e.index).collect();
    assert_eq!(bad, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_export_then_import_restores() {
    let (engine, _) = memory_engine(VisibilityConfig::default()).await;
    for i in 0..20 {
        engine
            .set_state(&format!("e{}", i), VisibilityState::Hidden, &format!("title {}", i))
            .await
            .unwrap();
    }
    let dump = engine.export_all().await.unwrap();
    assert_eq!(dump.records.len(), 20);
    assert!(dump.records.windows(2).all(|w| w[0].updated_at >= w[1].updated_at));

    engine.clear_all().await.unwrap();
    assert_eq!(engine.get_stats().await.unwrap().total, 0);

    let report = engine
        .import_records(dump.records.clone(), ConflictStrategy::Overwrite)
        .await
        .unwrap();
    assert_eq!(report.added, 20);
    let again = engine.export_all().await.unwrap();
    assert_eq!(again.records, dump.records);
}

// =============================================================================
// Batching
// =============================================================================

#[tokio::test]
async fn test_batched_writes_visible_before_flush() {
    let config = VisibilityConfig {
        batch_writes: true,
        batch_max_items: 10,
        batch_idle_ms: 60_000,
        ..Default::default()
    };
    let (engine, store) = memory_engine(config).await;

    engine.set_state("a", VisibilityState::Hidden, "").await.unwrap();
    engine.set_state("b", VisibilityState::Dimmed, "").await.unwrap();
    engine.set_state("b", VisibilityState::Normal, "").await.unwrap();
    assert!(store.is_empty());

    let found = engine.get_many(&ids(&["a", "b"])).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(engine.health().await.batch_pending, 2);

    // Scans flush first
    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_batch_flushes_on_count_and_close() {
    let config = VisibilityConfig {
        batch_writes: true,
        batch_max_items: 5,
        batch_idle_ms: 60_000,
        ..Default::default()
    };
    let (engine, store) = memory_engine(config).await;

    for i in 0..7 {
        engine.set_state(&format!("b{}", i), VisibilityState::Hidden, "").await.unwrap();
    }
    assert_eq!(store.len(), 5);

    engine.close().await;
    assert_eq!(store.len(), 7);
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_sqlite_records_survive_reopen() {
    let dir = TempDir::new().unwrap();

    let engine = VisibilityStore::open(file_config(&dir)).await.unwrap();
    engine.set_state("keep", VisibilityState::Dimmed, "persisted").await.unwrap();
    engine.set_state("drop", VisibilityState::Hidden, "").await.unwrap();
    engine.set_state("drop", VisibilityState::Normal, "").await.unwrap();
    engine.close().await;

    let engine = VisibilityStore::open(file_config(&dir)).await.unwrap();
    let found = engine.get_many(&ids(&["keep", "drop"])).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found["keep"].title, "persisted");
    engine.close().await;
}

#[tokio::test]
async fn test_forced_close_keeps_acknowledged_batched_writes() {
    let dir = TempDir::new().unwrap();
    let batched = VisibilityConfig {
        batch_writes: true,
        batch_max_items: 100,
        batch_idle_ms: 60_000,
        ..file_config(&dir)
    };

    let engine = VisibilityStore::open(batched.clone()).await.unwrap();
    engine.set_state("gone", VisibilityState::Dimmed, "").await.unwrap();
    engine.close().await;

    let engine = VisibilityStore::open(batched.clone()).await.unwrap();
    let outcome = engine.set_state("acked", VisibilityState::Hidden, "kept").await.unwrap();
    assert!(matches!(outcome, SetOutcome::Stored { .. }));
    engine.set_state("gone", VisibilityState::Normal, "").await.unwrap();
    assert_eq!(engine.health().await.batch_pending, 2);
    engine.close_now();

    // Reopened without batching: the journal replay alone must restore both writes
    let engine = VisibilityStore::open(file_config(&dir)).await.unwrap();
    let found = engine.get_many(&ids(&["acked", "gone"])).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found["acked"].state, VisibilityState::Hidden);
    assert_eq!(found["acked"].title, "kept");
    assert_eq!(engine.get_stats().await.unwrap().total, 1);
    engine.close().await;
}

#[tokio::test]
async fn test_operations_after_close_fail() {
    let (engine, _) = memory_engine(VisibilityConfig::default()).await;
    engine.close().await;

    let err = engine.set_state("a", VisibilityState::Hidden, "").await.unwrap_err();
    assert!(matches!(err, StorageError::Closed | StorageError::ShuttingDown));
}

#[tokio::test]
async fn test_health_snapshot() {
    let (engine, _) = memory_engine(VisibilityConfig::default()).await;
    engine.set_state("a", VisibilityState::Hidden, "").await.unwrap();

    let health = engine.health().await;
    assert!(health.accepting_writes);
    assert_eq!(health.fallback_pending, 0);
    assert_eq!(health.in_flight, 0);
    assert!(health.migration.is_none());
}
