// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded in-memory record store.
//!
//! Same contract as the SQLite store, including capacity failures: once a
//! capacity is configured, a write that would add records beyond it fails
//! with [`StorageError::QuotaExceeded`] and changes nothing.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::traits::{
    PageQuery, RecordStore, StorageError, StoreFactory, StoreStats, WriteMode,
};
use crate::record::{Record, VisibilityState};

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Record>,
    /// Global recency ordering: (updated_at, id)
    by_recency: BTreeSet<(i64, String)>,
}

impl Inner {
    fn insert(&mut self, record: Record) {
        if let Some(old) = self.by_id.remove(&record.id) {
            self.by_recency.remove(&(old.updated_at, old.id));
        }
        self.by_recency.insert((record.updated_at, record.id.clone()));
        self.by_id.insert(record.id.clone(), record);
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.by_id.remove(id) {
            Some(old) => {
                self.by_recency.remove(&(old.updated_at, old.id));
                true
            }
            None => false,
        }
    }
}

pub struct InMemoryRecordStore {
    inner: RwLock<Inner>,
    capacity: Option<usize>,
    closed: AtomicBool,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Store that rejects writes growing it past `capacity` records.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reopen after a close (the data survives, like a file on disk).
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_many(&self, ids: &[String]) -> Result<Vec<Record>, StorageError> {
        self.check_open()?;
        let inner = self.inner.read();
        Ok(ids.iter().filter_map(|id| inner.by_id.get(id).cloned()).collect())
    }

    async fn put_many(&self, records: &[Record], mode: WriteMode) -> Result<usize, StorageError> {
        self.check_open()?;
        let mut inner = self.inner.write();

        let mut accepted: HashMap<&str, &Record> = HashMap::new();
        for record in records {
            let current = accepted
                .get(record.id.as_str())
                .copied()
                .or_else(|| inner.by_id.get(&record.id));
            let write = match (mode, current) {
                (_, None) | (WriteMode::Overwrite, Some(_)) => true,
                (WriteMode::IfNewer, Some(existing)) => record.updated_at > existing.updated_at,
                (WriteMode::IfAbsent, Some(_)) => false,
            };
            if write {
                accepted.insert(record.id.as_str(), record);
            }
        }

        if let Some(capacity) = self.capacity {
            let new_ids = accepted.keys().filter(|id| !inner.by_id.contains_key(**id)).count();
            if inner.by_id.len() + new_ids > capacity {
                return Err(StorageError::QuotaExceeded(format!(
                    "{} records + {} new exceeds capacity {}",
                    inner.by_id.len(),
                    new_ids,
                    capacity
                )));
            }
        }

        let written = accepted.len();
        for record in accepted.into_values() {
            inner.insert(record.clone());
        }
        Ok(written)
    }

    async fn delete_many(&self, ids: &[String]) -> Result<usize, StorageError> {
        self.check_open()?;
        let mut inner = self.inner.write();
        Ok(ids.iter().filter(|id| inner.remove(id)).count())
    }

    async fn delete_oldest(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        self.check_open()?;
        let mut inner = self.inner.write();
        let victims: Vec<String> = inner
            .by_recency
            .iter()
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect();
        for id in &victims {
            inner.remove(id);
        }
        Ok(victims)
    }

    async fn page(&self, query: &PageQuery) -> Result<Vec<Record>, StorageError> {
        self.check_open()?;
        let inner = self.inner.read();
        let range: Box<dyn DoubleEndedIterator<Item = &(i64, String)>> = match &query.after {
            Some(after) => Box::new(
                inner
                    .by_recency
                    .range(..(after.updated_at, after.id.clone())),
            ),
            None => Box::new(inner.by_recency.iter()),
        };
        Ok(range
            .rev()
            .filter_map(|(_, id)| inner.by_id.get(id))
            .filter(|r| query.state.map_or(true, |s| r.state == s))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        self.check_open()?;
        let inner = self.inner.read();
        let mut stats = StoreStats {
            total: inner.by_id.len() as u64,
            ..StoreStats::default()
        };
        for record in inner.by_id.values() {
            match record.state {
                VisibilityState::Hidden => stats.hidden += 1,
                VisibilityState::Dimmed => stats.dimmed += 1,
                VisibilityState::Normal => {}
            }
        }
        Ok(stats)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.check_open()?;
        *self.inner.write() = Inner::default();
        Ok(())
    }

    async fn close(&self) {
        self.close_now();
    }

    fn close_now(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Factory handing out one shared in-memory store; `destroy` swaps in an empty one.
pub struct MemoryStoreFactory {
    capacity: Option<usize>,
    current: Mutex<Arc<InMemoryRecordStore>>,
}

impl MemoryStoreFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::from_store(Arc::new(InMemoryRecordStore::new()))
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_store(Arc::new(InMemoryRecordStore::with_capacity(capacity)))
    }

    #[must_use]
    pub fn from_store(store: Arc<InMemoryRecordStore>) -> Self {
        Self {
            capacity: store.capacity,
            current: Mutex::new(store),
        }
    }

    /// The store the next `open` returns.
    #[must_use]
    pub fn store(&self) -> Arc<InMemoryRecordStore> {
        self.current.lock().clone()
    }
}

impl Default for MemoryStoreFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    async fn open(&self) -> Result<Arc<dyn RecordStore>, StorageError> {
        let store = self.store();
        store.reopen();
        Ok(store)
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        let fresh = match self.capacity {
            Some(capacity) => InMemoryRecordStore::with_capacity(capacity),
            None => InMemoryRecordStore::new(),
        };
        *self.current.lock() = Arc::new(fresh);
        Ok(())
    }

    fn describe(&self) -> String {
        match self.capacity {
            Some(capacity) => format!("memory(capacity={})", capacity),
            None => "memory".to_string(),
        }
    }
}
