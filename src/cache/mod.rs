// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read Cache
//!
//! Process-local LRU/TTL cache of store lookups. One map entry per id holds
//! the value (or a tombstone), its freshness timestamp and its insert time;
//! the LRU list inside [`lru::LruCache`] is the access order, so eviction and
//! expiry always remove all three together.
//!
//! # Write paths
//!
//! ```text
//! local mutation ──► set()            always wins
//! store fetch    ──► merge_fetched()  applies only if strictly fresher,
//!                                     otherwise just refreshes recency
//! ```
//!
//! The cache is fully rebuildable: anything suspicious can simply be cleared.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::metrics;
use crate::record::Record;

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Cached record
    Value(Record),
    /// Confirmed absent from the store (tombstone)
    Absent,
    /// Not cached; consult the store
    Unknown,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Option<Record>,
    freshness: i64,
    inserted_at: Instant,
}

impl Entry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub tombstone_hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Result of [`ReadCache::validate_consistency`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Entries past their TTL that have not been touched since
    pub expired: Vec<String>,
    /// Entries whose cached record carries a different id than its key
    pub mismatched: Vec<String>,
    /// Entry count above configured capacity
    pub over_capacity: usize,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.expired.is_empty() && self.mismatched.is_empty() && self.over_capacity == 0
    }
}

pub struct ReadCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
    hits: AtomicU64,
    tombstone_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ReadCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            tombstone_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up an id, promoting it in LRU order. Expired entries are dropped.
    pub fn get(&self, id: &str) -> Lookup {
        let mut entries = self.entries.lock();
        let expired = match entries.get(id) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_lookup("miss");
                return Lookup::Unknown;
            }
            Some(entry) if entry.is_expired(self.ttl) => true,
            Some(entry) => {
                return match &entry.value {
                    Some(record) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        metrics::record_cache_lookup("hit");
                        Lookup::Value(record.clone())
                    }
                    None => {
                        self.tombstone_hits.fetch_add(1, Ordering::Relaxed);
                        metrics::record_cache_lookup("tombstone");
                        Lookup::Absent
                    }
                };
            }
        };
        if expired {
            entries.pop(id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_eviction("ttl", 1);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_lookup("miss");
        Lookup::Unknown
    }

    /// Unconditional write for locally authored mutations. `None` stores a tombstone.
    pub fn set(&self, id: &str, value: Option<Record>, freshness: i64) {
        let mut entries = self.entries.lock();
        self.insert(&mut entries, id, value, freshness);
    }

    /// Conditional write for values fetched from the store.
    ///
    /// Applies only when `freshness` is strictly newer than the cached entry;
    /// otherwise only promotes the entry. Returns whether the value was applied.
    pub fn merge_fetched(&self, id: &str, value: Option<Record>, freshness: i64) -> bool {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(id) {
            if !entry.is_expired(self.ttl) && freshness <= entry.freshness {
                return false;
            }
        }
        self.insert(&mut entries, id, value, freshness);
        true
    }

    fn insert(&self, entries: &mut LruCache<String, Entry>, id: &str, value: Option<Record>, freshness: i64) {
        let entry = Entry {
            value,
            freshness,
            inserted_at: Instant::now(),
        };
        if let Some((evicted, _)) = entries.push(id.to_string(), entry) {
            // push returns the old value on key replacement too
            if evicted != id {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_eviction("lru", 1);
            }
        }
        metrics::set_cache_entries(entries.len());
    }

    /// Forget ids so the next read goes to the store.
    pub fn invalidate(&self, ids: &[String]) {
        let mut entries = self.entries.lock();
        for id in ids {
            entries.pop(id.as_str());
        }
        metrics::set_cache_entries(entries.len());
    }

    /// Record confirmed deletions as tombstones.
    pub fn set_absent(&self, ids: &[String], freshness: i64) {
        let mut entries = self.entries.lock();
        for id in ids {
            self.insert(&mut entries, id, None, freshness);
        }
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        let dropped = entries.len();
        entries.clear();
        metrics::set_cache_entries(0);
        debug!(dropped, "Read cache cleared");
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            entries: entries.len(),
            capacity: entries.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            tombstone_hits: self.tombstone_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Scan for stale or mismatched entries without changing LRU order.
    #[must_use]
    pub fn validate_consistency(&self) -> ConsistencyReport {
        let entries = self.entries.lock();
        let mut report = ConsistencyReport {
            over_capacity: entries.len().saturating_sub(entries.cap().get()),
            ..Default::default()
        };
        for (key, entry) in entries.iter() {
            if entry.is_expired(self.ttl) {
                report.expired.push(key.clone());
            }
            if let Some(record) = &entry.value {
                if &record.id != key {
                    report.mismatched.push(key.clone());
                }
            }
        }
        report
    }

    /// Drop everything [`validate_consistency`](Self::validate_consistency) flags.
    /// Returns the number of entries removed.
    pub fn repair_consistency(&self) -> usize {
        let report = self.validate_consistency();
        if report.is_consistent() {
            return 0;
        }
        let mut entries = self.entries.lock();
        let mut removed = 0;
        for key in report.expired.iter().chain(report.mismatched.iter()) {
            if entries.pop(key.as_str()).is_some() {
                removed += 1;
            }
        }
        while entries.len() > entries.cap().get() {
            if entries.pop_lru().is_none() {
                break;
            }
            removed += 1;
        }
        if !report.mismatched.is_empty() {
            warn!(mismatched = report.mismatched.len(), "Repaired mismatched cache entries");
        }
        metrics::set_cache_entries(entries.len());
        removed
    }
}
