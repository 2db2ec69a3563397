// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Coalescing write batcher.
//!
//! [`PendingBatch`] keeps the most recent item per id and reports when a
//! threshold is hit: pending count, or idle time since the last enqueue.
//! [`WriteBatcher`] wraps it for concurrent use and serializes flushes.
//!
//! # Example
//!
//! ```
//! use visibility_store::batching::{BatchConfig, BatchableItem, FlushReason, PendingBatch};
//!
//! #[derive(Clone)]
//! struct Item { id: String, n: u32 }
//! impl BatchableItem for Item {
//!     fn id(&self) -> &str { &self.id }
//! }
//!
//! let mut batch = PendingBatch::new(BatchConfig { max_items: 2, idle_ms: 100 });
//! assert!(batch.add(Item { id: "a".into(), n: 1 }).is_none());
//! // Same id coalesces
//! assert!(batch.add(Item { id: "a".into(), n: 2 }).is_none());
//! assert_eq!(batch.len(), 1);
//! assert_eq!(batch.add(Item { id: "b".into(), n: 1 }), Some(FlushReason::Count));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::VisibilityConfig;
use crate::metrics;
use crate::storage::traits::StorageError;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Pending count reached the maximum
    Count,
    /// No enqueue for the idle delay
    Idle,
    /// Manual flush requested
    Manual,
    /// Shutdown flush
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Idle => "idle",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Flush once this many distinct ids are pending
    pub max_items: usize,
    /// Flush once this long has passed since the last enqueue
    pub idle_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items: 50,
            idle_ms: 100,
        }
    }
}

impl From<&VisibilityConfig> for BatchConfig {
    fn from(config: &VisibilityConfig) -> Self {
        Self {
            max_items: config.batch_max_items.max(1),
            idle_ms: config.batch_idle_ms,
        }
    }
}

/// Items that coalesce by id.
pub trait BatchableItem {
    fn id(&self) -> &str;
}

/// A batch taken for flushing
#[derive(Debug)]
pub struct FlushBatch<T> {
    pub items: Vec<T>,
    pub reason: FlushReason,
}

/// Pending items, one per id, last writer wins.
#[derive(Debug)]
pub struct PendingBatch<T> {
    config: BatchConfig,
    items: HashMap<String, T>,
    last_enqueue: Instant,
}

impl<T: BatchableItem> PendingBatch<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            items: HashMap::new(),
            last_enqueue: Instant::now(),
        }
    }

    /// Add an item, replacing any pending item with the same id.
    /// Returns the flush reason if the count threshold is hit.
    pub fn add(&mut self, item: T) -> Option<FlushReason> {
        self.items.insert(item.id().to_string(), item);
        self.last_enqueue = Instant::now();
        (self.items.len() >= self.config.max_items).then_some(FlushReason::Count)
    }

    /// Put back items from a failed flush. Ids re-enqueued since are newer and win.
    pub fn restore(&mut self, items: Vec<T>) {
        for item in items {
            if !self.items.contains_key(item.id()) {
                self.items.insert(item.id().to_string(), item);
            }
        }
    }

    #[must_use]
    pub fn should_flush_idle(&self) -> bool {
        !self.items.is_empty() && self.last_enqueue.elapsed() >= Duration::from_millis(self.config.idle_ms)
    }

    /// Take the batch if any threshold is ready
    pub fn take_if_ready(&mut self) -> Option<FlushBatch<T>> {
        let reason = if self.items.len() >= self.config.max_items {
            FlushReason::Count
        } else if self.should_flush_idle() {
            FlushReason::Idle
        } else {
            return None;
        };
        self.force_flush_with_reason(reason)
    }

    pub fn force_flush_with_reason(&mut self, reason: FlushReason) -> Option<FlushBatch<T>> {
        if self.items.is_empty() {
            return None;
        }
        let items: Vec<T> = self.items.drain().map(|(_, item)| item).collect();
        Some(FlushBatch { items, reason })
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.get(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Shared batcher with serialized flushes.
///
/// A flush triggered while another is running waits for it, then takes
/// whatever is pending at that point. Items enqueued during a flush are
/// never part of it and never lost.
pub struct WriteBatcher<T> {
    pending: Mutex<PendingBatch<T>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl<T: BatchableItem + Clone> WriteBatcher<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            pending: Mutex::new(PendingBatch::new(config)),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Queue an item. Returns `Some(Count)` when the caller should flush now.
    pub fn enqueue(&self, item: T) -> Option<FlushReason> {
        let mut pending = self.pending.lock();
        let reason = pending.add(item);
        metrics::set_batch_queue_items(pending.len());
        reason
    }

    /// Pending item for `id`, for read-your-writes.
    #[must_use]
    pub fn pending(&self, id: &str) -> Option<T> {
        self.pending.lock().get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    #[must_use]
    pub fn should_flush_idle(&self) -> bool {
        self.pending.lock().should_flush_idle()
    }

    /// Drop everything pending.
    pub fn discard(&self) -> usize {
        let mut pending = self.pending.lock();
        let dropped = pending.len();
        pending.force_flush_with_reason(FlushReason::Manual);
        metrics::set_batch_queue_items(0);
        dropped
    }

    /// Flush pending items through `write`.
    ///
    /// On failure the items go back into the pending set unless a newer item
    /// for the same id arrived meanwhile.
    pub async fn flush<F, Fut>(&self, reason: FlushReason, write: F) -> Result<usize, StorageError>
    where
        F: FnOnce(Vec<T>) -> Fut,
        Fut: Future<Output = Result<(), StorageError>>,
    {
        let _flushing = self.flush_lock.lock().await;
        let batch = {
            let mut pending = self.pending.lock();
            let batch = pending.force_flush_with_reason(reason);
            metrics::set_batch_queue_items(pending.len());
            batch
        };
        let Some(batch) = batch else {
            return Ok(0);
        };

        let count = batch.items.len();
        debug!(count, reason = reason.as_str(), "Flushing write batch");
        match write(batch.items.clone()).await {
            Ok(()) => {
                metrics::record_batch_flush(reason.as_str(), count);
                Ok(count)
            }
            Err(e) => {
                warn!(count, error = %e, "Batch flush failed, items requeued");
                let mut pending = self.pending.lock();
                pending.restore(batch.items);
                metrics::set_batch_queue_items(pending.len());
                Err(e)
            }
        }
    }
}
