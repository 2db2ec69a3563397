// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{Record, VisibilityState};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Transient storage failure: {0}")]
    Transient(String),
    #[error("Operation '{operation}' timed out after {budget_ms}ms")]
    Timeout { operation: String, budget_ms: u64 },
    #[error("Storage capacity exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Storage corruption detected: {0}")]
    Corruption(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Permanent storage failure: {0}")]
    Permanent(String),
    #[error("Too many operations in flight ({in_flight}/{max})")]
    Overloaded { in_flight: usize, max: usize },
    #[error("Store is shutting down")]
    ShuttingDown,
    #[error("Store is closed")]
    Closed,
    #[error("Fallback area full: {pending} entries (max {max})")]
    FallbackFull { pending: u64, max: u64 },
}

/// Failure classification driving retry and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry locally, bounded attempts
    Transient,
    /// Retry with an escalated budget
    Timeout,
    /// Routed into the overflow protocol, never surfaced raw
    QuotaExceeded,
    /// Triggers a store reset, then surfaces as failed
    Corruption,
    /// Rejected immediately, never retried
    Permanent,
}

impl StorageError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::QuotaExceeded(_) => ErrorClass::QuotaExceeded,
            Self::Corruption(_) => ErrorClass::Corruption,
            Self::Validation(_)
            | Self::Permanent(_)
            | Self::Overloaded { .. }
            | Self::ShuttingDown
            | Self::Closed
            | Self::FallbackFull { .. } => ErrorClass::Permanent,
        }
    }

    /// Whether the retry loop may attempt the operation again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Timeout)
    }

    #[must_use]
    pub fn is_quota(&self) -> bool {
        self.class() == ErrorClass::QuotaExceeded
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Timeout { .. } => "timeout",
            Self::QuotaExceeded(_) => "quota",
            Self::Corruption(_) => "corruption",
            Self::Validation(_) => "validation",
            Self::Permanent(_) => "permanent",
            Self::Overloaded { .. } => "overloaded",
            Self::ShuttingDown => "shutting_down",
            Self::Closed => "closed",
            Self::FallbackFull { .. } => "fallback_full",
        }
    }
}

/// Conflict handling for multi-record writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Last writer wins unconditionally
    Overwrite,
    /// Only replace an existing record with a strictly newer `updated_at`
    IfNewer,
    /// Never touch an existing record
    IfAbsent,
}

/// Sort key of the recency orderings: `(updated_at DESC, id DESC)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub updated_at: i64,
    pub id: String,
}

impl SortKey {
    #[must_use]
    pub fn of(record: &Record) -> Self {
        Self {
            updated_at: record.updated_at,
            id: record.id.clone(),
        }
    }

    /// Whether `record` sorts strictly after this key in recency order.
    #[must_use]
    pub fn precedes(&self, record: &Record) -> bool {
        record.updated_at < self.updated_at
            || (record.updated_at == self.updated_at && record.id < self.id)
    }
}

/// A recency-ordered range read.
#[derive(Debug, Clone)]
pub struct PageQuery {
    pub state: Option<VisibilityState>,
    pub after: Option<SortKey>,
    pub limit: usize,
}

/// Per-state record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total: u64,
    pub hidden: u64,
    pub dimmed: u64,
}

/// The durable keyed store. Every method is one transactional unit.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_many(&self, ids: &[String]) -> Result<Vec<Record>, StorageError>;

    /// Returns the number of records actually written.
    async fn put_many(&self, records: &[Record], mode: WriteMode) -> Result<usize, StorageError>;

    async fn delete_many(&self, ids: &[String]) -> Result<usize, StorageError>;

    /// Delete up to `limit` records with the oldest `updated_at`; returns their ids.
    async fn delete_oldest(&self, limit: usize) -> Result<Vec<String>, StorageError>;

    async fn page(&self, query: &PageQuery) -> Result<Vec<Record>, StorageError>;

    async fn stats(&self) -> Result<StoreStats, StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;

    async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.stats().await?.total)
    }

    /// Graceful close.
    async fn close(&self);

    /// Close without suspending. Must be safe to call while operations are in flight.
    fn close_now(&self);
}

/// Opens, and when corrupted destroys, the underlying durable store.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn RecordStore>, StorageError>;

    /// Remove all durable state so the next `open` starts empty.
    async fn destroy(&self) -> Result<(), StorageError>;

    fn describe(&self) -> String;
}
