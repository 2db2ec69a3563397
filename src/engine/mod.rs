// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Visibility store engine.
//!
//! The [`VisibilityStore`] owns every component and exposes the service
//! operations:
//!
//! ```text
//! get_many ──► write batcher (pending) ──► read cache ──► store gateway
//!                                                            │
//! set_state / import ──► fallback pressure gate ──► gateway ─┴─QuotaExceeded─► overflow manager
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! open: validate config → gateway → sidecar → overflow (replay) → migration → journal replay → ready
//! close: flush batcher → gateway drain + close → sidecar close
//! ```
//!
//! # Example
//!
//! ```rust
//! use visibility_store::{VisibilityConfig, VisibilityState, VisibilityStore, SetOutcome};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = VisibilityStore::open(VisibilityConfig::default()).await.unwrap();
//!
//! let outcome = store.set_state("item-1", VisibilityState::Hidden, "A title").await.unwrap();
//! assert!(matches!(outcome, SetOutcome::Stored { .. }));
//!
//! let found = store.get_many(&["item-1".to_string()]).await.unwrap();
//! assert_eq!(found["item-1"].state, VisibilityState::Hidden);
//!
//! store.close().await;
//! # }
//! ```

mod api;
mod lifecycle;
mod request;
mod types;

pub use request::{Request, Response};
pub use types::{
    ConflictStrategy, HealthSnapshot, ImportIssue, ImportReport, OpenOptions, Page, SetOutcome, StoreStatsReport,
};

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::batching::WriteBatcher;
use crate::cache::ReadCache;
use crate::config::VisibilityConfig;
use crate::gateway::StoreGateway;
use crate::migration::MigrationEngine;
use crate::overflow::OverflowManager;
use crate::record::Record;
use crate::storage::sidecar::Sidecar;

/// Writes between capacity-ceiling checks on the single-record path.
pub(crate) const PRUNE_CHECK_INTERVAL: u64 = 100;

/// The visibility store.
///
/// `Send + Sync`; share it behind an `Arc`. Every piece of state that must
/// survive a process suspension lives in the record store or the sidecar.
pub struct VisibilityStore {
    pub(super) config: VisibilityConfig,
    pub(super) gateway: Arc<StoreGateway>,
    pub(super) cache: Arc<ReadCache>,
    pub(super) overflow: Arc<OverflowManager>,
    pub(super) sidecar: Arc<Sidecar>,
    /// Present when `batch_writes` is enabled
    pub(super) batcher: Option<WriteBatcher<Record>>,
    /// Present when legacy sources were supplied
    pub(super) migration: Option<MigrationEngine>,
    pub(super) writes_since_prune_check: AtomicU64,
}

impl VisibilityStore {
    #[must_use]
    pub fn config(&self) -> &VisibilityConfig {
        &self.config
    }

    #[must_use]
    pub fn gateway(&self) -> &Arc<StoreGateway> {
        &self.gateway
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ReadCache> {
        &self.cache
    }

    #[must_use]
    pub fn overflow(&self) -> &Arc<OverflowManager> {
        &self.overflow
    }

    /// Point-in-time health snapshot.
    pub async fn health(&self) -> HealthSnapshot {
        let overflow = self.overflow.status();
        let migration = match &self.migration {
            Some(engine) => engine.state().await.ok(),
            None => None,
        };
        HealthSnapshot {
            gateway: self.gateway.state(),
            in_flight: self.gateway.in_flight(),
            resets: self.gateway.reset_count(),
            cache_entries: self.cache.len(),
            fallback_pending: overflow.pending,
            fallback_max: overflow.max,
            fallback_tier: overflow.tier,
            recovering: overflow.recovering,
            batch_pending: self.batcher.as_ref().map_or(0, WriteBatcher::len),
            migration,
            accepting_writes: self.overflow.current_tier().should_accept_writes(),
        }
    }
}
