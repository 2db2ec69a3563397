// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Visibility Store
//!
//! Durable per-item visibility state (hidden / dimmed / normal) for a host
//! that can suspend or kill the process at any instant.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   VisibilityStore (engine)                  │
//! │  • get_many / set_state / get_page / stats / clear          │
//! │  • export / import with conflict strategies                 │
//! │  • optional write batching (count or idle flush)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Read cache (LRU + tombstones)              │
//! │  • freshness-guarded so stale fetches never win             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Store gateway                         │
//! │  • admission limit, timeouts, classified retries            │
//! │  • corruption → drain, recreate, reopen                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ QuotaExceeded
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Overflow manager                        │
//! │  • fallback queue in the sidecar, queued before cleanup     │
//! │  • sized oldest-first cleanup, tiered pressure actions      │
//! │  • throttled notifications, quota event log                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A resumable [`migration`] imports legacy id→value maps on open.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use visibility_store::{VisibilityConfig, VisibilityState, VisibilityStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = VisibilityConfig {
//!         store_path: Some("visibility.db".into()),
//!         sidecar_path: Some("visibility-sidecar.db".into()),
//!         ..Default::default()
//!     };
//!     let store = VisibilityStore::open(config).await.expect("Failed to open");
//!
//!     store.set_state("item-42", VisibilityState::Dimmed, "Some title").await.expect("write");
//!     let page = store.get_page(Some(VisibilityState::Dimmed), None, 20).await.expect("page");
//!     println!("{} dimmed items", page.items.len());
//!
//!     store.close().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: The [`VisibilityStore`] façade and its message surface
//! - [`storage`]: Record store backends (SQLite, memory) and the sidecar
//! - [`gateway`]: Connection lifecycle, admission, timeouts, corruption reset
//! - [`cache`]: Bounded read cache
//! - [`overflow`]: Capacity recovery, fallback queue, pressure tiers
//! - [`migration`]: Legacy import
//! - [`batching`]: Write batcher
//! - [`resilience`]: Retry and timeout policies

pub mod batching;
pub mod cache;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod metrics;
pub mod migration;
pub mod overflow;
pub mod record;
pub mod resilience;
pub mod storage;

pub use config::VisibilityConfig;
pub use engine::{
    ConflictStrategy, HealthSnapshot, ImportIssue, ImportReport, OpenOptions, Page, Request, Response, SetOutcome,
    StoreStatsReport, VisibilityStore,
};
pub use gateway::{AccessMode, GatewayState, StoreGateway};
pub use overflow::{FallbackTier, NotificationPriority, NotificationSink, OverflowManager, QuotaRecoveryResult};
pub use record::{ExportDump, Record, VisibilityState};
pub use resilience::retry::{RetryConfig, TimeoutSchedule};
pub use storage::traits::{RecordStore, StorageError, StoreFactory, WriteMode};
pub use metrics::LatencyTimer;
