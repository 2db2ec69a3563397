// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store Gateway: sole owner of the durable record store.
//!
//! Every store access goes through [`StoreGateway::with_store`], which:
//! 1. Admits the operation or rejects it (`Overloaded`, `ShuttingDown`, `Closed`).
//!    Admission is a synchronous counter bump with an RAII guard, so the
//!    count a forced close sees is exact.
//! 2. Runs it under a per-attempt timeout (progressive for scans), retrying
//!    Transient/Timeout failures with backoff.
//! 3. On Corruption, drains in-flight work (bounded), destroys and reopens the
//!    store, clears the read cache, then fails the triggering call.
//!
//! # State machine
//!
//! ```text
//! Created → Opening → Ready ⇄ Resetting
//!                       │
//!                       ├─ close()      → ShuttingDown → Closed
//!                       └─ close_now()  → Closed   (never suspends)
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::cache::ReadCache;
use crate::config::VisibilityConfig;
use crate::metrics::{self, LatencyTimer};
use crate::record::now_millis;
use crate::resilience::retry::{retry_classified, RetryConfig, TimeoutSchedule};
use crate::storage::traits::{ErrorClass, RecordStore, StorageError, StoreFactory, StoreStats};

/// Rows deleted per pruning round.
const PRUNE_CHUNK: usize = 5_000;

/// Gateway lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GatewayState {
    Created,
    Opening,
    Ready,
    /// Corruption recovery in progress
    Resetting,
    ShuttingDown,
    Closed,
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Opening => write!(f, "Opening"),
            Self::Ready => write!(f, "Ready"),
            Self::Resetting => write!(f, "Resetting"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Which timeout schedule an operation runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Point read: fixed budget
    Read,
    /// Point write: fixed budget
    Write,
    /// Cursor scan, bulk delete or stats: progressive budget
    Scan,
}

impl AccessMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Scan => "scan",
        }
    }
}

/// Gateway tunables, derived from [`VisibilityConfig`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_in_flight: usize,
    pub point_schedule: TimeoutSchedule,
    pub scan_schedule: TimeoutSchedule,
    pub retry: RetryConfig,
    pub reset_drain_timeout: Duration,
    pub shutdown_drain_timeout: Duration,
}

impl From<&VisibilityConfig> for GatewayConfig {
    fn from(config: &VisibilityConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight,
            point_schedule: TimeoutSchedule::fixed(Duration::from_millis(config.op_timeout_ms)),
            scan_schedule: TimeoutSchedule::progressive(&config.scan_timeouts_ms),
            retry: RetryConfig {
                initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
                max_delay: Duration::from_millis(config.retry_max_delay_ms),
                factor: 2.0,
                max_retries: Some(config.max_retries),
            },
            reset_drain_timeout: Duration::from_millis(config.reset_drain_timeout_ms),
            shutdown_drain_timeout: Duration::from_millis(config.shutdown_drain_timeout_ms),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&VisibilityConfig::default())
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let now = self.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::set_in_flight(now);
    }
}

pub struct StoreGateway {
    factory: Arc<dyn StoreFactory>,
    store: RwLock<Option<Arc<dyn RecordStore>>>,
    cache: Arc<ReadCache>,
    config: GatewayConfig,
    in_flight: Arc<AtomicUsize>,
    shutting_down: AtomicBool,
    closed: AtomicBool,
    /// Serializes resets and lazy reopens
    reset_lock: Mutex<()>,
    resets: AtomicU64,
    state: watch::Sender<GatewayState>,
}

impl StoreGateway {
    /// Open the store. A store that is corrupt at open is destroyed and recreated.
    pub async fn open(
        factory: Arc<dyn StoreFactory>,
        cache: Arc<ReadCache>,
        config: GatewayConfig,
    ) -> Result<Self, StorageError> {
        let (state, _rx) = watch::channel(GatewayState::Created);
        let gateway = Self {
            factory,
            store: RwLock::new(None),
            cache,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutting_down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reset_lock: Mutex::new(()),
            resets: AtomicU64::new(0),
            state,
        };

        gateway.set_state(GatewayState::Opening);
        info!(store = %gateway.factory.describe(), "Opening store gateway");
        let store = match gateway.factory.open().await {
            Ok(store) => store,
            Err(e) if e.class() == ErrorClass::Corruption => {
                error!(error = %e, "Store corrupt at open, recreating");
                gateway.factory.destroy().await?;
                let store = gateway.factory.open().await?;
                gateway.resets.fetch_add(1, Ordering::Relaxed);
                metrics::record_corruption_reset(true);
                store
            }
            Err(e) => return Err(e),
        };
        *gateway.store.write() = Some(store);
        gateway.set_state(GatewayState::Ready);
        Ok(gateway)
    }

    fn set_state(&self, state: GatewayState) {
        self.state.send_replace(state);
        metrics::set_gateway_state(&state.to_string());
    }

    #[must_use]
    pub fn state(&self) -> GatewayState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<GatewayState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Number of corruption resets since open.
    #[must_use]
    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ReadCache> {
        &self.cache
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn describe(&self) -> String {
        self.factory.describe()
    }

    /// Admit one operation. Increment happens before the shutdown check so a
    /// concurrent close either sees this operation or this operation sees the flag.
    pub fn admit(&self) -> Result<InFlightGuard, StorageError> {
        let prev = self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        };
        if self.closed.load(Ordering::Acquire) {
            metrics::record_rejected("closed");
            return Err(StorageError::Closed);
        }
        if self.shutting_down.load(Ordering::Acquire) {
            metrics::record_rejected("shutting_down");
            return Err(StorageError::ShuttingDown);
        }
        if prev >= self.config.max_in_flight {
            metrics::record_rejected("overloaded");
            return Err(StorageError::Overloaded {
                in_flight: prev,
                max: self.config.max_in_flight,
            });
        }
        metrics::set_in_flight(prev + 1);
        Ok(guard)
    }

    /// The current store, reopening lazily after a failed reset.
    async fn ensure_store(&self) -> Result<Arc<dyn RecordStore>, StorageError> {
        if let Some(store) = self.store.read().clone() {
            return Ok(store);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let _reset = self.reset_lock.lock().await;
        if let Some(store) = self.store.read().clone() {
            return Ok(store);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        warn!("Store handle missing, reopening");
        let store = self.factory.open().await?;
        *self.store.write() = Some(store.clone());
        self.set_state(GatewayState::Ready);
        Ok(store)
    }

    /// Run one transactional unit against the store.
    ///
    /// `op` may be invoked more than once (retries), each time with the current
    /// store handle. A timeout abandons the wait, not necessarily the work.
    pub async fn with_store<T, F, Fut>(&self, mode: AccessMode, name: &'static str, op: F) -> Result<T, StorageError>
    where
        F: Fn(Arc<dyn RecordStore>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let guard = self.admit()?;
        let _timer = LatencyTimer::new(name);
        let schedule = match mode {
            AccessMode::Scan => &self.config.scan_schedule,
            AccessMode::Read | AccessMode::Write => &self.config.point_schedule,
        };

        let result = retry_classified(name, &self.config.retry, schedule, || {
            let op = &op;
            async move {
                let store = self.ensure_store().await?;
                op(store).await
            }
        })
        .await;

        match &result {
            Ok(_) => metrics::record_operation(name, "success"),
            Err(e) => {
                metrics::record_operation(name, "error");
                metrics::record_error(name, e.kind());
                debug!(operation = name, mode = mode.as_str(), error = %e, "Store operation failed");
                if e.class() == ErrorClass::Corruption {
                    drop(guard);
                    self.recover_from_corruption(name).await;
                }
            }
        }
        result
    }

    /// Drain, destroy, reopen, clear cache. Concurrent triggers collapse into one reset.
    async fn recover_from_corruption(&self, trigger: &str) {
        let _reset = match self.reset_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // Another reset is running; wait for it instead of starting a second.
                let _ = self.reset_lock.lock().await;
                return;
            }
        };
        if self.closed.load(Ordering::Acquire) || self.shutting_down.load(Ordering::Acquire) {
            return;
        }

        error!(trigger, in_flight = self.in_flight(), "Store corruption detected, resetting");
        self.set_state(GatewayState::Resetting);

        if !self.wait_for_drain(self.config.reset_drain_timeout).await {
            warn!(in_flight = self.in_flight(), "Reset proceeding with operations still in flight");
        }

        let old = self.store.write().take();
        if let Some(store) = old {
            if tokio::time::timeout(self.config.reset_drain_timeout, store.close()).await.is_err() {
                warn!("Graceful close of corrupt store timed out, forcing");
                store.close_now();
            }
        }
        self.cache.clear();

        let reopened = match self.factory.destroy().await {
            Ok(()) => self.factory.open().await,
            Err(e) => Err(e),
        };
        match reopened {
            Ok(store) => {
                *self.store.write() = Some(store);
                self.resets.fetch_add(1, Ordering::Relaxed);
                metrics::record_corruption_reset(true);
                self.set_state(GatewayState::Ready);
                info!(store = %self.factory.describe(), "Store recreated after corruption");
            }
            Err(e) => {
                // Slot stays empty; the next operation retries the open.
                metrics::record_corruption_reset(false);
                error!(error = %e, "Failed to recreate store after corruption");
            }
        }
    }

    /// Poll until nothing is in flight or `timeout` elapses.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Graceful close: reject new work, wait for in-flight work, then close.
    pub async fn close(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.shutting_down.store(true, Ordering::Release);
        self.set_state(GatewayState::ShuttingDown);
        info!(in_flight = self.in_flight(), "Store gateway shutting down");

        if !self.wait_for_drain(self.config.shutdown_drain_timeout).await {
            warn!(in_flight = self.in_flight(), "Shutdown drain timed out, closing anyway");
        }
        self.closed.store(true, Ordering::Release);
        let store = self.store.write().take();
        if let Some(store) = store {
            store.close().await;
        }
        self.set_state(GatewayState::Closed);
        info!("Store gateway closed");
    }

    /// Forced close for hosts that may terminate at any instant.
    ///
    /// Never suspends. Operations still in flight may fail afterwards.
    pub fn close_now(&self) {
        self.shutting_down.store(true, Ordering::Release);
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let in_flight = self.in_flight();
        let store = self.store.write().take();
        if let Some(store) = store {
            store.close_now();
        }
        self.set_state(GatewayState::Closed);
        if in_flight > 0 {
            warn!(in_flight, "Store force-closed with operations in flight");
        } else {
            info!("Store force-closed");
        }
    }

    // ----- helpers shared by the overflow manager and the engine -----

    pub async fn count(&self) -> Result<u64, StorageError> {
        self.with_store(AccessMode::Scan, "count", |store| async move { store.count().await })
            .await
    }

    pub async fn stats(&self) -> Result<StoreStats, StorageError> {
        self.with_store(AccessMode::Scan, "stats", |store| async move { store.stats().await })
            .await
    }

    /// Delete the `limit` oldest records; the cache learns they are gone.
    pub async fn delete_oldest(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let deleted = self
            .with_store(AccessMode::Scan, "delete_oldest", |store| async move {
                store.delete_oldest(limit).await
            })
            .await?;
        self.cache.set_absent(&deleted, now_millis());
        Ok(deleted)
    }

    /// When the store holds more than `max_records`, delete oldest records down
    /// to `target`. Returns how many were deleted.
    pub async fn prune_if_over(&self, max_records: u64, target: u64) -> Result<usize, StorageError> {
        let total = self.count().await?;
        if total <= max_records {
            return Ok(0);
        }
        let mut excess = (total - target.min(total)) as usize;
        info!(total, max_records, target, excess, "Pruning store to capacity target");

        let mut deleted = 0usize;
        while excess > 0 {
            let chunk = excess.min(PRUNE_CHUNK);
            let removed = self.delete_oldest(chunk).await?.len();
            if removed == 0 {
                break;
            }
            deleted += removed;
            excess = excess.saturating_sub(removed);
            tokio::task::yield_now().await;
        }
        metrics::record_cleanup_deleted("prune", deleted);
        Ok(deleted)
    }
}
