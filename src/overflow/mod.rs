// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Overflow Manager: turns a capacity-exceeded write into a no-data-loss
//! recovery protocol.
//!
//! # Recovery sequence
//!
//! ```text
//! put_many ──QuotaExceeded──► handle_quota_failure
//!                                 │
//!                                 ├─ 1. queue payload in fallback (before any cleanup)
//!                                 ├─ 2. delete N oldest records (N sized from payload)
//!                                 ├─ 3. retry write; on quota grow N ×factor, capped
//!                                 │     per round and by a total budget
//!                                 └─ 4. success → unqueue payload
//!                                       failure → payload stays queued for replay
//! ```
//!
//! Fallback utilization then drives the tier actions in [`FallbackTier`].
//! Only one recovery or tier action runs at a time; a recovery triggered from
//! inside another (same task) only queues its payload.

pub mod cleanup;
pub mod fallback;
pub mod notify;
pub mod pressure;
pub mod quota_log;

pub use cleanup::CleanupPlanner;
pub use fallback::{FallbackQueue, FallbackStats, ReplayOutcome};
pub use notify::{
    LogSink, NotificationPriority, NotificationSink, NotificationThrottle, Notifier, RecordingSink,
    ThrottlePolicy,
};
pub use pressure::{FallbackTier, TierThresholds};
pub use quota_log::{QuotaEvent, QuotaEventKind, QuotaEventLog};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::VisibilityConfig;
use crate::gateway::{AccessMode, StoreGateway};
use crate::metrics;
use crate::record::{ExportDump, Record};
use crate::storage::sidecar::Sidecar;
use crate::storage::traits::{StorageError, WriteMode};

tokio::task_local! {
    /// Set while a recovery sequence runs on the current task.
    static IN_RECOVERY: ();
}

fn in_recovery() -> bool {
    IN_RECOVERY.try_with(|_| ()).is_ok()
}

/// What the caller should do after a failed recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Payload is queued; it will be replayed once space frees up
    Retry,
    /// Cleanup budget exhausted; the user has to free space
    ManualCleanup,
    /// Something other than capacity is wrong
    SystemError,
}

/// Structured outcome of [`OverflowManager::handle_quota_failure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaRecoveryResult {
    pub success: bool,
    /// Records deleted from the primary store by cleanup
    pub deleted: usize,
    /// Whether the payload is (still) preserved in the fallback area
    pub in_fallback: bool,
    /// Write attempts made after cleanup
    pub attempts: usize,
    /// `None` on success
    pub recommendation: Option<Recommendation>,
}

/// Overflow state for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverflowStatus {
    pub tier: u8,
    pub pending: u64,
    pub max: u64,
    pub recovering: bool,
}

#[derive(Debug)]
struct TierState {
    acted: FallbackTier,
    export_offered: bool,
}

/// RAII guard to reset the recovering flag.
struct RecoveringGuard<'a>(&'a AtomicBool);

impl Drop for RecoveringGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OverflowManager {
    gateway: Arc<StoreGateway>,
    fallback: FallbackQueue,
    quota_log: QuotaEventLog,
    notifier: Notifier,
    planner: CleanupPlanner,
    thresholds: TierThresholds,
    quota_max_retries: usize,
    aggressive_cleanup: usize,
    replay_batch: usize,
    /// One recovery/tier-action sequence at a time
    sequence: Mutex<()>,
    recovering: AtomicBool,
    tier_state: SyncMutex<TierState>,
}

impl OverflowManager {
    pub async fn open(
        gateway: Arc<StoreGateway>,
        sidecar: Arc<Sidecar>,
        sink: Arc<dyn NotificationSink>,
        config: &VisibilityConfig,
    ) -> Result<Self, StorageError> {
        let fallback = FallbackQueue::open(sidecar.clone(), config.fallback_max_entries).await?;
        let thresholds = TierThresholds::from(config);
        let tier = FallbackTier::from_depth(fallback.len(), fallback.max_entries(), &thresholds);
        metrics::set_fallback_tier(tier as u8);
        Ok(Self {
            gateway,
            fallback,
            quota_log: QuotaEventLog::new(sidecar, config.quota_log_cap),
            notifier: Notifier::new(sink, ThrottlePolicy::from(config)),
            planner: CleanupPlanner::from(config),
            thresholds,
            quota_max_retries: config.quota_max_retries,
            aggressive_cleanup: config.aggressive_cleanup_records,
            replay_batch: config.fallback_replay_batch,
            sequence: Mutex::new(()),
            recovering: AtomicBool::new(false),
            // Tier actions are not replayed for state found at open.
            tier_state: SyncMutex::new(TierState {
                acted: tier,
                export_offered: false,
            }),
        })
    }

    #[must_use]
    pub fn fallback(&self) -> &FallbackQueue {
        &self.fallback
    }

    #[must_use]
    pub fn quota_log(&self) -> &QuotaEventLog {
        &self.quota_log
    }

    #[must_use]
    pub fn current_tier(&self) -> FallbackTier {
        FallbackTier::from_depth(self.fallback.len(), self.fallback.max_entries(), &self.thresholds)
    }

    #[must_use]
    pub fn status(&self) -> OverflowStatus {
        OverflowStatus {
            tier: self.current_tier() as u8,
            pending: self.fallback.len(),
            max: self.fallback.max_entries(),
            recovering: self.recovering.load(Ordering::Acquire),
        }
    }

    /// Run the recovery protocol for a write that failed with QuotaExceeded.
    pub async fn handle_quota_failure(&self, records: &[Record], mode: WriteMode) -> QuotaRecoveryResult {
        if in_recovery() {
            // Nested trigger: preserve the payload, never start a second cleanup.
            let in_fallback = self.fallback.push(records).await.is_ok();
            warn!(records = records.len(), in_fallback, "Nested quota failure, payload queued without cleanup");
            return QuotaRecoveryResult {
                success: false,
                deleted: 0,
                in_fallback,
                attempts: 0,
                recommendation: Some(Recommendation::Retry),
            };
        }

        let result = IN_RECOVERY.scope((), self.recover(records, mode)).await;
        self.evaluate_pressure().await;
        result
    }

    async fn recover(&self, records: &[Record], mode: WriteMode) -> QuotaRecoveryResult {
        let _sequence = self.sequence.lock().await;
        self.recovering.store(true, Ordering::Release);
        let _recovering = RecoveringGuard(&self.recovering);

        let payload_bytes: usize = records.iter().map(Record::estimated_bytes).sum();
        warn!(records = records.len(), payload_bytes, "Store capacity exceeded, starting recovery");
        self.quota_log
            .record(QuotaEventKind::QuotaExceeded, json!({ "records": records.len(), "bytes": payload_bytes }))
            .await;

        // 1. Data safety before space reclamation
        let (seqs, in_fallback) = match self.fallback.push(records).await {
            Ok(seqs) => {
                self.quota_log
                    .record(QuotaEventKind::FallbackQueued, json!({ "records": seqs.len() }))
                    .await;
                (seqs, true)
            }
            Err(e) => {
                error!(error = %e, records = records.len(), "Fallback area cannot take payload");
                self.quota_log
                    .record(QuotaEventKind::FallbackRejected, json!({ "records": records.len(), "error": e.to_string() }))
                    .await;
                self.notifier.notify(
                    NotificationPriority::Emergency,
                    "Storage is full and the backup area is full. Recent changes cannot be saved.",
                );
                (Vec::new(), false)
            }
        };

        // 2-3. Cleanup and bounded retries
        let mut deleted = 0usize;
        let mut attempts = 0usize;
        let mut round = self.planner.initial(records);
        let mut success = false;
        let recommendation = loop {
            if attempts >= self.quota_max_retries {
                break if self.planner.remaining(deleted) == 0 {
                    Recommendation::ManualCleanup
                } else {
                    Recommendation::Retry
                };
            }
            let size = round.min(self.planner.remaining(deleted));
            if size == 0 {
                break Recommendation::ManualCleanup;
            }
            match self.gateway.delete_oldest(size).await {
                Ok(ids) if ids.is_empty() => {
                    error!("Store reports capacity exceeded while empty");
                    break Recommendation::SystemError;
                }
                Ok(ids) => {
                    deleted += ids.len();
                    metrics::record_cleanup_deleted("quota", ids.len());
                    info!(round = attempts + 1, deleted = ids.len(), total_deleted = deleted, "Quota cleanup round");
                }
                Err(e) => {
                    error!(error = %e, "Cleanup failed during quota recovery");
                    break Recommendation::SystemError;
                }
            }

            attempts += 1;
            let write = self
                .gateway
                .with_store(AccessMode::Write, "put_many", |store| async move {
                    store.put_many(records, mode).await
                })
                .await;
            match write {
                Ok(_) => {
                    success = true;
                    break Recommendation::Retry;
                }
                Err(e) if e.is_quota() => {
                    round = self.planner.next(round, deleted);
                }
                Err(e) => {
                    error!(error = %e, "Write failed after cleanup");
                    break Recommendation::SystemError;
                }
            }
        };

        if deleted > 0 {
            self.quota_log
                .record(QuotaEventKind::CleanupPerformed, json!({ "deleted": deleted, "attempts": attempts }))
                .await;
        }

        // 4. Structured result
        if success {
            let mut still_queued = in_fallback;
            if in_fallback {
                match self.fallback.remove_seqs(&seqs).await {
                    Ok(_) => still_queued = false,
                    Err(e) => warn!(error = %e, "Committed payload left in fallback; replay will drop it"),
                }
            }
            self.quota_log
                .record(QuotaEventKind::RecoverySucceeded, json!({ "deleted": deleted, "attempts": attempts }))
                .await;
            info!(deleted, attempts, "Quota recovery succeeded");
            QuotaRecoveryResult {
                success: true,
                deleted,
                in_fallback: still_queued,
                attempts,
                recommendation: None,
            }
        } else {
            self.quota_log
                .record(
                    QuotaEventKind::RecoveryFailed,
                    json!({ "deleted": deleted, "attempts": attempts, "in_fallback": in_fallback }),
                )
                .await;
            if in_fallback {
                self.notifier.notify(
                    NotificationPriority::Warning,
                    "Storage is full. Changes are kept safely and will be saved once space frees up.",
                );
            }
            warn!(deleted, attempts, in_fallback, recommendation = ?recommendation, "Quota recovery failed");
            QuotaRecoveryResult {
                success: false,
                deleted,
                in_fallback,
                attempts,
                recommendation: Some(recommendation),
            }
        }
    }

    /// Replay the fallback queue into the primary store.
    pub async fn replay_fallback(&self) -> Result<ReplayOutcome, StorageError> {
        let _sequence = self.sequence.lock().await;
        self.replay_locked().await
    }

    async fn replay_locked(&self) -> Result<ReplayOutcome, StorageError> {
        let outcome = self.fallback.replay_into(&self.gateway, self.replay_batch).await?;
        if outcome.drained > 0 {
            self.quota_log
                .record(
                    QuotaEventKind::FallbackReplayed,
                    json!({ "drained": outcome.drained, "remaining": outcome.remaining }),
                )
                .await;
        }
        Ok(outcome)
    }

    /// Re-evaluate fallback pressure and run the actions of a newly reached tier.
    ///
    /// Actions fire once per escalation, so calling this repeatedly is safe.
    /// Every evaluation at Warning or above attempts a replay.
    pub async fn evaluate_pressure(&self) -> FallbackTier {
        let _sequence = self.sequence.lock().await;
        let tier = self.current_tier();
        metrics::set_fallback_tier(tier as u8);

        let previous = {
            let mut state = self.tier_state.lock();
            let previous = state.acted;
            state.acted = tier;
            if tier == FallbackTier::Normal {
                state.export_offered = false;
            }
            previous
        };

        if tier != previous {
            info!(from = %previous, to = %tier, pending = self.fallback.len(), "Fallback tier changed");
            self.quota_log
                .record(
                    QuotaEventKind::TierChanged,
                    json!({ "from": previous as u8, "to": tier as u8, "pending": self.fallback.len() }),
                )
                .await;
        }

        if tier == FallbackTier::Normal {
            if previous > FallbackTier::Normal {
                self.notifier.reset();
            }
            return tier;
        }

        if tier > previous {
            // A jump past Warning or Critical still owes their cleanup rounds;
            // only the reached tier notifies.
            for skipped in FallbackTier::ALL
                .into_iter()
                .filter(|t| *t > previous && *t < tier && t.runs_cleanup())
            {
                debug!(tier = %skipped, "Running cleanup of skipped tier");
                self.aggressive_cleanup().await;
            }
            self.run_tier_actions(tier).await;
        }

        if let Err(e) = self.replay_locked().await {
            warn!(error = %e, "Fallback replay failed");
        }
        let after = self.current_tier();
        metrics::set_fallback_tier(after as u8);
        after
    }

    async fn run_tier_actions(&self, tier: FallbackTier) {
        let pending = self.fallback.len();
        let max = self.fallback.max_entries();
        match tier {
            FallbackTier::Normal => {}
            FallbackTier::Warning => {
                self.notifier.notify(
                    NotificationPriority::Warning,
                    &format!("Storage is nearly full ({} of {} pending changes). Cleaning up old entries.", pending, max),
                );
                self.aggressive_cleanup().await;
            }
            FallbackTier::Critical => {
                self.notifier.notify(
                    NotificationPriority::Critical,
                    &format!("Storage is full ({} of {} pending changes). New changes are paused.", pending, max),
                );
                self.aggressive_cleanup().await;
            }
            FallbackTier::Emergency | FallbackTier::Max => {
                self.notifier.notify(
                    NotificationPriority::Emergency,
                    &format!("Storage is critically full ({} of {} pending changes). Please export a backup.", pending, max),
                );
                self.offer_export_once().await;
            }
        }
    }

    async fn aggressive_cleanup(&self) {
        match self.gateway.delete_oldest(self.aggressive_cleanup).await {
            Ok(ids) => {
                metrics::record_cleanup_deleted("pressure", ids.len());
                if !ids.is_empty() {
                    self.quota_log
                        .record(QuotaEventKind::CleanupPerformed, json!({ "deleted": ids.len(), "reason": "pressure" }))
                        .await;
                }
            }
            Err(e) => warn!(error = %e, "Aggressive cleanup failed"),
        }
    }

    async fn offer_export_once(&self) {
        {
            let mut state = self.tier_state.lock();
            if state.export_offered {
                return;
            }
            state.export_offered = true;
        }
        match self.fallback.snapshot().await {
            Ok(records) => {
                let dump = ExportDump::new(records);
                self.notifier.offer_export(&dump);
                self.quota_log
                    .record(QuotaEventKind::ExportOffered, json!({ "records": dump.records.len() }))
                    .await;
            }
            Err(e) => {
                self.tier_state.lock().export_offered = false;
                error!(error = %e, "Failed to build emergency export");
            }
        }
    }

    /// Gate for caller writes. Critical and above first run tier actions;
    /// writes are refused while pressure stays at Critical or above.
    pub async fn admit_write(&self) -> Result<(), StorageError> {
        let tier = self.current_tier();
        if tier.should_accept_writes() {
            return Ok(());
        }
        let after = self.evaluate_pressure().await;
        if tier != FallbackTier::Max && after.should_accept_writes() {
            return Ok(());
        }
        metrics::record_rejected("fallback_pressure");
        Err(StorageError::FallbackFull {
            pending: self.fallback.len(),
            max: self.fallback.max_entries(),
        })
    }

    /// Drop queued entries for ids committed directly.
    pub async fn supersede(&self, ids: &[String]) -> Result<usize, StorageError> {
        self.fallback.remove_ids(ids).await
    }

    /// Queued records for `ids`, newest per id.
    pub async fn pending_for(&self, ids: &[String]) -> Result<std::collections::HashMap<String, Record>, StorageError> {
        self.fallback.lookup(ids).await
    }

    /// Empty the fallback area and reset tier state.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let _sequence = self.sequence.lock().await;
        self.fallback.clear().await?;
        *self.tier_state.lock() = TierState {
            acted: FallbackTier::Normal,
            export_offered: false,
        };
        self.notifier.reset();
        metrics::set_fallback_tier(0);
        Ok(())
    }
}
