// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: open, maintenance loop, close.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::batching::{BatchConfig, FlushReason, WriteBatcher};
use crate::cache::ReadCache;
use crate::config::VisibilityConfig;
use crate::gateway::{GatewayConfig, StoreGateway};
use crate::metrics;
use crate::migration::MigrationEngine;
use crate::overflow::{LogSink, NotificationSink, OverflowManager};
use crate::storage::memory::MemoryStoreFactory;
use crate::storage::sidecar::Sidecar;
use crate::storage::sql::{SqliteOptions, SqliteStoreFactory};
use crate::storage::traits::{StorageError, StoreFactory, WriteMode};

use super::{OpenOptions, VisibilityStore};

/// Maintenance cadence when batching is off.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

impl VisibilityStore {
    /// Open with config-driven collaborators.
    pub async fn open(config: VisibilityConfig) -> Result<Self, StorageError> {
        Self::open_with(config, OpenOptions::default()).await
    }

    /// Open the engine.
    ///
    /// Startup order:
    /// 1. Validate config
    /// 2. Open the record store (a corrupt store is recreated)
    /// 3. Open the sidecar (fallback queue, quota log, migration progress)
    /// 4. Replay anything left in the fallback queue
    /// 5. Run or resume legacy migration, if sources were given
    /// 6. Apply batched writes journaled before a forced close
    #[tracing::instrument(skip(config, options))]
    pub async fn open_with(config: VisibilityConfig, options: OpenOptions) -> Result<Self, StorageError> {
        let start = std::time::Instant::now();
        config.validate().map_err(|e| StorageError::Validation(e.to_string()))?;

        let factory: Arc<dyn StoreFactory> = match (options.store_factory, &config.store_path) {
            (Some(factory), _) => factory,
            (None, Some(path)) => Arc::new(SqliteStoreFactory::new(
                path,
                SqliteOptions {
                    max_page_count: config.store_max_pages,
                    ..Default::default()
                },
            )),
            (None, None) => {
                warn!("No store path configured, records are kept in memory only");
                Arc::new(MemoryStoreFactory::new())
            }
        };

        let cache = Arc::new(ReadCache::new(
            config.cache_max_entries,
            Duration::from_secs(config.cache_ttl_secs),
        ));
        let gateway = Arc::new(StoreGateway::open(factory, cache.clone(), GatewayConfig::from(&config)).await?);

        let sidecar = match (options.sidecar, &config.sidecar_path) {
            (Some(sidecar), _) => sidecar,
            (None, Some(path)) => Arc::new(Sidecar::open(path).await?),
            (None, None) => {
                warn!("No sidecar path configured, fallback queue and migration progress are volatile");
                Arc::new(Sidecar::open_in_memory().await?)
            }
        };

        let sink: Arc<dyn NotificationSink> = options.notification_sink.unwrap_or_else(|| Arc::new(LogSink));
        let overflow = Arc::new(OverflowManager::open(gateway.clone(), sidecar.clone(), sink, &config).await?);
        if overflow.fallback().has_pending() {
            info!(pending = overflow.fallback().len(), "Fallback queue not empty at open, replaying");
            if let Err(e) = overflow.replay_fallback().await {
                warn!(error = %e, "Fallback replay at open failed, will retry");
            }
        }

        let migration = if options.legacy_sources.is_empty() {
            None
        } else {
            let mut engine = MigrationEngine::new(
                gateway.clone(),
                overflow.clone(),
                sidecar.clone(),
                options.legacy_sources,
                &config,
            );
            if let Some(origin) = options.migration_origin {
                engine = engine.with_origin(origin);
            }
            match engine.run().await {
                Ok(report) => info!(
                    migrated = report.migrated,
                    batches = report.batches,
                    resumed = report.resumed,
                    "Legacy migration finished"
                ),
                // Progress is durable; the next open resumes.
                Err(e) => error!(error = %e, "Legacy migration failed, will resume on next open"),
            }
            Some(engine)
        };

        let batcher = config
            .batch_writes
            .then(|| WriteBatcher::new(BatchConfig::from(&config)));

        info!(
            store = %gateway.describe(),
            batching = config.batch_writes,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Visibility store ready"
        );

        let engine = Self {
            config,
            gateway,
            cache,
            overflow,
            sidecar,
            batcher,
            migration,
            writes_since_prune_check: AtomicU64::new(0),
        };
        if let Err(e) = engine.replay_batch_journal().await {
            // Entries stay journaled; the next open tries again.
            error!(error = %e, "Batch journal replay failed");
        }
        Ok(engine)
    }

    /// Apply batched writes that were acknowledged but never flushed.
    async fn replay_batch_journal(&self) -> Result<usize, StorageError> {
        let records = self.sidecar.journal_load().await?;
        if records.is_empty() {
            return Ok(0);
        }
        info!(count = records.len(), "Replaying journaled batch writes");
        self.write_records(&records, WriteMode::IfNewer).await?;
        self.sidecar.journal_remove(&records).await?;
        Ok(records.len())
    }

    /// One round of maintenance: idle batch flush and fallback replay.
    pub async fn tick(&self) {
        if let Some(batcher) = &self.batcher {
            if batcher.should_flush_idle() {
                if let Err(e) = self.flush_batch(FlushReason::Idle).await {
                    warn!(error = %e, "Idle batch flush failed");
                }
            }
        }
        if self.overflow.fallback().has_pending() {
            if let Err(e) = self.overflow.replay_fallback().await {
                debug!(error = %e, "Fallback replay deferred");
            }
            self.overflow.evaluate_pressure().await;
        }
        metrics::set_fallback_depth(self.overflow.fallback().len());
    }

    /// Run maintenance until `shutdown` flips to true.
    #[tracing::instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = match &self.batcher {
            Some(_) => Duration::from_millis(self.config.batch_idle_ms.max(1)),
            None => TICK_INTERVAL,
        };
        info!(interval_ms = interval.as_millis() as u64, "Maintenance loop running");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
            }
        }
        info!("Maintenance loop stopped");
    }

    /// Graceful close: flush pending batched writes, drain, close.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) {
        if self.batcher.is_some() {
            if let Err(e) = self.flush_batch(FlushReason::Shutdown).await {
                error!(error = %e, "Final batch flush failed");
            }
        }
        self.gateway.close().await;
        self.sidecar.close().await;
        info!("Visibility store closed");
    }

    /// Forced close for hosts that may terminate at any instant. Never suspends.
    ///
    /// Batched writes not yet flushed stay in the sidecar journal and are
    /// applied by the next open.
    pub fn close_now(&self) {
        if let Some(batcher) = &self.batcher {
            let pending = batcher.discard();
            if pending > 0 {
                warn!(pending, "Forced close with unflushed batched writes, left to journal replay");
            }
        }
        self.gateway.close_now();
        self.sidecar.close_now();
    }
}
