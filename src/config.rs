// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the visibility store.
//!
//! # Example
//!
//! ```
//! use visibility_store::VisibilityConfig;
//!
//! // Minimal config (uses defaults, in-memory stores)
//! let config = VisibilityConfig::default();
//! assert_eq!(config.max_records, 200_000);
//! assert!(config.validate().is_ok());
//!
//! // Durable config
//! let config = VisibilityConfig {
//!     store_path: Some("/var/lib/app/visibility.db".into()),
//!     sidecar_path: Some("/var/lib/app/visibility-sidecar.db".into()),
//!     cache_max_entries: 5_000,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Configuration for the visibility store.
///
/// All fields have sensible defaults. Without `store_path` the engine keeps
/// records in memory; without `sidecar_path` the fallback queue, quota log
/// and migration progress are volatile.
#[derive(Debug, Clone, Deserialize)]
pub struct VisibilityConfig {
    /// SQLite file for records
    #[serde(default)]
    pub store_path: Option<String>,

    /// SQLite file for fallback queue, quota log and migration progress
    #[serde(default)]
    pub sidecar_path: Option<String>,

    /// Hard page cap for the record store file (`PRAGMA max_page_count`)
    #[serde(default)]
    pub store_max_pages: Option<u64>,

    /// Gateway admission ceiling
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Per-attempt budget for point operations
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// Escalating per-attempt budgets for scans (pages, bulk deletes, stats)
    #[serde(default = "default_scan_timeouts_ms")]
    pub scan_timeouts_ms: Vec<u64>,

    /// Attempts for Transient/Timeout failures
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// How long corruption recovery waits for in-flight operations
    #[serde(default = "default_reset_drain_timeout_ms")]
    pub reset_drain_timeout_ms: u64,

    /// How long graceful close waits for in-flight operations
    #[serde(default = "default_shutdown_drain_timeout_ms")]
    pub shutdown_drain_timeout_ms: u64,

    /// Read cache
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Capacity ceiling and the size pruning shrinks back to
    #[serde(default = "default_max_records")]
    pub max_records: u64,
    #[serde(default = "default_prune_target")]
    pub prune_target: u64,

    /// Fallback area bound and tier thresholds (utilization 0.0 - 1.0)
    #[serde(default = "default_fallback_max_entries")]
    pub fallback_max_entries: u64,
    #[serde(default = "default_fallback_warning_ratio")]
    pub fallback_warning_ratio: f64,
    #[serde(default = "default_fallback_critical_ratio")]
    pub fallback_critical_ratio: f64,
    #[serde(default = "default_fallback_emergency_ratio")]
    pub fallback_emergency_ratio: f64,
    #[serde(default = "default_fallback_replay_batch")]
    pub fallback_replay_batch: usize,

    /// Quota cleanup sizing
    #[serde(default = "default_cleanup_min_records")]
    pub cleanup_min_records: usize,
    #[serde(default = "default_cleanup_max_records")]
    pub cleanup_max_records: usize,
    #[serde(default = "default_estimated_bytes_per_record")]
    pub estimated_bytes_per_record: usize,
    #[serde(default = "default_cleanup_safety_margin")]
    pub cleanup_safety_margin: f64,
    #[serde(default = "default_cleanup_growth_factor")]
    pub cleanup_growth_factor: f64,
    #[serde(default = "default_cleanup_per_retry_cap")]
    pub cleanup_per_retry_cap: usize,
    #[serde(default = "default_cleanup_total_budget")]
    pub cleanup_total_budget: usize,
    #[serde(default = "default_quota_max_retries")]
    pub quota_max_retries: usize,
    #[serde(default = "default_aggressive_cleanup_records")]
    pub aggressive_cleanup_records: usize,

    /// Routine notification backoff
    #[serde(default = "default_notify_base_interval_secs")]
    pub notify_base_interval_secs: u64,
    #[serde(default = "default_notify_max_interval_secs")]
    pub notify_max_interval_secs: u64,
    #[serde(default = "default_notify_max_consecutive")]
    pub notify_max_consecutive: u32,
    #[serde(default = "default_notify_quiet_reset_secs")]
    pub notify_quiet_reset_secs: u64,

    /// Quota event log cap
    #[serde(default = "default_quota_log_cap")]
    pub quota_log_cap: usize,

    /// Legacy migration batch size
    #[serde(default = "default_migration_batch_size")]
    pub migration_batch_size: usize,

    /// Write batcher (off by default)
    #[serde(default)]
    pub batch_writes: bool,
    #[serde(default = "default_batch_max_items")]
    pub batch_max_items: usize,
    #[serde(default = "default_batch_idle_ms")]
    pub batch_idle_ms: u64,

    /// Upper bound for `get_page` limit
    #[serde(default = "default_page_max")]
    pub page_max: usize,

    /// Import duplicate-timestamp heuristic
    #[serde(default = "default_import_duplicate_min_records")]
    pub import_duplicate_min_records: usize,
    #[serde(default = "default_import_duplicate_ratio")]
    pub import_duplicate_ratio: f64,
}

fn default_max_in_flight() -> usize { 32 }
fn default_op_timeout_ms() -> u64 { 5_000 }
fn default_scan_timeouts_ms() -> Vec<u64> { vec![2_000, 8_000, 20_000] }
fn default_max_retries() -> usize { 3 }
fn default_retry_initial_delay_ms() -> u64 { 50 }
fn default_retry_max_delay_ms() -> u64 { 1_000 }
fn default_reset_drain_timeout_ms() -> u64 { 2_000 }
fn default_shutdown_drain_timeout_ms() -> u64 { 5_000 }
fn default_cache_max_entries() -> usize { 10_000 }
fn default_cache_ttl_secs() -> u64 { 300 }
fn default_max_records() -> u64 { 200_000 }
fn default_prune_target() -> u64 { 180_000 }
fn default_fallback_max_entries() -> u64 { 5_000 }
fn default_fallback_warning_ratio() -> f64 { 0.5 }
fn default_fallback_critical_ratio() -> f64 { 0.8 }
fn default_fallback_emergency_ratio() -> f64 { 0.95 }
fn default_fallback_replay_batch() -> usize { 200 }
fn default_cleanup_min_records() -> usize { 50 }
fn default_cleanup_max_records() -> usize { 5_000 }
fn default_estimated_bytes_per_record() -> usize { 256 }
fn default_cleanup_safety_margin() -> f64 { 1.5 }
fn default_cleanup_growth_factor() -> f64 { 1.5 }
fn default_cleanup_per_retry_cap() -> usize { 10_000 }
fn default_cleanup_total_budget() -> usize { 20_000 }
fn default_quota_max_retries() -> usize { 3 }
fn default_aggressive_cleanup_records() -> usize { 1_000 }
fn default_notify_base_interval_secs() -> u64 { 60 }
fn default_notify_max_interval_secs() -> u64 { 3_600 }
fn default_notify_max_consecutive() -> u32 { 5 }
fn default_notify_quiet_reset_secs() -> u64 { 1_800 }
fn default_quota_log_cap() -> usize { 100 }
fn default_migration_batch_size() -> usize { 500 }
fn default_batch_max_items() -> usize { 50 }
fn default_batch_idle_ms() -> u64 { 100 }
fn default_page_max() -> usize { 500 }
fn default_import_duplicate_min_records() -> usize { 100 }
fn default_import_duplicate_ratio() -> f64 { 0.9 }

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            sidecar_path: None,
            store_max_pages: None,
            max_in_flight: default_max_in_flight(),
            op_timeout_ms: default_op_timeout_ms(),
            scan_timeouts_ms: default_scan_timeouts_ms(),
            max_retries: default_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            reset_drain_timeout_ms: default_reset_drain_timeout_ms(),
            shutdown_drain_timeout_ms: default_shutdown_drain_timeout_ms(),
            cache_max_entries: default_cache_max_entries(),
            cache_ttl_secs: default_cache_ttl_secs(),
            max_records: default_max_records(),
            prune_target: default_prune_target(),
            fallback_max_entries: default_fallback_max_entries(),
            fallback_warning_ratio: default_fallback_warning_ratio(),
            fallback_critical_ratio: default_fallback_critical_ratio(),
            fallback_emergency_ratio: default_fallback_emergency_ratio(),
            fallback_replay_batch: default_fallback_replay_batch(),
            cleanup_min_records: default_cleanup_min_records(),
            cleanup_max_records: default_cleanup_max_records(),
            estimated_bytes_per_record: default_estimated_bytes_per_record(),
            cleanup_safety_margin: default_cleanup_safety_margin(),
            cleanup_growth_factor: default_cleanup_growth_factor(),
            cleanup_per_retry_cap: default_cleanup_per_retry_cap(),
            cleanup_total_budget: default_cleanup_total_budget(),
            quota_max_retries: default_quota_max_retries(),
            aggressive_cleanup_records: default_aggressive_cleanup_records(),
            notify_base_interval_secs: default_notify_base_interval_secs(),
            notify_max_interval_secs: default_notify_max_interval_secs(),
            notify_max_consecutive: default_notify_max_consecutive(),
            notify_quiet_reset_secs: default_notify_quiet_reset_secs(),
            quota_log_cap: default_quota_log_cap(),
            migration_batch_size: default_migration_batch_size(),
            batch_writes: false,
            batch_max_items: default_batch_max_items(),
            batch_idle_ms: default_batch_idle_ms(),
            page_max: default_page_max(),
            import_duplicate_min_records: default_import_duplicate_min_records(),
            import_duplicate_ratio: default_import_duplicate_ratio(),
        }
    }
}

impl VisibilityConfig {
    /// Reject settings that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_in_flight", self.max_in_flight as u64),
            ("op_timeout_ms", self.op_timeout_ms),
            ("max_retries", self.max_retries as u64),
            ("cache_max_entries", self.cache_max_entries as u64),
            ("max_records", self.max_records),
            ("fallback_max_entries", self.fallback_max_entries),
            ("fallback_replay_batch", self.fallback_replay_batch as u64),
            ("estimated_bytes_per_record", self.estimated_bytes_per_record as u64),
            ("quota_log_cap", self.quota_log_cap as u64),
            ("migration_batch_size", self.migration_batch_size as u64),
            ("batch_max_items", self.batch_max_items as u64),
            ("page_max", self.page_max as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError(format!("{} must be greater than zero", name)));
            }
        }

        if self.scan_timeouts_ms.is_empty() || self.scan_timeouts_ms.contains(&0) {
            return Err(ConfigError("scan_timeouts_ms must be a non-empty list of positive budgets".into()));
        }
        if self.prune_target > self.max_records {
            return Err(ConfigError(format!(
                "prune_target ({}) must not exceed max_records ({})",
                self.prune_target, self.max_records
            )));
        }

        let w = self.fallback_warning_ratio;
        let c = self.fallback_critical_ratio;
        let e = self.fallback_emergency_ratio;
        if !(0.0 < w && w < c && c < e && e <= 1.0) {
            return Err(ConfigError(format!(
                "fallback tier ratios must satisfy 0 < warning < critical < emergency <= 1 (got {}, {}, {})",
                w, c, e
            )));
        }

        if self.cleanup_min_records > self.cleanup_max_records {
            return Err(ConfigError("cleanup_min_records must not exceed cleanup_max_records".into()));
        }
        if self.cleanup_safety_margin < 1.0 {
            return Err(ConfigError("cleanup_safety_margin must be at least 1.0".into()));
        }
        if self.cleanup_growth_factor < 1.0 {
            return Err(ConfigError("cleanup_growth_factor must be at least 1.0".into()));
        }
        if self.notify_base_interval_secs > self.notify_max_interval_secs {
            return Err(ConfigError("notify_base_interval_secs must not exceed notify_max_interval_secs".into()));
        }
        if !(0.0 < self.import_duplicate_ratio && self.import_duplicate_ratio <= 1.0) {
            return Err(ConfigError("import_duplicate_ratio must be in (0, 1]".into()));
        }
        Ok(())
    }
}
