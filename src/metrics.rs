// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for visibility-store.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `visibility_store_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: get_many, put_many, page, stats, ...
//! - `status`: success, error, rejected
//! - `error_type`: transient, timeout, quota, corruption, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a gateway operation outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "visibility_store_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "visibility_store_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an error with category for alerting
pub fn record_error(operation: &str, error_type: &str) {
    counter!(
        "visibility_store_errors_total",
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record an operation retry
pub fn record_retry(operation: &str) {
    counter!(
        "visibility_store_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set operations currently in flight
pub fn set_in_flight(count: usize) {
    gauge!("visibility_store_in_flight").set(count as f64);
}

/// Record an admission rejection
pub fn record_rejected(reason: &str) {
    counter!(
        "visibility_store_rejected_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// READ CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record cache lookup outcome (hit, tombstone, miss)
pub fn record_cache_lookup(outcome: &'static str) {
    counter!(
        "visibility_store_cache_lookups_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Set cache entry count
pub fn set_cache_entries(count: usize) {
    gauge!("visibility_store_cache_entries").set(count as f64);
}

/// Record cache evictions (lru or ttl)
pub fn record_cache_eviction(reason: &'static str, count: usize) {
    counter!(
        "visibility_store_cache_evictions_total",
        "reason" => reason
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// OVERFLOW - Quota handling and fallback area
// ═══════════════════════════════════════════════════════════════════════════

/// Set fallback queue depth
pub fn set_fallback_depth(count: u64) {
    gauge!("visibility_store_fallback_entries").set(count as f64);
}

/// Set fallback pressure tier (0 = Normal .. 4 = Max)
pub fn set_fallback_tier(level: u8) {
    gauge!("visibility_store_fallback_tier").set(level as f64);
}

/// Record a quota event by kind
pub fn record_quota_event(kind: &str) {
    counter!(
        "visibility_store_quota_events_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record records deleted by cleanup or pruning
pub fn record_cleanup_deleted(reason: &'static str, count: usize) {
    counter!(
        "visibility_store_cleanup_deleted_total",
        "reason" => reason
    )
    .increment(count as u64);
}

/// Record fallback replay
pub fn record_fallback_replay(count: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "visibility_store_fallback_replay_total",
        "status" => status
    )
    .increment(1);

    if success {
        counter!("visibility_store_fallback_replayed_items_total").increment(count as u64);
    }
}

/// Record a notification emitted or suppressed
pub fn record_notification(priority: &str, delivered: bool) {
    let outcome = if delivered { "delivered" } else { "suppressed" };
    counter!(
        "visibility_store_notifications_total",
        "priority" => priority.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// RECOVERY AND LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a corruption-triggered store reset
pub fn record_corruption_reset(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "visibility_store_corruption_resets_total",
        "status" => status
    )
    .increment(1);
}

/// Track gateway state transitions
pub fn set_gateway_state(state: &str) {
    counter!(
        "visibility_store_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record migration batch outcome
pub fn record_migration_batch(count: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "visibility_store_migration_batches_total",
        "status" => status
    )
    .increment(1);

    if success {
        counter!("visibility_store_migrated_records_total").increment(count as u64);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WRITE BATCHER
// ═══════════════════════════════════════════════════════════════════════════

/// Set batch queue depth (items pending flush)
pub fn set_batch_queue_items(count: usize) {
    gauge!("visibility_store_batch_queue_items").set(count as f64);
}

/// Record batch flush size and reason
pub fn record_batch_flush(reason: &'static str, count: usize) {
    counter!(
        "visibility_store_batch_flushes_total",
        "reason" => reason
    )
    .increment(1);
    histogram!("visibility_store_batch_size").record(count as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These verify the API doesn't panic without an installed recorder.

    #[test]
    fn test_operation_metrics() {
        record_operation("get_many", "success");
        record_operation("put_many", "error");
        record_error("put_many", "quota");
        record_retry("page");
        record_rejected("overloaded");
        set_in_flight(3);
    }

    #[test]
    fn test_cache_metrics() {
        record_cache_lookup("hit");
        record_cache_lookup("tombstone");
        record_cache_lookup("miss");
        set_cache_entries(128);
        record_cache_eviction("lru", 4);
    }

    #[test]
    fn test_overflow_metrics() {
        set_fallback_depth(12);
        set_fallback_tier(2);
        record_quota_event("quota_exceeded");
        record_cleanup_deleted("quota", 50);
        record_fallback_replay(10, true);
        record_fallback_replay(0, false);
        record_notification("warning", false);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("get_many");
            std::thread::sleep(Duration::from_micros(10));
        }
    }

    #[test]
    fn test_lifecycle_metrics() {
        record_corruption_reset(true);
        set_gateway_state("Ready");
        record_migration_batch(500, true);
        set_batch_queue_items(7);
        record_batch_flush("count", 50);
    }
}
