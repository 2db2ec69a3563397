// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cleanup sizing for quota recovery.
//!
//! First round: payload bytes × safety margin ÷ bytes-per-record, clamped to
//! `[min, max]`. Each retry grows the previous round geometrically, capped per
//! round and by a total budget for the whole sequence.

use crate::config::VisibilityConfig;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleanupPlanner {
    pub min_records: usize,
    pub max_records: usize,
    pub bytes_per_record: usize,
    pub safety_margin: f64,
    pub growth_factor: f64,
    pub per_retry_cap: usize,
    pub total_budget: usize,
}

impl From<&VisibilityConfig> for CleanupPlanner {
    fn from(config: &VisibilityConfig) -> Self {
        Self {
            min_records: config.cleanup_min_records,
            max_records: config.cleanup_max_records,
            bytes_per_record: config.estimated_bytes_per_record.max(1),
            safety_margin: config.cleanup_safety_margin,
            growth_factor: config.cleanup_growth_factor,
            per_retry_cap: config.cleanup_per_retry_cap,
            total_budget: config.cleanup_total_budget,
        }
    }
}

impl CleanupPlanner {
    /// Records to delete before the first retry of `payload`.
    #[must_use]
    pub fn initial(&self, payload: &[Record]) -> usize {
        let bytes: usize = payload.iter().map(Record::estimated_bytes).sum();
        let wanted = (bytes as f64 * self.safety_margin / self.bytes_per_record as f64).ceil() as usize;
        wanted.clamp(self.min_records, self.max_records.max(self.min_records))
    }

    /// Size of the round after one that deleted `previous`, given `spent` so far.
    #[must_use]
    pub fn next(&self, previous: usize, spent: usize) -> usize {
        let grown = (previous.max(1) as f64 * self.growth_factor).ceil() as usize;
        grown.min(self.per_retry_cap).min(self.remaining(spent))
    }

    /// What is left of the total budget.
    #[must_use]
    pub fn remaining(&self, spent: usize) -> usize {
        self.total_budget.saturating_sub(spent)
    }
}
