// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fallback-area pressure tiers.
//!
//! The fallback queue is bounded; its utilization drives a five-tier
//! escalation so a saturated primary store degrades loudly, not silently.
//!
//! # Example
//!
//! ```
//! use visibility_store::overflow::{FallbackTier, TierThresholds};
//!
//! let thresholds = TierThresholds::default();
//! assert_eq!(FallbackTier::from_utilization(0.1, &thresholds), FallbackTier::Normal);
//! assert_eq!(FallbackTier::from_utilization(0.85, &thresholds), FallbackTier::Critical);
//! assert!(!FallbackTier::Max.should_accept_writes());
//! ```

use crate::config::VisibilityConfig;

/// Tier boundaries as utilization ratios (0.0 → 1.0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierThresholds {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self::from(&VisibilityConfig::default())
    }
}

impl From<&VisibilityConfig> for TierThresholds {
    fn from(config: &VisibilityConfig) -> Self {
        Self {
            warning: config.fallback_warning_ratio,
            critical: config.fallback_critical_ratio,
            emergency: config.fallback_emergency_ratio,
        }
    }
}

/// Fallback pressure tier.
///
/// - **Normal**: no action
/// - **Warning**: aggressive primary cleanup, immediate replay
/// - **Critical**: block new writes, urgent notification, one more cleanup
/// - **Emergency**: offer a user-driven export of the fallback contents
/// - **Max**: fallback full, reject new writes unconditionally
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FallbackTier {
    Normal = 0,
    Warning = 1,
    Critical = 2,
    Emergency = 3,
    Max = 4,
}

impl FallbackTier {
    pub const ALL: [FallbackTier; 5] = [Self::Normal, Self::Warning, Self::Critical, Self::Emergency, Self::Max];

    /// Tiers whose actions include an aggressive primary cleanup.
    #[must_use]
    pub fn runs_cleanup(&self) -> bool {
        matches!(self, Self::Warning | Self::Critical)
    }

    #[must_use]
    pub fn from_utilization(utilization: f64, thresholds: &TierThresholds) -> Self {
        match utilization {
            u if u >= 1.0 => Self::Max,
            u if u >= thresholds.emergency => Self::Emergency,
            u if u >= thresholds.critical => Self::Critical,
            u if u >= thresholds.warning => Self::Warning,
            _ => Self::Normal,
        }
    }

    /// Tier for `pending` entries out of `max`.
    #[must_use]
    pub fn from_depth(pending: u64, max: u64, thresholds: &TierThresholds) -> Self {
        if max == 0 {
            return Self::Max;
        }
        Self::from_utilization(pending as f64 / max as f64, thresholds)
    }

    /// Whether caller writes are admitted without first running tier actions.
    #[must_use]
    pub fn should_accept_writes(&self) -> bool {
        matches!(self, Self::Normal | Self::Warning)
    }

    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Warning => "Warning - fallback area filling, cleaning up",
            Self::Critical => "Critical - new writes blocked",
            Self::Emergency => "Emergency - export offered",
            Self::Max => "Max - fallback area full, writes rejected",
        }
    }
}

impl std::fmt::Display for FallbackTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_thresholds() {
        let t = TierThresholds { warning: 0.5, critical: 0.8, emergency: 0.95 };
        assert_eq!(FallbackTier::from_utilization(0.0, &t), FallbackTier::Normal);
        assert_eq!(FallbackTier::from_utilization(0.49, &t), FallbackTier::Normal);
        assert_eq!(FallbackTier::from_utilization(0.5, &t), FallbackTier::Warning);
        assert_eq!(FallbackTier::from_utilization(0.79, &t), FallbackTier::Warning);
        assert_eq!(FallbackTier::from_utilization(0.8, &t), FallbackTier::Critical);
        assert_eq!(FallbackTier::from_utilization(0.95, &t), FallbackTier::Emergency);
        assert_eq!(FallbackTier::from_utilization(0.999, &t), FallbackTier::Emergency);
        assert_eq!(FallbackTier::from_utilization(1.0, &t), FallbackTier::Max);
    }

    #[test]
    fn test_from_depth() {
        let t = TierThresholds::default();
        assert_eq!(FallbackTier::from_depth(0, 100, &t), FallbackTier::Normal);
        assert_eq!(FallbackTier::from_depth(100, 100, &t), FallbackTier::Max);
        assert_eq!(FallbackTier::from_depth(0, 0, &t), FallbackTier::Max);
    }

    #[test]
    fn test_should_accept_writes() {
        assert!(FallbackTier::Normal.should_accept_writes());
        assert!(FallbackTier::Warning.should_accept_writes());
        assert!(!FallbackTier::Critical.should_accept_writes());
        assert!(!FallbackTier::Emergency.should_accept_writes());
        assert!(!FallbackTier::Max.should_accept_writes());
    }

    #[test]
    fn test_tier_ordering() {
        assert!(FallbackTier::Normal < FallbackTier::Warning);
        assert!(FallbackTier::Warning < FallbackTier::Critical);
        assert!(FallbackTier::Critical < FallbackTier::Emergency);
        assert!(FallbackTier::Emergency < FallbackTier::Max);
    }
}
