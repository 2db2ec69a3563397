// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Two layers:
//! - [`retry`] retries any fallible future with backoff (used for connects).
//! - [`retry_classified`] runs each attempt under a timeout from a
//!   [`TimeoutSchedule`] and only retries Transient/Timeout failures.
//!
//! # Example
//!
//! ```
//! use visibility_store::{RetryConfig, TimeoutSchedule};
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad paths
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Query: quick retry, then fail
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, Some(3));
//!
//! // Scans escalate their budget per attempt
//! let scan = TimeoutSchedule::progressive(&[2_000, 8_000, 20_000]);
//! assert_eq!(scan.budget(0), Duration::from_secs(2));
//! assert_eq!(scan.budget(5), Duration::from_secs(20));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::metrics;
use crate::storage::traits::StorageError;

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for opening store files
/// - [`RetryConfig::query()`] - Quick retry for individual operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fast-fail retry for opening the store.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual store operations.
    /// 3 attempts with fast backoff - if it fails, let caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Per-attempt timeout budgets. Attempts past the end reuse the last budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutSchedule {
    budgets: Vec<Duration>,
}

impl TimeoutSchedule {
    /// Same budget on every attempt.
    #[must_use]
    pub fn fixed(budget: Duration) -> Self {
        Self { budgets: vec![budget] }
    }

    /// Escalating budgets in milliseconds (short, medium, long...).
    /// An empty list falls back to a single 5s budget.
    #[must_use]
    pub fn progressive(budgets_ms: &[u64]) -> Self {
        if budgets_ms.is_empty() {
            return Self::fixed(Duration::from_secs(5));
        }
        Self {
            budgets: budgets_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        }
    }

    #[must_use]
    pub fn budget(&self, attempt: usize) -> Duration {
        let idx = attempt.min(self.budgets.len().saturating_sub(1));
        self.budgets.get(idx).copied().unwrap_or(Duration::from_secs(5))
    }

    /// Number of distinct budget steps.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.budgets.len()
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }
                metrics::record_retry(operation_name);

                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Run `operation` under per-attempt timeouts, retrying only errors whose
/// class is Transient or Timeout.
///
/// The attempt count is the larger of `config.max_retries` and the number of
/// schedule steps, so every escalation step gets a chance. An elapsed budget
/// becomes [`StorageError::Timeout`]; the abandoned attempt may still finish
/// in the background, so its outcome is unknown to the caller.
pub async fn retry_classified<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    schedule: &TimeoutSchedule,
    mut operation: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let max_attempts = config.max_retries.unwrap_or(1).max(schedule.steps()).max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0usize;

    loop {
        let budget = schedule.budget(attempt);
        let outcome = match tokio::time::timeout(budget, operation()).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                operation: operation_name.to_string(),
                budget_ms: budget.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(val) => {
                if attempt > 0 {
                    info!(operation = operation_name, retries = attempt, "Operation recovered after retry");
                }
                return Ok(val);
            }
            Err(err) => {
                attempt += 1;
                if !err.is_retryable() || attempt >= max_attempts {
                    return Err(err);
                }
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    budget_ms = budget.as_millis() as u64,
                    error = %err,
                    "Retrying store operation"
                );
                metrics::record_retry(operation_name);
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
