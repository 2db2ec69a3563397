// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! User notifications for capacity pressure.
//!
//! Routine warnings back off exponentially per consecutive notification:
//! the interval doubles up to a cap, notifications go silent after N in a
//! row, and a sustained quiet period resets everything. Critical and
//! emergency notifications bypass the throttle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::VisibilityConfig;
use crate::metrics;
use crate::record::ExportDump;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NotificationPriority {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl NotificationPriority {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }

    /// Whether this priority skips the backoff throttle.
    #[must_use]
    pub fn bypasses_throttle(&self) -> bool {
        matches!(self, Self::Critical | Self::Emergency)
    }
}

/// Where notifications go. Presentation is the host's business.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, priority: NotificationPriority, message: &str);

    /// Offer the user a download of `dump` as a last-resort backup.
    fn offer_export(&self, dump: &ExportDump);
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn emit(&self, priority: NotificationPriority, message: &str) {
        match priority {
            NotificationPriority::Info => info!(priority = priority.as_str(), "{}", message),
            NotificationPriority::Warning => warn!(priority = priority.as_str(), "{}", message),
            NotificationPriority::Critical | NotificationPriority::Emergency => {
                error!(priority = priority.as_str(), "{}", message)
            }
        }
    }

    fn offer_export(&self, dump: &ExportDump) {
        error!(records = dump.records.len(), "Emergency export available");
    }
}

/// Sink that keeps everything in memory, for hosts that poll and for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<(NotificationPriority, String)>>,
    exports: Mutex<Vec<ExportDump>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<(NotificationPriority, String)> {
        self.messages.lock().clone()
    }

    #[must_use]
    pub fn exports(&self) -> Vec<ExportDump> {
        self.exports.lock().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn emit(&self, priority: NotificationPriority, message: &str) {
        self.messages.lock().push((priority, message.to_string()));
    }

    fn offer_export(&self, dump: &ExportDump) {
        self.exports.lock().push(dump.clone());
    }
}

/// Backoff settings for routine notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub max_consecutive: u32,
    pub quiet_reset: Duration,
}

impl From<&VisibilityConfig> for ThrottlePolicy {
    fn from(config: &VisibilityConfig) -> Self {
        Self {
            base_interval: Duration::from_secs(config.notify_base_interval_secs),
            max_interval: Duration::from_secs(config.notify_max_interval_secs),
            max_consecutive: config.notify_max_consecutive,
            quiet_reset: Duration::from_secs(config.notify_quiet_reset_secs),
        }
    }
}

#[derive(Debug, Default)]
struct ThrottleState {
    consecutive: u32,
    last_sent: Option<Instant>,
    last_event: Option<Instant>,
}

/// Exponential backoff gate for routine notifications.
#[derive(Debug)]
pub struct NotificationThrottle {
    policy: ThrottlePolicy,
    state: Mutex<ThrottleState>,
}

impl NotificationThrottle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(ThrottleState::default()),
        }
    }

    /// Interval required after `consecutive` notifications already sent.
    #[must_use]
    pub fn interval_after(&self, consecutive: u32) -> Duration {
        if consecutive == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(consecutive - 1);
        self.policy.base_interval.saturating_mul(factor).min(self.policy.max_interval)
    }

    /// Decide whether a routine notification raised at `now` goes out.
    pub fn should_send(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if let Some(last) = state.last_event {
            if now.saturating_duration_since(last) >= self.policy.quiet_reset {
                *state = ThrottleState::default();
            }
        }
        state.last_event = Some(now);

        if state.consecutive >= self.policy.max_consecutive {
            return false;
        }
        let due = match state.last_sent {
            None => true,
            Some(sent) => now.saturating_duration_since(sent) >= self.interval_after(state.consecutive),
        };
        if due {
            state.consecutive += 1;
            state.last_sent = Some(now);
        }
        due
    }

    pub fn reset(&self) {
        *self.state.lock() = ThrottleState::default();
    }
}

/// Sink plus throttle.
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    throttle: NotificationThrottle,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, policy: ThrottlePolicy) -> Self {
        Self {
            sink,
            throttle: NotificationThrottle::new(policy),
        }
    }

    /// Emit `message`, subject to backoff unless the priority bypasses it.
    /// Returns whether it was delivered.
    pub fn notify(&self, priority: NotificationPriority, message: &str) -> bool {
        let delivered = priority.bypasses_throttle() || self.throttle.should_send(Instant::now());
        metrics::record_notification(priority.as_str(), delivered);
        if delivered {
            self.sink.emit(priority, message);
        }
        delivered
    }

    pub fn offer_export(&self, dump: &ExportDump) {
        self.sink.offer_export(dump);
    }

    /// Pressure is gone; the next routine warning starts a fresh backoff.
    pub fn reset(&self) {
        self.throttle.reset();
    }
}
