// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable, capped log of quota-relevant events.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::metrics;
use crate::record::now_millis;
use crate::storage::sidecar::Sidecar;
use crate::storage::traits::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaEventKind {
    QuotaExceeded,
    FallbackQueued,
    FallbackRejected,
    CleanupPerformed,
    RecoverySucceeded,
    RecoveryFailed,
    FallbackReplayed,
    TierChanged,
    ExportOffered,
    Pruned,
}

impl QuotaEventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota_exceeded",
            Self::FallbackQueued => "fallback_queued",
            Self::FallbackRejected => "fallback_rejected",
            Self::CleanupPerformed => "cleanup_performed",
            Self::RecoverySucceeded => "recovery_succeeded",
            Self::RecoveryFailed => "recovery_failed",
            Self::FallbackReplayed => "fallback_replayed",
            Self::TierChanged => "tier_changed",
            Self::ExportOffered => "export_offered",
            Self::Pruned => "pruned",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaEvent {
    pub kind: QuotaEventKind,
    pub at: i64,
    pub metadata: Value,
}

pub struct QuotaEventLog {
    sidecar: Arc<Sidecar>,
    cap: usize,
    lock: Mutex<()>,
}

impl QuotaEventLog {
    pub fn new(sidecar: Arc<Sidecar>, cap: usize) -> Self {
        Self {
            sidecar,
            cap,
            lock: Mutex::new(()),
        }
    }

    /// Append an event; the oldest entries past the cap are trimmed.
    pub async fn append(&self, kind: QuotaEventKind, metadata: Value) -> Result<(), StorageError> {
        let _order = self.lock.lock().await;
        metrics::record_quota_event(kind.as_str());
        self.sidecar
            .quota_append(kind.as_str(), now_millis(), &metadata.to_string(), self.cap)
            .await
    }

    /// Append, logging instead of failing. The log is diagnostic only.
    pub async fn record(&self, kind: QuotaEventKind, metadata: Value) {
        if let Err(e) = self.append(kind, metadata).await {
            warn!(kind = kind.as_str(), error = %e, "Failed to append quota event");
        }
    }

    /// Newest-first events. Rows with unknown kinds are skipped.
    pub async fn recent(&self, limit: usize) -> Result<Vec<QuotaEvent>, StorageError> {
        let raw = self.sidecar.quota_recent(limit).await?;
        Ok(raw
            .into_iter()
            .filter_map(|row| {
                let kind = QuotaEventKind::parse(&row.kind)?;
                let metadata = serde_json::from_str(&row.metadata).unwrap_or(Value::Null);
                Some(QuotaEvent { kind, at: row.at, metadata })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_recent() {
        let sidecar = Arc::new(Sidecar::open_in_memory().await.unwrap());
        let log = QuotaEventLog::new(sidecar, 3);

        log.append(QuotaEventKind::QuotaExceeded, json!({"records": 1})).await.unwrap();
        log.append(QuotaEventKind::CleanupPerformed, json!({"deleted": 50})).await.unwrap();

        let events = log.recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, QuotaEventKind::CleanupPerformed);
        assert_eq!(events[0].metadata["deleted"], 50);
    }

    #[tokio::test]
    async fn test_cap_trims_oldest() {
        let sidecar = Arc::new(Sidecar::open_in_memory().await.unwrap());
        let log = QuotaEventLog::new(sidecar, 3);
        for i in 0..6 {
            log.record(QuotaEventKind::Pruned, json!({"round": i})).await;
        }
        let events = log.recent(10).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].metadata["round"], 5);
        assert_eq!(events[2].metadata["round"], 3);
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in [QuotaEventKind::QuotaExceeded, QuotaEventKind::ExportOffered, QuotaEventKind::TierChanged] {
            assert_eq!(QuotaEventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(QuotaEventKind::parse("unknown"), None);
    }
}
