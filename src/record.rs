// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record data structure.
//!
//! A [`Record`] is the durable unit of state for one external item id.
//! Only `Hidden` and `Dimmed` are ever persisted: setting an item back to
//! `Normal` deletes its record.
//!
//! # Example
//!
//! ```
//! use visibility_store::{Record, VisibilityState};
//!
//! let record = Record::new("item-42", VisibilityState::Hidden, "Some title");
//! assert_eq!(record.id, "item-42");
//! assert!(record.updated_at > 0);
//! assert!(record.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};

use crate::batching::BatchableItem;
use crate::storage::traits::StorageError;

/// Maximum title length in characters (longer titles are truncated).
pub const MAX_TITLE_CHARS: usize = 512;

/// Maximum id length in bytes.
pub const MAX_ID_BYTES: usize = 256;

/// How far into the future an imported timestamp may lie (24h).
pub const MAX_FUTURE_SKEW_MS: i64 = 24 * 60 * 60 * 1000;

/// Visibility state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityState {
    Hidden,
    Dimmed,
    /// Never persisted; means "delete".
    Normal,
}

impl VisibilityState {
    /// Column value used by the durable stores.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hidden => "hidden",
            Self::Dimmed => "dimmed",
            Self::Normal => "normal",
        }
    }

    /// Parse a stored or legacy state string (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hidden" => Some(Self::Hidden),
            "dimmed" => Some(Self::Dimmed),
            "normal" => Some(Self::Normal),
            _ => None,
        }
    }

    /// States that can exist as a record.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        !matches!(self, Self::Normal)
    }

    /// Both persistent states, in a stable order.
    pub const PERSISTENT: [VisibilityState; 2] = [Self::Hidden, Self::Dimmed];
}

impl std::fmt::Display for VisibilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable per-item visibility record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub state: VisibilityState,
    #[serde(default)]
    pub title: String,
    /// Last update timestamp (epoch millis)
    pub updated_at: i64,
}

impl Record {
    /// Create a record stamped with the current time. The title is truncated.
    pub fn new(id: impl Into<String>, state: VisibilityState, title: impl AsRef<str>) -> Self {
        Self::with_timestamp(id, state, title, now_millis())
    }

    /// Create a record with an explicit timestamp. The title is truncated.
    pub fn with_timestamp(
        id: impl Into<String>,
        state: VisibilityState,
        title: impl AsRef<str>,
        updated_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            state,
            title: truncate_title(title.as_ref()),
            updated_at,
        }
    }

    /// Check the invariants a record must hold before it may be persisted.
    pub fn validate(&self) -> Result<(), StorageError> {
        validate_id(&self.id)?;
        if !self.state.is_persistent() {
            return Err(StorageError::Validation(format!(
                "record '{}' has state normal, which is never persisted",
                self.id
            )));
        }
        if self.title.chars().count() > MAX_TITLE_CHARS {
            return Err(StorageError::Validation(format!(
                "record '{}' title exceeds {} characters",
                self.id, MAX_TITLE_CHARS
            )));
        }
        if self.updated_at < 0 {
            return Err(StorageError::Validation(format!(
                "record '{}' has negative timestamp {}",
                self.id, self.updated_at
            )));
        }
        let horizon = now_millis().saturating_add(MAX_FUTURE_SKEW_MS);
        if self.updated_at > horizon {
            return Err(StorageError::Validation(format!(
                "record '{}' timestamp {} is too far in the future",
                self.id, self.updated_at
            )));
        }
        Ok(())
    }

    /// Rough serialized size in bytes, used for cleanup sizing.
    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        // id + title + state tag + timestamp + JSON framing
        self.id.len() + self.title.len() + self.state.as_str().len() + 8 + 48
    }
}

/// Version stamped into every [`ExportDump`].
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// Ordered full dump (newest first), as produced by export and the emergency backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDump {
    pub version: u32,
    pub exported_at: i64,
    pub records: Vec<Record>,
}

impl ExportDump {
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            version: EXPORT_FORMAT_VERSION,
            exported_at: now_millis(),
            records,
        }
    }
}

impl BatchableItem for Record {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Validate an external item id.
pub fn validate_id(id: &str) -> Result<(), StorageError> {
    if id.trim().is_empty() {
        return Err(StorageError::Validation("id must not be empty".into()));
    }
    if id.len() > MAX_ID_BYTES {
        return Err(StorageError::Validation(format!(
            "id exceeds {} bytes",
            MAX_ID_BYTES
        )));
    }
    Ok(())
}

/// Truncate a title to [`MAX_TITLE_CHARS`] characters on a char boundary.
#[must_use]
pub fn truncate_title(title: &str) -> String {
    match title.char_indices().nth(MAX_TITLE_CHARS) {
        Some((cut, _)) => title[..cut].to_string(),
        None => title.to_string(),
    }
}

/// Current wall-clock time in epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_valid() {
        let record = Record::new("abc", VisibilityState::Dimmed, "title");
        assert_eq!(record.state, VisibilityState::Dimmed);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_title_truncated_on_char_boundary() {
        let long: String = "é".repeat(MAX_TITLE_CHARS + 10);
        let record = Record::new("abc", VisibilityState::Hidden, &long);
        assert_eq!(record.title.chars().count(), MAX_TITLE_CHARS);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_normal_state_rejected() {
        let record = Record::new("abc", VisibilityState::Normal, "");
        let err = record.validate().unwrap_err();
        assert!(err.to_string().contains("never persisted"));
    }

    #[test]
    fn test_empty_and_oversized_ids_rejected() {
        assert!(validate_id("").is_err());
        assert!(validate_id("   ").is_err());
        assert!(validate_id(&"x".repeat(MAX_ID_BYTES + 1)).is_err());
        assert!(validate_id("ok").is_ok());
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let record = Record::with_timestamp(
            "abc",
            VisibilityState::Hidden,
            "",
            now_millis() + MAX_FUTURE_SKEW_MS * 2,
        );
        assert!(record.validate().is_err());

        let record = Record::with_timestamp("abc", VisibilityState::Hidden, "", -1);
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_state_parse() {
        assert_eq!(VisibilityState::parse("Hidden"), Some(VisibilityState::Hidden));
        assert_eq!(VisibilityState::parse(" dimmed "), Some(VisibilityState::Dimmed));
        assert_eq!(VisibilityState::parse("normal"), Some(VisibilityState::Normal));
        assert_eq!(VisibilityState::parse("blocked"), None);
    }

    #[test]
    fn test_serializes_camel_case() {
        let record = Record::with_timestamp("a", VisibilityState::Hidden, "t", 5);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"updatedAt\":5"));
        assert!(json.contains("\"state\":\"hidden\""));
    }
}
