// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message surface: one tagged request in, one tagged response out.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::record::{ExportDump, Record, VisibilityState};
use crate::storage::traits::StorageError;

use super::{ConflictStrategy, HealthSnapshot, ImportReport, Page, SetOutcome, StoreStatsReport, VisibilityStore};

/// Default page size when a request omits `limit`.
const DEFAULT_PAGE_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Request {
    GetMany {
        ids: Vec<String>,
    },
    SetState {
        id: String,
        state: VisibilityState,
        #[serde(default)]
        title: String,
    },
    GetPage {
        #[serde(default)]
        state: Option<VisibilityState>,
        #[serde(default)]
        cursor: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
    GetStats,
    ClearAll,
    ExportAll,
    ImportRecords {
        records: Vec<Record>,
        strategy: ConflictStrategy,
    },
    Health,
}

impl Request {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetMany { .. } => "get_many",
            Self::SetState { .. } => "set_state",
            Self::GetPage { .. } => "get_page",
            Self::GetStats => "get_stats",
            Self::ClearAll => "clear_all",
            Self::ExportAll => "export_all",
            Self::ImportRecords { .. } => "import_records",
            Self::Health => "health",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Response {
    Records { records: HashMap<String, Record> },
    State { outcome: SetOutcome },
    Page { page: Page },
    Stats { stats: StoreStatsReport },
    Cleared,
    Export { dump: ExportDump },
    Import { report: ImportReport },
    Health { health: HealthSnapshot },
}

impl VisibilityStore {
    /// Dispatch one request.
    #[tracing::instrument(skip(self, request), fields(op = request.name()))]
    pub async fn handle(&self, request: Request) -> Result<Response, StorageError> {
        let response = match request {
            Request::GetMany { ids } => Response::Records {
                records: self.get_many(&ids).await?,
            },
            Request::SetState { id, state, title } => Response::State {
                outcome: self.set_state(&id, state, &title).await?,
            },
            Request::GetPage { state, cursor, limit } => Response::Page {
                page: self
                    .get_page(state, cursor.as_deref(), limit.unwrap_or(DEFAULT_PAGE_LIMIT))
                    .await?,
            },
            Request::GetStats => Response::Stats {
                stats: self.get_stats().await?,
            },
            Request::ClearAll => {
                self.clear_all().await?;
                Response::Cleared
            }
            Request::ExportAll => Response::Export {
                dump: self.export_all().await?,
            },
            Request::ImportRecords { records, strategy } => Response::Import {
                report: self.import_records(records, strategy).await?,
            },
            Request::Health => Response::Health {
                health: self.health().await,
            },
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::VisibilityConfig;

    #[test]
    fn test_request_parses_tagged_json() {
        let request: Request = serde_json::from_value(json!({
            "op": "setState",
            "id": "abc",
            "state": "hidden"
        }))
        .unwrap();
        assert_eq!(
            request,
            Request::SetState {
                id: "abc".into(),
                state: VisibilityState::Hidden,
                title: String::new(),
            }
        );

        let request: Request = serde_json::from_value(json!({ "op": "getPage", "state": "dimmed" })).unwrap();
        assert_eq!(request.name(), "get_page");

        assert!(serde_json::from_value::<Request>(json!({ "op": "dropTables" })).is_err());
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let store = VisibilityStore::open(VisibilityConfig::default()).await.unwrap();

        let response = store
            .handle(Request::SetState {
                id: "a".into(),
                state: VisibilityState::Dimmed,
                title: "t".into(),
            })
            .await
            .unwrap();
        assert!(matches!(response, Response::State { outcome: SetOutcome::Stored { .. } }));

        let response = store.handle(Request::GetMany { ids: vec!["a".into(), "b".into()] }).await.unwrap();
        let Response::Records { records } = response else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records["a"].state, VisibilityState::Dimmed);

        let json = serde_json::to_value(store.handle(Request::GetStats).await.unwrap()).unwrap();
        assert_eq!(json["type"], "stats");
        assert_eq!(json["stats"]["dimmed"], 1);

        store.close().await;
    }
}
