// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sidecar SQLite file for state that must outlive a full or reset primary store.
//!
//! Holds four small tables:
//! - `fallback_queue`: FIFO of records that could not be committed yet
//! - `batch_journal`: acknowledged batched writes not yet flushed, one per id
//! - `quota_events`: capped append-only log
//! - `kv_state`: JSON blobs keyed by name (migration progress)
//!
//! The primary store can be destroyed on corruption without touching this file.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info};

use super::sql::{map_sqlx_error, open_pool, SqliteOptions};
use super::traits::StorageError;
use crate::record::{Record, VisibilityState};

/// A queued fallback row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRecord {
    pub seq: i64,
    pub record: Record,
    pub queued_at: i64,
}

/// A raw quota-log row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawQuotaEvent {
    pub seq: i64,
    pub kind: String,
    pub at: i64,
    pub metadata: String,
}

fn queued_from_row(row: &SqliteRow) -> Result<QueuedRecord, StorageError> {
    let state_str: String = row.try_get("state").map_err(map_sqlx_error)?;
    let state = VisibilityState::parse(&state_str)
        .filter(VisibilityState::is_persistent)
        .ok_or_else(|| StorageError::Corruption(format!("fallback row has state '{}'", state_str)))?;
    Ok(QueuedRecord {
        seq: row.try_get("seq").map_err(map_sqlx_error)?,
        record: Record {
            id: row.try_get("id").map_err(map_sqlx_error)?,
            state,
            title: row.try_get("title").map_err(map_sqlx_error)?,
            updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
        },
        queued_at: row.try_get("queued_at").map_err(map_sqlx_error)?,
    })
}

pub struct Sidecar {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Sidecar {
    /// Open (or create) the sidecar file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        info!(path = %path.display(), "Opening sidecar store");
        let pool = open_pool(&path, &SqliteOptions::default()).await?;
        let sidecar = Self { pool, path: Some(path) };
        sidecar.init_schema().await?;
        Ok(sidecar)
    }

    /// Volatile sidecar on a single in-memory connection (tests, ephemeral engines).
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(map_sqlx_error)?;
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;
        let sidecar = Self { pool, path: None };
        sidecar.init_schema().await?;
        Ok(sidecar)
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for sql in [
            r#"
            CREATE TABLE IF NOT EXISTS fallback_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                state TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL,
                queued_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_fallback_id ON fallback_queue(id)",
            r#"
            CREATE TABLE IF NOT EXISTS batch_journal (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS quota_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                at INTEGER NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS kv_state (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        ] {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    // ----- fallback queue -----

    /// Append records atomically; rejects the whole batch if it would exceed `max`.
    pub async fn fallback_push(&self, records: &[Record], now: i64, max: u64) -> Result<Vec<i64>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM fallback_queue")
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let pending: i64 = row.try_get("cnt").map_err(map_sqlx_error)?;
        if pending as u64 + records.len() as u64 > max {
            return Err(StorageError::FallbackFull { pending: pending as u64, max });
        }

        let mut seqs = Vec::with_capacity(records.len());
        for record in records {
            let result = sqlx::query(
                "INSERT INTO fallback_queue (id, state, title, updated_at, queued_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&record.id)
            .bind(record.state.as_str())
            .bind(&record.title)
            .bind(record.updated_at)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            seqs.push(result.last_insert_rowid());
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(queued = seqs.len(), pending = pending as usize + seqs.len(), "Records queued in fallback");
        Ok(seqs)
    }

    /// Oldest-first slice of the queue.
    pub async fn fallback_peek(&self, limit: usize) -> Result<Vec<QueuedRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT seq, id, state, title, updated_at, queued_at FROM fallback_queue ORDER BY seq ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(queued_from_row).collect()
    }

    /// Queued rows for the given ids, oldest first.
    pub async fn fallback_for_ids(&self, ids: &[String]) -> Result<Vec<QueuedRecord>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT seq, id, state, title, updated_at, queued_at FROM fallback_queue WHERE id IN (",
        );
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id);
        }
        sep.push_unseparated(") ORDER BY seq ASC");
        let rows = qb.build().fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.iter().map(queued_from_row).collect()
    }

    pub async fn fallback_remove_seqs(&self, seqs: &[i64]) -> Result<usize, StorageError> {
        if seqs.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM fallback_queue WHERE seq IN (");
        let mut sep = qb.separated(", ");
        for seq in seqs {
            sep.push_bind(*seq);
        }
        sep.push_unseparated(")");
        let result = qb.build().execute(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(result.rows_affected() as usize)
    }

    pub async fn fallback_remove_ids(&self, ids: &[String]) -> Result<usize, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM fallback_queue WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id);
        }
        sep.push_unseparated(")");
        let result = qb.build().execute(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(result.rows_affected() as usize)
    }

    pub async fn fallback_count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM fallback_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let count: i64 = row.try_get("cnt").map_err(map_sqlx_error)?;
        Ok(count as u64)
    }

    pub async fn fallback_clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM fallback_queue")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    // ----- quota events -----

    /// Append one event and trim the log to the newest `cap` rows.
    pub async fn quota_append(&self, kind: &str, at: i64, metadata: &str, cap: usize) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        sqlx::query("INSERT INTO quota_events (kind, at, metadata) VALUES (?, ?, ?)")
            .bind(kind)
            .bind(at)
            .bind(metadata)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query(
            "DELETE FROM quota_events WHERE seq NOT IN (SELECT seq FROM quota_events ORDER BY seq DESC LIMIT ?)",
        )
        .bind(cap as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Newest-first events.
    pub async fn quota_recent(&self, limit: usize) -> Result<Vec<RawQuotaEvent>, StorageError> {
        let rows = sqlx::query("SELECT seq, kind, at, metadata FROM quota_events ORDER BY seq DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| {
                Ok(RawQuotaEvent {
                    seq: row.try_get("seq").map_err(map_sqlx_error)?,
                    kind: row.try_get("kind").map_err(map_sqlx_error)?,
                    at: row.try_get("at").map_err(map_sqlx_error)?,
                    metadata: row.try_get("metadata").map_err(map_sqlx_error)?,
                })
            })
            .collect()
    }

    // ----- batch journal -----

    /// Record an acknowledged batched write. A later write for the same id replaces it.
    pub async fn journal_put(&self, record: &Record) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO batch_journal (id, state, title, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                title = excluded.title,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(record.state.as_str())
        .bind(&record.title)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Drop journal entries that exactly match flushed records.
    ///
    /// An entry replaced by a newer write since the flush started stays.
    pub async fn journal_remove(&self, records: &[Record]) -> Result<usize, StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut removed = 0;
        for record in records {
            let result = sqlx::query(
                "DELETE FROM batch_journal WHERE id = ? AND state = ? AND title = ? AND updated_at = ?",
            )
            .bind(&record.id)
            .bind(record.state.as_str())
            .bind(&record.title)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(removed)
    }

    /// Every journaled write, including removals (`state = normal`).
    pub async fn journal_load(&self) -> Result<Vec<Record>, StorageError> {
        let rows = sqlx::query("SELECT id, state, title, updated_at FROM batch_journal ORDER BY updated_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter()
            .map(|row| {
                let state_str: String = row.try_get("state").map_err(map_sqlx_error)?;
                let state = VisibilityState::parse(&state_str).ok_or_else(|| {
                    StorageError::Corruption(format!("journal row has state '{}'", state_str))
                })?;
                Ok(Record {
                    id: row.try_get("id").map_err(map_sqlx_error)?,
                    state,
                    title: row.try_get("title").map_err(map_sqlx_error)?,
                    updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
                })
            })
            .collect()
    }

    pub async fn journal_clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM batch_journal")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    // ----- named state -----

    pub async fn load_state(&self, name: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT value FROM kv_state WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        match row {
            Some(row) => Ok(Some(row.try_get("value").map_err(map_sqlx_error)?)),
            None => Ok(None),
        }
    }

    pub async fn save_state(&self, name: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv_state (name, value) VALUES (?, ?) ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Non-suspending close; see `RecordStore::close_now`.
    pub fn close_now(&self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = self.pool.clone();
            handle.spawn(async move { pool.close().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(id: &str, ts: i64) -> Record {
        Record::with_timestamp(id, VisibilityState::Hidden, "t", ts)
    }

    #[tokio::test]
    async fn test_fallback_fifo_and_bound() {
        let sidecar = Sidecar::open_in_memory().await.unwrap();
        let seqs = sidecar.fallback_push(&[rec("a", 1), rec("b", 2)], 100, 3).await.unwrap();
        assert_eq!(seqs.len(), 2);

        let err = sidecar.fallback_push(&[rec("c", 3), rec("d", 4)], 100, 3).await.unwrap_err();
        assert_eq!(err, StorageError::FallbackFull { pending: 2, max: 3 });
        assert_eq!(sidecar.fallback_count().await.unwrap(), 2);

        let queued = sidecar.fallback_peek(10).await.unwrap();
        let ids: Vec<_> = queued.iter().map(|q| q.record.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(sidecar.fallback_remove_seqs(&[queued[0].seq]).await.unwrap(), 1);
        assert_eq!(sidecar.fallback_remove_ids(&["b".into()]).await.unwrap(), 1);
        assert_eq!(sidecar.fallback_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_journal_keeps_entries_replaced_during_flush() {
        let sidecar = Sidecar::open_in_memory().await.unwrap();
        let flushed = rec("a", 1);
        sidecar.journal_put(&flushed).await.unwrap();
        sidecar
            .journal_put(&Record::with_timestamp("gone", VisibilityState::Normal, "", 2))
            .await
            .unwrap();

        // A newer write for "a" lands before the flush of the older one completes
        let newer = Record::with_timestamp("a", VisibilityState::Dimmed, "t", 1);
        sidecar.journal_put(&newer).await.unwrap();
        assert_eq!(sidecar.journal_remove(std::slice::from_ref(&flushed)).await.unwrap(), 0);

        let journaled = sidecar.journal_load().await.unwrap();
        assert_eq!(journaled.len(), 2);
        assert_eq!(journaled[0], newer);
        assert_eq!(journaled[1].state, VisibilityState::Normal);

        assert_eq!(sidecar.journal_remove(&journaled).await.unwrap(), 2);
        assert!(sidecar.journal_load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quota_log_is_capped() {
        let sidecar = Sidecar::open_in_memory().await.unwrap();
        for i in 0..10 {
            sidecar.quota_append("quota_exceeded", i, "{}", 4).await.unwrap();
        }
        let events = sidecar.quota_recent(100).await.unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].at, 9);
        assert_eq!(events[3].at, 6);
    }

    #[tokio::test]
    async fn test_state_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sidecar.db");
        {
            let sidecar = Sidecar::open(&path).await.unwrap();
            sidecar.save_state("migration", "{\"completed\":false}").await.unwrap();
            sidecar.save_state("migration", "{\"completed\":true}").await.unwrap();
            sidecar.fallback_push(&[rec("kept", 1)], 1, 10).await.unwrap();
            sidecar.close().await;
        }
        let sidecar = Sidecar::open(&path).await.unwrap();
        assert_eq!(
            sidecar.load_state("migration").await.unwrap().as_deref(),
            Some("{\"completed\":true}")
        );
        assert_eq!(sidecar.load_state("missing").await.unwrap(), None);
        assert_eq!(sidecar.fallback_count().await.unwrap(), 1);
    }
}
