// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite storage backend for visibility records.
//!
//! Schema (one keyed table plus the two recency orderings):
//! ```sql
//! CREATE TABLE visibility_records (
//!   id TEXT PRIMARY KEY,
//!   state TEXT NOT NULL,          -- 'hidden' | 'dimmed'
//!   title TEXT NOT NULL,
//!   updated_at INTEGER NOT NULL   -- epoch millis
//! );
//! CREATE INDEX idx_records_recency ON visibility_records(updated_at, id);
//! CREATE INDEX idx_records_state_recency ON visibility_records(state, updated_at, id);
//! ```
//!
//! Paginated reads walk one of the two indexes from a `(updated_at, id)`
//! cursor, so no read needs a full scan.
//!
//! ## Capacity
//!
//! `max_page_count` caps the database file. When a write would grow past it
//! SQLite answers `SQLITE_FULL`, which maps to [`StorageError::QuotaExceeded`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info, warn};

use super::traits::{
    PageQuery, RecordStore, StorageError, StoreFactory, StoreStats, WriteMode,
};
use crate::record::{Record, VisibilityState};
use crate::resilience::retry::{retry, RetryConfig};

/// Rows per multi-row statement (4 binds each).
const CHUNK_SIZE: usize = 200;

/// Options for opening a SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
    /// Hard cap on database pages (`PRAGMA max_page_count`); `None` = unlimited
    pub max_page_count: Option<u64>,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
            max_page_count: None,
        }
    }
}

/// Open a WAL-mode SQLite pool, creating the file if needed.
pub(crate) async fn open_pool(path: &Path, options: &SqliteOptions) -> Result<SqlitePool, StorageError> {
    let mut connect = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(options.busy_timeout);
    if let Some(pages) = options.max_page_count {
        connect = connect.pragma("max_page_count", pages.to_string());
    }

    retry("sqlite_connect", &RetryConfig::startup(), || {
        let connect = connect.clone();
        async move {
            SqlitePoolOptions::new()
                .max_connections(options.max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .connect_with(connect)
                .await
                .map_err(map_sqlx_error)
        }
    })
    .await
}

/// Map a sqlx error onto the storage taxonomy.
///
/// SQLite reports extended result codes; the primary code is the low byte.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            let primary = db
                .code()
                .and_then(|c| c.parse::<i64>().ok())
                .map(|c| c & 0xff);
            match primary {
                Some(13) => StorageError::QuotaExceeded(message),
                Some(11) | Some(26) => StorageError::Corruption(message),
                Some(5) | Some(6) => StorageError::Transient(message),
                _ if message.contains("database or disk is full") => {
                    StorageError::QuotaExceeded(message)
                }
                _ if message.contains("malformed") || message.contains("not a database") => {
                    StorageError::Corruption(message)
                }
                _ => StorageError::Permanent(message),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => {
            StorageError::Transient(err.to_string())
        }
        sqlx::Error::Io(_) => StorageError::Transient(err.to_string()),
        sqlx::Error::PoolClosed => StorageError::Closed,
        _ => StorageError::Permanent(err.to_string()),
    }
}

fn record_from_row(row: &SqliteRow) -> Result<Record, StorageError> {
    let id: String = row.try_get("id").map_err(map_sqlx_error)?;
    let state_str: String = row.try_get("state").map_err(map_sqlx_error)?;
    let state = VisibilityState::parse(&state_str)
        .filter(VisibilityState::is_persistent)
        .ok_or_else(|| {
            StorageError::Corruption(format!("record '{}' has invalid state '{}'", id, state_str))
        })?;
    let title: String = row.try_get("title").map_err(map_sqlx_error)?;
    let updated_at: i64 = row.try_get("updated_at").map_err(map_sqlx_error)?;
    Ok(Record {
        id,
        state,
        title,
        updated_at,
    })
}

/// Keyset page query. The row-value cursor bound lets SQLite seek into
/// `idx_records_recency` (or the state index) instead of walking it.
fn page_query<'a>(select: &str, query: &'a PageQuery) -> QueryBuilder<'a, Sqlite> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(select);
    qb.push(" FROM visibility_records WHERE 1 = 1");
    if let Some(state) = query.state {
        qb.push(" AND state = ").push_bind(state.as_str());
    }
    if let Some(after) = &query.after {
        qb.push(" AND (updated_at, id) < (")
            .push_bind(after.updated_at)
            .push(", ")
            .push_bind(after.id.as_str())
            .push(")");
    }
    qb.push(" ORDER BY updated_at DESC, id DESC LIMIT ")
        .push_bind(query.limit as i64);
    qb
}

/// Collapse duplicate ids inside one write so each statement touches an id once.
fn dedupe(records: &[Record], mode: WriteMode) -> Vec<&Record> {
    let mut order: Vec<&str> = Vec::new();
    let mut chosen: HashMap<&str, &Record> = HashMap::new();
    for record in records {
        match chosen.get(record.id.as_str()) {
            None => {
                order.push(&record.id);
                chosen.insert(&record.id, record);
            }
            Some(existing) => {
                let replace = match mode {
                    WriteMode::Overwrite => true,
                    WriteMode::IfNewer => record.updated_at > existing.updated_at,
                    WriteMode::IfAbsent => false,
                };
                if replace {
                    chosen.insert(&record.id, record);
                }
            }
        }
    }
    order.into_iter().filter_map(|id| chosen.get(id).copied()).collect()
}

pub struct SqliteRecordStore {
    pool: SqlitePool,
    path: PathBuf,
    closed: AtomicBool,
}

impl SqliteRecordStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: impl AsRef<Path>, options: &SqliteOptions) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        info!(path = %path.display(), max_page_count = ?options.max_page_count, "Opening record store");
        let pool = open_pool(&path, options).await?;
        let store = Self {
            pool,
            path,
            closed: AtomicBool::new(false),
        };
        store.init_schema().await?;
        Ok(store)
    }

    #[must_use]
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for sql in [
            r#"
            CREATE TABLE IF NOT EXISTS visibility_records (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_records_recency ON visibility_records(updated_at, id)",
            "CREATE INDEX IF NOT EXISTS idx_records_state_recency ON visibility_records(state, updated_at, id)",
        ] {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get_many(&self, ids: &[String]) -> Result<Vec<Record>, StorageError> {
        self.check_open()?;
        let mut found = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(CHUNK_SIZE * 4) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT id, state, title, updated_at FROM visibility_records WHERE id IN (",
            );
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id);
            }
            sep.push_unseparated(")");
            let rows = qb.build().fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
            for row in &rows {
                found.push(record_from_row(row)?);
            }
        }
        Ok(found)
    }

    async fn put_many(&self, records: &[Record], mode: WriteMode) -> Result<usize, StorageError> {
        self.check_open()?;
        let records = dedupe(records, mode);
        if records.is_empty() {
            return Ok(0);
        }

        let conflict = match mode {
            WriteMode::Overwrite => {
                " ON CONFLICT(id) DO UPDATE SET state = excluded.state, title = excluded.title, updated_at = excluded.updated_at"
            }
            WriteMode::IfNewer => {
                " ON CONFLICT(id) DO UPDATE SET state = excluded.state, title = excluded.title, updated_at = excluded.updated_at \
                 WHERE excluded.updated_at > visibility_records.updated_at"
            }
            WriteMode::IfAbsent => " ON CONFLICT(id) DO NOTHING",
        };

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut written = 0usize;
        for chunk in records.chunks(CHUNK_SIZE) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO visibility_records (id, state, title, updated_at) ");
            qb.push_values(chunk.iter(), |mut b, record| {
                b.push_bind(&record.id)
                    .push_bind(record.state.as_str())
                    .push_bind(&record.title)
                    .push_bind(record.updated_at);
            });
            qb.push(conflict);
            let result = qb.build().execute(&mut *tx).await.map_err(map_sqlx_error)?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(written, mode = ?mode, "Records written");
        Ok(written)
    }

    async fn delete_many(&self, ids: &[String]) -> Result<usize, StorageError> {
        self.check_open()?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut deleted = 0usize;
        for chunk in ids.chunks(CHUNK_SIZE * 4) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM visibility_records WHERE id IN (");
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id);
            }
            sep.push_unseparated(")");
            deleted += qb.build().execute(&mut *tx).await.map_err(map_sqlx_error)?.rows_affected() as usize;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(deleted)
    }

    async fn delete_oldest(&self, limit: usize) -> Result<Vec<String>, StorageError> {
        self.check_open()?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let rows = sqlx::query(
            "SELECT id FROM visibility_records ORDER BY updated_at ASC, id ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let mut victims = Vec::with_capacity(rows.len());
        for row in &rows {
            victims.push(row.try_get::<String, _>("id").map_err(map_sqlx_error)?);
        }

        for chunk in victims.chunks(CHUNK_SIZE * 4) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM visibility_records WHERE id IN (");
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id);
            }
            sep.push_unseparated(")");
            qb.build().execute(&mut *tx).await.map_err(map_sqlx_error)?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(victims)
    }

    async fn page(&self, query: &PageQuery) -> Result<Vec<Record>, StorageError> {
        self.check_open()?;
        let rows = page_query("SELECT id, state, title, updated_at", query)
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        self.check_open()?;
        let rows = sqlx::query("SELECT state, COUNT(*) AS cnt FROM visibility_records GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut stats = StoreStats::default();
        for row in &rows {
            let state: String = row.try_get("state").map_err(map_sqlx_error)?;
            let count: i64 = row.try_get("cnt").map_err(map_sqlx_error)?;
            match VisibilityState::parse(&state) {
                Some(VisibilityState::Hidden) => stats.hidden += count as u64,
                Some(VisibilityState::Dimmed) => stats.dimmed += count as u64,
                _ => warn!(state = %state, count, "Ignoring rows with unexpected state"),
            }
            stats.total += count as u64;
        }
        Ok(stats)
    }

    async fn count(&self) -> Result<u64, StorageError> {
        self.check_open()?;
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM visibility_records")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let count: i64 = row.try_get("cnt").map_err(map_sqlx_error)?;
        Ok(count as u64)
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.check_open()?;
        sqlx::query("DELETE FROM visibility_records")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pool.close().await;
        debug!(path = %self.path.display(), "Record store closed");
    }

    fn close_now(&self) {
        self.closed.store(true, Ordering::Release);
        // Pool::close is async; hand it to the runtime without waiting. Without a
        // runtime the connections close when the last pool handle drops.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = self.pool.clone();
            handle.spawn(async move { pool.close().await });
        }
    }
}

/// Remove a SQLite file and its `-wal`/`-shm` companions.
pub(crate) fn remove_sqlite_files(path: &Path) -> std::io::Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut target = path.as_os_str().to_owned();
        target.push(suffix);
        match std::fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Opens SQLite record stores at a fixed path.
pub struct SqliteStoreFactory {
    path: PathBuf,
    options: SqliteOptions,
}

impl SqliteStoreFactory {
    pub fn new(path: impl Into<PathBuf>, options: SqliteOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }
}

#[async_trait]
impl StoreFactory for SqliteStoreFactory {
    async fn open(&self) -> Result<Arc<dyn RecordStore>, StorageError> {
        Ok(Arc::new(SqliteRecordStore::open(&self.path, &self.options).await?))
    }

    async fn destroy(&self) -> Result<(), StorageError> {
        warn!(path = %self.path.display(), "Destroying record store files");
        remove_sqlite_files(&self.path)
            .map_err(|e| StorageError::Permanent(format!("failed to remove store files: {}", e)))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}
