//! The versioned history store: sole source of truth for path-to-hash
//! mappings, per-path file records, and symlink edges.
//!
//! Mapping history is append-only. Each path has at most one open row
//! (`valid_to IS NULL`) at any instant — enforced by a partial unique index
//! so the invariant survives crashes and concurrent writers — and
//! consecutive rows are contiguous: a commit closes the open row and opens
//! the next one with the same boundary timestamp inside a single
//! transaction. Readers run on WAL snapshots and are never blocked by the
//! writer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::FromRow;
use tracing::{debug, warn};

use filetrail_model::{
    ContentHash, FileRecord, FileState, HashMapping, SymlinkEdge,
};

use crate::error::{Result, TrailError};

const DB_FILENAME: &str = "history.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a write against the mapping history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A new mapping row was opened (and any previous one closed).
    Recorded,
    /// The open mapping already matched; nothing was written.
    Unchanged,
    /// Nothing to do (e.g. deletion of a path with no history).
    Skipped,
}

/// Per-path answer for a current lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurrentEntry {
    Hash(ContentHash),
    /// The open mapping is the deletion sentinel.
    Deleted,
    /// No mapping exists for the path.
    Unknown,
}

/// Per-path answer for a point-in-time lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoricalEntry {
    Hash(ContentHash),
    /// The mapping covering the instant is the deletion sentinel.
    Deleted,
    /// No mapping covers the instant.
    NoRecord,
}

#[derive(Debug, FromRow)]
struct MappingRow {
    path: String,
    content_hash: Option<String>,
    valid_from: i64,
    valid_to: Option<i64>,
}

impl MappingRow {
    fn into_mapping(self) -> Result<HashMapping> {
        let content_hash = self
            .content_hash
            .map(|raw| {
                ContentHash::parse(&raw)
                    .map_err(|err| TrailError::Database(err.to_string()))
            })
            .transpose()?;
        Ok(HashMapping {
            path: PathBuf::from(self.path),
            content_hash,
            valid_from: millis_to_ts(self.valid_from)?,
            valid_to: self.valid_to.map(millis_to_ts).transpose()?,
        })
    }
}

#[derive(Debug, FromRow)]
struct FileRecordRow {
    path: String,
    size: i64,
    mtime: i64,
    state: String,
    content_hash: Option<String>,
    attempts: i64,
    last_stable_at: Option<i64>,
}

impl FileRecordRow {
    fn into_record(self) -> Result<FileRecord> {
        let state = FileState::parse(&self.state).ok_or_else(|| {
            TrailError::Database(format!("unknown file state: {}", self.state))
        })?;
        let content_hash = self
            .content_hash
            .map(|raw| {
                ContentHash::parse(&raw)
                    .map_err(|err| TrailError::Database(err.to_string()))
            })
            .transpose()?;
        Ok(FileRecord {
            path: PathBuf::from(self.path),
            size: self.size.max(0) as u64,
            mtime: self.mtime,
            state,
            content_hash,
            attempts: self.attempts.max(0) as u32,
            last_stable_at: self.last_stable_at.map(millis_to_ts).transpose()?,
        })
    }
}

/// Handle over the history database. Cheap to clone; all clones share the
/// underlying pool.
#[derive(Clone, Debug)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Path of the database file inside a store directory.
    pub fn db_path(dir: &Path) -> PathBuf {
        dir.join(DB_FILENAME)
    }

    /// Open the store read-write, creating the directory, database, and
    /// schema if needed. There should be exactly one writer process.
    pub async fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let options = SqliteConnectOptions::new()
            .filename(Self::db_path(dir))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|err| {
                TrailError::Database(format!(
                    "failed to open history store in {}: {err}",
                    dir.display()
                ))
            })?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open the store for the read side. Never creates or migrates
    /// anything; shares the file with a running writer through WAL
    /// snapshot isolation.
    pub async fn open_read_only(dir: &Path) -> Result<Self> {
        // The writer set WAL mode when it created the file; asking for it
        // again here would need write access.
        let options = SqliteConnectOptions::new()
            .filename(Self::db_path(dir))
            .busy_timeout(BUSY_TIMEOUT)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|err| {
                TrailError::Database(format!(
                    "failed to open history store read-only in {}: {err}",
                    dir.display()
                ))
            })?;
        Ok(Self { pool })
    }

    async fn init_schema(&self) -> Result<()> {
        for sql in [
            r#"
            CREATE TABLE IF NOT EXISTS hash_mappings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                content_hash TEXT,
                valid_from INTEGER NOT NULL,
                valid_to INTEGER
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_open_mapping
                ON hash_mappings (path) WHERE valid_to IS NULL
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_mapping_history
                ON hash_mappings (path, valid_from)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_mapping_reverse
                ON hash_mappings (content_hash) WHERE valid_to IS NULL
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS file_records (
                path TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                state TEXT NOT NULL,
                content_hash TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_stable_at INTEGER,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS symlink_edges (
                source TEXT PRIMARY KEY,
                target TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        ] {
            sqlx::query(sql).execute(&self.pool).await.map_err(|err| {
                TrailError::Database(format!("schema initialization failed: {err}"))
            })?;
        }
        Ok(())
    }

    /// Close the pool. Pending acquires fail afterwards.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ---- mapping writes -------------------------------------------------

    /// Record `hash` as the content of `path` as of `observed_at`.
    ///
    /// Atomically closes any open mapping and opens the new one in a single
    /// transaction, so the one-open-mapping and contiguity invariants hold
    /// even under a crash between the two sub-steps. Committing the hash
    /// the open mapping already carries is a no-op, which is what makes
    /// re-crawls of unchanged trees produce zero new rows.
    pub async fn commit(
        &self,
        path: &Path,
        hash: &ContentHash,
        observed_at: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        self.commit_inner(path, Some(hash.as_str()), observed_at).await
    }

    /// Record the deletion sentinel for `path`. A path with no history, or
    /// one already marked deleted, is left untouched — a file whose whole
    /// lifetime fit inside the settle window never reaches the history.
    pub async fn commit_deletion(
        &self,
        path: &Path,
        observed_at: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        self.commit_inner(path, None, observed_at).await
    }

    async fn commit_inner(
        &self,
        path: &Path,
        hash: Option<&str>,
        observed_at: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        // A losing writer retries against the latest committed row.
        // Per-path serialization upstream makes contention here rare.
        const ATTEMPTS: u32 = 3;
        for attempt in 0..ATTEMPTS {
            match self.try_commit(path, hash, observed_at).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if attempt + 1 < ATTEMPTS && is_commit_conflict(&err) => {
                    debug!(
                        path = %path.display(),
                        attempt,
                        "commit conflict, retrying against latest version"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        unreachable!("commit loop returns on its final attempt");
    }

    async fn try_commit(
        &self,
        path: &Path,
        hash: Option<&str>,
        observed_at: DateTime<Utc>,
    ) -> Result<CommitOutcome> {
        let path_text = path_text(path);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let open: Option<(i64, Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT id, content_hash, valid_from
            FROM hash_mappings
            WHERE path = ?1 AND valid_to IS NULL
            "#,
        )
        .bind(&path_text)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let boundary = match &open {
            Some((_, existing, _)) if existing.as_deref() == hash => {
                return Ok(CommitOutcome::Unchanged);
            }
            Some((id, _, valid_from)) => {
                // Clamp forward so history stays contiguous and strictly
                // ordered per path even if the wall clock stepped back.
                let boundary = ts_to_millis(observed_at).max(valid_from + 1);
                sqlx::query(
                    "UPDATE hash_mappings SET valid_to = ?1 WHERE id = ?2",
                )
                .bind(boundary)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                boundary
            }
            None => {
                if hash.is_none() {
                    // Deleting a path nobody ever recorded.
                    return Ok(CommitOutcome::Skipped);
                }
                ts_to_millis(observed_at)
            }
        };

        sqlx::query(
            r#"
            INSERT INTO hash_mappings (path, content_hash, valid_from, valid_to)
            VALUES (?1, ?2, ?3, NULL)
            "#,
        )
        .bind(&path_text)
        .bind(hash)
        .bind(boundary)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(CommitOutcome::Recorded)
    }

    // ---- mapping reads --------------------------------------------------

    /// The open mapping for `path`, if any.
    pub async fn open_mapping(&self, path: &Path) -> Result<Option<HashMapping>> {
        let row: Option<MappingRow> = sqlx::query_as(
            r#"
            SELECT path, content_hash, valid_from, valid_to
            FROM hash_mappings
            WHERE path = ?1 AND valid_to IS NULL
            "#,
        )
        .bind(path_text(path))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(MappingRow::into_mapping).transpose()
    }

    /// Complete history for `path`, oldest first.
    pub async fn history(&self, path: &Path) -> Result<Vec<HashMapping>> {
        let rows: Vec<MappingRow> = sqlx::query_as(
            r#"
            SELECT path, content_hash, valid_from, valid_to
            FROM hash_mappings
            WHERE path = ?1
            ORDER BY valid_from ASC
            "#,
        )
        .bind(path_text(path))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(MappingRow::into_mapping).collect()
    }

    /// Current hash for every requested path. Absent paths come back as
    /// [`CurrentEntry::Unknown`] rather than failing the batch.
    pub async fn current_lookup(
        &self,
        paths: &[PathBuf],
    ) -> Result<HashMap<PathBuf, CurrentEntry>> {
        let mut out = HashMap::with_capacity(paths.len());
        for path in paths {
            let entry = match self.open_mapping(path).await? {
                Some(mapping) => match mapping.content_hash {
                    Some(hash) => CurrentEntry::Hash(hash),
                    None => CurrentEntry::Deleted,
                },
                None => CurrentEntry::Unknown,
            };
            out.insert(path.clone(), entry);
        }
        Ok(out)
    }

    /// Hash valid at instant `at` for every requested path.
    pub async fn historical_lookup(
        &self,
        paths: &[PathBuf],
        at: DateTime<Utc>,
    ) -> Result<HashMap<PathBuf, HistoricalEntry>> {
        let at_ms = ts_to_millis(at);
        let mut out = HashMap::with_capacity(paths.len());
        for path in paths {
            let row: Option<MappingRow> = sqlx::query_as(
                r#"
                SELECT path, content_hash, valid_from, valid_to
                FROM hash_mappings
                WHERE path = ?1
                  AND valid_from <= ?2
                  AND (valid_to IS NULL OR valid_to > ?2)
                ORDER BY valid_from DESC
                LIMIT 1
                "#,
            )
            .bind(path_text(path))
            .bind(at_ms)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            let entry = match row {
                Some(row) => match row.into_mapping()?.content_hash {
                    Some(hash) => HistoricalEntry::Hash(hash),
                    None => HistoricalEntry::Deleted,
                },
                None => HistoricalEntry::NoRecord,
            };
            out.insert(path.clone(), entry);
        }
        Ok(out)
    }

    /// Paths currently mapped to each requested hash. Costs an index probe
    /// per hash; deleted paths drop out because the sentinel row carries no
    /// hash.
    pub async fn reverse_lookup(
        &self,
        hashes: &[ContentHash],
    ) -> Result<BTreeMap<ContentHash, BTreeSet<PathBuf>>> {
        let mut out = BTreeMap::new();
        for hash in hashes {
            let rows: Vec<(String,)> = sqlx::query_as(
                r#"
                SELECT path FROM hash_mappings
                WHERE content_hash = ?1 AND valid_to IS NULL
                "#,
            )
            .bind(hash.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
            out.insert(
                hash.clone(),
                rows.into_iter().map(|(p,)| PathBuf::from(p)).collect(),
            );
        }
        Ok(out)
    }

    // ---- file records ---------------------------------------------------

    pub async fn file_record(&self, path: &Path) -> Result<Option<FileRecord>> {
        let row: Option<FileRecordRow> = sqlx::query_as(
            r#"
            SELECT path, size, mtime, state, content_hash, attempts, last_stable_at
            FROM file_records
            WHERE path = ?1
            "#,
        )
        .bind(path_text(path))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(FileRecordRow::into_record).transpose()
    }

    /// All records whose path falls under `root`.
    pub async fn file_records_under(&self, root: &Path) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRecordRow> = sqlx::query_as(
            r#"
            SELECT path, size, mtime, state, content_hash, attempts, last_stable_at
            FROM file_records
            WHERE path = ?1 OR path LIKE ?2
            "#,
        )
        .bind(path_text(root))
        .bind(like_prefix(root))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(FileRecordRow::into_record).collect()
    }

    pub async fn upsert_file_record(&self, record: &FileRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_records
                (path, size, mtime, state, content_hash, attempts, last_stable_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (path) DO UPDATE SET
                size = excluded.size,
                mtime = excluded.mtime,
                state = excluded.state,
                content_hash = excluded.content_hash,
                attempts = excluded.attempts,
                last_stable_at = excluded.last_stable_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(path_text(&record.path))
        .bind(record.size as i64)
        .bind(record.mtime)
        .bind(record.state.as_str())
        .bind(record.content_hash.as_ref().map(ContentHash::as_str))
        .bind(record.attempts as i64)
        .bind(record.last_stable_at.map(ts_to_millis))
        .bind(ts_to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn remove_file_record(&self, path: &Path) -> Result<()> {
        sqlx::query("DELETE FROM file_records WHERE path = ?1")
            .bind(path_text(path))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // ---- symlink edges --------------------------------------------------

    pub async fn upsert_symlink_edge(&self, edge: &SymlinkEdge) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO symlink_edges (source, target, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (source) DO UPDATE SET
                target = excluded.target,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(path_text(&edge.source))
        .bind(path_text(&edge.target))
        .bind(ts_to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn remove_symlink_edge(&self, source: &Path) -> Result<()> {
        sqlx::query("DELETE FROM symlink_edges WHERE source = ?1")
            .bind(path_text(source))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn symlink_target(&self, source: &Path) -> Result<Option<PathBuf>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT target FROM symlink_edges WHERE source = ?1",
        )
        .bind(path_text(source))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|(target,)| PathBuf::from(target)))
    }

    /// All edges whose source falls under `root`.
    pub async fn symlink_edges_under(&self, root: &Path) -> Result<Vec<SymlinkEdge>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT source, target FROM symlink_edges
            WHERE source = ?1 OR source LIKE ?2
            "#,
        )
        .bind(path_text(root))
        .bind(like_prefix(root))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|(source, target)| SymlinkEdge {
                source: PathBuf::from(source),
                target: PathBuf::from(target),
            })
            .collect())
    }
}

fn db_err(err: sqlx::Error) -> TrailError {
    TrailError::Database(err.to_string())
}

fn is_commit_conflict(err: &TrailError) -> bool {
    // Losing a same-path race surfaces either as the partial unique index
    // firing or as a lock upgrade failure, depending on interleaving.
    matches!(err, TrailError::Database(msg) if msg.contains("idx_open_mapping")
        || msg.contains("UNIQUE constraint")
        || msg.contains("database is locked"))
}

fn path_text(path: &Path) -> String {
    match path.to_str() {
        Some(text) => text.to_string(),
        None => {
            warn!(path = %path.display(), "non-UTF-8 path stored lossily");
            path.to_string_lossy().into_owned()
        }
    }
}

fn like_prefix(root: &Path) -> String {
    // Escape is unnecessary for '/'-separated absolute roots without
    // wildcards; patterns with % or _ in the root would over-match, which
    // only costs a few extra rows in the reconcile pass.
    format!("{}/%", path_text(root).trim_end_matches('/'))
}

fn ts_to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn millis_to_ts(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| TrailError::Database(format!("timestamp out of range: {ms}")))
}
