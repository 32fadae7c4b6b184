//! Batch read-side lookups.
//!
//! The query service is the read half of the system: it opens its own
//! read-only connection over the history database and never talks to the
//! updater — storage snapshot isolation is the only contract between the
//! two processes, so a stalled query cannot stall ingestion and vice
//! versa. Misses are per-entry answers, never request-level failures.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use filetrail_model::ContentHash;

use crate::error::Result;
use crate::resolver::{FsLinkReader, LinkReader, PathResolver};
use crate::store::{CurrentEntry, HistoricalEntry, HistoryStore};

/// Per-entry answer for a path lookup. `Unknown` is the current-lookup
/// miss, `NoRecord` the point-in-time miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathLookup {
    Hash(ContentHash),
    Deleted,
    Unknown,
    NoRecord,
    /// Symlink resolution failed for this entry (cycle or hop limit); the
    /// rest of the batch is unaffected.
    Unresolvable(String),
}

/// Read-side service over a history database.
#[derive(Debug, Clone)]
pub struct QueryService<R: LinkReader = FsLinkReader> {
    store: HistoryStore,
    resolver: PathResolver<R>,
}

impl QueryService<FsLinkReader> {
    /// Open the database read-only. `scope` lists the watched roots so the
    /// resolver knows which prefixes the edge set is authoritative for.
    pub async fn open(store_dir: &Path, scope: Vec<PathBuf>) -> Result<Self> {
        let store = HistoryStore::open_read_only(store_dir).await?;
        Ok(Self::with_store(store, scope))
    }

    /// Wrap an already-open store; used by in-process embedders and tests.
    pub fn with_store(store: HistoryStore, scope: Vec<PathBuf>) -> Self {
        let resolver = PathResolver::new(store.clone(), scope);
        Self { store, resolver }
    }
}

impl<R: LinkReader> QueryService<R> {
    pub fn with_resolver(store: HistoryStore, resolver: PathResolver<R>) -> Self {
        Self { store, resolver }
    }

    /// Current hash for each requested path, keyed by the path as the
    /// caller wrote it.
    pub async fn current(
        &self,
        paths: &[PathBuf],
    ) -> Result<BTreeMap<PathBuf, PathLookup>> {
        let mut out = BTreeMap::new();
        for requested in paths {
            let canonical = match self.resolver.resolve(requested).await {
                Ok(canonical) => canonical,
                Err(err) => {
                    out.insert(
                        requested.clone(),
                        PathLookup::Unresolvable(err.to_string()),
                    );
                    continue;
                }
            };
            let looked_up = self
                .store
                .current_lookup(std::slice::from_ref(&canonical))
                .await?;
            let entry = match looked_up.into_values().next() {
                Some(CurrentEntry::Hash(hash)) => PathLookup::Hash(hash),
                Some(CurrentEntry::Deleted) => PathLookup::Deleted,
                _ => PathLookup::Unknown,
            };
            out.insert(requested.clone(), entry);
        }
        Ok(out)
    }

    /// Hash valid at instant `at` for each requested path.
    pub async fn at_time(
        &self,
        paths: &[PathBuf],
        at: DateTime<Utc>,
    ) -> Result<BTreeMap<PathBuf, PathLookup>> {
        let mut out = BTreeMap::new();
        for requested in paths {
            let canonical = match self.resolver.resolve(requested).await {
                Ok(canonical) => canonical,
                Err(err) => {
                    out.insert(
                        requested.clone(),
                        PathLookup::Unresolvable(err.to_string()),
                    );
                    continue;
                }
            };
            let looked_up = self
                .store
                .historical_lookup(std::slice::from_ref(&canonical), at)
                .await?;
            let entry = match looked_up.into_values().next() {
                Some(HistoricalEntry::Hash(hash)) => PathLookup::Hash(hash),
                Some(HistoricalEntry::Deleted) => PathLookup::Deleted,
                _ => PathLookup::NoRecord,
            };
            out.insert(requested.clone(), entry);
        }
        Ok(out)
    }

    /// Paths currently mapped to each requested hash. A hash nobody maps
    /// to comes back with an empty set.
    pub async fn reverse(
        &self,
        hashes: &[ContentHash],
    ) -> Result<BTreeMap<ContentHash, BTreeSet<PathBuf>>> {
        self.store.reverse_lookup(hashes).await
    }
}
