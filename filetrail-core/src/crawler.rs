//! Full and scoped filesystem enumeration.
//!
//! The crawler bootstraps state at startup and reconciles it whenever the
//! watcher reports overflow: it walks a root (or a subdirectory of one),
//! compares what is on disk against the stored file records, and feeds the
//! differences into the same event channel the watcher uses. Unchanged
//! files are pre-filtered on size+mtime so they are never re-hashed; stored
//! records with no on-disk counterpart become deletion events; symlink
//! edges are brought in sync with the link targets actually present.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use filetrail_model::{
    ChangeEvent, ChangeKind, FileRecord, FileState, SymlinkEdge, SymlinkPolicy,
    WatchRoot,
};

use crate::error::{Result, TrailError};
use crate::hasher::file_identity;
use crate::store::HistoryStore;

/// Outcome counters for one crawl pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    /// Regular files inspected.
    pub files_seen: usize,
    /// Created events emitted (new, changed, or errored-and-retried files).
    pub files_emitted: usize,
    /// Deleted events emitted for records with no on-disk counterpart.
    pub deletions_emitted: usize,
    /// Symlink edges inserted or updated.
    pub edges_recorded: usize,
    /// Stale symlink edges removed.
    pub edges_removed: usize,
    /// Unreadable entries skipped.
    pub errors: usize,
}

enum Discovered {
    File { path: PathBuf, size: u64, mtime: i64 },
    Symlink { path: PathBuf, target: PathBuf },
}

/// Enumerates watched trees and reconciles them against the store.
#[derive(Debug, Clone)]
pub struct Crawler {
    store: HistoryStore,
    events: mpsc::Sender<ChangeEvent>,
}

impl Crawler {
    pub fn new(store: HistoryStore, events: mpsc::Sender<ChangeEvent>) -> Self {
        Self { store, events }
    }

    /// Crawl an entire root. Runs at startup and after watch overflow.
    pub async fn crawl_root(&self, root: &WatchRoot) -> Result<CrawlSummary> {
        self.crawl(root, root.path.clone()).await
    }

    /// Crawl one subdirectory of a root, e.g. a directory that appeared
    /// while watch coverage was still being established. Deletion detection
    /// is likewise limited to the scope.
    pub async fn crawl_dir(
        &self,
        root: &WatchRoot,
        dir: &Path,
    ) -> Result<CrawlSummary> {
        if !root.contains(dir) {
            return Err(TrailError::Internal(format!(
                "crawl scope {} is outside root {}",
                dir.display(),
                root.path.display()
            )));
        }
        self.crawl(root, dir.to_path_buf()).await
    }

    async fn crawl(&self, root: &WatchRoot, scope: PathBuf) -> Result<CrawlSummary> {
        let mut summary = CrawlSummary::default();
        debug!(scope = %scope.display(), "crawl started");

        let walk_root = root.clone();
        let walk_scope = scope.clone();
        let (discovered, walk_errors) =
            spawn_blocking(move || enumerate(&walk_root, &walk_scope))
                .await
                .map_err(|err| {
                    TrailError::Internal(format!("crawl worker panicked: {err}"))
                })?;
        summary.errors = walk_errors;

        let mut known: HashMap<PathBuf, FileRecord> = self
            .store
            .file_records_under(&scope)
            .await?
            .into_iter()
            .map(|record| (record.path.clone(), record))
            .collect();

        let mut known_links: HashMap<PathBuf, PathBuf> = self
            .store
            .symlink_edges_under(&scope)
            .await?
            .into_iter()
            .map(|edge| (edge.source, edge.target))
            .collect();

        for entry in discovered {
            match entry {
                Discovered::File { path, size, mtime } => {
                    summary.files_seen += 1;
                    let record = known.remove(&path);
                    if known_links.remove(&path).is_some() {
                        // Was a symlink, now a regular file.
                        self.store.remove_symlink_edge(&path).await?;
                        summary.edges_removed += 1;
                    }
                    let unchanged = record.is_some_and(|record| {
                        record.state == FileState::Hashed
                            && record.matches(size, mtime)
                    });
                    if unchanged {
                        continue;
                    }
                    self.emit(
                        ChangeEvent::new(root.path.clone(), path, ChangeKind::Created),
                    )
                    .await?;
                    summary.files_emitted += 1;
                }
                Discovered::Symlink { path, target } => {
                    known.remove(&path);
                    let stale = known_links.remove(&path).map(|t| t != target);
                    if stale.unwrap_or(true) {
                        self.store
                            .upsert_symlink_edge(&SymlinkEdge {
                                source: path,
                                target,
                            })
                            .await?;
                        summary.edges_recorded += 1;
                    }
                }
            }
        }

        // Records with no on-disk counterpart: the path vanished while we
        // were not looking.
        for (path, _) in known {
            self.emit(ChangeEvent::new(
                root.path.clone(),
                path,
                ChangeKind::Deleted,
            ))
            .await?;
            summary.deletions_emitted += 1;
        }

        // Edges whose link no longer exists.
        for (source, _) in known_links {
            self.store.remove_symlink_edge(&source).await?;
            summary.edges_removed += 1;
        }

        info!(
            scope = %scope.display(),
            seen = summary.files_seen,
            emitted = summary.files_emitted,
            deleted = summary.deletions_emitted,
            errors = summary.errors,
            "crawl finished"
        );
        Ok(summary)
    }

    async fn emit(&self, event: ChangeEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| TrailError::Cancelled("event channel closed".into()))
    }
}

fn enumerate(root: &WatchRoot, scope: &Path) -> (Vec<Discovered>, usize) {
    let mut out = Vec::new();
    let mut errors = 0usize;

    let walker = WalkDir::new(scope).follow_links(false).into_iter();
    let mut iter = walker.filter_entry(|entry| {
        !(entry.file_type().is_dir() && root.ignore.skips_dir(entry.path()))
    });

    loop {
        let entry = match iter.next() {
            None => break,
            Some(Err(err)) => {
                warn!(error = %err, "unreadable entry during crawl");
                errors += 1;
                continue;
            }
            Some(Ok(entry)) => entry,
        };

        let file_type = entry.file_type();
        let path = entry.path();

        if file_type.is_file() {
            if root.ignore.skips_file(path) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => {
                    let (size, mtime) = file_identity(&meta);
                    out.push(Discovered::File {
                        path: path.to_path_buf(),
                        size,
                        mtime,
                    });
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "stat failed");
                    errors += 1;
                }
            }
        } else if file_type.is_symlink() {
            if root.symlink_policy == SymlinkPolicy::Ignore
                || root.ignore.skips_file(path)
            {
                continue;
            }
            match std::fs::read_link(path) {
                Ok(target) => out.push(Discovered::Symlink {
                    path: path.to_path_buf(),
                    target,
                }),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "read_link failed");
                    errors += 1;
                }
            }
        }
    }

    (out, errors)
}
