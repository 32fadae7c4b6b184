use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Normalized classification of a filesystem notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
    /// The notification channel dropped events; state for the affected root
    /// can no longer be trusted and must be re-crawled.
    Overflow,
}

/// A single normalized change produced by the watcher or the crawler.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChangeEvent {
    /// Affected path; for `Overflow` this is the watch root itself.
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Previous path for `Moved` events, when the backend reported one.
    pub old_path: Option<PathBuf>,
    /// Watch root the event belongs to.
    pub root: PathBuf,
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(root: PathBuf, path: PathBuf, kind: ChangeKind) -> Self {
        Self {
            path,
            kind,
            old_path: None,
            root,
            observed_at: Utc::now(),
        }
    }

    pub fn moved(root: PathBuf, from: PathBuf, to: PathBuf) -> Self {
        Self {
            path: to,
            kind: ChangeKind::Moved,
            old_path: Some(from),
            root,
            observed_at: Utc::now(),
        }
    }

    pub fn overflow(root: PathBuf) -> Self {
        Self {
            path: root.clone(),
            kind: ChangeKind::Overflow,
            old_path: None,
            root,
            observed_at: Utc::now(),
        }
    }
}
