use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::hash::ContentHash;

/// Lifecycle state of an observed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FileState {
    /// Seen, but not yet hashed since the last change.
    #[default]
    Pending,
    /// The open mapping reflects the on-disk content.
    Hashed,
    /// Hashing gave up (retry budget exhausted or permission denied);
    /// excluded from watch-driven retries until the next crawl.
    Errored,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Pending => "pending",
            FileState::Hashed => "hashed",
            FileState::Errored => "errored",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(FileState::Pending),
            "hashed" => Some(FileState::Hashed),
            "errored" => Some(FileState::Errored),
            _ => None,
        }
    }
}

/// Current per-path bookkeeping used by the write side.
///
/// One record per observed path. Size and mtime feed the crawler's metadata
/// pre-filter so unchanged files are never re-hashed; `attempts` tracks the
/// transient-failure retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time in whole seconds, as reported by the filesystem.
    pub mtime: i64,
    pub state: FileState,
    pub content_hash: Option<ContentHash>,
    pub attempts: u32,
    pub last_stable_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn pending(path: PathBuf, size: u64, mtime: i64) -> Self {
        Self {
            path,
            size,
            mtime,
            state: FileState::Pending,
            content_hash: None,
            attempts: 0,
            last_stable_at: None,
        }
    }

    /// Whether on-disk metadata matches what we recorded at last hash time.
    pub fn matches(&self, size: u64, mtime: i64) -> bool {
        self.size == size && self.mtime == mtime
    }
}
