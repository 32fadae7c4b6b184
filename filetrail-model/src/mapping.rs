use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::hash::ContentHash;

/// One row of the append-only path history.
///
/// `valid_to == None` marks the open (currently active) mapping;
/// `content_hash == None` is the deletion sentinel. Rows are never mutated
/// after insertion except to close `valid_to` on supersession, and
/// consecutive rows for a path are contiguous: each `valid_from` equals the
/// previous row's `valid_to`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HashMapping {
    pub path: PathBuf,
    pub content_hash: Option<ContentHash>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

impl HashMapping {
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    pub fn is_deletion(&self) -> bool {
        self.content_hash.is_none()
    }

    /// Whether this mapping was the active one at instant `at`.
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_to.is_none_or(|until| at < until)
    }
}
