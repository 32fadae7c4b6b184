//! Core data model definitions shared across filetrail crates.
//!
//! Everything in here is plain data: content hashes and the algorithms that
//! produce them, filesystem change events, versioned path-to-hash mappings,
//! per-path bookkeeping records, and the watch-root configuration the
//! pipeline is built around. Behaviour (watching, hashing, storage) lives in
//! `filetrail-core`.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod error;
pub mod event;
pub mod hash;
pub mod mapping;
pub mod record;
pub mod watch;

pub use error::{ModelError, Result as ModelResult};
pub use event::{ChangeEvent, ChangeKind};
pub use hash::{ContentHash, HashAlgorithm};
pub use mapping::HashMapping;
pub use record::{FileRecord, FileState};
pub use watch::{IgnoreRules, SymlinkEdge, SymlinkPolicy, WatchRoot};
