//! # Filetrail Core
//!
//! Core library for filetrail: a durable, queryable, historically-versioned
//! mapping between filesystem paths and content hashes, kept current under
//! continuous filesystem churn without blocking readers.
//!
//! ## Overview
//!
//! The write side ([`Updater`]) turns raw filesystem notifications into a
//! gap-free append-only history of path-to-hash mappings:
//!
//! - [`watcher`]: live change notifications over the configured roots,
//!   normalized into [`filetrail_model::ChangeEvent`]s, with explicit
//!   overflow signalling when the notification channel drops events
//! - [`crawler`]: full/incremental enumeration that bootstraps state and
//!   reconciles it after overflows
//! - [`settler`]: per-path debounce timers that coalesce bursts and keep
//!   short-lived files from ever being hashed
//! - [`hasher`]: a bounded worker pool that digests settled files and
//!   commits the results
//! - [`store`]: the transactional history store, sole source of truth
//!
//! The read side ([`QueryService`]) runs as an independent process against
//! the same database file and serves batch current, point-in-time, and
//! reverse lookups, resolving symlink chains through [`resolver`].
//!
//! ## Example
//!
//! ```no_run
//! use filetrail_config::TrailConfig;
//! use filetrail_core::Updater;
//!
//! async fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let (config, _source) = TrailConfig::load_from_env()?;
//!     let updater = Updater::start(config.into_settings()?).await?;
//!     // ... let it ingest; shut down on your own signal handling
//!     updater.shutdown().await?;
//!     Ok(())
//! }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Full and scoped filesystem enumeration
pub mod crawler;

/// Error types and error handling utilities
pub mod error;

/// Content digests and the bounded hashing worker pool
pub mod hasher;

/// Batch read-side lookups
pub mod query;

/// Lazy symlink-chain resolution
pub mod resolver;

/// Per-path debounce timers
pub mod settler;

/// The versioned history store
pub mod store;

/// Write-side composition and lifecycle
pub mod updater;

/// Live change notifications
pub mod watcher;

pub use crawler::{Crawler, CrawlSummary};
pub use error::{Result, TrailError};
pub use hasher::{HashTask, HasherPool, HasherPoolConfig, TaskAction, compute_hash};
pub use query::{PathLookup, QueryService};
pub use resolver::{FsLinkReader, LinkReader, PathResolver, MAX_HOPS};
pub use settler::{Settler, SettlerConfig, SettlerHandle};
pub use store::{CommitOutcome, CurrentEntry, HistoricalEntry, HistoryStore};
pub use updater::Updater;
pub use watcher::Watcher;
