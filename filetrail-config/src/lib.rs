//! Configuration models and loading for filetrail.
//!
//! The core treats configuration as immutable input supplied at startup:
//! watch roots, exclusion rules, the settle duration, the hash algorithm,
//! and hasher pool sizing. This crate owns the serde surface (TOML or JSON),
//! the ordered search paths, and validation into the model types the core
//! consumes.
#![allow(missing_docs)]

pub mod models;

pub use models::{
    ConfigSource, ExcludeConfig, HashingConfig, RootEntry, Settings,
    StoreConfig, SymlinkMode, TimesConfig, TrailConfig,
};
