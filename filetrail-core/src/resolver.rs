//! Lazy symlink-chain resolution.
//!
//! Paths handed to the read side may contain symlink components. Resolution
//! walks the path prefix by prefix against the recorded edge set — edges
//! are resolved at query time, never flattened into history, so a link
//! change never rewrites historical rows. Prefixes outside watched scope
//! fall back to direct filesystem inspection through [`LinkReader`], the
//! seam an embedder can replace. The walk is bounded: more than
//! [`MAX_HOPS`] substitutions or a revisited link is an error, never a
//! loop.

use std::collections::{HashSet, VecDeque};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::trace;

use crate::error::{Result, TrailError};
use crate::store::HistoryStore;

/// Upper bound on link substitutions for a single resolution.
pub const MAX_HOPS: usize = 40;

/// Fallback link inspection for prefixes outside watched scope.
pub trait LinkReader: Send + Sync {
    /// `Ok(Some(target))` when `path` is a symlink, `Ok(None)` when it is
    /// not (or does not exist).
    fn read_link(&self, path: &Path) -> std::io::Result<Option<PathBuf>>;
}

/// The real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsLinkReader;

impl LinkReader for FsLinkReader {
    fn read_link(&self, path: &Path) -> std::io::Result<Option<PathBuf>> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                std::fs::read_link(path).map(Some)
            }
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Resolves paths to their canonical watched-scope form.
#[derive(Debug, Clone)]
pub struct PathResolver<R = FsLinkReader> {
    store: HistoryStore,
    scope: Vec<PathBuf>,
    reader: R,
}

impl PathResolver<FsLinkReader> {
    pub fn new(store: HistoryStore, scope: Vec<PathBuf>) -> Self {
        Self::with_reader(store, scope, FsLinkReader)
    }
}

impl<R: LinkReader> PathResolver<R> {
    pub fn with_reader(store: HistoryStore, scope: Vec<PathBuf>, reader: R) -> Self {
        Self {
            store,
            scope,
            reader,
        }
    }

    /// Canonicalize `path` through the edge set. Terminates within
    /// [`MAX_HOPS`] substitutions; cycles fail fast.
    pub async fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let mut queue: VecDeque<PathComponent> = decompose(path);
        let mut resolved = PathBuf::new();
        let mut hops = 0usize;
        let mut visited: HashSet<PathBuf> = HashSet::new();

        while let Some(component) = queue.pop_front() {
            match component {
                PathComponent::Root => resolved = PathBuf::from("/"),
                PathComponent::Parent => {
                    resolved.pop();
                }
                PathComponent::Normal(seg) => resolved.push(seg),
            }

            let Some(target) = self.link_target(&resolved).await? else {
                continue;
            };

            hops += 1;
            if hops > MAX_HOPS {
                return Err(TrailError::Resolution(format!(
                    "hop limit ({MAX_HOPS}) exceeded resolving {}",
                    path.display()
                )));
            }
            if !visited.insert(resolved.clone()) {
                return Err(TrailError::Resolution(format!(
                    "symlink cycle at {} resolving {}",
                    resolved.display(),
                    path.display()
                )));
            }

            // Rebase: an absolute target restarts from the filesystem
            // root; a relative one resolves against the link's parent.
            // Either way the substituted prefix goes back through the walk
            // so nested links and dot-dot segments are handled uniformly.
            let rebased = if target.is_absolute() {
                target
            } else {
                let mut base = resolved.clone();
                base.pop();
                base.join(target)
            };
            trace!(
                link = %resolved.display(),
                target = %rebased.display(),
                "substituting symlink prefix"
            );

            let mut replacement = decompose(&rebased);
            replacement.append(&mut queue);
            queue = replacement;
            resolved = PathBuf::new();
        }

        Ok(resolved)
    }

    async fn link_target(&self, prefix: &Path) -> Result<Option<PathBuf>> {
        if prefix.as_os_str().is_empty() || prefix == Path::new("/") {
            return Ok(None);
        }
        if self.in_scope(prefix) {
            self.store.symlink_target(prefix).await
        } else {
            Ok(self.reader.read_link(prefix)?)
        }
    }

    fn in_scope(&self, path: &Path) -> bool {
        self.scope.iter().any(|root| path.starts_with(root))
    }
}

enum PathComponent {
    Root,
    Parent,
    Normal(OsString),
}

fn decompose(path: &Path) -> VecDeque<PathComponent> {
    path.components()
        .filter_map(|component| match component {
            Component::RootDir => Some(PathComponent::Root),
            Component::ParentDir => Some(PathComponent::Parent),
            Component::Normal(seg) => {
                Some(PathComponent::Normal(seg.to_os_string()))
            }
            Component::CurDir | Component::Prefix(_) => None,
        })
        .collect()
}
