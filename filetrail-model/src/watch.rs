use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::{ModelError, Result};

/// How symlinks found under a watch root are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum SymlinkPolicy {
    /// Record the link as an edge for lazy query-time resolution.
    #[default]
    Record,
    /// Pretend the link does not exist.
    Ignore,
}

/// A directed symlink edge. The edge set must form a DAG; resolution
/// enforces a hop bound and rejects cycles instead of looping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SymlinkEdge {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Exclusion rules applied before any event is emitted or any file visited.
///
/// Three tiers, checked cheapest first: exact path matches, directory-name
/// matches (pruning whole subtrees), and regular expressions over the full
/// path.
#[derive(Clone, Default)]
pub struct IgnoreRules {
    exact_paths: Vec<PathBuf>,
    directory_names: Vec<String>,
    patterns: Vec<Regex>,
}

impl IgnoreRules {
    pub fn new(
        exact_paths: Vec<PathBuf>,
        directory_names: Vec<String>,
        patterns: &[String],
    ) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let regex = Regex::new(pattern).map_err(|err| ModelError::InvalidPattern {
                pattern: pattern.clone(),
                reason: err.to_string(),
            })?;
            compiled.push(regex);
        }
        Ok(Self {
            exact_paths,
            directory_names,
            patterns: compiled,
        })
    }

    /// Whether descent into `path` (a directory) should be skipped.
    pub fn skips_dir(&self, path: &Path) -> bool {
        if self.exact_paths.iter().any(|p| p == path) {
            return true;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && self.directory_names.iter().any(|d| d == name)
        {
            return true;
        }
        self.matches_pattern(path)
    }

    /// Whether `path` (a file or symlink) should be skipped.
    pub fn skips_file(&self, path: &Path) -> bool {
        self.exact_paths.iter().any(|p| p == path) || self.matches_pattern(path)
    }

    fn matches_pattern(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.patterns.iter().any(|regex| regex.is_match(&text))
    }

    pub fn is_empty(&self) -> bool {
        self.exact_paths.is_empty()
            && self.directory_names.is_empty()
            && self.patterns.is_empty()
    }
}

impl fmt::Debug for IgnoreRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IgnoreRules")
            .field("exact_paths", &self.exact_paths.len())
            .field("directory_names", &self.directory_names)
            .field(
                "patterns",
                &self
                    .patterns
                    .iter()
                    .map(|regex| regex.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A configured root to track. Immutable after load.
#[derive(Debug, Clone)]
pub struct WatchRoot {
    pub path: PathBuf,
    pub ignore: IgnoreRules,
    pub symlink_policy: SymlinkPolicy,
}

impl WatchRoot {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            ignore: IgnoreRules::default(),
            symlink_policy: SymlinkPolicy::default(),
        }
    }

    pub fn with_ignore(mut self, ignore: IgnoreRules) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_symlink_policy(mut self, policy: SymlinkPolicy) -> Self {
        self.symlink_policy = policy;
        self
    }

    /// Whether `path` falls under this root.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_name_rules_prune_subtrees() {
        let rules =
            IgnoreRules::new(vec![], vec![".git".to_string()], &[]).unwrap();
        assert!(rules.skips_dir(Path::new("/repo/.git")));
        assert!(!rules.skips_dir(Path::new("/repo/src")));
    }

    #[test]
    fn pattern_rules_apply_to_files_and_dirs() {
        let rules = IgnoreRules::new(
            vec![PathBuf::from("/swap/swapfile")],
            vec![],
            &[r"\.tmp$".to_string(), r"/cache/".to_string()],
        )
        .unwrap();
        assert!(rules.skips_file(Path::new("/data/x.tmp")));
        assert!(rules.skips_file(Path::new("/swap/swapfile")));
        assert!(rules.skips_dir(Path::new("/data/cache/objects")));
        assert!(!rules.skips_file(Path::new("/data/x.txt")));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(IgnoreRules::new(vec![], vec![], &["[".to_string()]).is_err());
    }
}
