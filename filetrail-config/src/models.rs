use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use filetrail_model::{HashAlgorithm, IgnoreRules, SymlinkPolicy, WatchRoot};

/// Source that produced the loaded configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// One tracked root. `symlinks = "ignore"` drops links instead of recording
/// them as resolution edges.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RootEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub symlinks: SymlinkMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SymlinkMode {
    #[default]
    Record,
    Ignore,
}

/// Exclusion tiers, cheapest checked first: exact paths, directory names
/// (pruning whole subtrees), and regular expressions over the full path.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ExcludeConfig {
    pub paths: Vec<PathBuf>,
    pub directories: Vec<String>,
    pub patterns: Vec<String>,
}

/// Where the history database lives.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let dir = env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".filetrail"))
            .unwrap_or_else(|| PathBuf::from(".filetrail"));
        Self { dir }
    }
}

/// Timing knobs. `settle_secs` is the quiet period a path must survive
/// untouched before it is hashed; bursts within the window coalesce into a
/// single commit, and files whose whole lifetime is shorter never get
/// hashed at all.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimesConfig {
    pub settle_secs: f64,
}

impl Default for TimesConfig {
    fn default() -> Self {
        Self { settle_secs: 30.0 }
    }
}

/// Hashing knobs. `workers = 0` sizes the pool to the CPU count.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HashingConfig {
    pub algorithm: String,
    pub workers: usize,
    /// Transient-failure retries before a path is marked errored.
    pub retry_budget: u32,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::default().as_str().to_string(),
            workers: 0,
            retry_budget: 5,
        }
    }
}

/// Top-level filetrail configuration, loaded once at startup and treated as
/// immutable by the core.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TrailConfig {
    pub roots: Vec<RootEntry>,
    pub exclude: ExcludeConfig,
    pub store: StoreConfig,
    pub times: TimesConfig,
    pub hashing: HashingConfig,
}

impl TrailConfig {
    /// Load configuration using environment variables. Evaluation order:
    /// 1) `$FILETRAIL_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$FILETRAIL_CONFIG_JSON` (inline JSON),
    /// 3) the first existing default search path,
    /// 4) defaults if none of the above is set.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        if let Ok(path_str) = env::var("FILETRAIL_CONFIG_PATH")
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var("FILETRAIL_CONFIG_JSON")
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw)
                .context("failed to parse FILETRAIL_CONFIG_JSON")?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file() {
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read config from {}", path.display())
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid config {}", path.display())),
            Some("toml") | Some("tml") => {
                toml::from_str(&contents).map_err(|err| {
                    anyhow!("invalid config {}: {}", path.display(), err)
                })
            }
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        // Try TOML first, then JSON for convenience.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| anyhow!("invalid config json: {err}"))
    }

    /// Search paths, most local first: working directory, then per-user,
    /// then system-wide.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut candidates = vec![
            PathBuf::from("filetrail.toml"),
            PathBuf::from("filetrail.json"),
            PathBuf::from("config/filetrail.toml"),
        ];
        if let Some(home) = env::var_os("HOME") {
            candidates
                .push(PathBuf::from(home).join(".config/filetrail/config.toml"));
        }
        candidates.push(PathBuf::from("/etc/filetrail/config.toml"));
        candidates
    }

    fn find_default_file() -> Option<PathBuf> {
        Self::search_paths().into_iter().find(|path| path.exists())
    }

    /// Validate and lower into the settings the core consumes. Compiles
    /// ignore patterns, resolves the algorithm identifier, and sizes the
    /// worker pool.
    pub fn into_settings(self) -> anyhow::Result<Settings> {
        if self.roots.is_empty() {
            return Err(anyhow!("configuration lists no roots to track"));
        }

        let ignore = IgnoreRules::new(
            self.exclude.paths,
            self.exclude.directories,
            &self.exclude.patterns,
        )
        .map_err(|err| anyhow!("{err}"))?;

        let mut roots = Vec::with_capacity(self.roots.len());
        for entry in self.roots {
            if !entry.path.is_absolute() {
                return Err(anyhow!(
                    "root {} must be an absolute path",
                    entry.path.display()
                ));
            }
            let policy = match entry.symlinks {
                SymlinkMode::Record => SymlinkPolicy::Record,
                SymlinkMode::Ignore => SymlinkPolicy::Ignore,
            };
            roots.push(
                WatchRoot::new(entry.path)
                    .with_ignore(ignore.clone())
                    .with_symlink_policy(policy),
            );
        }

        let algorithm: HashAlgorithm = self
            .hashing
            .algorithm
            .parse()
            .map_err(|err| anyhow!("{err}"))?;

        let workers = if self.hashing.workers == 0 {
            num_cpus::get()
        } else {
            self.hashing.workers
        };

        let settle = Duration::from_secs_f64(self.times.settle_secs.max(0.0));

        Ok(Settings {
            roots,
            store_dir: self.store.dir,
            settle,
            algorithm,
            hasher_workers: workers,
            retry_budget: self.hashing.retry_budget,
        })
    }
}

/// Validated, lowered configuration handed to the core.
#[derive(Debug, Clone)]
pub struct Settings {
    pub roots: Vec<WatchRoot>,
    pub store_dir: PathBuf,
    pub settle: Duration,
    pub algorithm: HashAlgorithm,
    pub hasher_workers: usize,
    pub retry_budget: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_usable() {
        let config = TrailConfig::default();
        assert!(config.roots.is_empty());
        assert_eq!(config.times.settle_secs, 30.0);
        assert_eq!(config.hashing.algorithm, "sha512");
    }

    #[test]
    fn toml_roundtrip() {
        let raw = r#"
            [[roots]]
            path = "/srv/data"

            [[roots]]
            path = "/srv/scratch"
            symlinks = "ignore"

            [exclude]
            directories = [".git"]
            patterns = ["\\.tmp$"]

            [times]
            settle_secs = 2.5

            [hashing]
            algorithm = "blake3"
            workers = 4
        "#;
        let config = TrailConfig::parse_from_str(raw, "inline").unwrap();
        let settings = config.into_settings().unwrap();
        assert_eq!(settings.roots.len(), 2);
        assert_eq!(settings.roots[1].symlink_policy, SymlinkPolicy::Ignore);
        assert_eq!(settings.algorithm, HashAlgorithm::Blake3);
        assert_eq!(settings.hasher_workers, 4);
        assert_eq!(settings.settle, Duration::from_millis(2_500));
    }

    #[test]
    fn json_is_accepted() {
        let raw = r#"{"roots": [{"path": "/srv/data"}]}"#;
        let config = TrailConfig::parse_from_str(raw, "inline").unwrap();
        assert_eq!(config.roots.len(), 1);
    }

    #[test]
    fn empty_roots_are_rejected() {
        let err = TrailConfig::default().into_settings().unwrap_err();
        assert!(err.to_string().contains("no roots"));
    }

    #[test]
    fn relative_roots_are_rejected() {
        let raw = r#"{"roots": [{"path": "data"}]}"#;
        let config = TrailConfig::parse_from_str(raw, "inline").unwrap();
        assert!(config.into_settings().is_err());
    }

    #[test]
    fn bad_pattern_is_reported() {
        let raw = r#"{"roots": [{"path": "/srv"}], "exclude": {"patterns": ["["]}}"#;
        let config = TrailConfig::parse_from_str(raw, "inline").unwrap();
        let err = config.into_settings().unwrap_err();
        assert!(err.to_string().contains("invalid ignore pattern"));
    }

    #[test]
    fn file_extension_selects_parser() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filetrail.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[[roots]]\npath = \"/srv/data\"").unwrap();
        let config = TrailConfig::load_from_file(&path).unwrap();
        assert_eq!(config.roots[0].path, PathBuf::from("/srv/data"));
    }
}
