//! Builder settings loaded from `kiln.toml`.
//!
//! ```toml
//! [cache]
//! enabled = true
//! max_bytes = 10737418240
//!
//! [snapshot]
//! workers = 8
//! exclude = ["/proc", "/sys", "/etc/resolv.conf"]
//!
//! [executor]
//! instruction_timeout_secs = 600
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KilnResult;
use crate::paths::KilnPaths;

/// Paths that never belong in an image: kernel pseudo-filesystems,
/// files the sandbox injects for networking, and the builder's own scratch
/// directory.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "/proc",
    "/sys",
    "/dev",
    "/etc/hosts",
    "/etc/hostname",
    "/etc/resolv.conf",
    "/.kiln",
];

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Layer cache settings.
    pub cache: CacheSettings,
    /// Filesystem snapshot settings.
    pub snapshot: SnapshotSettings,
    /// Instruction executor settings.
    pub executor: ExecutorSettings,
}

/// Layer cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    /// Consult and populate the cache.
    pub enabled: bool,
    /// Cache directory; defaults to [`KilnPaths::cache`].
    pub dir: Option<PathBuf>,
    /// Size limit applied by `kiln cache prune`.
    pub max_bytes: Option<u64>,
    /// Base URL of a remote blob store used instead of the local directory.
    pub remote_url: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_bytes: None,
            remote_url: None,
        }
    }
}

/// Filesystem snapshot settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotSettings {
    /// Directory traversal workers; `0` means one per available CPU.
    pub workers: usize,
    /// Modification time granularity in seconds.
    pub mtime_granularity_secs: u64,
    /// Glob patterns always excluded from scans and diffs.
    pub exclude: Vec<String>,
    /// Glob patterns whose scan errors are logged and skipped.
    pub tolerate: Vec<String>,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            mtime_granularity_secs: 1,
            exclude: DEFAULT_EXCLUDES.iter().map(ToString::to_string).collect(),
            tolerate: Vec::new(),
        }
    }
}

impl SnapshotSettings {
    /// Effective worker count.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
    }
}

/// Instruction executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorSettings {
    /// Per-instruction timeout; `None` disables it.
    pub instruction_timeout_secs: Option<u64>,
    /// Shell used for run instructions.
    pub shell: Vec<String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            instruction_timeout_secs: None,
            shell: vec!["/bin/sh".to_string(), "-c".to_string()],
        }
    }
}

impl ExecutorSettings {
    /// Per-instruction timeout as a duration.
    #[must_use]
    pub fn instruction_timeout(&self) -> Option<Duration> {
        self.instruction_timeout_secs.map(Duration::from_secs)
    }
}

impl Settings {
    /// Parse settings from TOML text.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed TOML or unknown keys.
    pub fn from_toml(content: &str) -> KilnResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load settings from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> KilnResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    /// Load settings from an optional file, falling back to defaults, then
    /// apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file cannot be loaded.
    pub fn load(path: Option<&Path>) -> KilnResult<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Apply `KILN_NO_CACHE` overrides.
    pub fn apply_env(&mut self) {
        if std::env::var("KILN_NO_CACHE").is_ok_and(|v| v == "1" || v == "true") {
            self.cache.enabled = false;
        }
    }

    /// Effective cache directory.
    #[must_use]
    pub fn cache_dir(&self, paths: &KilnPaths) -> PathBuf {
        self.cache.dir.clone().unwrap_or_else(|| paths.cache())
    }
}
