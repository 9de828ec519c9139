//! Standard filesystem paths for Kiln.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Kiln data.
pub static KILN_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KILN_ROOT").map_or_else(
        |_| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("kiln")
        },
        PathBuf::from,
    )
});

/// Standard paths used by the builder.
#[derive(Debug, Clone)]
pub struct KilnPaths {
    /// Root data directory (default: `$KILN_ROOT` or `<user cache>/kiln`).
    pub root: PathBuf,
}

impl KilnPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layer cache directory.
    #[must_use]
    pub fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Cache entry manifests, one JSON file per cache key.
    #[must_use]
    pub fn cache_entries(&self) -> PathBuf {
        self.cache().join("entries")
    }

    /// Content-addressable storage for cached file contents.
    #[must_use]
    pub fn cache_blobs(&self) -> PathBuf {
        self.cache().join("blobs").join("sha256")
    }

    /// Scratch space for stage roots during a build.
    #[must_use]
    pub fn scratch(&self) -> PathBuf {
        self.root.join("scratch")
    }

    /// Default output directory for OCI layouts.
    #[must_use]
    pub fn output(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.cache_entries())?;
        std::fs::create_dir_all(self.cache_blobs())?;
        std::fs::create_dir_all(self.scratch())?;
        std::fs::create_dir_all(self.output())?;
        Ok(())
    }
}

impl Default for KilnPaths {
    fn default() -> Self {
        Self {
            root: KILN_ROOT.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = KilnPaths::with_root("/tmp/kiln-test");
        assert_eq!(paths.cache(), PathBuf::from("/tmp/kiln-test/cache"));
        assert_eq!(
            paths.cache_blobs(),
            PathBuf::from("/tmp/kiln-test/cache/blobs/sha256")
        );
        assert_eq!(
            paths.cache_entries(),
            PathBuf::from("/tmp/kiln-test/cache/entries")
        );
        assert_eq!(paths.scratch(), PathBuf::from("/tmp/kiln-test/scratch"));
    }

    #[test]
    fn create_dirs_builds_tree() {
        let temp = tempfile::tempdir().unwrap();
        let paths = KilnPaths::with_root(temp.path().join("root"));
        paths.create_dirs().unwrap();
        assert!(paths.cache_blobs().is_dir());
        assert!(paths.cache_entries().is_dir());
        assert!(paths.output().is_dir());
    }
}
