//! Path pattern sets for exclusion and tolerate-and-skip lists.

use glob::{MatchOptions, Pattern};

use crate::error::SnapshotError;
use crate::snapshot::ancestors;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A set of glob patterns over canonical image paths.
///
/// A path matches when it, or any of its ancestors, matches a pattern, so
/// `/proc` covers the whole `/proc` subtree.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    patterns: Vec<Pattern>,
}

impl PathFilter {
    /// A filter that matches nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile a pattern list.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::InvalidPattern`] for the first pattern that
    /// fails to compile.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, SnapshotError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                Pattern::new(p).map_err(|e| SnapshotError::InvalidPattern {
                    pattern: p.to_string(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Whether `path` or one of its ancestors matches.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        std::iter::once(path)
            .chain(ancestors(path))
            .any(|candidate| self.matches_exact(candidate))
    }

    fn matches_exact(&self, path: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(path, MATCH_OPTIONS))
    }

    /// Number of patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the filter has no patterns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_covers_subtree() {
        let filter = PathFilter::new(&["/proc", "/etc/resolv.conf"]).unwrap();
        assert!(filter.matches("/proc"));
        assert!(filter.matches("/proc/1/status"));
        assert!(filter.matches("/etc/resolv.conf"));
        assert!(!filter.matches("/etc/passwd"));
        assert!(!filter.matches("/procfs"));
    }

    #[test]
    fn star_does_not_cross_separator() {
        let filter = PathFilter::new(&["/tmp/*.log"]).unwrap();
        assert!(filter.matches("/tmp/a.log"));
        assert!(!filter.matches("/tmp/sub/a.log"));
    }

    #[test]
    fn double_star_crosses_separator() {
        let filter = PathFilter::new(&["/var/cache/**"]).unwrap();
        assert!(filter.matches("/var/cache/apt/archives/x.deb"));
        assert!(!filter.matches("/var/lib"));
    }

    #[test]
    fn empty_matches_nothing() {
        let filter = PathFilter::empty();
        assert!(filter.is_empty());
        assert!(!filter.matches("/anything"));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let err = PathFilter::new(&["/a/[b"]).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidPattern { .. }));
    }
}
