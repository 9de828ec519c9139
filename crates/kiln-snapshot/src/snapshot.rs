//! Filesystem snapshots and canonical image paths.
//!
//! Image paths are absolute, `/`-separated and relative to the image root:
//! `/etc/passwd`, never `etc/passwd`, `/etc/` or `/etc/./passwd`. The root
//! itself is never an entry.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::SnapshotError;
use crate::metadata::FileMetadata;

/// Path → metadata for a whole tree, or for the subtrees named by `scope`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemSnapshot {
    entries: BTreeMap<String, FileMetadata>,
    scope: Option<Vec<String>>,
    skipped: BTreeSet<String>,
}

impl FilesystemSnapshot {
    /// An empty, unscoped snapshot (the state of an empty root).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from entries.
    ///
    /// `scope`, when set, names the subtrees the entries cover; paths outside
    /// them are unknown rather than absent.
    #[must_use]
    pub fn from_entries(entries: BTreeMap<String, FileMetadata>, scope: Option<Vec<String>>) -> Self {
        Self {
            entries,
            scope: scope.map(normalize_scope),
            skipped: BTreeSet::new(),
        }
    }

    /// Mark paths whose state could not be read. A skipped path and
    /// everything beneath it are unknown: a diff treats them as unchanged.
    #[must_use]
    pub fn with_skipped(mut self, skipped: BTreeSet<String>) -> Self {
        self.skipped = skipped;
        self
    }

    /// Paths skipped after a tolerated read error.
    #[must_use]
    pub const fn skipped(&self) -> &BTreeSet<String> {
        &self.skipped
    }

    /// Whether `path` is, or lies beneath, a skipped path.
    #[must_use]
    pub fn is_skipped(&self, path: &str) -> bool {
        self.skipped.iter().any(|s| is_within(path, s))
    }

    /// Metadata for a path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FileMetadata> {
        self.entries.get(path)
    }

    /// Whether a path is present.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileMetadata)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Underlying map.
    #[must_use]
    pub const fn entries(&self) -> &BTreeMap<String, FileMetadata> {
        &self.entries
    }

    /// The covered subtrees, `None` for a full scan.
    #[must_use]
    pub fn scope(&self) -> Option<&[String]> {
        self.scope.as_deref()
    }

    /// Whether `path` lies inside this snapshot's scope.
    #[must_use]
    pub fn covers(&self, path: &str) -> bool {
        self.scope
            .as_ref()
            .is_none_or(|scope| scope.iter().any(|s| is_within(path, s)))
    }
}

/// Drop duplicate and nested scope entries; `/` collapses everything.
pub(crate) fn normalize_scope(mut scope: Vec<String>) -> Vec<String> {
    scope.sort();
    scope.dedup();
    let mut kept: Vec<String> = Vec::with_capacity(scope.len());
    for path in scope {
        if !kept.iter().any(|k| is_within(&path, k)) {
            kept.push(path);
        }
    }
    kept
}

/// Whether `path` equals `base` or lies beneath it.
#[must_use]
pub fn is_within(path: &str, base: &str) -> bool {
    if base == "/" {
        return true;
    }
    path == base
        || (path.len() > base.len() && path.starts_with(base) && path.as_bytes()[base.len()] == b'/')
}

/// Proper ancestors of an image path, nearest first, excluding `/`.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut current = path;
    std::iter::from_fn(move || {
        let idx = current.rfind('/')?;
        if idx == 0 {
            return None;
        }
        current = &current[..idx];
        Some(current)
    })
}

/// Join a directory's image path with a child name.
#[must_use]
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Host location of an image path under `root`.
#[must_use]
pub fn host_path(root: &Path, image_path: &str) -> PathBuf {
    let relative = image_path.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Canonicalize a user-supplied image path: make it absolute, drop empty and
/// `.` components, resolve `..` lexically without escaping the root.
#[must_use]
pub fn canonicalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Reject image paths that are not already canonical.
///
/// # Errors
///
/// Returns [`SnapshotError::InvalidLayer`] for relative paths, the root
/// itself, or paths with empty, `.` or `..` components.
pub fn validate(path: &str) -> Result<(), SnapshotError> {
    let invalid = |why: &str| SnapshotError::InvalidLayer {
        message: format!("path '{path}' {why}"),
    };
    let Some(rest) = path.strip_prefix('/') else {
        return Err(invalid("is not absolute"));
    };
    if rest.is_empty() {
        return Err(invalid("is the root"));
    }
    if rest
        .split('/')
        .any(|c| c.is_empty() || c == "." || c == "..")
    {
        return Err(invalid("is not canonical"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within() {
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn skipped_covers_subtree() {
        let snapshot = FilesystemSnapshot::new()
            .with_skipped(BTreeSet::from(["/data".to_string()]));
        assert!(snapshot.is_skipped("/data"));
        assert!(snapshot.is_skipped("/data/x/y"));
        assert!(!snapshot.is_skipped("/database"));
        assert!(!FilesystemSnapshot::new().is_skipped("/data"));
    }

    #[test]
    fn ancestor_chain() {
        let chain: Vec<_> = ancestors("/a/b/c").collect();
        assert_eq!(chain, vec!["/a/b", "/a"]);
        assert_eq!(ancestors("/a").count(), 0);
    }

    #[test]
    fn canonical_forms() {
        assert_eq!(canonicalize("app/"), "/app");
        assert_eq!(canonicalize("/a/./b//c"), "/a/b/c");
        assert_eq!(canonicalize("/a/../../etc"), "/etc");
        assert_eq!(canonicalize(""), "/");
    }

    #[test]
    fn validation() {
        assert!(validate("/a/b").is_ok());
        assert!(validate("a/b").is_err());
        assert!(validate("/").is_err());
        assert!(validate("/a/../b").is_err());
        assert!(validate("/a//b").is_err());
    }

    #[test]
    fn scope_normalization() {
        let scope = normalize_scope(vec![
            "/app/sub".to_string(),
            "/app".to_string(),
            "/etc".to_string(),
            "/app".to_string(),
        ]);
        assert_eq!(scope, vec!["/app", "/etc"]);
        assert_eq!(normalize_scope(vec!["/x".into(), "/".into()]), vec!["/"]);
    }

    #[test]
    fn covers_respects_scope() {
        let snapshot = FilesystemSnapshot::from_entries(BTreeMap::new(), Some(vec!["/app".into()]));
        assert!(snapshot.covers("/app/x"));
        assert!(!snapshot.covers("/etc/x"));
        assert!(FilesystemSnapshot::new().covers("/etc/x"));
    }

    #[test]
    fn host_paths() {
        let root = Path::new("/srv/root");
        assert_eq!(host_path(root, "/etc/hosts"), PathBuf::from("/srv/root/etc/hosts"));
        assert_eq!(host_path(root, "/"), PathBuf::from("/srv/root"));
    }
}
