//! Snapshot diffing.

use std::collections::BTreeSet;
use std::path::Path;

use bytes::Bytes;
use kiln_common::Digest;

use crate::error::SnapshotError;
use crate::layer::{FileOp, Layer};
use crate::metadata::{FileKind, FileMetadata};
use crate::snapshot::{FilesystemSnapshot, ancestors, host_path};

/// Diff two snapshots into a layer without content.
///
/// When `after` is scoped, only paths inside its scope are compared; paths
/// outside are assumed unchanged. A directory that disappears (or stops
/// being a directory) takes its descendants with it, so their deletions are
/// folded into the single op on the directory. Paths `after` skipped on a
/// tolerated read error, and their subtrees, are likewise assumed unchanged.
#[must_use]
pub fn diff(before: &FilesystemSnapshot, after: &FilesystemSnapshot) -> Layer {
    let mut ops = Vec::new();
    // Directories removed or replaced by a non-directory.
    let mut dead_dirs: BTreeSet<&str> = BTreeSet::new();

    let mut old = before
        .iter()
        .filter(|(path, _)| after.covers(path))
        .peekable();
    let mut new = after.iter().peekable();

    loop {
        let step = match (old.peek(), new.peek()) {
            (None, None) => break,
            (Some(_), None) => Step::Removed,
            (None, Some(_)) => Step::Added,
            (Some((a, _)), Some((b, _))) => match a.cmp(b) {
                std::cmp::Ordering::Less => Step::Removed,
                std::cmp::Ordering::Greater => Step::Added,
                std::cmp::Ordering::Equal => Step::Both,
            },
        };

        match step {
            Step::Removed => {
                let Some((path, meta)) = old.next() else { break };
                if after.is_skipped(path) {
                    continue;
                }
                if meta.kind.is_dir() {
                    dead_dirs.insert(path);
                }
                if !ancestors(path).any(|a| dead_dirs.contains(a)) {
                    ops.push(FileOp::Delete {
                        path: path.to_string(),
                    });
                }
            }
            Step::Added => {
                let Some((path, meta)) = new.next() else { break };
                ops.push(FileOp::Add {
                    path: path.to_string(),
                    metadata: meta.normalized(),
                });
            }
            Step::Both => {
                let (Some((path, was)), Some((_, now))) = (old.next(), new.next()) else {
                    break;
                };
                if after.is_skipped(path) {
                    continue;
                }
                if was.kind.is_dir() && !now.kind.is_dir() {
                    dead_dirs.insert(path);
                }
                if was.differs_from(now) {
                    ops.push(FileOp::Modify {
                        path: path.to_string(),
                        metadata: now.normalized(),
                    });
                }
            }
        }
    }

    Layer::from_sorted_ops(ops)
}

enum Step {
    Removed,
    Added,
    Both,
}

/// Diff two snapshots and read the content of every added or modified
/// regular file from `root` into the layer.
///
/// # Errors
///
/// Returns an I/O error if a file cannot be read, or
/// [`SnapshotError::ContentChanged`] if its content no longer matches the
/// hash recorded in `after`.
pub fn capture(
    root: &Path,
    before: &FilesystemSnapshot,
    after: &FilesystemSnapshot,
) -> Result<Layer, SnapshotError> {
    let mut layer = diff(before, after);

    let wanted: Vec<(String, Digest)> = layer
        .ops()
        .iter()
        .filter_map(|op| {
            let meta = op.metadata().filter(|m| has_content(m))?;
            let hash = meta.content_hash.clone()?;
            Some((op.path().to_string(), hash))
        })
        .collect();

    for (path, hash) in wanted {
        if layer.blob(&hash).is_some() {
            continue;
        }
        let content = std::fs::read(host_path(root, &path)).map_err(|e| SnapshotError::io(&path, e))?;
        if Digest::of(&content) != hash {
            return Err(SnapshotError::ContentChanged { path });
        }
        layer.insert_blob(hash, Bytes::from(content));
    }

    tracing::debug!(
        digest = %layer.digest(),
        ops = layer.len(),
        content_bytes = layer.content_size(),
        "Layer captured"
    );

    Ok(layer)
}

/// Whether `meta` would be written as a regular file with content.
#[must_use]
pub fn has_content(meta: &FileMetadata) -> bool {
    meta.kind == FileKind::Regular && meta.content_hash.is_some()
}
