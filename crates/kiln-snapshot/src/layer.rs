//! Layers: ordered, content-addressed sets of file operations.

use std::collections::BTreeMap;

use bytes::Bytes;
use kiln_common::Digest;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;
use crate::metadata::{FileKind, FileMetadata, SpecialKind};
use crate::snapshot::validate;

/// One change to one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum FileOp {
    /// A path that did not exist before.
    Add {
        /// Image path.
        path: String,
        /// Normalized metadata; regular files reference content by hash.
        metadata: FileMetadata,
    },
    /// A path whose type, mode, ownership or content changed.
    Modify {
        /// Image path.
        path: String,
        /// Normalized metadata after the change.
        metadata: FileMetadata,
    },
    /// A removed path; serialized as a whiteout.
    Delete {
        /// Image path.
        path: String,
    },
}

impl FileOp {
    /// The path this op applies to.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Modify { path, .. } | Self::Delete { path } => path,
        }
    }

    /// Metadata written by this op, `None` for deletions.
    #[must_use]
    pub const fn metadata(&self) -> Option<&FileMetadata> {
        match self {
            Self::Add { metadata, .. } | Self::Modify { metadata, .. } => Some(metadata),
            Self::Delete { .. } => None,
        }
    }

    /// Whether this op deletes its path.
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }
}

static EMPTY_DIGEST: Lazy<Digest> = Lazy::new(|| Digest::of(&canonical_bytes(&[])));

/// An immutable set of file operations, sorted by path with one op per path.
///
/// The digest covers the canonical serialization of the ops only. Content is
/// referenced by hash inside each op's metadata, so two layers with the same
/// logical change always share a digest; the blob table holds the bytes
/// needed to replay the layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    ops: Vec<FileOp>,
    digest: Digest,
    blobs: BTreeMap<Digest, Bytes>,
}

impl Layer {
    /// The layer that changes nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            ops: Vec::new(),
            digest: Self::empty_digest(),
            blobs: BTreeMap::new(),
        }
    }

    /// Digest shared by every empty layer.
    #[must_use]
    pub fn empty_digest() -> Digest {
        EMPTY_DIGEST.clone()
    }

    /// Assemble a layer from untrusted parts, checking every invariant.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::InvalidLayer`] if paths are not canonical,
    /// not strictly ascending, or an op carries metadata inconsistent with
    /// its kind; [`SnapshotError::MissingContent`] if a regular file's
    /// content is absent from `blobs`.
    pub fn from_parts(ops: Vec<FileOp>, blobs: BTreeMap<Digest, Bytes>) -> Result<Self, SnapshotError> {
        for (i, op) in ops.iter().enumerate() {
            validate(op.path())?;
            if i > 0 && ops[i - 1].path() >= op.path() {
                return Err(SnapshotError::InvalidLayer {
                    message: format!(
                        "ops not sorted and unique at '{}' after '{}'",
                        op.path(),
                        ops[i - 1].path()
                    ),
                });
            }
            if let Some(metadata) = op.metadata() {
                check_metadata(op.path(), metadata)?;
                if let Some(hash) = &metadata.content_hash {
                    let content = blobs.get(hash).ok_or_else(|| SnapshotError::MissingContent {
                        path: op.path().to_string(),
                        hash: hash.clone(),
                    })?;
                    if Digest::of(content) != *hash {
                        return Err(SnapshotError::InvalidLayer {
                            message: format!("content for '{}' does not match {hash}", op.path()),
                        });
                    }
                }
            }
        }

        let digest = Digest::of(&canonical_bytes(&ops));
        Ok(Self { ops, digest, blobs })
    }

    /// Build from ops already known to be sorted, unique and normalized.
    pub(crate) fn from_sorted_ops(ops: Vec<FileOp>) -> Self {
        debug_assert!(ops.windows(2).all(|w| w[0].path() < w[1].path()));
        let digest = Digest::of(&canonical_bytes(&ops));
        Self {
            ops,
            digest,
            blobs: BTreeMap::new(),
        }
    }

    pub(crate) fn insert_blob(&mut self, hash: Digest, content: Bytes) {
        self.blobs.insert(hash, content);
    }

    /// Content-addressed digest of this layer.
    #[must_use]
    pub const fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Ops in path order.
    #[must_use]
    pub fn ops(&self) -> &[FileOp] {
        &self.ops
    }

    /// Content blobs keyed by hash.
    #[must_use]
    pub const fn blobs(&self) -> &BTreeMap<Digest, Bytes> {
        &self.blobs
    }

    /// Content for a hash.
    #[must_use]
    pub fn blob(&self, hash: &Digest) -> Option<&Bytes> {
        self.blobs.get(hash)
    }

    /// Whether every regular file's content is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.ops
            .iter()
            .filter_map(FileOp::metadata)
            .filter_map(|m| m.content_hash.as_ref())
            .all(|h| self.blobs.contains_key(h))
    }

    /// Whether this layer changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Total size of carried content.
    #[must_use]
    pub fn content_size(&self) -> u64 {
        self.blobs.values().map(|b| b.len() as u64).sum()
    }

    /// The canonical serialization the digest is computed over.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.ops)
    }
}

/// JSON array of ops; field order is fixed by the type definitions and map
/// keys never appear, so the encoding is deterministic.
fn canonical_bytes(ops: &[FileOp]) -> Vec<u8> {
    // Serializing plain enums and structs of strings and integers cannot fail.
    serde_json::to_vec(ops).unwrap_or_default()
}

fn check_metadata(path: &str, metadata: &FileMetadata) -> Result<(), SnapshotError> {
    let consistent = match metadata.kind {
        FileKind::Regular => metadata.content_hash.is_some() && metadata.link_target.is_none(),
        FileKind::Symlink => metadata.link_target.is_some() && metadata.content_hash.is_none(),
        FileKind::Directory | FileKind::Other(_) => {
            metadata.content_hash.is_none() && metadata.link_target.is_none()
        }
    } && (metadata.rdev == 0
        || matches!(
            metadata.kind,
            FileKind::Other(SpecialKind::CharDevice | SpecialKind::BlockDevice)
        ));
    if consistent && metadata.mtime == 0 {
        Ok(())
    } else {
        Err(SnapshotError::InvalidLayer {
            message: format!("metadata for '{path}' is inconsistent with {:?}", metadata.kind),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regular(content: &[u8]) -> FileMetadata {
        FileMetadata {
            kind: FileKind::Regular,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: content.len() as u64,
            content_hash: Some(Digest::of(content)),
            mtime: 0,
            link_target: None,
            rdev: 0,
        }
    }

    fn blobs(contents: &[&[u8]]) -> BTreeMap<Digest, Bytes> {
        contents
            .iter()
            .map(|c| (Digest::of(c), Bytes::copy_from_slice(c)))
            .collect()
    }

    #[test]
    fn empty_layer_digest_is_fixed() {
        assert_eq!(Layer::empty().digest(), &Layer::empty_digest());
        assert_eq!(Layer::empty_digest(), Digest::of(b"[]"));
        assert!(Layer::empty().is_empty());
        assert_eq!(
            Layer::from_parts(Vec::new(), BTreeMap::new()).unwrap(),
            Layer::empty()
        );
    }

    #[test]
    fn from_parts_accepts_valid_layer() {
        let ops = vec![
            FileOp::Add {
                path: "/a".to_string(),
                metadata: regular(b"one"),
            },
            FileOp::Delete {
                path: "/b".to_string(),
            },
        ];
        let layer = Layer::from_parts(ops, blobs(&[b"one"])).unwrap();
        assert_eq!(layer.len(), 2);
        assert!(layer.is_complete());
        assert_eq!(layer.content_size(), 3);
    }

    #[test]
    fn from_parts_rejects_unsorted_or_duplicate() {
        let unsorted = vec![
            FileOp::Delete { path: "/b".into() },
            FileOp::Delete { path: "/a".into() },
        ];
        assert!(Layer::from_parts(unsorted, BTreeMap::new()).is_err());

        let duplicate = vec![
            FileOp::Delete { path: "/a".into() },
            FileOp::Delete { path: "/a".into() },
        ];
        assert!(Layer::from_parts(duplicate, BTreeMap::new()).is_err());
    }

    #[test]
    fn from_parts_rejects_traversal() {
        let ops = vec![FileOp::Delete {
            path: "/../etc/passwd".into(),
        }];
        assert!(matches!(
            Layer::from_parts(ops, BTreeMap::new()),
            Err(SnapshotError::InvalidLayer { .. })
        ));
    }

    #[test]
    fn from_parts_requires_content() {
        let ops = vec![FileOp::Add {
            path: "/a".into(),
            metadata: regular(b"one"),
        }];
        assert!(matches!(
            Layer::from_parts(ops.clone(), BTreeMap::new()),
            Err(SnapshotError::MissingContent { .. })
        ));
        let mut wrong = BTreeMap::new();
        wrong.insert(Digest::of(b"one"), Bytes::from_static(b"two"));
        assert!(matches!(
            Layer::from_parts(ops, wrong),
            Err(SnapshotError::InvalidLayer { .. })
        ));
    }

    #[test]
    fn digest_ignores_blob_table() {
        let ops = vec![FileOp::Add {
            path: "/a".into(),
            metadata: regular(b"one"),
        }];
        let full = Layer::from_parts(ops.clone(), blobs(&[b"one"])).unwrap();
        let bare = Layer::from_sorted_ops(ops);
        assert_eq!(full.digest(), bare.digest());
        assert!(!bare.is_complete());
    }

    #[test]
    fn canonical_bytes_are_stable() {
        let layer = Layer::from_sorted_ops(vec![FileOp::Delete { path: "/gone".into() }]);
        assert_eq!(
            String::from_utf8(layer.canonical_bytes()).unwrap(),
            r#"[{"op":"delete","path":"/gone"}]"#
        );
    }
}
