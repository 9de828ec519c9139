//! Tar serialization of layers.
//!
//! Entries follow op order with all timestamps zeroed, so the archive bytes
//! depend only on the layer. Deletions become whiteout entries: an empty
//! regular file named `.wh.<name>` beside the deleted path.

use std::io::{self, Write};

use rustix::fs::{major, minor};
use tar::{Builder, EntryType, Header};
use tracing::warn;

use crate::error::SnapshotError;
use crate::layer::{FileOp, Layer};
use crate::metadata::{FileKind, FileMetadata, SpecialKind};

/// File name prefix marking a deleted path in a layer archive.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Write `layer` as an uncompressed tar stream.
///
/// # Errors
///
/// Returns [`SnapshotError::MissingContent`] if the layer lacks content for a
/// regular file, or an I/O error from `writer`.
pub fn write_tar<W: Write>(layer: &Layer, writer: W) -> Result<(), SnapshotError> {
    let mut builder = Builder::new(writer);
    builder.mode(tar::HeaderMode::Deterministic);

    for op in layer.ops() {
        let path = op.path();
        let relative = path.trim_start_matches('/');
        match op {
            FileOp::Delete { .. } => {
                let mut header = base_header(EntryType::Regular, 0o644, 0, 0);
                append_data(&mut builder, &mut header, path, &whiteout_name(relative), io::empty())?;
            }
            FileOp::Add { metadata, .. } | FileOp::Modify { metadata, .. } => {
                append_entry(&mut builder, layer, path, relative, metadata)?;
            }
        }
    }

    builder
        .into_inner()
        .and_then(|mut w| w.flush())
        .map_err(|e| SnapshotError::io("<archive>", e))
}

fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    layer: &Layer,
    path: &str,
    relative: &str,
    metadata: &FileMetadata,
) -> Result<(), SnapshotError> {
    match metadata.kind {
        FileKind::Directory => {
            let mut header = base_header(EntryType::Directory, metadata.mode, metadata.uid, metadata.gid);
            append_data(builder, &mut header, path, relative, io::empty())
        }
        FileKind::Regular => {
            let hash = metadata
                .content_hash
                .as_ref()
                .ok_or_else(|| SnapshotError::InvalidLayer {
                    message: format!("regular file '{path}' has no content hash"),
                })?;
            let content = layer.blob(hash).ok_or_else(|| SnapshotError::MissingContent {
                path: path.to_string(),
                hash: hash.clone(),
            })?;
            let mut header = base_header(EntryType::Regular, metadata.mode, metadata.uid, metadata.gid);
            header.set_size(content.len() as u64);
            append_data(builder, &mut header, path, relative, content.as_ref())
        }
        FileKind::Symlink => {
            let target = metadata.link_target.as_deref().unwrap_or_default();
            let mut header = base_header(EntryType::Symlink, metadata.mode, metadata.uid, metadata.gid);
            builder
                .append_link(&mut header, relative, target)
                .map_err(|e| SnapshotError::io(path, e))
        }
        FileKind::Other(kind) => {
            let entry_type = match kind {
                SpecialKind::Fifo => EntryType::Fifo,
                SpecialKind::CharDevice => EntryType::Char,
                SpecialKind::BlockDevice => EntryType::Block,
                SpecialKind::Socket => {
                    warn!(path, "Socket not archived");
                    return Ok(());
                }
            };
            let mut header = base_header(entry_type, metadata.mode, metadata.uid, metadata.gid);
            if entry_type != EntryType::Fifo {
                header
                    .set_device_major(major(metadata.rdev))
                    .and_then(|()| header.set_device_minor(minor(metadata.rdev)))
                    .map_err(|e| SnapshotError::io(path, e))?;
            }
            append_data(builder, &mut header, path, relative, io::empty())
        }
    }
}

fn append_data<W: Write, R: io::Read>(
    builder: &mut Builder<W>,
    header: &mut Header,
    path: &str,
    name: &str,
    data: R,
) -> Result<(), SnapshotError> {
    builder
        .append_data(header, name, data)
        .map_err(|e| SnapshotError::io(path, e))
}

fn base_header(entry_type: EntryType, mode: u32, uid: u32, gid: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(u64::from(uid));
    header.set_gid(u64::from(gid));
    header.set_mtime(0);
    header.set_size(0);
    header
}

/// Archive name of the whiteout for a relative path.
fn whiteout_name(relative: &str) -> String {
    match relative.rsplit_once('/') {
        Some((parent, name)) => format!("{parent}/{WHITEOUT_PREFIX}{name}"),
        None => format!("{WHITEOUT_PREFIX}{relative}"),
    }
}

impl Layer {
    /// Serialize to an in-memory tar archive.
    ///
    /// # Errors
    ///
    /// See [`write_tar`].
    pub fn to_tar(&self) -> Result<Vec<u8>, SnapshotError> {
        let mut out = Vec::new();
        write_tar(self, &mut out)?;
        Ok(out)
    }
}
