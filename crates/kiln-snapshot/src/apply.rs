//! Replaying a layer onto a directory.

use std::fs;
use std::io;
use std::os::unix::fs::{PermissionsExt, lchown, symlink};
use std::path::Path;

use rustix::fs::{CWD, FileType, Mode, mknodat};
use tracing::{debug, warn};

use crate::error::SnapshotError;
use crate::layer::{FileOp, Layer};
use crate::metadata::{FileKind, FileMetadata, SpecialKind};
use crate::snapshot::host_path;

/// Apply `layer` to the tree at `root`.
///
/// Ops are replayed in path order, so a parent directory is always created
/// before its children. Deleting a missing path is a no-op, which makes
/// applying the same layer twice safe. Directory modes are set last so that
/// read-only directories do not block writes beneath them. Ownership is set
/// when the process is allowed to; otherwise it is left as is. FIFOs and
/// devices are recreated with `mknod`; sockets are skipped.
///
/// # Errors
///
/// Returns [`SnapshotError::MissingContent`] if a regular file's content is
/// not in the layer, or an I/O error from the filesystem. A refused `mknod`
/// is an error too.
pub fn apply(layer: &Layer, root: &Path) -> Result<(), SnapshotError> {
    let mut dir_modes: Vec<(&str, u32)> = Vec::new();

    for op in layer.ops() {
        match op {
            FileOp::Delete { path } => remove(root, path)?,
            FileOp::Add { path, metadata } | FileOp::Modify { path, metadata } => {
                if write_entry(layer, root, path, metadata)? {
                    if metadata.kind == FileKind::Directory {
                        dir_modes.push((path, metadata.mode));
                    }
                    chown(root, path, metadata);
                }
            }
        }
    }

    // Deepest first.
    for (path, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(host_path(root, path), fs::Permissions::from_mode(mode))
            .map_err(|e| SnapshotError::io(path, e))?;
    }

    debug!(digest = %layer.digest(), ops = layer.len(), root = %root.display(), "Layer applied");
    Ok(())
}

/// Returns whether anything was written.
fn write_entry(
    layer: &Layer,
    root: &Path,
    path: &str,
    metadata: &FileMetadata,
) -> Result<bool, SnapshotError> {
    let target = host_path(root, path);
    let existing = fs::symlink_metadata(&target).ok();

    match metadata.kind {
        FileKind::Directory => {
            match existing {
                Some(m) if m.is_dir() => {}
                Some(_) => {
                    remove(root, path)?;
                    fs::create_dir(&target).map_err(|e| SnapshotError::io(path, e))?;
                }
                None => fs::create_dir_all(&target).map_err(|e| SnapshotError::io(path, e))?,
            }
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
            if existing.is_some_and(|m| !m.is_file()) {
                remove(root, path)?;
            }
            ensure_parent(root, path, &target)?;
            fs::write(&target, content).map_err(|e| SnapshotError::io(path, e))?;
            fs::set_permissions(&target, fs::Permissions::from_mode(metadata.mode))
                .map_err(|e| SnapshotError::io(path, e))?;
        }
        FileKind::Symlink => {
            let link_target = metadata
                .link_target
                .as_deref()
                .ok_or_else(|| SnapshotError::InvalidLayer {
                    message: format!("symlink '{path}' has no target"),
                })?;
            if existing.is_some() {
                remove(root, path)?;
            }
            ensure_parent(root, path, &target)?;
            symlink(link_target, &target).map_err(|e| SnapshotError::io(path, e))?;
        }
        FileKind::Other(SpecialKind::Socket) => {
            warn!(path, "Skipping socket");
            return Ok(false);
        }
        FileKind::Other(kind) => {
            if existing.is_some() {
                remove(root, path)?;
            }
            ensure_parent(root, path, &target)?;
            make_node(&target, kind, metadata).map_err(|e| SnapshotError::io(path, e))?;
        }
    }
    Ok(true)
}

fn make_node(target: &Path, kind: SpecialKind, metadata: &FileMetadata) -> io::Result<()> {
    let file_type = match kind {
        SpecialKind::Fifo => FileType::Fifo,
        SpecialKind::CharDevice => FileType::CharacterDevice,
        SpecialKind::BlockDevice => FileType::BlockDevice,
        SpecialKind::Socket => FileType::Socket,
    };
    mknodat(CWD, target, file_type, Mode::from_raw_mode(metadata.mode), metadata.rdev)?;
    // mknod is subject to the umask.
    fs::set_permissions(target, fs::Permissions::from_mode(metadata.mode))
}

fn ensure_parent(root: &Path, path: &str, target: &Path) -> Result<(), SnapshotError> {
    match target.parent() {
        Some(parent) if parent != root => {
            fs::create_dir_all(parent).map_err(|e| SnapshotError::io(path, e))
        }
        _ => Ok(()),
    }
}

/// Remove a path and everything beneath it; missing paths are fine.
fn remove(root: &Path, path: &str) -> Result<(), SnapshotError> {
    let target = host_path(root, path);
    let result = match fs::symlink_metadata(&target) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(&target),
        Ok(_) => fs::remove_file(&target),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound || e.kind() == io::ErrorKind::NotADirectory => {
            Ok(())
        }
        Err(e) => Err(SnapshotError::io(path, e)),
    }
}

fn chown(root: &Path, path: &str, metadata: &FileMetadata) {
    let target = host_path(root, path);
    if let Err(e) = lchown(&target, Some(metadata.uid), Some(metadata.gid)) {
        if e.kind() != io::ErrorKind::PermissionDenied {
            debug!(path, error = %e, "Could not set ownership");
        }
    }
}
