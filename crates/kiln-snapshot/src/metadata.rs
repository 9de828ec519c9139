//! Per-path file metadata.

use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::time::UNIX_EPOCH;

use kiln_common::{Digest, Sha256Writer};
use serde::{Deserialize, Serialize};

/// Kind of a special file. Special files are recorded but never hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialKind {
    /// Named pipe.
    Fifo,
    /// Unix domain socket.
    Socket,
    /// Character device.
    CharDevice,
    /// Block device.
    BlockDevice,
}

/// File type of a snapshot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Socket, fifo or device.
    Other(SpecialKind),
}

impl FileKind {
    fn from_file_type(file_type: fs::FileType) -> Self {
        if file_type.is_dir() {
            Self::Directory
        } else if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_fifo() {
            Self::Other(SpecialKind::Fifo)
        } else if file_type.is_socket() {
            Self::Other(SpecialKind::Socket)
        } else if file_type.is_char_device() {
            Self::Other(SpecialKind::CharDevice)
        } else if file_type.is_block_device() {
            Self::Other(SpecialKind::BlockDevice)
        } else {
            Self::Regular
        }
    }

    /// Whether this is a directory.
    #[must_use]
    pub const fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }
}

/// Metadata recorded for one path.
///
/// `mtime` is informational: it is truncated to the scan granularity and
/// ignored by [`FileMetadata::differs_from`] and by layer digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File type.
    pub kind: FileKind,
    /// Permission bits, including setuid/setgid/sticky.
    pub mode: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Content size in bytes (regular files), target length (symlinks), 0 otherwise.
    pub size: u64,
    /// SHA-256 of the content, regular files only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<Digest>,
    /// Modification time in seconds, truncated to the scan granularity.
    #[serde(default)]
    pub mtime: i64,
    /// Symlink target, symlinks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// Device number, character and block devices only.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rdev: u64,
}

const fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl FileMetadata {
    /// Read metadata for `host_path` without following symlinks, hashing
    /// regular file content.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from `lstat`, `readlink` or reading the file.
    pub fn read(host_path: &Path, mtime_granularity: u64) -> io::Result<Self> {
        let meta = fs::symlink_metadata(host_path)?;
        Self::from_std(host_path, &meta, mtime_granularity)
    }

    /// Build metadata from an already obtained `lstat` result.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from `readlink` or reading the file.
    pub fn from_std(host_path: &Path, meta: &fs::Metadata, mtime_granularity: u64) -> io::Result<Self> {
        let kind = FileKind::from_file_type(meta.file_type());
        let mut size = 0;
        let mut content_hash = None;
        let mut link_target = None;
        let mut rdev = 0;

        match kind {
            FileKind::Regular => {
                size = meta.len();
                content_hash = Some(hash_file(host_path)?);
            }
            FileKind::Symlink => {
                let target = fs::read_link(host_path)?;
                let target = target.into_os_string().into_string().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "symlink target is not UTF-8")
                })?;
                size = target.len() as u64;
                link_target = Some(target);
            }
            FileKind::Other(SpecialKind::CharDevice | SpecialKind::BlockDevice) => {
                rdev = meta.rdev();
            }
            FileKind::Directory | FileKind::Other(_) => {}
        }

        Ok(Self {
            kind,
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            size,
            content_hash,
            mtime: truncate_mtime(meta, mtime_granularity),
            link_target,
            rdev,
        })
    }

    /// Whether two entries differ in anything a layer must record: type,
    /// mode, ownership, size, content, link target or device number.
    #[must_use]
    pub fn differs_from(&self, other: &Self) -> bool {
        self.kind != other.kind
            || self.mode != other.mode
            || self.uid != other.uid
            || self.gid != other.gid
            || self.size != other.size
            || self.content_hash != other.content_hash
            || self.link_target != other.link_target
            || self.rdev != other.rdev
    }

    /// Copy with the fields a layer does not carry zeroed out.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            mtime: 0,
            ..self.clone()
        }
    }
}

fn truncate_mtime(meta: &fs::Metadata, granularity: u64) -> i64 {
    let secs = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
    let granularity = i64::try_from(granularity.max(1)).unwrap_or(1);
    secs - secs % granularity
}

/// SHA-256 of a file's content, streamed.
///
/// # Errors
///
/// Returns any I/O error from opening or reading the file.
pub fn hash_file(path: &Path) -> io::Result<Digest> {
    let mut file = fs::File::open(path)?;
    let mut writer = Sha256Writer::sink();
    io::copy(&mut file, &mut writer)?;
    Ok(writer.finish().0)
}
