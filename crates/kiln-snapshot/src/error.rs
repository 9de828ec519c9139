//! Snapshot errors.
//!
//! The snapshotter reports what went wrong and where; whether a failure is
//! fatal is decided by the caller.

use std::io;
use std::path::PathBuf;

use kiln_common::Digest;
use miette::Diagnostic;
use thiserror::Error;

/// Errors raised while scanning, diffing, applying or archiving.
#[derive(Error, Diagnostic, Debug)]
pub enum SnapshotError {
    /// Reading or writing a path failed.
    #[error("I/O error at {path}: {source}")]
    #[diagnostic(code(kiln::snapshot::io))]
    Io {
        /// Image path (or host path) involved.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A path could not be read for lack of permission.
    #[error("Permission denied: {path}")]
    #[diagnostic(
        code(kiln::snapshot::permission_denied),
        help("Add the path to `snapshot.tolerate` to skip it instead of failing")
    )]
    PermissionDenied {
        /// Image path.
        path: String,
    },

    /// A file name is not valid UTF-8.
    #[error("Path is not valid UTF-8: {}", path.display())]
    #[diagnostic(code(kiln::snapshot::non_utf8))]
    NonUtf8Path {
        /// Host path.
        path: PathBuf,
    },

    /// A layer references content it does not carry.
    #[error("Layer has no content {hash} for {path}")]
    #[diagnostic(code(kiln::snapshot::missing_content))]
    MissingContent {
        /// Image path.
        path: String,
        /// Content hash that was expected.
        hash: Digest,
    },

    /// A file changed between scanning and capture.
    #[error("File changed while capturing layer: {path}")]
    #[diagnostic(code(kiln::snapshot::content_changed))]
    ContentChanged {
        /// Image path.
        path: String,
    },

    /// A layer violates its structural invariants.
    #[error("Invalid layer: {message}")]
    #[diagnostic(code(kiln::snapshot::invalid_layer))]
    InvalidLayer {
        /// What is wrong.
        message: String,
    },

    /// An exclusion pattern does not compile.
    #[error("Invalid path pattern '{pattern}': {message}")]
    #[diagnostic(code(kiln::snapshot::invalid_pattern))]
    InvalidPattern {
        /// The pattern text.
        pattern: String,
        /// Parser message.
        message: String,
    },

    /// The scan was canceled.
    #[error("Snapshot canceled")]
    #[diagnostic(code(kiln::snapshot::canceled))]
    Canceled,
}

impl SnapshotError {
    /// Classify an I/O error at an image path.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::PermissionDenied {
            Self::PermissionDenied { path }
        } else {
            Self::Io { path, source }
        }
    }

    /// Image path the error is about, if any.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Io { path, .. }
            | Self::PermissionDenied { path }
            | Self::MissingContent { path, .. }
            | Self::ContentChanged { path } => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_is_classified() {
        let err = SnapshotError::io(
            "/secret",
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(matches!(err, SnapshotError::PermissionDenied { .. }));
        assert_eq!(err.path(), Some("/secret"));
    }

    #[test]
    fn other_io_errors_keep_source() {
        let err = SnapshotError::io("/x", io::Error::other("boom"));
        assert_eq!(err.to_string(), "I/O error at /x: boom");
    }
}
