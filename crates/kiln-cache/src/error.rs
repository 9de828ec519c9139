//! Cache errors.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CacheError`].
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised by layer cache backends.
#[derive(Error, Diagnostic, Debug)]
pub enum CacheError {
    /// The backend cannot be reached.
    #[error("Cache backend unavailable: {message}")]
    #[diagnostic(code(kiln::cache::unavailable))]
    Unavailable {
        /// What failed.
        message: String,
    },

    /// A stored entry is unreadable or inconsistent.
    #[error("Corrupt cache entry {key}: {message}")]
    #[diagnostic(
        code(kiln::cache::corrupt),
        help("Remove it with `kiln cache clear` or let the next build overwrite it")
    )]
    Corrupt {
        /// Key of the entry.
        key: String,
        /// What is wrong with it.
        message: String,
    },

    /// Local filesystem error.
    #[error("Cache I/O error at {}: {source}", path.display())]
    #[diagnostic(code(kiln::cache::io))]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Entry (de)serialization failed.
    #[error("Cache serialization error: {0}")]
    #[diagnostic(code(kiln::cache::serialization))]
    Serialization(#[from] serde_json::Error),

    /// Remote store returned an error.
    #[error("Cache HTTP error: {0}")]
    #[diagnostic(code(kiln::cache::http))]
    Http(#[from] reqwest::Error),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(key: impl ToString, message: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Whether the backend itself could not be reached, as opposed to
    /// holding bad data.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Http(_))
    }
}
