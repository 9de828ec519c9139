//! Common error types for the Kiln crates.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KilnError`].
pub type KilnResult<T> = Result<T, KilnError>;

/// Errors shared across the Kiln crates.
#[derive(Error, Diagnostic, Debug)]
pub enum KilnError {
    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(kiln::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(kiln::serialization))]
    Serialization(String),

    /// A string that should have been a content digest.
    #[error("Invalid digest: {value}")]
    #[diagnostic(
        code(kiln::digest::invalid),
        help("Digests look like 'sha256:' followed by 64 lowercase hex characters")
    )]
    InvalidDigest {
        /// The rejected value.
        value: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(kiln::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(kiln::internal),
        help("This is a bug, please report it at https://github.com/kiln-build/kiln/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for KilnError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}
