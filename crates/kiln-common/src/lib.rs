//! # kiln-common
//!
//! Shared utilities and types for the Kiln image builder.
//!
//! This crate provides common functionality used across all Kiln crates:
//! - Content digests (`sha256:<hex>`)
//! - Standard filesystem paths
//! - The `kiln.toml` settings file
//! - Common error types

#![warn(missing_docs)]

pub mod digest;
pub mod error;
pub mod paths;
pub mod settings;

pub use digest::{Digest, Sha256Writer};
pub use error::{KilnError, KilnResult};
pub use paths::KilnPaths;
pub use settings::Settings;
