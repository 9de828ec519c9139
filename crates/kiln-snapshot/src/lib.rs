//! # kiln-snapshot
//!
//! Filesystem snapshotter for the Kiln image builder.
//!
//! A build instruction's effect on the image root is captured by scanning the
//! tree before and after it runs and diffing the two [`FilesystemSnapshot`]s
//! into a [`Layer`]: a path-sorted list of [`FileOp`]s whose digest depends
//! only on the logical change, never on traversal order or timestamps.
//!
//! This crate provides:
//! - Parallel, optionally scoped scans ([`Scanner`])
//! - Pure diffing ([`diff`]) and content capture ([`capture`])
//! - Replaying a layer onto a live tree ([`apply`])
//! - Deterministic tar serialization with whiteouts ([`write_tar`])

#![warn(missing_docs)]

pub mod apply;
pub mod archive;
pub mod diff;
pub mod error;
pub mod filter;
pub mod layer;
pub mod metadata;
pub mod scan;
pub mod snapshot;

pub use apply::apply;
pub use archive::{WHITEOUT_PREFIX, write_tar};
pub use diff::{capture, diff};
pub use error::SnapshotError;
pub use filter::PathFilter;
pub use layer::{FileOp, Layer};
pub use metadata::{FileKind, FileMetadata, SpecialKind};
pub use scan::Scanner;
pub use snapshot::FilesystemSnapshot;
