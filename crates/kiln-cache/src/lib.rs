//! # kiln-cache
//!
//! Layer cache for the Kiln image builder.
//!
//! A [`CacheKey`] identifies the effect of one instruction at one point in a
//! build's lineage. Backends implementing [`LayerCache`] map keys to the
//! [`Layer`](kiln_snapshot::Layer) that instruction produced:
//! - [`LocalLayerCache`]: a directory with atomic writes and LRU pruning
//! - [`MemoryLayerCache`]: an in-process map
//! - [`RemoteLayerCache`]: an HTTP digest-addressed blob store
//!
//! Backends report failures; deciding whether a failure matters is left to
//! the caller.

#![warn(missing_docs)]

pub mod backend;
pub mod entry;
pub mod error;
pub mod key;
pub mod local;
pub mod memory;
pub mod remote;

pub use backend::LayerCache;
pub use entry::CacheEntry;
pub use error::{CacheError, CacheResult};
pub use key::{CacheKey, normalize_instruction, referenced_args};
pub use local::{LocalLayerCache, PruneStats};
pub use memory::MemoryLayerCache;
pub use remote::RemoteLayerCache;
