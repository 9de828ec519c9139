//! Stored cache entries.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use kiln_common::Digest;
use kiln_snapshot::{FileOp, Layer};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;

/// A cache key's layer, minus its content blobs, plus bookkeeping.
///
/// Content is stored separately by hash so identical files shared by many
/// layers are kept once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key this entry is stored under.
    pub key: CacheKey,
    /// Digest of the stored layer.
    pub layer_digest: Digest,
    /// The layer's ops.
    pub ops: Vec<FileOp>,
    /// Bytes of content the layer references.
    pub size_bytes: u64,
    /// When the entry was written.
    pub stored_at: DateTime<Utc>,
    /// When the entry was last read.
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    /// Describe `layer` for storage under `key`.
    #[must_use]
    pub fn new(key: CacheKey, layer: &Layer) -> Self {
        let now = Utc::now();
        Self {
            key,
            layer_digest: layer.digest().clone(),
            ops: layer.ops().to_vec(),
            size_bytes: layer.content_size(),
            stored_at: now,
            last_accessed: now,
        }
    }

    /// Content hashes the layer needs, deduplicated.
    #[must_use]
    pub fn content_hashes(&self) -> BTreeSet<Digest> {
        self.ops
            .iter()
            .filter_map(FileOp::metadata)
            .filter_map(|m| m.content_hash.clone())
            .collect()
    }

    /// Rebuild the layer, checking it against the recorded digest.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Corrupt`] if the ops are invalid, content is
    /// missing or wrong, or the digest does not match.
    pub fn into_layer(self, blobs: BTreeMap<Digest, Bytes>) -> CacheResult<Layer> {
        let layer = Layer::from_parts(self.ops, blobs).map_err(|e| CacheError::corrupt(&self.key, e.to_string()))?;
        if layer.digest() != &self.layer_digest {
            return Err(CacheError::corrupt(
                &self.key,
                format!("layer digest {} does not match recorded {}", layer.digest(), self.layer_digest),
            ));
        }
        Ok(layer)
    }
}
