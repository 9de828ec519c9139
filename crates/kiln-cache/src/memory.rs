//! In-process layer cache.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use kiln_snapshot::Layer;

use crate::backend::LayerCache;
use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;

/// Layer cache held in memory, with hit/miss/store counters.
#[derive(Debug, Default)]
pub struct MemoryLayerCache {
    layers: DashMap<CacheKey, Layer>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    stores: AtomicUsize,
}

impl MemoryLayerCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Whether `key` is stored.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.layers.contains_key(key)
    }

    /// Successful lookups so far.
    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that found nothing.
    #[must_use]
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    /// Store calls so far.
    #[must_use]
    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LayerCache for MemoryLayerCache {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Layer>> {
        let found = self.layers.get(key).map(|l| l.value().clone());
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(found)
    }

    async fn put(&self, key: &CacheKey, layer: &Layer) -> CacheResult<()> {
        if !layer.is_complete() {
            return Err(CacheError::corrupt(key, "refusing to store a layer without its content"));
        }
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.layers.insert(key.clone(), layer.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
