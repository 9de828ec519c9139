//! The layer cache interface.

use std::sync::Arc;

use async_trait::async_trait;
use kiln_snapshot::Layer;

use crate::error::CacheResult;
use crate::key::CacheKey;

/// A store mapping cache keys to layers.
///
/// Implementations must be safe to share between concurrently running
/// stages. Storing the same key twice must leave the store in the same
/// state as storing it once.
#[async_trait]
pub trait LayerCache: Send + Sync {
    /// Look up a layer. `Ok(None)` means the key is not stored.
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Layer>>;

    /// Store a complete layer (one carrying all its content) under `key`.
    async fn put(&self, key: &CacheKey, layer: &Layer) -> CacheResult<()>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T: LayerCache + ?Sized> LayerCache for Arc<T> {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Layer>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &CacheKey, layer: &Layer) -> CacheResult<()> {
        (**self).put(key, layer).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
