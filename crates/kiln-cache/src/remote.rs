//! HTTP blob store backend.
//!
//! The store is addressed by digest:
//! `GET|PUT {base}/entries/<key hex>` holds the JSON [`CacheEntry`] and
//! `GET|HEAD|PUT {base}/blobs/sha256/<hex>` holds file content.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kiln_common::Digest;
use kiln_snapshot::Layer;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::backend::LayerCache;
use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Layer cache in a remote digest-addressed blob store.
#[derive(Debug, Clone)]
pub struct RemoteLayerCache {
    client: Client,
    base: String,
}

impl RemoteLayerCache {
    /// Connect to the store at `base` (e.g. `https://cache.example.com/kiln`).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Unavailable`] if the URL is not http(s) or the
    /// client cannot be built.
    pub fn new(base: &str) -> CacheResult<Self> {
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(CacheError::Unavailable {
                message: format!("remote cache URL must be http(s): {base}"),
            });
        }
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn entry_url(&self, key: &CacheKey) -> String {
        format!("{}/entries/{}", self.base, key.hex())
    }

    fn blob_url(&self, hash: &Digest) -> String {
        format!("{}/blobs/sha256/{}", self.base, hash.hex())
    }

    async fn fetch(&self, url: &str) -> CacheResult<Option<bytes::Bytes>> {
        let response = self.client.get(url).send().await.map_err(unavailable)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.bytes().await?))
    }

    async fn exists(&self, url: &str) -> CacheResult<bool> {
        let response = self.client.head(url).send().await.map_err(unavailable)?;
        Ok(response.status().is_success())
    }

    async fn upload(&self, url: &str, body: Vec<u8>) -> CacheResult<()> {
        self.client
            .put(url)
            .body(body)
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()?;
        Ok(())
    }
}

fn unavailable(err: reqwest::Error) -> CacheError {
    CacheError::Unavailable {
        message: err.to_string(),
    }
}

#[async_trait]
impl LayerCache for RemoteLayerCache {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Layer>> {
        let Some(raw) = self.fetch(&self.entry_url(key)).await? else {
            return Ok(None);
        };
        let entry: CacheEntry =
            serde_json::from_slice(&raw).map_err(|e| CacheError::corrupt(key, e.to_string()))?;
        if &entry.key != key {
            return Err(CacheError::corrupt(key, format!("entry records key {}", entry.key)));
        }

        let mut blobs = BTreeMap::new();
        for hash in entry.content_hashes() {
            let content = self
                .fetch(&self.blob_url(&hash))
                .await?
                .ok_or_else(|| CacheError::corrupt(key, format!("missing blob {hash}")))?;
            blobs.insert(hash, content);
        }
        debug!(key = %key, blobs = blobs.len(), "Fetched remote layer");
        entry.into_layer(blobs).map(Some)
    }

    async fn put(&self, key: &CacheKey, layer: &Layer) -> CacheResult<()> {
        if !layer.is_complete() {
            return Err(CacheError::corrupt(key, "refusing to store a layer without its content"));
        }
        for (hash, content) in layer.blobs() {
            let url = self.blob_url(hash);
            if !self.exists(&url).await? {
                self.upload(&url, content.to_vec()).await?;
            }
        }
        let entry = serde_json::to_vec(&CacheEntry::new(key.clone(), layer))?;
        self.upload(&self.entry_url(key), entry).await?;
        debug!(key = %key, layer = %layer.digest(), "Uploaded layer");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}
