//! Directory-backed layer cache.
//!
//! Layout under the cache directory:
//!
//! ```text
//! entries/<key hex>.json     CacheEntry
//! blobs/sha256/<hex>         file content, shared between entries
//! ```
//!
//! Every file is written to a temporary file in the same directory and
//! renamed into place, so readers never observe a partial write and two
//! builds storing the same key race harmlessly.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use kiln_common::{Digest, KilnPaths};
use kiln_snapshot::Layer;
use tracing::{debug, warn};

use crate::backend::LayerCache;
use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;

/// Outcome of [`LocalLayerCache::prune`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Entries removed.
    pub entries_removed: usize,
    /// Blobs removed because no remaining entry referenced them.
    pub blobs_removed: usize,
    /// Bytes freed on disk.
    pub bytes_freed: u64,
}

/// Layer cache stored in a local directory.
#[derive(Debug, Clone)]
pub struct LocalLayerCache {
    entries_dir: PathBuf,
    blobs_dir: PathBuf,
}

impl LocalLayerCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directories cannot be created.
    pub fn new(dir: &Path) -> CacheResult<Self> {
        let cache = Self {
            entries_dir: dir.join("entries"),
            blobs_dir: dir.join("blobs").join("sha256"),
        };
        for d in [&cache.entries_dir, &cache.blobs_dir] {
            fs::create_dir_all(d).map_err(|e| CacheError::io(d, e))?;
        }
        Ok(cache)
    }

    /// Open the cache at the standard location.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directories cannot be created.
    pub fn open(paths: &KilnPaths) -> CacheResult<Self> {
        Self::new(&paths.cache())
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir.join(format!("{}.json", key.hex()))
    }

    fn blob_path(&self, hash: &Digest) -> PathBuf {
        self.blobs_dir.join(hash.hex())
    }

    /// Read a layer, refreshing its access time.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Corrupt`] for an unreadable or inconsistent
    /// entry, or an I/O error.
    pub fn load(&self, key: &CacheKey) -> CacheResult<Option<Layer>> {
        let Some(mut entry) = self.read_entry(key)? else {
            return Ok(None);
        };

        let mut blobs = BTreeMap::new();
        for hash in entry.content_hashes() {
            let path = self.blob_path(&hash);
            let content = match fs::read(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(CacheError::corrupt(key, format!("missing blob {hash}")));
                }
                Err(e) => return Err(CacheError::io(path, e)),
            };
            blobs.insert(hash, Bytes::from(content));
        }

        entry.last_accessed = chrono::Utc::now();
        if let Err(e) = self.write_entry(&entry) {
            debug!(key = %key, error = %e, "Could not refresh cache entry access time");
        }

        entry.into_layer(blobs).map(Some)
    }

    /// Write a layer and its content.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Corrupt`] if the layer is missing content, or an
    /// I/O error.
    pub fn store(&self, key: &CacheKey, layer: &Layer) -> CacheResult<()> {
        if !layer.is_complete() {
            return Err(CacheError::corrupt(key, "refusing to store a layer without its content"));
        }
        for (hash, content) in layer.blobs() {
            let path = self.blob_path(hash);
            if !path.exists() {
                atomic_write(&self.blobs_dir, &path, content)?;
            }
        }
        self.write_entry(&CacheEntry::new(key.clone(), layer))?;
        debug!(key = %key, layer = %layer.digest(), size_bytes = layer.content_size(), "Stored layer");
        Ok(())
    }

    fn read_entry(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(path, e)),
        };
        let entry: CacheEntry =
            serde_json::from_slice(&raw).map_err(|e| CacheError::corrupt(key, e.to_string()))?;
        if &entry.key != key {
            return Err(CacheError::corrupt(key, format!("entry records key {}", entry.key)));
        }
        Ok(Some(entry))
    }

    fn write_entry(&self, entry: &CacheEntry) -> CacheResult<()> {
        let json = serde_json::to_vec_pretty(entry)?;
        atomic_write(&self.entries_dir, &self.entry_path(&entry.key), &json)
    }

    /// All readable entries; unreadable ones are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the entries directory cannot be listed.
    pub fn list_entries(&self) -> CacheResult<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for path in list_dir(&self.entries_dir)? {
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match fs::read(&path)
                .map_err(|e| CacheError::io(&path, e))
                .and_then(|raw| Ok(serde_json::from_slice::<CacheEntry>(&raw)?))
            {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry"),
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Bytes used on disk by entries and blobs.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be listed.
    pub fn total_size(&self) -> CacheResult<u64> {
        let mut total = 0;
        for dir in [&self.entries_dir, &self.blobs_dir] {
            for path in list_dir(dir)? {
                total += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }

    /// Remove one entry. Returns whether it existed. Its blobs are left for
    /// [`LocalLayerCache::collect_garbage`].
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the entry cannot be removed.
    pub fn invalidate(&self, key: &CacheKey) -> CacheResult<bool> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    /// Remove blobs no entry references. Returns (blobs removed, bytes freed).
    ///
    /// A blob written by a concurrent [`LocalLayerCache::store`] whose entry
    /// is not yet in place may be removed; that entry then reads as corrupt.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be listed.
    pub fn collect_garbage(&self) -> CacheResult<(usize, u64)> {
        let live: BTreeSet<String> = self
            .list_entries()?
            .iter()
            .flat_map(CacheEntry::content_hashes)
            .map(|h| h.hex().to_string())
            .collect();

        let mut removed = 0;
        let mut freed = 0;
        for path in list_dir(&self.blobs_dir)? {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if live.contains(name) {
                continue;
            }
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    freed += size;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(path, e)),
            }
        }
        Ok((removed, freed))
    }

    /// Shrink the cache to at most `max_bytes`, evicting least recently
    /// accessed entries first.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the cache cannot be listed or modified.
    pub fn prune(&self, max_bytes: u64) -> CacheResult<PruneStats> {
        let before = self.total_size()?;
        if before <= max_bytes {
            return Ok(PruneStats::default());
        }

        let mut entries = self.list_entries()?;
        entries.sort_by_key(|e| e.last_accessed);

        let mut estimate = before;
        let mut stats = PruneStats::default();
        for entry in &entries {
            if estimate <= max_bytes {
                break;
            }
            let entry_file = fs::metadata(self.entry_path(&entry.key)).map(|m| m.len()).unwrap_or(0);
            if self.invalidate(&entry.key)? {
                stats.entries_removed += 1;
                estimate = estimate.saturating_sub(entry.size_bytes + entry_file);
                debug!(key = %entry.key, size_bytes = entry.size_bytes, "Evicted cache entry");
            }
        }

        let (blobs_removed, _) = self.collect_garbage()?;
        stats.blobs_removed = blobs_removed;
        stats.bytes_freed = before.saturating_sub(self.total_size()?);
        Ok(stats)
    }

    /// Remove every entry and blob.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directories cannot be removed or recreated.
    pub fn clear(&self) -> CacheResult<()> {
        for dir in [&self.entries_dir, &self.blobs_dir] {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(dir, e)),
            }
            fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl LayerCache for LocalLayerCache {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Layer>> {
        let cache = self.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || cache.load(&key))
            .await
            .map_err(|e| CacheError::Unavailable {
                message: e.to_string(),
            })?
    }

    async fn put(&self, key: &CacheKey, layer: &Layer) -> CacheResult<()> {
        let cache = self.clone();
        let key = key.clone();
        let layer = layer.clone();
        tokio::task::spawn_blocking(move || cache.store(&key, &layer))
            .await
            .map_err(|e| CacheError::Unavailable {
                message: e.to_string(),
            })?
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

fn atomic_write(dir: &Path, target: &Path, content: &[u8]) -> CacheResult<()> {
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
    temp.write_all(content).map_err(|e| CacheError::io(temp.path(), e))?;
    temp.persist(target)
        .map_err(|e| CacheError::io(target, e.error))?;
    Ok(())
}

fn list_dir(dir: &Path) -> CacheResult<Vec<PathBuf>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CacheError::io(dir, e)),
    };
    let mut paths = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| CacheError::io(dir, e))?;
        let path = entry.path();
        // Skip in-flight temp files.
        if entry.file_name().to_string_lossy().starts_with(".tmp") {
            continue;
        }
        paths.push(path);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kiln_snapshot::{FileKind, FileMetadata, FileOp};

    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::derive(&Digest::of(b"parent"), name, &BTreeMap::new(), &Digest::of(b"base"))
    }

    fn layer(files: &[(&str, &str)]) -> Layer {
        let mut ops = Vec::new();
        let mut blobs = BTreeMap::new();
        for (path, content) in files {
            let hash = Digest::of(content.as_bytes());
            ops.push(FileOp::Add {
                path: (*path).to_string(),
                metadata: FileMetadata {
                    kind: FileKind::Regular,
                    mode: 0o644,
                    uid: 0,
                    gid: 0,
                    size: content.len() as u64,
                    content_hash: Some(hash.clone()),
                    mtime: 0,
                    link_target: None,
                    rdev: 0,
                },
            });
            blobs.insert(hash, Bytes::copy_from_slice(content.as_bytes()));
        }
        Layer::from_parts(ops, blobs).unwrap()
    }

    #[test]
    fn store_then_load() {
        let temp = tempfile::tempdir().unwrap();
        let cache = LocalLayerCache::new(temp.path()).unwrap();
        let layer = layer(&[("/a", "alpha"), ("/b", "beta")]);

        assert!(cache.load(&key("RUN a")).unwrap().is_none());
        cache.store(&key("RUN a"), &layer).unwrap();
        let loaded = cache.load(&key("RUN a")).unwrap().unwrap();
        assert_eq!(loaded, layer);
        assert!(loaded.is_complete());
    }

    #[test]
    fn storing_twice_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let cache = LocalLayerCache::new(temp.path()).unwrap();
        let layer = layer(&[("/a", "alpha")]);
        cache.store(&key("RUN a"), &layer).unwrap();
        cache.store(&key("RUN a"), &layer).unwrap();
        assert_eq!(cache.list_entries().unwrap().len(), 1);
        assert_eq!(cache.load(&key("RUN a")).unwrap().unwrap(), layer);
    }

    #[test]
    fn shared_content_is_stored_once() {
        let temp = tempfile::tempdir().unwrap();
        let cache = LocalLayerCache::new(temp.path()).unwrap();
        cache.store(&key("one"), &layer(&[("/a", "same")])).unwrap();
        cache.store(&key("two"), &layer(&[("/b", "same")])).unwrap();
        assert_eq!(list_dir(&cache.blobs_dir).unwrap().len(), 1);
    }

    #[test]
    fn incomplete_layer_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let cache = LocalLayerCache::new(temp.path()).unwrap();
        let metadata = layer(&[("/a", "alpha")]).ops()[0].metadata().unwrap().clone();
        let after = kiln_snapshot::FilesystemSnapshot::from_entries(
            [("/a".to_string(), metadata)].into_iter().collect(),
            None,
        );
        // diff() carries no content
        let bare = kiln_snapshot::diff(&kiln_snapshot::FilesystemSnapshot::new(), &after);
        assert!(matches!(cache.store(&key("bad"), &bare), Err(CacheError::Corrupt { .. })));
        assert!(cache.list_entries().unwrap().is_empty());
    }

    #[test]
    fn corrupt_entry_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let cache = LocalLayerCache::new(temp.path()).unwrap();
        let k = key("RUN a");
        fs::write(cache.entry_path(&k), b"{ not json").unwrap();
        assert!(matches!(cache.load(&k), Err(CacheError::Corrupt { .. })));
    }

    #[test]
    fn missing_blob_is_corrupt() {
        let temp = tempfile::tempdir().unwrap();
        let cache = LocalLayerCache::new(temp.path()).unwrap();
        let k = key("RUN a");
        cache.store(&k, &layer(&[("/a", "alpha")])).unwrap();
        fs::remove_file(cache.blob_path(&Digest::of(b"alpha"))).unwrap();
        assert!(matches!(cache.load(&k), Err(CacheError::Corrupt { .. })));
    }

    #[test]
    fn invalidate_and_garbage_collect() {
        let temp = tempfile::tempdir().unwrap();
        let cache = LocalLayerCache::new(temp.path()).unwrap();
        cache.store(&key("one"), &layer(&[("/a", "only-one")])).unwrap();
        cache.store(&key("two"), &layer(&[("/b", "only-two")])).unwrap();

        assert!(cache.invalidate(&key("one")).unwrap());
        assert!(!cache.invalidate(&key("one")).unwrap());
        let (removed, freed) = cache.collect_garbage().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(freed, 8);
        assert!(cache.load(&key("two")).unwrap().is_some());
    }

    #[test]
    fn prune_evicts_least_recently_used() {
        let temp = tempfile::tempdir().unwrap();
        let cache = LocalLayerCache::new(temp.path()).unwrap();
        let big = "x".repeat(4096);
        let other = "y".repeat(4096);
        cache.store(&key("old"), &layer(&[("/old", big.as_str())])).unwrap();
        cache.store(&key("new"), &layer(&[("/new", other.as_str())])).unwrap();

        let mut old = cache.read_entry(&key("old")).unwrap().unwrap();
        old.last_accessed -= chrono::Duration::hours(1);
        cache.write_entry(&old).unwrap();

        let stats = cache.prune(6000).unwrap();
        assert_eq!(stats.entries_removed, 1);
        assert_eq!(stats.blobs_removed, 1);
        assert!(stats.bytes_freed >= 4096);
        assert!(cache.load(&key("old")).unwrap().is_none());
        assert!(cache.load(&key("new")).unwrap().is_some());
        assert!(cache.total_size().unwrap() <= 6000);
    }

    #[test]
    fn clear_removes_everything() {
        let temp = tempfile::tempdir().unwrap();
        let cache = LocalLayerCache::new(temp.path()).unwrap();
        cache.store(&key("one"), &layer(&[("/a", "alpha")])).unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.total_size().unwrap(), 0);
        assert!(cache.list_entries().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn trait_calls_use_blocking_pool() {
        let temp = tempfile::tempdir().unwrap();
        let cache = LocalLayerCache::new(temp.path()).unwrap();
        let layer = layer(&[("/a", "alpha")]);
        LayerCache::put(&cache, &key("RUN a"), &layer).await.unwrap();
        assert_eq!(LayerCache::get(&cache, &key("RUN a")).await.unwrap(), Some(layer));
        assert_eq!(cache.name(), "local");
    }
}
