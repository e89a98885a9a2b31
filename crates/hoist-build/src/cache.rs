//! Layer cache keyed by `(parent snapshot digest, stage cache key)`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::snapshot::SnapshotDelta;

const INDEX_FILE: &str = "layers.json";

/// Cached layer deltas, optionally persisted as JSON in a cache directory.
#[derive(Debug, Default)]
pub struct LayerCache {
    dir: Option<PathBuf>,
    index: CacheIndex,
    dirty: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    #[serde(default)]
    layers: BTreeMap<String, SnapshotDelta>,
}

impl LayerCache {
    /// A cache that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the cache stored in `dir`, starting empty when there is none yet.
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        let path = dir.join(INDEX_FILE);
        let index = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| CacheError::Read {
                path: path.clone(),
                source: e,
            })?;
            match serde_json::from_str(&content) {
                Ok(index) => index,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "discarding unreadable layer cache");
                    CacheIndex::default()
                }
            }
        } else {
            CacheIndex::default()
        };
        tracing::debug!(dir = %dir.display(), layers = index.layers.len(), "layer cache opened");
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            index,
            dirty: false,
        })
    }

    /// Directory holding the index and layer blobs, if persistent.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn get(&self, parent: &str, cache_key: &str) -> Option<&SnapshotDelta> {
        self.index.layers.get(&entry_key(parent, cache_key))
    }

    pub fn insert(&mut self, parent: &str, cache_key: &str, delta: SnapshotDelta) {
        self.index.layers.insert(entry_key(parent, cache_key), delta);
        self.dirty = true;
    }

    /// Drops an entry whose content can no longer be replayed.
    pub fn invalidate(&mut self, parent: &str, cache_key: &str) {
        if self.index.layers.remove(&entry_key(parent, cache_key)).is_some() {
            self.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.index.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.layers.is_empty()
    }

    /// Writes the index back to the cache directory. A no-op for in-memory caches.
    pub fn save(&mut self) -> Result<(), CacheError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }
        std::fs::create_dir_all(dir).map_err(|e| CacheError::Write {
            path: dir.clone(),
            source: e,
        })?;
        let path = dir.join(INDEX_FILE);
        let content = serde_json::to_string_pretty(&self.index)?;
        std::fs::write(&path, content).map_err(|e| CacheError::Write { path, source: e })?;
        self.dirty = false;
        Ok(())
    }
}

fn entry_key(parent: &str, cache_key: &str) -> String {
    format!("{parent}:{cache_key}")
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to read layer cache {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write layer cache {path}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize layer cache")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_across_open() {
        let tmp = tempfile::tempdir().unwrap();
        let mut delta = SnapshotDelta::default();
        delta.env.insert("A".to_owned(), "1".to_owned());

        let mut cache = LayerCache::open(tmp.path()).unwrap();
        cache.insert("parent", "key", delta.clone());
        cache.save().unwrap();

        let reopened = LayerCache::open(tmp.path()).unwrap();
        assert_eq!(reopened.get("parent", "key"), Some(&delta));
        assert!(reopened.get("other", "key").is_none());
    }

    #[test]
    fn corrupt_index_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(INDEX_FILE), "{not json").unwrap();
        let cache = LayerCache::open(tmp.path()).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn in_memory_save_is_noop() {
        let mut cache = LayerCache::in_memory();
        cache.insert("p", "k", SnapshotDelta::default());
        cache.save().unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.dir().is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let mut cache = LayerCache::in_memory();
        cache.insert("p", "k", SnapshotDelta::default());
        cache.invalidate("p", "k");
        assert!(cache.get("p", "k").is_none());
    }
}
