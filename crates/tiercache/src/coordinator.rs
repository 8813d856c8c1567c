// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Single entry point over the memory index, disk store and result cache.

use crate::Result;
use crate::config::CacheConfig;
use crate::disk::DiskStore;
use crate::fingerprint::fingerprint;
use crate::memory::MemoryIndex;
use crate::result::{MemoryResultCache, RedisResultCache, ResultCache};
use diagnostics::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Which tier answered a store lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Memory,
    Disk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub path: PathBuf,
    pub tier: Tier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub capacity: usize,
    pub max_bytes: u64,
}

pub struct CacheCoordinator {
    memory: MemoryIndex,
    disk: DiskStore,
    results: Arc<dyn ResultCache>,
}

impl CacheCoordinator {
    pub fn new(memory: MemoryIndex, disk: DiskStore, results: Arc<dyn ResultCache>) -> Self {
        Self {
            memory,
            disk,
            results,
        }
    }

    /// Build every tier from configuration. Connects to Redis when a URL is
    /// configured, otherwise results are cached in-process.
    pub async fn from_config(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let memory = MemoryIndex::new(config.memory_entries, config.memory_max_bytes);
        let disk = DiskStore::new(&config.cache_dir, config.disk_max_bytes)?;
        let results: Arc<dyn ResultCache> = match &config.redis_url {
            Some(url) => Arc::new(RedisResultCache::connect(url, config.redis_timeout()).await?),
            None => {
                info!("no redis_url configured; caching results in-process");
                Arc::new(MemoryResultCache::new())
            }
        };
        Ok(Self::new(memory, disk, results))
    }

    pub fn get_memory(&self, dataset_id: &str) -> Option<PathBuf> {
        let hit = self.memory.get(dataset_id);
        if hit.is_some() {
            debug!("memory hit for {dataset_id}", dataset_id: dataset_id);
        }
        hit
    }

    /// Record a store in the memory index, sized from the file on disk.
    pub fn set_memory(&self, dataset_id: &str, path: &Path) -> Result<()> {
        let size = std::fs::metadata(path)?.len();
        let evicted = self.memory.set(dataset_id, path.to_path_buf(), size);
        if !evicted.is_empty() {
            let count = evicted.len();
            debug!("memory index made room for {dataset_id} by evicting {count} entries", dataset_id: dataset_id, count: count);
        }
        Ok(())
    }

    pub fn remove_memory(&self, dataset_id: &str) -> bool {
        self.memory.remove(dataset_id)
    }

    pub fn get_disk(&self, dataset_id: &str) -> Option<PathBuf> {
        let hit = self.disk.get(dataset_id);
        if hit.is_some() {
            debug!("disk hit for {dataset_id}", dataset_id: dataset_id);
        }
        hit
    }

    /// Move a converted store into the disk tier and return where it lives.
    ///
    /// When the dataset is already on disk the existing path is returned and
    /// `src` is left untouched. Datasets evicted to respect the disk budget
    /// are dropped from the memory index too.
    pub fn set_disk(&self, dataset_id: &str, src: &Path) -> Result<PathBuf> {
        let placement = self.disk.set(dataset_id, src)?;
        for evicted in &placement.evicted {
            let _ = self.memory.remove(evicted);
        }
        if placement.placed {
            info!("stored {dataset_id} on disk", dataset_id: dataset_id);
        }
        Ok(placement.path)
    }

    /// Find a converted store in memory, then on disk. A disk hit is promoted
    /// into the memory index.
    pub fn locate(&self, dataset_id: &str) -> Option<Located> {
        if let Some(path) = self.get_memory(dataset_id) {
            if path.is_file() {
                return Some(Located {
                    path,
                    tier: Tier::Memory,
                });
            }
            let _ = self.memory.remove(dataset_id);
        }
        let path = self.get_disk(dataset_id)?;
        if let Err(e) = self.set_memory(dataset_id, &path) {
            let error_str = e.to_string();
            warn!("could not promote {dataset_id} to memory: {error}", dataset_id: dataset_id, error: error_str);
        }
        Some(Located {
            path,
            tier: Tier::Disk,
        })
    }

    /// Fetch a cached result. Remote failures count as a miss.
    pub async fn get_result(&self, key: &str) -> Option<Vec<u8>> {
        match self.results.get(key).await {
            Ok(Some(bytes)) => {
                debug!("result cache hit {key}", key: key);
                Some(bytes)
            }
            Ok(None) => {
                debug!("result cache miss {key}", key: key);
                None
            }
            Err(e) => {
                let error_str = e.to_string();
                warn!("result cache read failed for {key}: {error}", key: key, error: error_str);
                None
            }
        }
    }

    pub async fn set_result(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.results.set(key, value, ttl).await
    }

    pub fn fingerprint<T: Serialize>(
        &self,
        prefix: &str,
        dataset_id: &str,
        params: &T,
    ) -> Result<String> {
        fingerprint(prefix, dataset_id, params)
    }

    #[must_use]
    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            entries: self.memory.len(),
            total_bytes: self.memory.total_bytes(),
            capacity: self.memory.capacity(),
            max_bytes: self.memory.max_bytes(),
        }
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        self.disk.dir()
    }

    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.disk.staging_dir()
    }

    pub fn disk_usage(&self) -> Result<u64> {
        self.disk.usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn coordinator(dir: &Path, entries: usize, disk_max: u64) -> CacheCoordinator {
        CacheCoordinator::new(
            MemoryIndex::new(entries, u64::MAX),
            DiskStore::new(dir, disk_max).expect("disk store"),
            Arc::new(MemoryResultCache::new()),
        )
    }

    fn staged(coordinator: &CacheCoordinator, id: &str, bytes: usize) -> PathBuf {
        let path = coordinator.staging_dir().join(format!("{id}.tmp"));
        fs::write(&path, vec![0u8; bytes]).expect("write staged");
        path
    }

    #[test]
    fn test_set_memory_uses_file_size() {
        let dir = tempdir().expect("tempdir");
        let c = coordinator(dir.path(), 10, u64::MAX);
        let path = c.set_disk("abc", &staged(&c, "abc", 123)).expect("set_disk");
        c.set_memory("abc", &path).expect("set_memory");

        let stats = c.memory_stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 123);
        assert_eq!(c.get_memory("abc"), Some(path));
    }

    #[test]
    fn test_set_memory_missing_file_fails() {
        let dir = tempdir().expect("tempdir");
        let c = coordinator(dir.path(), 10, u64::MAX);
        assert!(c.set_memory("abc", &dir.path().join("nope")).is_err());
        assert!(c.get_memory("abc").is_none());
    }

    #[test]
    fn test_set_disk_race_returns_existing_path() {
        let dir = tempdir().expect("tempdir");
        let c = coordinator(dir.path(), 10, u64::MAX);
        let first = c.set_disk("abc", &staged(&c, "first", 1)).expect("first");
        let loser = staged(&c, "second", 2);
        let second = c.set_disk("abc", &loser).expect("second");
        assert_eq!(first, second);
        assert!(loser.exists());
    }

    #[test]
    fn test_memory_eviction_falls_back_to_disk() {
        let dir = tempdir().expect("tempdir");
        let c = coordinator(dir.path(), 1, u64::MAX);
        for id in ["one", "two"] {
            let path = c.set_disk(id, &staged(&c, id, 10)).expect("set_disk");
            c.set_memory(id, &path).expect("set_memory");
        }
        assert!(c.get_memory("one").is_none());

        let located = c.locate("one").expect("on disk");
        assert_eq!(located.tier, Tier::Disk);
        // Promotion makes the next lookup a memory hit
        assert_eq!(c.locate("one").expect("promoted").tier, Tier::Memory);
    }

    #[test]
    fn test_disk_eviction_drops_memory_entry() {
        let dir = tempdir().expect("tempdir");
        let c = coordinator(dir.path(), 10, 15);
        let old = c.set_disk("old", &staged(&c, "old", 10)).expect("old");
        c.set_memory("old", &old).expect("memory");
        std::thread::sleep(Duration::from_millis(20));
        c.set_disk("new", &staged(&c, "new", 10)).expect("new");

        assert!(c.get_memory("old").is_none());
        assert!(c.locate("old").is_none());
        assert!(c.locate("new").is_some());
    }

    #[tokio::test]
    async fn test_results_round_trip() {
        let dir = tempdir().expect("tempdir");
        let c = coordinator(dir.path(), 10, u64::MAX);
        let key = c
            .fingerprint("stats", "abc", &serde_json::json!({"column": "edad"}))
            .expect("fingerprint");
        assert!(c.get_result(&key).await.is_none());
        c.set_result(&key, b"{}", Duration::from_secs(60))
            .await
            .expect("set_result");
        assert_eq!(c.get_result(&key).await, Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn test_from_config_without_redis() {
        let dir = tempdir().expect("tempdir");
        let config = CacheConfig {
            cache_dir: dir.path().join("cache"),
            ..CacheConfig::default()
        };
        let c = CacheCoordinator::from_config(&config).await.expect("coordinator");
        assert!(c.staging_dir().is_dir());
        assert_eq!(c.cache_dir(), dir.path().join("cache"));
        assert_eq!(c.disk_usage().expect("usage"), 0);
    }
}
