// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Bounded LRU index of "hot" converted stores.
//!
//! The index only remembers where a dataset's store lives and how large it is.
//! Two bounds apply at once: a small entry cap sized for the working set, and a
//! cumulative byte budget. Both are enforced after every insert or update.

use diagnostics::*;
use lru::LruCache;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default entry cap: the hot working set is small.
pub const DEFAULT_MEMORY_ENTRIES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub path: PathBuf,
    pub size: u64,
}

struct Inner {
    entries: LruCache<String, MemoryEntry>,
    total_bytes: u64,
}

/// Recency-ordered map from dataset id to store path.
///
/// Reads and writes share one lock because `get` mutates recency.
pub struct MemoryIndex {
    capacity: usize,
    max_bytes: u64,
    inner: Mutex<Inner>,
}

impl MemoryIndex {
    #[must_use]
    pub fn new(capacity: usize, max_bytes: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            max_bytes,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a dataset and mark it most recently used.
    pub fn get(&self, dataset_id: &str) -> Option<PathBuf> {
        let mut inner = self.lock();
        inner.entries.get(dataset_id).map(|e| e.path.clone())
    }

    /// Insert or update an entry, then evict from the cold end until both
    /// bounds hold. Returns the evicted dataset ids, oldest first.
    pub fn set(&self, dataset_id: &str, path: PathBuf, size: u64) -> Vec<String> {
        let mut inner = self.lock();

        let replaced = inner
            .entries
            .put(dataset_id.to_string(), MemoryEntry { path, size });
        if let Some(old) = replaced {
            inner.total_bytes = inner.total_bytes.saturating_sub(old.size);
        }
        inner.total_bytes += size;

        let mut evicted = Vec::new();
        while inner.entries.len() > self.capacity || inner.total_bytes > self.max_bytes {
            let Some((id, entry)) = inner.entries.pop_lru() else {
                break;
            };
            inner.total_bytes = inner.total_bytes.saturating_sub(entry.size);
            debug!("memory index evicted {id} ({size} bytes)", id: id, size: entry.size);
            evicted.push(id);
        }
        evicted
    }

    /// Drop an entry. Returns whether it was present.
    pub fn remove(&self, dataset_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.entries.pop(dataset_id) {
            Some(entry) => {
                inner.total_bytes = inner.total_bytes.saturating_sub(entry.size);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Dataset ids from most to least recently used. Does not touch recency.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.lock().entries.iter().map(|(k, _)| k.clone()).collect()
    }
}
