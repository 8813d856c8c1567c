// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! On-disk store of converted datasets, one `<id>.duckdb` file per dataset.
//!
//! Placement is a rename into the store directory and never overwrites an
//! existing file, so two conversions racing to finish the same dataset leave
//! the first one in place. After each placement the byte budget is enforced by
//! deleting the oldest stores (by modification time).

use crate::error::CacheError;
use diagnostics::*;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

pub const STORE_EXTENSION: &str = "duckdb";
const STAGING_DIR: &str = ".staging";

/// Check that a dataset id is safe to use as a file name.
pub fn validate_dataset_id(dataset_id: &str) -> Result<(), CacheError> {
    let ok = !dataset_id.is_empty()
        && dataset_id.len() <= 128
        && dataset_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CacheError::InvalidDatasetId(dataset_id.to_string()))
    }
}

/// Outcome of [`DiskStore::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Where the dataset's store lives now.
    pub path: PathBuf,
    /// False when a store was already present and the source was left alone.
    pub placed: bool,
    /// Datasets deleted to bring the store back under budget.
    pub evicted: Vec<String>,
}

pub struct DiskStore {
    dir: PathBuf,
    max_bytes: u64,
    lock: Mutex<()>,
}

impl DiskStore {
    pub fn new<P: AsRef<Path>>(dir: P, max_bytes: u64) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(STAGING_DIR))?;
        Ok(Self {
            dir,
            max_bytes,
            lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scratch directory for conversions in progress. Lives on the same
    /// filesystem as the store so placement is a plain rename.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.dir.join(STAGING_DIR)
    }

    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn path_for(&self, dataset_id: &str) -> Result<PathBuf, CacheError> {
        validate_dataset_id(dataset_id)?;
        Ok(self.dir.join(format!("{dataset_id}.{STORE_EXTENSION}")))
    }

    pub fn get(&self, dataset_id: &str) -> Option<PathBuf> {
        let path = self.path_for(dataset_id).ok()?;
        path.is_file().then_some(path)
    }

    /// Move `src` into the store as the dataset's file.
    ///
    /// A no-op when the destination already exists.
    pub fn set(&self, dataset_id: &str, src: &Path) -> Result<Placement, CacheError> {
        let dst = self.path_for(dataset_id)?;
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        if dst.exists() {
            debug!("disk store already holds {dataset_id}; leaving source in place", dataset_id: dataset_id);
            return Ok(Placement {
                path: dst,
                placed: false,
                evicted: Vec::new(),
            });
        }

        match fs::rename(src, &dst) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::CrossesDevices => {
                fs::copy(src, &dst)?;
                fs::remove_file(src)?;
            }
            Err(e) => return Err(e.into()),
        }

        let evicted = self.enforce_budget(&dst)?;
        Ok(Placement {
            path: dst,
            placed: true,
            evicted,
        })
    }

    /// Delete a dataset's store (and its write-ahead log, if any).
    pub fn remove(&self, dataset_id: &str) -> Result<bool, CacheError> {
        let path = self.path_for(dataset_id)?;
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        remove_store_file(&path)
    }

    /// Total bytes held by store files.
    pub fn usage(&self) -> Result<u64, CacheError> {
        Ok(self.stores()?.iter().map(|s| s.size).sum())
    }

    fn stores(&self) -> Result<Vec<StoreFile>, CacheError> {
        let mut stores = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            stores.push(StoreFile {
                id,
                path,
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(stores)
    }

    fn enforce_budget(&self, keep: &Path) -> Result<Vec<String>, CacheError> {
        let mut stores = self.stores()?;
        let mut total: u64 = stores.iter().map(|s| s.size).sum();
        if total <= self.max_bytes {
            return Ok(Vec::new());
        }

        stores.sort_by_key(|s| s.modified);
        let mut evicted = Vec::new();
        for store in stores {
            if total <= self.max_bytes {
                break;
            }
            if store.path == keep {
                continue;
            }
            match remove_store_file(&store.path) {
                Ok(_) => {
                    total = total.saturating_sub(store.size);
                    info!("disk store evicted {id} ({size} bytes)", id: store.id.clone(), size: store.size);
                    evicted.push(store.id);
                }
                Err(e) => {
                    let error_str = e.to_string();
                    warn!("could not evict {id} from disk store: {error}", id: store.id.clone(), error: error_str);
                }
            }
        }
        Ok(evicted)
    }
}

struct StoreFile {
    id: String,
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

fn remove_store_file(path: &Path) -> Result<bool, CacheError> {
    let removed = match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };
    let wal = path.with_extension(format!("{STORE_EXTENSION}.wal"));
    match fs::remove_file(wal) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn write(path: &Path, bytes: usize) {
        fs::write(path, vec![b'x'; bytes]).expect("write file");
    }

    #[test]
    fn test_validate_dataset_id() {
        assert!(validate_dataset_id("4f7c-aa_01").is_ok());
        assert!(validate_dataset_id("").is_err());
        assert!(validate_dataset_id("../etc/passwd").is_err());
        assert!(validate_dataset_id("a b").is_err());
        assert!(validate_dataset_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_set_moves_file_into_store() {
        let dir = tempdir().expect("tempdir");
        let store = DiskStore::new(dir.path().join("cache"), u64::MAX).expect("store");
        let src = store.staging_dir().join("abc-tmp.duckdb");
        write(&src, 16);

        let placement = store.set("abc", &src).expect("set");
        assert!(placement.placed);
        assert_eq!(placement.path, dir.path().join("cache/abc.duckdb"));
        assert!(!src.exists());
        assert_eq!(store.get("abc"), Some(placement.path));
    }

    #[test]
    fn test_set_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = DiskStore::new(dir.path(), u64::MAX).expect("store");
        let first = dir.path().join("first.bin");
        let second = dir.path().join("second.bin");
        fs::write(&first, b"original").expect("write");
        fs::write(&second, b"replacement").expect("write");

        store.set("abc", &first).expect("first set");
        let placement = store.set("abc", &second).expect("second set");

        assert!(!placement.placed);
        assert_eq!(fs::read(&placement.path).expect("read"), b"original");
        // The second source is not consumed
        assert!(second.exists());
    }

    #[test]
    fn test_get_missing() {
        let dir = tempdir().expect("tempdir");
        let store = DiskStore::new(dir.path(), u64::MAX).expect("store");
        assert_eq!(store.get("missing"), None);
        assert_eq!(store.get("../missing"), None);
    }

    #[test]
    fn test_budget_evicts_oldest_other_than_placed() {
        let dir = tempdir().expect("tempdir");
        let store = DiskStore::new(dir.path(), 250).expect("store");

        for id in ["one", "two"] {
            let src = dir.path().join(format!("{id}.src"));
            write(&src, 100);
            store.set(id, &src).expect("set");
            // Distinct modification times
            std::thread::sleep(Duration::from_millis(20));
        }

        let src = dir.path().join("three.src");
        write(&src, 100);
        let placement = store.set("three", &src).expect("set");

        assert_eq!(placement.evicted, vec!["one".to_string()]);
        assert!(store.get("one").is_none());
        assert!(store.get("two").is_some());
        assert!(store.get("three").is_some());
        assert_eq!(store.usage().expect("usage"), 200);
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().expect("tempdir");
        let store = DiskStore::new(dir.path(), u64::MAX).expect("store");
        let src = dir.path().join("x.src");
        write(&src, 4);
        store.set("x", &src).expect("set");
        assert!(store.remove("x").expect("remove"));
        assert!(!store.remove("x").expect("remove again"));
    }
}
