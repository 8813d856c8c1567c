// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Read-only query handles on converted stores, one per dataset.

use crate::Result;
use crate::config::PoolLimits;
use crate::engine::{self, ColumnInfo, QueryOutput};
use crate::error::DatasetError;
use crate::pipeline::{Acquire, acquire_into_cache, no_progress};
use crate::query::BuiltQuery;
use diagnostics::*;
use duckdb::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tiercache::CacheCoordinator;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;

struct Idle {
    conn: Connection,
    opened: Instant,
}

struct Connections {
    root: Mutex<Connection>,
    idle: Mutex<Vec<Idle>>,
    limits: PoolLimits,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connections {
    fn checkout(&self) -> Result<Idle> {
        let max_lifetime = self.limits.max_lifetime();
        let mut idle = lock(&self.idle);
        while let Some(candidate) = idle.pop() {
            if candidate.opened.elapsed() < max_lifetime {
                return Ok(candidate);
            }
        }
        drop(idle);
        let conn = lock(&self.root).try_clone()?;
        Ok(Idle {
            conn,
            opened: Instant::now(),
        })
    }

    fn checkin(&self, conn: Idle) {
        let mut idle = lock(&self.idle);
        if idle.len() < self.limits.max_idle && conn.opened.elapsed() < self.limits.max_lifetime()
        {
            idle.push(conn);
        }
    }
}

/// An open, read-only converted store.
///
/// Up to `max_open` queries run at once; connections beyond `max_idle` or
/// older than `max_lifetime` are closed when returned.
pub struct DatasetHandle {
    dataset_id: String,
    path: PathBuf,
    columns: Vec<ColumnInfo>,
    connections: Arc<Connections>,
    permits: Arc<Semaphore>,
}

impl DatasetHandle {
    /// Open `path` read-only, check it answers, and capture its schema.
    pub fn open(dataset_id: &str, path: &Path, limits: PoolLimits) -> Result<Self> {
        let conn = engine::open_read_only(path)?;
        let _: i32 = conn.query_row("SELECT 1", [], |r| r.get(0))?;
        let columns = engine::read_columns(&conn)?;
        if columns.is_empty() {
            return Err(DatasetError::Load(format!(
                "{} has no {} table",
                path.display(),
                engine::TABLE
            )));
        }
        Ok(Self {
            dataset_id: dataset_id.to_string(),
            path: path.to_path_buf(),
            columns,
            connections: Arc::new(Connections {
                root: Mutex::new(conn),
                idle: Mutex::new(Vec::new()),
                limits,
            }),
            permits: Arc::new(Semaphore::new(limits.max_open.max(1))),
        })
    }

    #[must_use]
    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Fail with `UnknownColumn` unless every name is in the schema.
    pub fn require_columns<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for name in names {
            if self.column(name).is_none() {
                return Err(DatasetError::UnknownColumn(name.to_string()));
            }
        }
        Ok(())
    }

    /// Run a built query on a blocking thread, bounded by `deadline`.
    ///
    /// The deadline covers both waiting for a connection and execution.
    pub async fn query(&self, query: BuiltQuery, deadline: Duration) -> Result<QueryOutput> {
        let started = Instant::now();
        let permit = timeout(deadline, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| DatasetError::QueryTimeout(deadline))?
            .map_err(|e| DatasetError::Task(e.to_string()))?;

        let connections = self.connections.clone();
        let task = tokio::task::spawn_blocking(move || {
            let idle = connections.checkout()?;
            let result = engine::run_query(&idle.conn, &query.sql, &query.values);
            connections.checkin(idle);
            drop(permit);
            result
        });

        let remaining = deadline.saturating_sub(started.elapsed());
        match timeout(remaining, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(DatasetError::Task(e.to_string())),
            Err(_) => Err(DatasetError::QueryTimeout(deadline)),
        }
    }

    /// Connections currently parked for reuse.
    #[must_use]
    pub fn idle_connections(&self) -> usize {
        lock(&self.connections.idle).len()
    }
}

/// Resolves datasets to open handles, acquiring them when no tier has them.
pub struct HandlePool {
    handles: RwLock<HashMap<String, Arc<DatasetHandle>>>,
    opening: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cache: Arc<CacheCoordinator>,
    acquire: Arc<dyn Acquire>,
    limits: PoolLimits,
}

impl HandlePool {
    pub fn new(cache: Arc<CacheCoordinator>, acquire: Arc<dyn Acquire>, limits: PoolLimits) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
            cache,
            acquire,
            limits,
        }
    }

    /// Open handle first, then memory, then disk, then a synchronous
    /// acquisition. Concurrent resolutions of one dataset open it once.
    pub async fn resolve(&self, dataset_id: &str) -> Result<Arc<DatasetHandle>> {
        tiercache::validate_dataset_id(dataset_id)?;

        if let Some(handle) = self.handles.read().await.get(dataset_id) {
            return Ok(handle.clone());
        }

        let guard = {
            let mut opening = lock(&self.opening);
            opening
                .entry(dataset_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _opening = guard.lock().await;
        let opened = self.open(dataset_id).await;
        let mut opening = lock(&self.opening);
        if opening
            .get(dataset_id)
            .is_some_and(|current| Arc::ptr_eq(current, &guard))
        {
            opening.remove(dataset_id);
        }
        opened
    }

    /// Called with the dataset's single-flight guard held.
    async fn open(&self, dataset_id: &str) -> Result<Arc<DatasetHandle>> {
        // Another caller may have finished while we waited
        if let Some(handle) = self.handles.read().await.get(dataset_id) {
            return Ok(handle.clone());
        }

        let path = match self.cache.locate(dataset_id) {
            Some(located) => {
                debug!("resolved {dataset_id} from cache", dataset_id: dataset_id);
                located.path
            }
            None => {
                info!("{dataset_id} not cached; acquiring", dataset_id: dataset_id);
                let path = acquire_into_cache(
                    self.acquire.as_ref(),
                    &self.cache,
                    dataset_id,
                    no_progress(),
                )
                .await?;
                if let Err(e) = self.cache.set_memory(dataset_id, &path) {
                    let error_str = e.to_string();
                    warn!("could not register {dataset_id} in memory: {error}", dataset_id: dataset_id, error: error_str);
                }
                path
            }
        };

        let id = dataset_id.to_string();
        let limits = self.limits;
        let handle = tokio::task::spawn_blocking(move || DatasetHandle::open(&id, &path, limits))
            .await
            .map_err(|e| DatasetError::Task(e.to_string()))??;
        let handle = Arc::new(handle);

        self.handles
            .write()
            .await
            .insert(dataset_id.to_string(), handle.clone());
        info!("opened handle for {dataset_id}", dataset_id: dataset_id);
        Ok(handle)
    }

    /// Close one dataset's handle. In-flight queries keep their reference.
    pub async fn evict(&self, dataset_id: &str) -> bool {
        self.handles.write().await.remove(dataset_id).is_some()
    }

    pub async fn close_all(&self) {
        let mut handles = self.handles.write().await;
        let count = handles.len();
        handles.clear();
        debug!("closed {count} dataset handles", count: count);
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ProgressSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};

    /// Builds a tiny store on demand and counts how often it was asked to.
    struct Builder {
        staging: PathBuf,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Acquire for Builder {
        async fn acquire(&self, dataset_id: &str, _progress: ProgressSink) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let path = self.staging.join(format!("{dataset_id}-new.duckdb"));
            let build = path.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let conn = Connection::open(&build)?;
                conn.execute_batch(
                    "CREATE TABLE data (estado VARCHAR, casos INTEGER);
                     INSERT INTO data VALUES ('Jalisco', 3), ('Colima', 4);",
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DatasetError::Task(e.to_string()))??;
            // Let concurrent callers pile up on the single-flight guard
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(path)
        }
    }

    fn setup(memory_entries: usize) -> (TempDir, Arc<Builder>, Arc<CacheCoordinator>, HandlePool) {
        let dir = tempdir().expect("tempdir");
        let cache = Arc::new(CacheCoordinator::new(
            tiercache::MemoryIndex::new(memory_entries, u64::MAX),
            tiercache::DiskStore::new(dir.path(), u64::MAX).expect("disk"),
            Arc::new(tiercache::MemoryResultCache::new()),
        ));
        let builder = Arc::new(Builder {
            staging: cache.staging_dir(),
            calls: AtomicUsize::new(0),
        });
        let pool = HandlePool::new(cache.clone(), builder.clone(), PoolLimits::default());
        (dir, builder, cache, pool)
    }

    fn count_query() -> BuiltQuery {
        BuiltQuery {
            sql: "SELECT COUNT(*) FROM data".to_string(),
            values: Vec::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_acquires_once() {
        let (_dir, builder, _cache, pool) = setup(10);
        let pool = Arc::new(pool);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.resolve("abc").await }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.expect("join").expect("resolve"));
        }

        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_joined_resolves_share_one_open() {
        let (_dir, builder, _cache, pool) = setup(10);

        let (a, b, c) = tokio::join!(pool.resolve("abc"), pool.resolve("abc"), pool.resolve("abc"));
        let (a, b, c) = (a.expect("a"), b.expect("b"), c.expect("c"));

        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
        assert_eq!(pool.len().await, 1);
        // The single-flight guard is released once resolution finishes
        assert!(lock(&pool.opening).is_empty());
    }

    #[tokio::test]
    async fn test_handle_queries_and_schema() {
        let (_dir, _builder, _cache, pool) = setup(10);
        let handle = pool.resolve("abc").await.expect("resolve");

        assert_eq!(handle.columns().len(), 2);
        assert!(handle.require_columns(["estado", "casos"]).is_ok());
        assert!(matches!(
            handle.require_columns(["missing"]),
            Err(DatasetError::UnknownColumn(c)) if c == "missing"
        ));

        let out = handle
            .query(count_query(), Duration::from_secs(5))
            .await
            .expect("query");
        assert_eq!(out.scalar(), Some(&serde_json::Value::from(2)));
        assert_eq!(handle.idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_evicted_from_memory_reopens_from_disk() {
        let (_dir, builder, cache, pool) = setup(1);
        pool.resolve("one").await.expect("one");
        pool.resolve("two").await.expect("two");
        assert!(cache.get_memory("one").is_none());

        pool.close_all().await;
        assert!(pool.is_empty().await);

        let handle = pool.resolve("one").await.expect("reopen");
        assert_eq!(handle.path(), cache.cache_dir().join("one.duckdb"));
        // Served from disk: no second acquisition
        assert_eq!(builder.calls.load(Ordering::SeqCst), 2);
        assert!(cache.get_memory("one").is_some());
    }

    #[tokio::test]
    async fn test_invalid_dataset_id() {
        let (_dir, builder, _cache, pool) = setup(10);
        assert!(pool.resolve("a/b").await.is_err());
        assert_eq!(builder.calls.load(Ordering::SeqCst), 0);
    }
}
