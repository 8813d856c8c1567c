// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Shared cache of computed query results, keyed by fingerprint.

use crate::Result;
use crate::error::CacheError;
use async_trait::async_trait;
use diagnostics::*;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// The kinds of results the service caches, each with its own lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultClass {
    Filters,
    Metadata,
    FilteredRows,
    Aggregate,
    Stats,
    TopValues,
    TimeSeries,
    CrossTab,
    Percentiles,
    Correlation,
}

impl ResultClass {
    /// Fingerprint prefix for this class.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            ResultClass::Filters => "filters",
            ResultClass::Metadata => "metadata",
            ResultClass::FilteredRows => "data",
            ResultClass::Aggregate => "aggregate",
            ResultClass::Stats => "stats",
            ResultClass::TopValues => "top_values",
            ResultClass::TimeSeries => "timeseries",
            ResultClass::CrossTab => "crosstab",
            ResultClass::Percentiles => "percentiles",
            ResultClass::Correlation => "correlation",
        }
    }

    #[must_use]
    pub fn ttl(self) -> Duration {
        const HOUR: u64 = 60 * 60;
        match self {
            ResultClass::Filters | ResultClass::Metadata => Duration::from_secs(24 * HOUR),
            ResultClass::FilteredRows => Duration::from_secs(30 * 60),
            _ => Duration::from_secs(HOUR),
        }
    }
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
}

/// Redis-backed result cache over one multiplexed connection.
#[derive(Clone)]
pub struct RedisResultCache {
    conn: MultiplexedConnection,
    op_timeout: Duration,
}

impl RedisResultCache {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = timeout(op_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| CacheError::Timeout(op_timeout))??;
        let pong: String = timeout(op_timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| CacheError::Timeout(op_timeout))??;
        debug!("redis answered {pong}", pong: pong);
        info!("redis result cache connected");
        Ok(Self { conn, op_timeout })
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = timeout(self.op_timeout, conn.get(key))
            .await
            .map_err(|_| CacheError::Timeout(self.op_timeout))??;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = timeout(self.op_timeout, conn.set_ex(key, value, seconds))
            .await
            .map_err(|_| CacheError::Timeout(self.op_timeout))??;
        Ok(())
    }
}

/// In-process result cache with per-entry expiry.
///
/// Used when no remote cache is configured. Expired entries are dropped
/// lazily on read and swept on write.
#[derive(Default)]
pub struct MemoryResultCache {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryResultCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match entries.get(key) {
            Some((value, expires)) if *expires > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        entries.insert(key.to_string(), (value.to_vec(), now + ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_classes() {
        assert_eq!(ResultClass::Filters.ttl(), Duration::from_secs(86_400));
        assert_eq!(ResultClass::Metadata.ttl(), Duration::from_secs(86_400));
        assert_eq!(ResultClass::FilteredRows.ttl(), Duration::from_secs(1_800));
        assert_eq!(ResultClass::Aggregate.ttl(), Duration::from_secs(3_600));
        assert_eq!(ResultClass::Correlation.ttl(), Duration::from_secs(3_600));
    }

    #[tokio::test]
    async fn test_memory_cache_round_trip() {
        let cache = MemoryResultCache::new();
        assert_eq!(cache.get("k").await.expect("get"), None);
        cache
            .set("k", b"value", Duration::from_secs(60))
            .await
            .expect("set");
        assert_eq!(cache.get("k").await.expect("get"), Some(b"value".to_vec()));
    }

    #[tokio::test]
    async fn test_memory_cache_expiry() {
        let cache = MemoryResultCache::new();
        cache
            .set("short", b"v", Duration::from_millis(10))
            .await
            .expect("set");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("short").await.expect("get"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_redis_connect_failure_is_an_error() {
        // Nothing listens on port 1
        let result =
            RedisResultCache::connect("redis://127.0.0.1:1/", Duration::from_millis(500)).await;
        assert!(result.is_err());
    }
}
