// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::Result;
use crate::error::CacheError;
use crate::memory::DEFAULT_MEMORY_ENTRIES;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

/// Sizing and placement of the three cache tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding converted stores.
    pub cache_dir: PathBuf,

    /// Entry cap of the memory index.
    pub memory_entries: usize,

    /// Byte budget of the memory index.
    pub memory_max_bytes: u64,

    /// Byte budget of the disk store.
    pub disk_max_bytes: u64,

    /// Remote result cache. An in-process cache is used when absent.
    pub redis_url: Option<String>,

    pub redis_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache"),
            memory_entries: DEFAULT_MEMORY_ENTRIES,
            memory_max_bytes: 2 * GIB,
            disk_max_bytes: 20 * GIB,
            redis_url: None,
            redis_timeout_ms: 2_000,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(CacheError::Configuration("cache_dir is empty".to_string()));
        }
        if self.memory_entries == 0 {
            return Err(CacheError::Configuration(
                "memory_entries must be positive".to_string(),
            ));
        }
        if self.memory_max_bytes == 0 || self.disk_max_bytes == 0 {
            return Err(CacheError::Configuration(
                "cache byte budgets must be positive".to_string(),
            ));
        }
        if let Some(url) = &self.redis_url {
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                return Err(CacheError::Configuration(format!(
                    "redis_url must start with redis:// or rediss://, got {url:?}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.memory_entries, 10);
        assert_eq!(config.redis_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = CacheConfig {
            memory_entries: 0,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());

        let config = CacheConfig {
            redis_url: Some("localhost:6379".to_string()),
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"cache_dir": "/var/cache/visor"}"#).expect("parse");
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/visor"));
        assert_eq!(config.disk_max_bytes, 20 * GIB);
    }
}
