// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::Result;
use crate::error::DatasetError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection limits applied to each dataset's read-only handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolLimits {
    pub max_open: usize,
    pub max_idle: usize,
    pub max_lifetime_secs: u64,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_open: 10,
            max_idle: 5,
            max_lifetime_secs: 60 * 60,
        }
    }
}

impl PoolLimits {
    #[must_use]
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// CKAN action API base, e.g. `https://example.org/api/3/action/`.
    pub catalog_url: String,
    pub catalog_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub job_retention_secs: u64,
    pub cleanup_interval_secs: u64,
    pub query_timeout_secs: u64,
    pub pool: PoolLimits,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            catalog_url: "https://datos.gob.mx/api/3/action/".to_string(),
            catalog_timeout_secs: 30,
            download_timeout_secs: 30 * 60,
            progress_interval_ms: 500,
            job_retention_secs: 60 * 60,
            cleanup_interval_secs: 5 * 60,
            query_timeout_secs: 30,
            pool: PoolLimits::default(),
        }
    }
}

impl DatasetConfig {
    #[must_use]
    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_secs(self.catalog_timeout_secs)
    }

    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    #[must_use]
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.catalog_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DatasetError::Configuration(format!(
                "catalog_url must be http or https: {}",
                self.catalog_url
            )));
        }
        let positive = [
            ("catalog_timeout_secs", self.catalog_timeout_secs),
            ("download_timeout_secs", self.download_timeout_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("query_timeout_secs", self.query_timeout_secs),
            ("pool.max_open", self.pool.max_open as u64),
            ("pool.max_lifetime_secs", self.pool.max_lifetime_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DatasetError::Configuration(format!(
                    "{name} must be positive"
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
        let config = DatasetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.progress_interval(), Duration::from_millis(500));
        assert_eq!(config.job_retention(), Duration::from_secs(3600));
        assert_eq!(config.pool.max_open, 10);
        assert_eq!(config.pool.max_idle, 5);
    }

    #[test]
    fn test_rejects_bad_catalog_url() {
        let config = DatasetConfig {
            catalog_url: "ftp://catalog/".to_string(),
            ..DatasetConfig::default()
        };
        assert!(config.validate().is_err());

        let config = DatasetConfig {
            catalog_url: "not a url".to_string(),
            ..DatasetConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_pool() {
        let config = DatasetConfig {
            pool: PoolLimits {
                max_open: 0,
                ..PoolLimits::default()
            },
            ..DatasetConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
