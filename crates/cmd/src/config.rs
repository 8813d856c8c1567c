// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! `visor` configuration: a YAML file plus environment overrides.
//!
//! ```yaml
//! cache:
//!   cache_dir: ./cache
//!   memory_entries: 10
//!   redis_url: redis://localhost:6379
//! dataset:
//!   catalog_url: https://datos.gob.mx/api/3/action/
//!   pool:
//!     max_open: 10
//! ```

use anyhow::{Context, Result};
use dataset::DatasetConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tiercache::CacheConfig;

pub const CONFIG_ENV: &str = "VISOR_CONFIG";
pub const CATALOG_URL_ENV: &str = "CKAN_URL";
pub const REDIS_URL_ENV: &str = "REDIS_URL";
pub const CACHE_DIR_ENV: &str = "CACHE_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub dataset: DatasetConfig,
}

/// Read, override from the environment, and validate.
///
/// An explicit `path` wins over `VISOR_CONFIG`; with neither, defaults are
/// used.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let env_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
    let mut config = match path.or(env_path.as_deref()) {
        Some(path) => read_config(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate_config(&config)?;
    Ok(config)
}

pub fn read_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    serde_yaml_ng::from_str(content).with_context(|| "Failed to parse YAML configuration")
}

/// Apply `CKAN_URL`, `REDIS_URL` and `CACHE_DIR`. Empty values are ignored.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    if let Some(url) = get(CATALOG_URL_ENV) {
        config.dataset.catalog_url = url;
    }
    if let Some(url) = get(REDIS_URL_ENV) {
        config.cache.redis_url = Some(url);
    }
    if let Some(dir) = get(CACHE_DIR_ENV) {
        config.cache.cache_dir = PathBuf::from(dir);
    }
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.dataset.catalog_url.trim().is_empty() {
        anyhow::bail!("dataset.catalog_url cannot be empty");
    }
    if config
        .cache
        .redis_url
        .as_deref()
        .is_some_and(|url| url.trim().is_empty())
    {
        anyhow::bail!("cache.redis_url cannot be empty when set");
    }
    config.cache.validate()?;
    config.dataset.validate()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_yaml_keeps_defaults() -> Result<()> {
        let config = parse_config(
            "cache:\n  cache_dir: /var/cache/visor\n  memory_entries: 4\n\
             dataset:\n  pool:\n    max_open: 2\n",
        )?;
        assert_eq!(config.cache.cache_dir, PathBuf::from("/var/cache/visor"));
        assert_eq!(config.cache.memory_entries, 4);
        assert_eq!(config.cache.disk_max_bytes, CacheConfig::default().disk_max_bytes);
        assert_eq!(config.dataset.pool.max_open, 2);
        assert_eq!(config.dataset.pool.max_idle, 5);
        assert_eq!(config.dataset.catalog_url, DatasetConfig::default().catalog_url);
        validate_config(&config)?;
        Ok(())
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CKAN_URL", "http://localhost:5000/api/3/action/"),
            ("REDIS_URL", "redis://cache:6379"),
            ("CACHE_DIR", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| env.get(key).map(|v| (*v).to_string()));
        assert_eq!(config.dataset.catalog_url, "http://localhost:5000/api/3/action/");
        assert_eq!(config.cache.redis_url.as_deref(), Some("redis://cache:6379"));
        // Empty values do not override
        assert_eq!(config.cache.cache_dir, PathBuf::from("./cache"));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.dataset.catalog_url = " ".to_string();
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.cache.memory_entries = 0;
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.cache.redis_url = Some(String::new());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_read_config_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("visor.yaml");
        std::fs::write(&path, "dataset:\n  query_timeout_secs: 5\n")?;
        let config = read_config(&path)?;
        assert_eq!(config.dataset.query_timeout_secs, 5);

        assert!(read_config(&dir.path().join("missing.yaml")).is_err());
        Ok(())
    }
}
