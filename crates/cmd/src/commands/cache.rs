// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::commands::render;
use crate::config::Config;
use anyhow::{Context, Result};
use dataset::DatasetManager;
use serde::Serialize;
use tiercache::MemoryStats;

#[derive(Serialize)]
struct CacheReport<'a> {
    cache_dir: String,
    memory: MemoryStats,
    disk_bytes: u64,
    disk_max_bytes: u64,
    redis: Option<&'a str>,
}

/// Show memory index occupancy and disk usage.
pub fn cache_command<F>(manager: &DatasetManager, config: &Config, mut handler: F) -> Result<()>
where
    F: FnMut(&str),
{
    let cache = manager.cache();
    let report = CacheReport {
        cache_dir: cache.cache_dir().display().to_string(),
        memory: cache.memory_stats(),
        disk_bytes: cache.disk_usage()?,
        disk_max_bytes: config.cache.disk_max_bytes,
        redis: config.cache.redis_url.as_ref().map(|_| "configured"),
    };
    handler(&render(&report)?);
    Ok(())
}

/// Print the effective configuration as YAML.
pub fn config_command<F>(config: &Config, mut handler: F) -> Result<()>
where
    F: FnMut(&str),
{
    let yaml = serde_yaml_ng::to_string(config).context("Failed to render configuration")?;
    handler(&yaml);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[tokio::test]
    async fn test_cache_report_on_empty_cache() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = Config::default();
        config.cache.cache_dir = dir.path().to_path_buf();
        let manager = DatasetManager::from_config(&config.cache, &config.dataset).await?;

        let mut output = String::new();
        cache_command(&manager, &config, |s| output.push_str(s))?;
        let report: serde_json::Value = serde_json::from_str(&output)?;
        assert_eq!(report["memory"]["entries"], 0);
        assert_eq!(report["disk_bytes"], 0);
        assert_eq!(report["redis"], serde_json::Value::Null);
        Ok(())
    }

    #[test]
    fn test_config_round_trips_through_yaml() -> Result<()> {
        let config = Config::default();
        let mut output = String::new();
        config_command(&config, |s| output.push_str(s))?;
        assert_eq!(parse_config(&output)?, config);
        Ok(())
    }
}
