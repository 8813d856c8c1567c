// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0


use anyhow::Result;
use dataset::{
    DatasetConfig, DatasetError, DatasetManager, DownloadStatus, FilterParams, Filters, JobStatus,
};
use mock_catalog::MockCatalog;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;
use tiercache::CacheConfig;

async fn manager(catalog: &MockCatalog, cache_dir: &Path) -> Result<DatasetManager> {
    let cache_config = CacheConfig {
        cache_dir: cache_dir.to_path_buf(),
        ..CacheConfig::default()
    };
    let config = DatasetConfig {
        catalog_url: catalog.action_url(),
        catalog_timeout_secs: 5,
        download_timeout_secs: 30,
        progress_interval_ms: 10,
        ..DatasetConfig::default()
    };
    Ok(DatasetManager::from_config(&cache_config, &config).await?)
}

async fn wait_terminal(manager: &DatasetManager, dataset_id: &str) -> Result<dataset::DownloadJob> {
    for _ in 0..500 {
        if let DownloadStatus::Job(job) = manager.download_status(dataset_id) {
            if job.status.is_terminal() {
                return Ok(job);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("job for {dataset_id} never finished")
}

#[tokio::test]
async fn test_background_acquisition_end_to_end() -> Result<()> {
    let catalog = MockCatalog::start().await?;
    let dir = tempdir()?;
    let manager = manager(&catalog, dir.path()).await?;

    assert!(matches!(
        manager.download_status("casos"),
        DownloadStatus::NotFound { .. }
    ));
    let started = manager.start_download("casos")?;
    assert!(matches!(started, DownloadStatus::Job(_)));

    let job = wait_terminal(&manager, "casos").await?;
    assert_eq!(job.status, JobStatus::Ready);
    assert!((job.progress - 100.0).abs() < f64::EPSILON);
    assert!(job.duration().is_some());
    assert!(dir.path().join("casos.duckdb").is_file());

    // Raw downloads and intermediate stores are gone from staging
    let staged: Vec<_> = std::fs::read_dir(manager.cache().staging_dir())?.collect();
    assert!(staged.is_empty());

    let params = FilterParams {
        filters: serde_json::from_value(json!({"estado": ["Jalisco", "Colima"]}))?,
        ..FilterParams::default()
    };
    let rows = manager.get_filtered_data("casos", &params).await?;
    assert_eq!(rows.value.len(), 4);
    assert!(rows.value[0].contains_key("fecha_registro"));

    manager.close().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_catalog_entry_fails_job() -> Result<()> {
    let catalog = MockCatalog::start().await?;
    let dir = tempdir()?;
    let manager = manager(&catalog, dir.path()).await?;

    let _ = manager.start_download("nada")?;
    let job = wait_terminal(&manager, "nada").await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.is_some());
    assert!(job.ended_at.is_some());

    // A failed job stays failed; starting again returns the same record
    let again = manager.start_download("nada")?;
    match again {
        DownloadStatus::Job(again) => assert_eq!(again.job_id, job.job_id),
        other => anyhow::bail!("unexpected status {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_download_error_and_unsupported_format() -> Result<()> {
    let catalog = MockCatalog::start().await?;
    let dir = tempdir()?;
    let manager = manager(&catalog, dir.path()).await?;

    let _ = manager.start_download("roto")?;
    let job = wait_terminal(&manager, "roto").await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().is_some_and(|e| e.contains("404")));
    let staged: Vec<_> = std::fs::read_dir(manager.cache().staging_dir())?.collect();
    assert!(staged.is_empty());

    let result = manager.get_filtered_data("hoja", &FilterParams::default()).await;
    assert!(matches!(result, Err(DatasetError::UnsupportedFormat(f)) if f == "xlsx"));
    Ok(())
}

#[tokio::test]
async fn test_query_acquires_synchronously() -> Result<()> {
    let catalog = MockCatalog::start().await?;
    let dir = tempdir()?;
    let manager = manager(&catalog, dir.path()).await?;

    let stats = manager.get_stats("casos", "casos", &Filters::new()).await?;
    assert!(!stats.from_cache);
    assert_eq!(stats.value.rows, 5);
    assert_eq!(stats.value.max, json!(7));

    // No job was created for the synchronous path, but the store is cached
    assert!(manager.tracker().get_job("casos").is_none());
    assert!(matches!(
        manager.download_status("casos"),
        DownloadStatus::Cached { .. }
    ));

    let empty: Filters = serde_json::from_value(json!({"estado": "Yucatan"}))?;
    let result = manager.get_stats("casos", "casos", &empty).await;
    assert!(matches!(result, Err(DatasetError::NoRows(_))));
    Ok(())
}

#[tokio::test]
async fn test_metadata_is_cached() -> Result<()> {
    let catalog = MockCatalog::start().await?;
    let dir = tempdir()?;
    let manager = manager(&catalog, dir.path()).await?;

    let first = manager.get_metadata("casos").await?;
    assert!(!first.from_cache);
    assert_eq!(first.value.name, "Casos confirmados");
    assert_eq!(first.value.format, "CSV");

    let second = manager.get_metadata("casos").await?;
    assert!(second.from_cache);
    assert_eq!(second.value, first.value);

    assert!(matches!(
        manager.get_metadata("nada").await,
        Err(DatasetError::Catalog(_))
    ));
    Ok(())
}
