// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Download and conversion of a catalog resource into a converted store.

use crate::Result;
use crate::catalog::CkanClient;
use crate::error::DatasetError;
use crate::loader::{self, LoadStage, SourceFormat};
use async_trait::async_trait;
use diagnostics::*;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiercache::CacheCoordinator;
use tokio::io::AsyncWriteExt;

/// Progress events emitted while a dataset is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Bytes written so far and the expected total (0 when unknown).
    Downloading { downloaded: u64, total: u64 },
    Stage(LoadStage),
}

pub type ProgressSink = Arc<dyn Fn(Progress) + Send + Sync>;

/// A sink that drops every event.
#[must_use]
pub fn no_progress() -> ProgressSink {
    Arc::new(|_| {})
}

/// Produces a staged converted store for a dataset.
#[async_trait]
pub trait Acquire: Send + Sync {
    /// Fetch and convert `dataset_id`. The returned file lives in the
    /// staging area and is handed to the disk tier by the caller.
    async fn acquire(&self, dataset_id: &str, progress: ProgressSink) -> Result<PathBuf>;
}

/// Acquire a dataset and place it in the disk tier.
///
/// A failed placement is logged and the staged path is served instead. When
/// another conversion already placed the dataset, the duplicate staged file is
/// removed and the existing store returned.
pub async fn acquire_into_cache(
    acquire: &dyn Acquire,
    cache: &CacheCoordinator,
    dataset_id: &str,
    progress: ProgressSink,
) -> Result<PathBuf> {
    let staged = acquire.acquire(dataset_id, progress).await?;
    match cache.set_disk(dataset_id, &staged) {
        Ok(path) => {
            if path != staged && staged.exists() {
                if let Err(e) = tokio::fs::remove_file(&staged).await {
                    let error_str = e.to_string();
                    warn!("could not remove duplicate store for {dataset_id}: {error}", dataset_id: dataset_id, error: error_str);
                }
            }
            Ok(path)
        }
        Err(e) => {
            let error_str = e.to_string();
            warn!("{dataset_id} acquired but not cached: {error}", dataset_id: dataset_id, error: error_str);
            Ok(staged)
        }
    }
}

/// Catalog lookup, streaming download and bulk load.
pub struct Pipeline {
    catalog: CkanClient,
    http: reqwest::Client,
    staging_dir: PathBuf,
    progress_interval: Duration,
}

impl Pipeline {
    pub fn new(
        catalog: CkanClient,
        staging_dir: PathBuf,
        download_timeout: Duration,
        progress_interval: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(download_timeout).build()?;
        Ok(Self {
            catalog,
            http,
            staging_dir,
            progress_interval,
        })
    }

    #[must_use]
    pub fn catalog(&self) -> &CkanClient {
        &self.catalog
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        catalog_size: Option<u64>,
        progress: &ProgressSink,
    ) -> Result<u64> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DatasetError::Download {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = response
            .content_length()
            .or(catalog_size)
            .unwrap_or_default();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_report = Instant::now();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if last_report.elapsed() >= self.progress_interval {
                progress(Progress::Downloading { downloaded, total });
                last_report = Instant::now();
            }
        }
        file.flush().await?;
        progress(Progress::Downloading { downloaded, total });

        let megabytes = downloaded as f64 / (1024.0 * 1024.0);
        info!("downloaded {megabytes} MB from {url}", megabytes: megabytes, url: url);
        Ok(downloaded)
    }
}

#[async_trait]
impl Acquire for Pipeline {
    async fn acquire(&self, dataset_id: &str, progress: ProgressSink) -> Result<PathBuf> {
        tiercache::validate_dataset_id(dataset_id)?;

        let resource = self.catalog.get_resource(dataset_id).await?;
        let format = SourceFormat::detect(&resource.format, &resource.url)?;
        let name = resource.name.clone();
        let url = resource.url.clone();
        info!("acquiring {dataset_id}: {name} from {url}", dataset_id: dataset_id, name: name, url: url);

        let stamp = uuid7::uuid7().to_string();
        let raw = self
            .staging_dir
            .join(format!("{dataset_id}-{stamp}.{}", format.extension()));
        let db = self.staging_dir.join(format!("{dataset_id}-{stamp}.duckdb"));

        let downloaded = self.download(&url, &raw, resource.size, &progress).await;
        if let Err(e) = downloaded {
            let _ = tokio::fs::remove_file(&raw).await;
            return Err(e);
        }

        let load_raw = raw.clone();
        let load_db = db.clone();
        let sink = progress.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            loader::load_store(&load_raw, format, &load_db, &|stage| {
                sink(Progress::Stage(stage));
            })
        })
        .await
        .map_err(|e| DatasetError::Task(e.to_string()));

        if let Err(e) = tokio::fs::remove_file(&raw).await {
            let error_str = e.to_string();
            warn!("could not remove raw download for {dataset_id}: {error}", dataset_id: dataset_id, error: error_str);
        }

        match loaded {
            Ok(Ok(report)) => {
                let indexed = report.indexed.len();
                debug!("{dataset_id} converted with {indexed} indexes", dataset_id: dataset_id, indexed: indexed);
                Ok(db)
            }
            Ok(Err(e)) | Err(e) => {
                let _ = tokio::fs::remove_file(&db).await;
                let _ = tokio::fs::remove_file(db.with_extension("duckdb.wal")).await;
                Err(e)
            }
        }
    }
}
