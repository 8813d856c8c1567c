// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::commands::render;
use anyhow::Result;
use dataset::{DatasetManager, DownloadStatus, JobStatus};
use diagnostics::*;
use std::time::Duration;

/// Acquire a dataset and report progress until the job finishes.
///
/// Jobs live only as long as this process, so the command always waits.
pub async fn download_command<F>(
    manager: &DatasetManager,
    dataset_id: &str,
    poll: Duration,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    debug!("download_command called for {dataset_id}", dataset_id: dataset_id);

    let started = manager.start_download(dataset_id)?;
    let DownloadStatus::Job(job) = started else {
        let message = started.message();
        handler(&format!("{dataset_id}: {message}"));
        return Ok(());
    };

    let mut last = (job.status, -1.0_f64);
    loop {
        let DownloadStatus::Job(job) = manager.download_status(dataset_id) else {
            anyhow::bail!("Job for {dataset_id} disappeared");
        };
        if (job.status, job.progress) != last {
            handler(&format!(
                "{dataset_id}: {} {:.1}% {}",
                job.status, job.progress, job.message
            ));
            last = (job.status, job.progress);
        }
        match job.status {
            JobStatus::Ready => {
                let seconds = job
                    .duration()
                    .map_or(0.0, |d| d.num_milliseconds() as f64 / 1000.0);
                handler(&format!("{dataset_id}: ready in {seconds:.1}s"));
                return Ok(());
            }
            JobStatus::Failed => {
                let error = job.error.unwrap_or_else(|| "unknown error".to_string());
                anyhow::bail!("Download of {dataset_id} failed: {error}");
            }
            _ => tokio::time::sleep(poll).await,
        }
    }
}

/// Print where a dataset stands: a job, cached, or unknown.
pub fn status_command<F>(manager: &DatasetManager, dataset_id: &str, mut handler: F) -> Result<()>
where
    F: FnMut(&str),
{
    let status = manager.download_status(dataset_id);
    handler(&render(&status)?);
    Ok(())
}
