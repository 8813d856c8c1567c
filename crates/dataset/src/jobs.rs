// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Background acquisition jobs, one per dataset.
//!
//! A job moves `Pending -> Downloading -> Processing -> Ready`, or to
//! `Failed` from `Downloading` or `Processing`. `Ready` and `Failed` are
//! terminal: later updates are ignored. Jobs run as detached tasks and are
//! observed by polling their status through a [`JobHandle`].

use crate::Result;
use crate::loader::LoadStage;
use crate::pipeline::{Acquire, Progress, ProgressSink, acquire_into_cache};
use chrono::{DateTime, Utc};
use diagnostics::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tiercache::CacheCoordinator;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Processing,
    Ready,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Processing => "processing",
            JobStatus::Ready => "ready",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub job_id: String,
    pub dataset_id: String,
    pub status: JobStatus,
    /// Percent complete: download maps to 0-80, later stages to fixed marks.
    pub progress: f64,
    pub downloaded: u64,
    pub total_bytes: u64,
    pub message: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadJob {
    fn new(dataset_id: &str) -> Self {
        Self {
            job_id: uuid7::uuid7().to_string(),
            dataset_id: dataset_id.to_string(),
            status: JobStatus::Pending,
            progress: 0.0,
            downloaded: 0,
            total_bytes: 0,
            message: "Starting download".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    /// Wall time of a finished job.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    /// Apply a pipeline progress event.
    fn observe(&mut self, event: Progress) {
        match event {
            Progress::Downloading { downloaded, total } => {
                self.status = JobStatus::Downloading;
                self.downloaded = downloaded;
                self.total_bytes = total;
                if total > 0 {
                    self.progress = (downloaded as f64 / total as f64 * 80.0).min(80.0);
                }
            }
            Progress::Stage(stage) => {
                self.status = JobStatus::Processing;
                let (progress, message) = match stage {
                    LoadStage::Loading => (80.0, "Loading into columnar store"),
                    LoadStage::Indexing => (88.0, "Creating indexes"),
                    LoadStage::Finalizing => (92.0, "Finalizing store"),
                };
                self.progress = progress;
                self.message = message.to_string();
            }
        }
    }
}

type Registry = Arc<RwLock<HashMap<String, DownloadJob>>>;

fn read(jobs: &Registry) -> std::sync::RwLockReadGuard<'_, HashMap<String, DownloadJob>> {
    jobs.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(jobs: &Registry) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DownloadJob>> {
    jobs.write().unwrap_or_else(PoisonError::into_inner)
}

/// Mutate a job unless it has reached a terminal state.
fn update(jobs: &Registry, dataset_id: &str, f: impl FnOnce(&mut DownloadJob)) {
    let mut jobs = write(jobs);
    if let Some(job) = jobs.get_mut(dataset_id) {
        if !job.status.is_terminal() {
            f(job);
        }
    }
}

fn cleanup(jobs: &Registry, retention: Duration) -> usize {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let now = Utc::now();
    let mut jobs = write(jobs);
    let before = jobs.len();
    jobs.retain(|dataset_id, job| {
        let expired = job.status.is_terminal()
            && job.ended_at.is_some_and(|end| now - end > retention);
        if expired {
            debug!("dropping finished job for {dataset_id}", dataset_id: dataset_id);
        }
        !expired
    });
    before - jobs.len()
}

/// Identity of a started job; poll it for progress.
#[derive(Clone)]
pub struct JobHandle {
    pub dataset_id: String,
    pub job_id: String,
    jobs: Registry,
}

impl JobHandle {
    /// Current state of this job, or `None` once it has been cleaned up.
    #[must_use]
    pub fn snapshot(&self) -> Option<DownloadJob> {
        read(&self.jobs)
            .get(&self.dataset_id)
            .filter(|job| job.job_id == self.job_id)
            .cloned()
    }

    /// Poll until the job is terminal (or gone).
    pub async fn wait(&self, poll: Duration) -> Option<DownloadJob> {
        loop {
            match self.snapshot() {
                Some(job) if job.status.is_terminal() => return Some(job),
                Some(_) => tokio::time::sleep(poll).await,
                None => return None,
            }
        }
    }
}

/// Owns the job registry and launches acquisitions.
pub struct JobTracker {
    jobs: Registry,
    acquire: Arc<dyn Acquire>,
    cache: Arc<CacheCoordinator>,
    retention: Duration,
    shutdown: CancellationToken,
}

impl JobTracker {
    pub fn new(
        acquire: Arc<dyn Acquire>,
        cache: Arc<CacheCoordinator>,
        retention: Duration,
    ) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            acquire,
            cache,
            retention,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start acquiring a dataset, or return the job that already exists for
    /// it. At most one job per dataset is ever live.
    pub fn start_download(&self, dataset_id: &str) -> Result<JobHandle> {
        tiercache::validate_dataset_id(dataset_id)?;

        let job_id = {
            let mut jobs = write(&self.jobs);
            if let Some(existing) = jobs.get(dataset_id) {
                return Ok(self.handle(dataset_id, existing.job_id.clone()));
            }
            let job = DownloadJob::new(dataset_id);
            let job_id = job.job_id.clone();
            jobs.insert(dataset_id.to_string(), job);
            job_id
        };

        info!("starting background acquisition of {dataset_id}", dataset_id: dataset_id);
        let task = JobTask {
            dataset_id: dataset_id.to_string(),
            jobs: self.jobs.clone(),
            acquire: self.acquire.clone(),
            cache: self.cache.clone(),
        };
        drop(tokio::spawn(task.run()));

        Ok(self.handle(dataset_id, job_id))
    }

    fn handle(&self, dataset_id: &str, job_id: String) -> JobHandle {
        JobHandle {
            dataset_id: dataset_id.to_string(),
            job_id,
            jobs: self.jobs.clone(),
        }
    }

    #[must_use]
    pub fn get_job(&self, dataset_id: &str) -> Option<DownloadJob> {
        read(&self.jobs).get(dataset_id).cloned()
    }

    #[must_use]
    pub fn jobs(&self) -> Vec<DownloadJob> {
        let mut jobs: Vec<_> = read(&self.jobs).values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    /// Drop finished jobs older than the retention window.
    pub fn cleanup_old_jobs(&self) -> usize {
        let removed = cleanup(&self.jobs, self.retention);
        if removed > 0 {
            info!("cleaned up {removed} finished jobs", removed: removed);
        }
        removed
    }

    /// Run [`cleanup_old_jobs`](Self::cleanup_old_jobs) every `interval`
    /// until [`shutdown`](Self::shutdown).
    pub fn spawn_cleanup_loop(&self, interval: Duration) -> JoinHandle<()> {
        let jobs = self.jobs.clone();
        let retention = self.retention;
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cleanup(&jobs, retention);
                        if removed > 0 {
                            info!("cleaned up {removed} finished jobs", removed: removed);
                        }
                    }
                }
            }
            debug!("job cleanup loop stopped");
        })
    }

    /// Stop the cleanup loop. Running acquisitions finish on their own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

struct JobTask {
    dataset_id: String,
    jobs: Registry,
    acquire: Arc<dyn Acquire>,
    cache: Arc<CacheCoordinator>,
}

impl JobTask {
    async fn run(self) {
        let dataset_id = self.dataset_id.as_str();
        update(&self.jobs, dataset_id, |job| {
            job.status = JobStatus::Downloading;
            job.message = "Downloading from catalog".to_string();
        });

        let jobs = self.jobs.clone();
        let id = self.dataset_id.clone();
        let sink: ProgressSink = Arc::new(move |event| {
            update(&jobs, &id, |job| job.observe(event));
        });

        let acquired =
            acquire_into_cache(self.acquire.as_ref(), &self.cache, dataset_id, sink).await;

        let path = match acquired {
            Ok(path) => path,
            Err(e) => {
                let error_str = e.to_string();
                error!("acquisition of {dataset_id} failed: {error}", dataset_id: dataset_id, error: error_str.clone());
                update(&self.jobs, dataset_id, |job| {
                    job.status = JobStatus::Failed;
                    job.error = Some(error_str);
                    job.ended_at = Some(Utc::now());
                    job.message = match job.status {
                        JobStatus::Processing => "Conversion failed",
                        _ => "Download failed",
                    }
                    .to_string();
                });
                return;
            }
        };

        update(&self.jobs, dataset_id, |job| {
            job.status = JobStatus::Processing;
            job.progress = 95.0;
            job.message = "Registering in cache".to_string();
        });

        if let Err(e) = self.cache.set_memory(dataset_id, &path) {
            let error_str = e.to_string();
            warn!("could not register {dataset_id} in memory: {error}", dataset_id: dataset_id, error: error_str);
        }

        update(&self.jobs, dataset_id, |job| {
            job.status = JobStatus::Ready;
            job.progress = 100.0;
            job.ended_at = Some(Utc::now());
            job.message = "Dataset ready".to_string();
        });

        if let Some(job) = read(&self.jobs).get(dataset_id) {
            let seconds = job
                .duration()
                .map_or(0.0, |d| d.num_milliseconds() as f64 / 1000.0);
            info!("{dataset_id} ready in {seconds} s", dataset_id: dataset_id, seconds: seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatasetError;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{TempDir, tempdir};
    use tokio::sync::Notify;

    #[derive(Clone, Copy)]
    enum FailAt {
        Download,
        Conversion,
    }

    /// Reports a download of 400,000 of 1,000,000 bytes, then waits to be released.
    struct Gated {
        staging: PathBuf,
        calls: AtomicUsize,
        release: Notify,
        fail: Option<FailAt>,
    }

    #[async_trait]
    impl Acquire for Gated {
        async fn acquire(&self, dataset_id: &str, progress: ProgressSink) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            progress(Progress::Downloading {
                downloaded: 400_000,
                total: 1_000_000,
            });
            self.release.notified().await;
            if matches!(self.fail, Some(FailAt::Download)) {
                return Err(DatasetError::Download {
                    url: "http://catalog/file.csv".to_string(),
                    status: 404,
                });
            }
            progress(Progress::Stage(LoadStage::Loading));
            if matches!(self.fail, Some(FailAt::Conversion)) {
                return Err(DatasetError::Load("malformed source".to_string()));
            }
            let path = self.staging.join(format!("{dataset_id}.tmp"));
            tokio::fs::write(&path, b"store").await?;
            Ok(path)
        }
    }

    fn setup(fail: Option<FailAt>) -> (TempDir, Arc<Gated>, Arc<CacheCoordinator>, JobTracker) {
        let dir = tempdir().expect("tempdir");
        let cache = Arc::new(CacheCoordinator::new(
            tiercache::MemoryIndex::new(10, u64::MAX),
            tiercache::DiskStore::new(dir.path(), u64::MAX).expect("disk"),
            Arc::new(tiercache::MemoryResultCache::new()),
        ));
        let gated = Arc::new(Gated {
            staging: cache.staging_dir(),
            calls: AtomicUsize::new(0),
            release: Notify::new(),
            fail,
        });
        let tracker = JobTracker::new(gated.clone(), cache.clone(), Duration::from_secs(3600));
        (dir, gated, cache, tracker)
    }

    async fn wait_for(handle: &JobHandle, status: JobStatus) -> DownloadJob {
        for _ in 0..200 {
            if let Some(job) = handle.snapshot() {
                if job.status == status {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job never reached {status}");
    }

    #[tokio::test]
    async fn test_progress_and_single_flight() {
        let (_dir, gated, cache, tracker) = setup(None);

        let first = tracker.start_download("abc").expect("start");
        let job = wait_for(&first, JobStatus::Downloading).await;
        assert_eq!(job.downloaded, 400_000);
        assert_eq!(job.total_bytes, 1_000_000);
        assert!((job.progress - 32.0).abs() < 1e-9);

        // A second request observes the same job
        let second = tracker.start_download("abc").expect("start again");
        assert_eq!(first.job_id, second.job_id);

        gated.release.notify_one();
        let done = first.wait(Duration::from_millis(5)).await.expect("job");
        assert_eq!(done.status, JobStatus::Ready);
        assert_eq!(done.progress, 100.0);
        assert!(done.ended_at.is_some());
        assert_eq!(gated.calls.load(Ordering::SeqCst), 1);

        // Ready registers the store in memory and on disk
        assert!(cache.get_memory("abc").is_some());
        assert!(cache.get_disk("abc").is_some());
    }

    #[tokio::test]
    async fn test_failure_is_terminal() {
        let (_dir, gated, cache, tracker) = setup(Some(FailAt::Download));
        let handle = tracker.start_download("bad").expect("start");
        wait_for(&handle, JobStatus::Downloading).await;
        gated.release.notify_one();

        let job = handle.wait(Duration::from_millis(5)).await.expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().is_some_and(|e| e.contains("404")));
        assert_eq!(job.message, "Download failed");
        assert!(cache.get_memory("bad").is_none());

        // Terminal jobs ignore further updates
        update(&tracker.jobs, "bad", |job| job.status = JobStatus::Ready);
        assert_eq!(tracker.get_job("bad").expect("job").status, JobStatus::Failed);

        // And are still returned rather than restarted
        let again = tracker.start_download("bad").expect("start again");
        assert_eq!(again.job_id, job.job_id);
        assert_eq!(gated.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conversion_failure_is_reported() {
        let (_dir, gated, cache, tracker) = setup(Some(FailAt::Conversion));
        let handle = tracker.start_download("mal").expect("start");
        wait_for(&handle, JobStatus::Downloading).await;
        gated.release.notify_one();

        let job = handle.wait(Duration::from_millis(5)).await.expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.message, "Conversion failed");
        assert!(job.error.as_deref().is_some_and(|e| e.contains("malformed source")));
        assert!(cache.get_disk("mal").is_none());
    }

    #[tokio::test]
    async fn test_invalid_id_is_rejected() {
        let (_dir, gated, _cache, tracker) = setup(None);
        assert!(tracker.start_download("../etc").is_err());
        assert!(tracker.get_job("../etc").is_none());
        assert_eq!(gated.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_finished_jobs() {
        let (_dir, _gated, _cache, tracker) = setup(None);
        {
            let mut jobs = write(&tracker.jobs);
            let mut old = DownloadJob::new("old");
            old.status = JobStatus::Ready;
            old.ended_at = Some(Utc::now() - chrono::Duration::hours(2));
            jobs.insert("old".to_string(), old);

            let mut recent = DownloadJob::new("recent");
            recent.status = JobStatus::Failed;
            recent.ended_at = Some(Utc::now());
            jobs.insert("recent".to_string(), recent);

            let mut running = DownloadJob::new("running");
            running.status = JobStatus::Downloading;
            jobs.insert("running".to_string(), running);
        }

        assert_eq!(tracker.cleanup_old_jobs(), 1);
        assert!(tracker.get_job("old").is_none());
        assert!(tracker.get_job("recent").is_some());
        assert!(tracker.get_job("running").is_some());
    }

    #[tokio::test]
    async fn test_cleanup_loop_stops_on_shutdown() {
        let (_dir, _gated, _cache, tracker) = setup(None);
        let handle = tracker.spawn_cleanup_loop(Duration::from_millis(10));
        tracker.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits")
            .expect("loop task");
    }
}
