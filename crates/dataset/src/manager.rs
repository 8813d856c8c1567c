// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Query surface over cached datasets.
//!
//! [`DatasetManager`] owns the cache coordinator, handle pool, job tracker and
//! catalog client. Every query operation is answered from the result cache
//! when possible; computed answers are written back with the TTL of their
//! [`ResultClass`].

use crate::Result;
use crate::catalog::{CkanClient, Resource};
use crate::config::DatasetConfig;
use crate::engine::QueryOutput;
use crate::error::DatasetError;
use crate::jobs::{DownloadJob, JobTracker};
use crate::pipeline::{Acquire, Pipeline};
use crate::pool::{DatasetHandle, HandlePool};
use crate::query::{self, AggregationParams, CATEGORICAL_MAX_DISTINCT, FilterParams, Filters};
use diagnostics::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tiercache::{CacheConfig, CacheCoordinator, ResultClass};
use tokio::task::JoinHandle;

/// A result plus whether it was served from the result cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cached<T> {
    pub value: T,
    pub from_cache: bool,
}

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DateRange {
    pub min: Value,
    pub max: Value,
}

/// Filter choices offered for a dataset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AvailableFilters {
    /// Low-cardinality columns and their sorted values.
    pub categorical: BTreeMap<String, Vec<Value>>,
    pub date_ranges: BTreeMap<String, DateRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub column: String,
    pub rows: u64,
    pub non_null: u64,
    pub distinct: u64,
    pub min: Value,
    pub max: Value,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub stddev: Option<f64>,
    pub q25: Option<f64>,
    pub q75: Option<f64>,
    pub iqr: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopValue {
    pub value: Value,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    pub date: Value,
    pub value: Value,
}

/// Aggregates pivoted by row value, then column value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CrossTab {
    pub row_values: Vec<String>,
    pub col_values: Vec<String>,
    pub cells: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Percentile {
    pub point: f64,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub first: String,
    pub second: String,
    pub coefficient: Option<f64>,
    pub rows: u64,
}

/// Where a dataset stands for a client polling after a download request.
///
/// Serializes as `{state, dataset_id, message}` plus the `job` record when
/// one exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "StatusReport")]
pub enum DownloadStatus {
    Job(DownloadJob),
    Cached { dataset_id: String },
    NotFound { dataset_id: String },
}

impl DownloadStatus {
    #[must_use]
    pub fn state(&self) -> &'static str {
        match self {
            DownloadStatus::Job(_) => "job",
            DownloadStatus::Cached { .. } => "cached",
            DownloadStatus::NotFound { .. } => "not_found",
        }
    }

    #[must_use]
    pub fn message(&self) -> String {
        match self {
            DownloadStatus::Job(job) => job.message.clone(),
            DownloadStatus::Cached { .. } => "ready".to_string(),
            DownloadStatus::NotFound { .. } => "trigger acquisition first".to_string(),
        }
    }
}

#[derive(Serialize)]
struct StatusReport {
    state: &'static str,
    dataset_id: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job: Option<DownloadJob>,
}

impl From<DownloadStatus> for StatusReport {
    fn from(status: DownloadStatus) -> Self {
        let state = status.state();
        let message = status.message();
        match status {
            DownloadStatus::Job(job) => StatusReport {
                state,
                dataset_id: job.dataset_id.clone(),
                message,
                job: Some(job),
            },
            DownloadStatus::Cached { dataset_id } | DownloadStatus::NotFound { dataset_id } => {
                StatusReport {
                    state,
                    dataset_id,
                    message,
                    job: None,
                }
            }
        }
    }
}

fn number(row: &Row, key: &str) -> Option<f64> {
    row.get(key).and_then(Value::as_f64)
}

fn count(row: &Row, key: &str) -> u64 {
    row.get(key).and_then(Value::as_u64).unwrap_or_default()
}

fn pivot_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn first_row(output: QueryOutput) -> Row {
    output.into_maps().into_iter().next().unwrap_or_default()
}

pub struct DatasetManager {
    cache: Arc<CacheCoordinator>,
    pool: HandlePool,
    tracker: JobTracker,
    catalog: CkanClient,
    query_timeout: Duration,
    cleanup_interval: Duration,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl DatasetManager {
    pub fn new(
        cache: Arc<CacheCoordinator>,
        acquire: Arc<dyn Acquire>,
        catalog: CkanClient,
        config: &DatasetConfig,
    ) -> Self {
        Self {
            pool: HandlePool::new(cache.clone(), acquire.clone(), config.pool),
            tracker: JobTracker::new(acquire, cache.clone(), config.job_retention()),
            cache,
            catalog,
            query_timeout: config.query_timeout(),
            cleanup_interval: config.cleanup_interval(),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Build the full stack: cache tiers, catalog client and pipeline.
    pub async fn from_config(cache_config: &CacheConfig, config: &DatasetConfig) -> Result<Self> {
        cache_config.validate()?;
        config.validate()?;
        let cache = Arc::new(CacheCoordinator::from_config(cache_config).await?);
        let catalog = CkanClient::new(&config.catalog_url, config.catalog_timeout())?;
        let pipeline = Pipeline::new(
            catalog.clone(),
            cache.staging_dir(),
            config.download_timeout(),
            config.progress_interval(),
        )?;
        Ok(Self::new(cache, Arc::new(pipeline), catalog, config))
    }

    #[must_use]
    pub fn cache(&self) -> &CacheCoordinator {
        &self.cache
    }

    #[must_use]
    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Start the periodic job cleanup. Calling it again is a no-op.
    pub fn start_background(&self) {
        let mut task = self.cleanup_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_none() {
            *task = Some(self.tracker.spawn_cleanup_loop(self.cleanup_interval));
        }
    }

    async fn cached<T, F, Fut>(
        &self,
        class: ResultClass,
        dataset_id: &str,
        params: &Value,
        compute: F,
    ) -> Result<Cached<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        tiercache::validate_dataset_id(dataset_id)?;
        let key = self.cache.fingerprint(class.prefix(), dataset_id, params)?;

        if let Some(bytes) = self.cache.get_result(&key).await {
            match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    return Ok(Cached {
                        value,
                        from_cache: true,
                    });
                }
                Err(e) => {
                    let error_str = e.to_string();
                    warn!("discarding unreadable cached result {key}: {error}", key: key, error: error_str);
                }
            }
        }

        let value = compute().await?;
        match serde_json::to_vec(&value) {
            Ok(bytes) => {
                if let Err(e) = self.cache.set_result(&key, &bytes, class.ttl()).await {
                    let error_str = e.to_string();
                    warn!("could not cache result {key}: {error}", key: key, error: error_str);
                }
            }
            Err(e) => {
                let error_str = e.to_string();
                warn!("could not encode result {key}: {error}", key: key, error: error_str);
            }
        }
        Ok(Cached {
            value,
            from_cache: false,
        })
    }

    async fn handle(&self, dataset_id: &str) -> Result<Arc<DatasetHandle>> {
        self.pool.resolve(dataset_id).await
    }

    pub async fn get_filtered_data(
        &self,
        dataset_id: &str,
        params: &FilterParams,
    ) -> Result<Cached<Vec<Row>>> {
        let key = serde_json::to_value(params)?;
        self.cached(ResultClass::FilteredRows, dataset_id, &key, || async {
            let handle = self.handle(dataset_id).await?;
            handle.require_columns(query::filter_columns(&params.filters))?;
            let built = query::build_filter_query(params)?;
            Ok(handle.query(built, self.query_timeout).await?.into_maps())
        })
        .await
    }

    /// Categorical columns (more than one and fewer than a hundred distinct
    /// values) with their values, and date-like columns with their range.
    pub async fn get_available_filters(&self, dataset_id: &str) -> Result<Cached<AvailableFilters>> {
        self.cached(ResultClass::Filters, dataset_id, &Value::Null, || async {
            let handle = self.handle(dataset_id).await?;
            let mut filters = AvailableFilters::default();
            for column in handle.columns() {
                let name = column.name.as_str();
                if let Err(e) = self.describe_column(&handle, column, &mut filters).await {
                    let error_str = e.to_string();
                    warn!("skipping filter column {name}: {error}", name: name, error: error_str);
                }
            }
            Ok(filters)
        })
        .await
    }

    async fn describe_column(
        &self,
        handle: &DatasetHandle,
        column: &crate::engine::ColumnInfo,
        filters: &mut AvailableFilters,
    ) -> Result<()> {
        let name = column.name.as_str();
        if column.is_date_like() {
            let row = first_row(handle.query(query::build_min_max(name)?, self.query_timeout).await?);
            let range = DateRange {
                min: row.get("min").cloned().unwrap_or_default(),
                max: row.get("max").cloned().unwrap_or_default(),
            };
            filters.date_ranges.insert(name.to_string(), range);
        }

        let distinct = handle
            .query(query::build_distinct_count(name)?, self.query_timeout)
            .await?
            .scalar()
            .and_then(Value::as_i64)
            .unwrap_or_default();
        if distinct > 1 && distinct < CATEGORICAL_MAX_DISTINCT {
            let values = handle
                .query(query::build_distinct_values(name)?, self.query_timeout)
                .await?
                .rows
                .into_iter()
                .filter_map(|row| row.into_iter().next())
                .collect();
            filters.categorical.insert(name.to_string(), values);
        }
        Ok(())
    }

    pub async fn get_aggregated_data(
        &self,
        dataset_id: &str,
        params: &AggregationParams,
    ) -> Result<Cached<Vec<Row>>> {
        let key = serde_json::to_value(params)?;
        self.cached(ResultClass::Aggregate, dataset_id, &key, || async {
            let handle = self.handle(dataset_id).await?;
            handle.require_columns(
                params
                    .group_by
                    .iter()
                    .map(String::as_str)
                    .chain(params.target.as_deref().filter(|t| !t.trim().is_empty()))
                    .chain(query::filter_columns(&params.filters)),
            )?;
            let date_columns: Vec<String> = handle
                .columns()
                .iter()
                .filter(|c| c.is_date_like())
                .map(|c| c.name.clone())
                .collect();
            let built = query::build_aggregation_query(params, &date_columns)?;
            Ok(handle.query(built, self.query_timeout).await?.into_maps())
        })
        .await
    }

    /// Summary statistics of a column. No matching rows is an error rather
    /// than a row of nulls.
    pub async fn get_stats(
        &self,
        dataset_id: &str,
        column: &str,
        filters: &Filters,
    ) -> Result<Cached<ColumnStats>> {
        let key = json!({ "column": column, "filters": filters });
        self.cached(ResultClass::Stats, dataset_id, &key, || async {
            let handle = self.handle(dataset_id).await?;
            handle.require_columns(std::iter::once(column).chain(query::filter_columns(filters)))?;
            let built = query::build_stats_query(column, filters)?;
            let row = first_row(handle.query(built, self.query_timeout).await?);

            let rows = count(&row, "rows");
            if rows == 0 {
                return Err(DatasetError::NoRows(column.to_string()));
            }
            let q25 = number(&row, "q25");
            let q75 = number(&row, "q75");
            Ok(ColumnStats {
                column: column.to_string(),
                rows,
                non_null: count(&row, "non_null"),
                distinct: count(&row, "distinct_count"),
                min: row.get("min").cloned().unwrap_or_default(),
                max: row.get("max").cloned().unwrap_or_default(),
                mean: number(&row, "mean"),
                median: number(&row, "median"),
                stddev: number(&row, "stddev"),
                q25,
                q75,
                iqr: q25.zip(q75).map(|(lo, hi)| hi - lo),
            })
        })
        .await
    }

    pub async fn get_top_values(
        &self,
        dataset_id: &str,
        column: &str,
        limit: u64,
        filters: &Filters,
    ) -> Result<Cached<Vec<TopValue>>> {
        let key = json!({ "column": column, "limit": limit, "filters": filters });
        self.cached(ResultClass::TopValues, dataset_id, &key, || async {
            let handle = self.handle(dataset_id).await?;
            handle.require_columns(std::iter::once(column).chain(query::filter_columns(filters)))?;
            let built = query::build_top_values_query(column, limit, filters)?;
            let rows = handle.query(built, self.query_timeout).await?.into_maps();
            Ok(rows
                .into_iter()
                .map(|row| TopValue {
                    value: row.get("value").cloned().unwrap_or_default(),
                    count: count(&row, "count"),
                    percentage: number(&row, "percentage").unwrap_or_default(),
                })
                .collect())
        })
        .await
    }

    /// Daily series along `date_column`. Without a value column the series
    /// counts rows.
    pub async fn get_time_series(
        &self,
        dataset_id: &str,
        date_column: &str,
        value_column: Option<&str>,
        agg: Option<&str>,
        filters: &Filters,
    ) -> Result<Cached<Vec<TimePoint>>> {
        let key = json!({
            "date_column": date_column,
            "value_column": value_column,
            "agg": agg,
            "filters": filters,
        });
        self.cached(ResultClass::TimeSeries, dataset_id, &key, || async {
            let handle = self.handle(dataset_id).await?;
            handle.require_columns(
                std::iter::once(date_column)
                    .chain(value_column)
                    .chain(query::filter_columns(filters)),
            )?;
            let built = query::build_time_series_query(date_column, value_column, agg, filters)?;
            let output = handle.query(built, self.query_timeout).await?;
            Ok(output
                .rows
                .into_iter()
                .map(|mut row| {
                    let value = row.pop().unwrap_or_default();
                    let date = row.pop().unwrap_or_default();
                    TimePoint { date, value }
                })
                .collect())
        })
        .await
    }

    pub async fn get_cross_tab(
        &self,
        dataset_id: &str,
        row_var: &str,
        col_var: &str,
        value_var: Option<&str>,
        agg: Option<&str>,
        filters: &Filters,
    ) -> Result<Cached<CrossTab>> {
        let key = json!({
            "row": row_var,
            "col": col_var,
            "value": value_var,
            "agg": agg,
            "filters": filters,
        });
        self.cached(ResultClass::CrossTab, dataset_id, &key, || async {
            let handle = self.handle(dataset_id).await?;
            handle.require_columns(
                [row_var, col_var]
                    .into_iter()
                    .chain(value_var)
                    .chain(query::filter_columns(filters)),
            )?;
            let built = query::build_cross_tab_query(row_var, col_var, value_var, agg, filters)?;
            let output = handle.query(built, self.query_timeout).await?;

            let mut table = CrossTab::default();
            for row in output.rows {
                let [r, c, total]: [Value; 3] = match row.try_into() {
                    Ok(cells) => cells,
                    Err(_) => continue,
                };
                let (r, c) = (pivot_key(&r), pivot_key(&c));
                if !table.row_values.contains(&r) {
                    table.row_values.push(r.clone());
                }
                if !table.col_values.contains(&c) {
                    table.col_values.push(c.clone());
                }
                let _ = table.cells.entry(r).or_default().insert(c, total);
            }
            table.col_values.sort();
            Ok(table)
        })
        .await
    }

    pub async fn get_percentiles(
        &self,
        dataset_id: &str,
        column: &str,
        points: &[f64],
        filters: &Filters,
    ) -> Result<Cached<Vec<Percentile>>> {
        let key = json!({ "column": column, "points": points, "filters": filters });
        self.cached(ResultClass::Percentiles, dataset_id, &key, || async {
            let handle = self.handle(dataset_id).await?;
            handle.require_columns(std::iter::once(column).chain(query::filter_columns(filters)))?;
            let built = query::build_percentiles_query(column, points, filters)?;
            let row = first_row(handle.query(built, self.query_timeout).await?);
            Ok(points
                .iter()
                .enumerate()
                .map(|(i, &point)| Percentile {
                    point,
                    value: number(&row, &format!("p{i}")),
                })
                .collect())
        })
        .await
    }

    pub async fn get_correlation(
        &self,
        dataset_id: &str,
        first: &str,
        second: &str,
        filters: &Filters,
    ) -> Result<Cached<Correlation>> {
        let key = json!({ "first": first, "second": second, "filters": filters });
        self.cached(ResultClass::Correlation, dataset_id, &key, || async {
            let handle = self.handle(dataset_id).await?;
            handle.require_columns([first, second].into_iter().chain(query::filter_columns(filters)))?;
            let built = query::build_correlation_query(first, second, filters)?;
            let row = first_row(handle.query(built, self.query_timeout).await?);
            Ok(Correlation {
                first: first.to_string(),
                second: second.to_string(),
                coefficient: number(&row, "correlation"),
                rows: count(&row, "rows"),
            })
        })
        .await
    }

    /// Catalog description of a dataset's resource.
    pub async fn get_metadata(&self, dataset_id: &str) -> Result<Cached<Resource>> {
        self.cached(ResultClass::Metadata, dataset_id, &Value::Null, || {
            self.catalog.get_resource(dataset_id)
        })
        .await
    }

    /// Begin a background acquisition unless the dataset is already cached.
    pub fn start_download(&self, dataset_id: &str) -> Result<DownloadStatus> {
        tiercache::validate_dataset_id(dataset_id)?;
        if self.tracker.get_job(dataset_id).is_none() && self.is_cached(dataset_id) {
            return Ok(DownloadStatus::Cached {
                dataset_id: dataset_id.to_string(),
            });
        }
        let handle = self.tracker.start_download(dataset_id)?;
        Ok(handle.snapshot().map_or_else(
            || DownloadStatus::NotFound {
                dataset_id: dataset_id.to_string(),
            },
            DownloadStatus::Job,
        ))
    }

    /// Job state if one exists, otherwise whether a tier holds the dataset.
    #[must_use]
    pub fn download_status(&self, dataset_id: &str) -> DownloadStatus {
        if let Some(job) = self.tracker.get_job(dataset_id) {
            return DownloadStatus::Job(job);
        }
        if self.is_cached(dataset_id) {
            DownloadStatus::Cached {
                dataset_id: dataset_id.to_string(),
            }
        } else {
            DownloadStatus::NotFound {
                dataset_id: dataset_id.to_string(),
            }
        }
    }

    fn is_cached(&self, dataset_id: &str) -> bool {
        self.cache
            .get_memory(dataset_id)
            .or_else(|| self.cache.get_disk(dataset_id))
            .is_some()
    }

    pub fn cleanup_jobs(&self) -> usize {
        self.tracker.cleanup_old_jobs()
    }

    /// Stop background work and drop every open handle.
    pub async fn close(&self) {
        self.tracker.shutdown();
        let task = self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.pool.close_all().await;
        info!("dataset manager closed");
    }
}
