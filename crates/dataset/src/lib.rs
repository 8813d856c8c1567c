// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Acquisition and querying of open-data datasets.
//!
//! A dataset is fetched from a CKAN catalog, converted into a single-table
//! DuckDB store and placed in the [`tiercache`] tiers. Queries run against
//! read-only handles from the [`HandlePool`]; [`DatasetManager`] is the entry
//! point tying the pieces together.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod loader;
pub mod manager;
pub mod pipeline;
pub mod pool;
pub mod query;

pub use catalog::{CkanClient, Package, Resource};
pub use config::{DatasetConfig, PoolLimits};
pub use engine::{ColumnInfo, QueryOutput};
pub use error::DatasetError;
pub use jobs::{DownloadJob, JobHandle, JobStatus, JobTracker};
pub use manager::{
    AvailableFilters, Cached, ColumnStats, Correlation, CrossTab, DatasetManager, DateRange,
    DownloadStatus, Percentile, Row, TimePoint, TopValue,
};
pub use pipeline::{Acquire, Pipeline, Progress, ProgressSink, acquire_into_cache, no_progress};
pub use pool::{DatasetHandle, HandlePool};
pub use query::{AggregationParams, BuiltQuery, FilterParams, Filters};

pub type Result<T> = std::result::Result<T, DatasetError>;
