// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Cache error: {0}")]
    Cache(#[from] tiercache::CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] duckdb::Error),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Download of {url} failed with HTTP status {status}")]
    Download { url: String, status: u16 },

    #[error("Unsupported format {0:?}")]
    UnsupportedFormat(String),

    #[error("Failed to load dataset: {0}")]
    Load(String),

    #[error("Invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("Unknown column {0:?}")]
    UnknownColumn(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Query timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error("No rows match the filters for column {0:?}")]
    NoRows(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}
