// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Query commands. Each prints the JSON form of a [`dataset::Cached`] result.

use crate::commands::render;
use anyhow::Result;
use dataset::{AggregationParams, DatasetManager, FilterParams, Filters};

pub async fn metadata_command<F>(manager: &DatasetManager, dataset_id: &str, mut handler: F) -> Result<()>
where
    F: FnMut(&str),
{
    let metadata = manager.get_metadata(dataset_id).await?;
    handler(&render(&metadata)?);
    Ok(())
}

pub async fn filters_command<F>(manager: &DatasetManager, dataset_id: &str, mut handler: F) -> Result<()>
where
    F: FnMut(&str),
{
    let filters = manager.get_available_filters(dataset_id).await?;
    handler(&render(&filters)?);
    Ok(())
}

pub async fn data_command<F>(
    manager: &DatasetManager,
    dataset_id: &str,
    params: &FilterParams,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    let rows = manager.get_filtered_data(dataset_id, params).await?;
    handler(&render(&rows)?);
    Ok(())
}

pub async fn aggregate_command<F>(
    manager: &DatasetManager,
    dataset_id: &str,
    params: &AggregationParams,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    let rows = manager.get_aggregated_data(dataset_id, params).await?;
    handler(&render(&rows)?);
    Ok(())
}

pub async fn stats_command<F>(
    manager: &DatasetManager,
    dataset_id: &str,
    column: &str,
    filters: &Filters,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    let stats = manager.get_stats(dataset_id, column, filters).await?;
    handler(&render(&stats)?);
    Ok(())
}

pub async fn top_command<F>(
    manager: &DatasetManager,
    dataset_id: &str,
    column: &str,
    limit: u64,
    filters: &Filters,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    let values = manager.get_top_values(dataset_id, column, limit, filters).await?;
    handler(&render(&values)?);
    Ok(())
}

pub async fn series_command<F>(
    manager: &DatasetManager,
    dataset_id: &str,
    date_column: &str,
    value_column: Option<&str>,
    agg: Option<&str>,
    filters: &Filters,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    let series = manager
        .get_time_series(dataset_id, date_column, value_column, agg, filters)
        .await?;
    handler(&render(&series)?);
    Ok(())
}

pub async fn cross_tab_command<F>(
    manager: &DatasetManager,
    dataset_id: &str,
    row_var: &str,
    col_var: &str,
    value_var: Option<&str>,
    agg: Option<&str>,
    filters: &Filters,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    let table = manager
        .get_cross_tab(dataset_id, row_var, col_var, value_var, agg, filters)
        .await?;
    handler(&render(&table)?);
    Ok(())
}

pub async fn percentiles_command<F>(
    manager: &DatasetManager,
    dataset_id: &str,
    column: &str,
    points: &[f64],
    filters: &Filters,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    let percentiles = manager
        .get_percentiles(dataset_id, column, points, filters)
        .await?;
    handler(&render(&percentiles)?);
    Ok(())
}

pub async fn correlation_command<F>(
    manager: &DatasetManager,
    dataset_id: &str,
    first: &str,
    second: &str,
    filters: &Filters,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    let correlation = manager
        .get_correlation(dataset_id, first, second, filters)
        .await?;
    handler(&render(&correlation)?);
    Ok(())
}
