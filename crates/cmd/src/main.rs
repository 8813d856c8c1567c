// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use cmd::commands;
use cmd::config::{self, Config};
use dataset::{AggregationParams, DatasetManager, FilterParams};
use diagnostics::*;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "visor")]
struct Cli {
    /// Configuration file (defaults to $VISOR_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct FilterArgs {
    /// Filter as column=value; a comma-separated value matches any of its items
    #[arg(short, long = "filter")]
    filters: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and convert a dataset, reporting progress until it is ready
    Download {
        dataset_id: String,
        /// Progress poll interval in milliseconds
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,
    },
    /// Show whether a dataset is cached
    Status { dataset_id: String },
    /// Show the catalog record of a dataset
    Metadata { dataset_id: String },
    /// List categorical filter values and date ranges
    Filters { dataset_id: String },
    /// Print filtered rows
    Data {
        dataset_id: String,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long, default_value_t = 100)]
        limit: u64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Group and aggregate rows
    Aggregate {
        dataset_id: String,
        /// Columns to group by, comma separated
        #[arg(short, long, value_delimiter = ',')]
        group_by: Vec<String>,
        /// count, sum, avg, min, max, median or stddev
        #[arg(short, long)]
        agg: Option<String>,
        /// Column the aggregate applies to
        #[arg(short, long)]
        target: Option<String>,
        /// A group-by column or "total"
        #[arg(long)]
        order_by: Option<String>,
        /// asc or desc
        #[arg(long)]
        order_dir: Option<String>,
        /// year, quarter, month, week, day or year_month
        #[arg(long)]
        granularity: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: u64,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Summary statistics of one column
    Stats {
        dataset_id: String,
        column: String,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Most frequent values of one column
    Top {
        dataset_id: String,
        column: String,
        #[arg(long, default_value_t = 10)]
        limit: u64,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Daily series along a date column
    Series {
        dataset_id: String,
        date_column: String,
        #[arg(long)]
        value: Option<String>,
        #[arg(short, long)]
        agg: Option<String>,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Aggregate pivoted by two columns
    Crosstab {
        dataset_id: String,
        row: String,
        col: String,
        #[arg(long)]
        value: Option<String>,
        #[arg(short, long)]
        agg: Option<String>,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Continuous quantiles of a column
    Percentiles {
        dataset_id: String,
        column: String,
        /// Points in [0, 1], comma separated
        #[arg(long, value_delimiter = ',', default_value = "0.25,0.5,0.75")]
        points: Vec<f64>,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Pearson correlation of two columns
    Correlation {
        dataset_id: String,
        first: String,
        second: String,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Show cache occupancy
    Cache,
    /// Print the effective configuration
    Config,
}

#[allow(clippy::print_stdout)]
fn print(output: &str) {
    println!("{output}");
}

async fn run(command: Commands, config: Config, manager: &DatasetManager) -> Result<()> {
    match command {
        Commands::Download {
            dataset_id,
            poll_ms,
        } => {
            commands::download_command(manager, &dataset_id, Duration::from_millis(poll_ms), print)
                .await
        }
        Commands::Status { dataset_id } => commands::status_command(manager, &dataset_id, print),
        Commands::Metadata { dataset_id } => {
            commands::metadata_command(manager, &dataset_id, print).await
        }
        Commands::Filters { dataset_id } => commands::filters_command(manager, &dataset_id, print).await,
        Commands::Data {
            dataset_id,
            filters,
            limit,
            offset,
        } => {
            let params = FilterParams {
                filters: commands::parse_filters(&filters.filters)?,
                limit,
                offset,
            };
            commands::data_command(manager, &dataset_id, &params, print).await
        }
        Commands::Aggregate {
            dataset_id,
            group_by,
            agg,
            target,
            order_by,
            order_dir,
            granularity,
            limit,
            filters,
        } => {
            let params = AggregationParams {
                filters: commands::parse_filters(&filters.filters)?,
                agg,
                target,
                group_by,
                order_by,
                order_dir,
                limit,
                granularity,
            };
            commands::aggregate_command(manager, &dataset_id, &params, print).await
        }
        Commands::Stats {
            dataset_id,
            column,
            filters,
        } => {
            let filters = commands::parse_filters(&filters.filters)?;
            commands::stats_command(manager, &dataset_id, &column, &filters, print).await
        }
        Commands::Top {
            dataset_id,
            column,
            limit,
            filters,
        } => {
            let filters = commands::parse_filters(&filters.filters)?;
            commands::top_command(manager, &dataset_id, &column, limit, &filters, print).await
        }
        Commands::Series {
            dataset_id,
            date_column,
            value,
            agg,
            filters,
        } => {
            let filters = commands::parse_filters(&filters.filters)?;
            commands::series_command(
                manager,
                &dataset_id,
                &date_column,
                value.as_deref(),
                agg.as_deref(),
                &filters,
                print,
            )
            .await
        }
        Commands::Crosstab {
            dataset_id,
            row,
            col,
            value,
            agg,
            filters,
        } => {
            let filters = commands::parse_filters(&filters.filters)?;
            commands::cross_tab_command(
                manager,
                &dataset_id,
                &row,
                &col,
                value.as_deref(),
                agg.as_deref(),
                &filters,
                print,
            )
            .await
        }
        Commands::Percentiles {
            dataset_id,
            column,
            points,
            filters,
        } => {
            let filters = commands::parse_filters(&filters.filters)?;
            commands::percentiles_command(manager, &dataset_id, &column, &points, &filters, print)
                .await
        }
        Commands::Correlation {
            dataset_id,
            first,
            second,
            filters,
        } => {
            let filters = commands::parse_filters(&filters.filters)?;
            commands::correlation_command(manager, &dataset_id, &first, &second, &filters, print)
                .await
        }
        Commands::Cache => commands::cache_command(manager, &config, print),
        Commands::Config => commands::config_command(&config, print),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    diagnostics::init();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;
    debug!("configuration loaded");

    let manager = DatasetManager::from_config(&config.cache, &config.dataset).await?;
    manager.start_background();

    let result = run(cli.command, config, &manager).await;
    manager.close().await;

    if let Err(e) = &result {
        let error_str = e.to_string();
        error!("visor failed: {error}", error: error_str);
    }
    result
}
