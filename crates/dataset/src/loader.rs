// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Bulk load of a raw file into a fresh DuckDB store.
//!
//! Everything here is blocking and runs under `spawn_blocking`.

use crate::Result;
use crate::engine::{self, DuckFunc, TABLE, quote_ident};
use crate::error::DatasetError;
use diagnostics::*;
use duckdb::Connection;
use sea_query::{Alias, Asterisk, Expr, Func, Query, SqliteQueryBuilder};
use std::path::Path;

/// Raw file formats the loader understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    Tsv,
    Json,
    Parquet,
}

impl SourceFormat {
    /// Resolve the catalog's declared format, falling back to the URL's
    /// extension when the catalog leaves it blank.
    pub fn detect(declared: &str, url: &str) -> Result<Self> {
        let declared = declared.trim().trim_start_matches('.').to_ascii_lowercase();
        let name = if declared.is_empty() {
            url.split(['?', '#'])
                .next()
                .and_then(|path| path.rsplit_once('.'))
                .map(|(_, ext)| ext.to_ascii_lowercase())
                .unwrap_or_default()
        } else {
            declared
        };
        match name.as_str() {
            "csv" | "txt" => Ok(SourceFormat::Csv),
            "tsv" => Ok(SourceFormat::Tsv),
            "json" | "ndjson" | "jsonl" => Ok(SourceFormat::Json),
            "parquet" => Ok(SourceFormat::Parquet),
            _ => Err(DatasetError::UnsupportedFormat(name)),
        }
    }

    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            SourceFormat::Csv => "csv",
            SourceFormat::Tsv => "tsv",
            SourceFormat::Json => "json",
            SourceFormat::Parquet => "parquet",
        }
    }
}

/// Loader stages reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Loading,
    Indexing,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadReport {
    pub rows: Option<u64>,
    pub indexed: Vec<String>,
}

/// Column name fragments that get an index. Spanish names first, the English
/// equivalents after.
const INDEXED_CATEGORIES: &[&str] = &[
    "entidad",
    "estado",
    "municipio",
    "tipo",
    "categoria",
    "clasificacion",
    "entity",
    "state",
    "municipality",
    "type",
    "category",
    "classification",
];

/// Whether the loader indexes a column with this name.
#[must_use]
pub fn wants_index(column: &str) -> bool {
    let lower = column.to_lowercase();
    engine::is_date_name(&lower) || INDEXED_CATEGORIES.iter().any(|c| lower.contains(c))
}

/// `CREATE TABLE data AS SELECT * FROM <reader>(...)` for a raw file.
#[must_use]
pub fn create_table_sql(raw: &Path, format: SourceFormat) -> String {
    let path = Expr::val(raw.to_string_lossy().into_owned());
    let reader = match format {
        SourceFormat::Csv | SourceFormat::Tsv => {
            let mut f = Func::cust(DuckFunc::ReadCsvAuto)
                .arg(path)
                .arg(Expr::cust("header = true"))
                .arg(Expr::cust("ignore_errors = true"))
                .arg(Expr::cust("null_padding = true"))
                .arg(Expr::cust("sample_size = -1"))
                .arg(Expr::cust("normalize_names = true"));
            if format == SourceFormat::Tsv {
                f = f.arg(Expr::cust("delim = '\\t'"));
            }
            f
        }
        SourceFormat::Json => Func::cust(DuckFunc::ReadJsonAuto).arg(path),
        SourceFormat::Parquet => Func::cust(DuckFunc::ReadParquet).arg(path),
    };

    let select = Query::select()
        .column(Asterisk)
        .from_function(reader, Alias::new("raw"))
        .to_string(SqliteQueryBuilder);
    format!("CREATE TABLE {TABLE} AS {select}")
}

/// Load `raw` into a new store at `db_path`.
///
/// Only a failure to create the table is fatal. Row counting, indexing and
/// the final checkpoint are best effort.
pub fn load_store(
    raw: &Path,
    format: SourceFormat,
    db_path: &Path,
    stage: &dyn Fn(LoadStage),
) -> Result<LoadReport> {
    let conn = Connection::open(db_path)?;

    stage(LoadStage::Loading);
    let sql = create_table_sql(raw, format);
    debug!("loading store: {sql}", sql: sql);
    conn.execute_batch(&sql)
        .map_err(|e| DatasetError::Load(e.to_string()))?;

    let rows = match conn.query_row(&format!("SELECT COUNT(*) FROM {TABLE}"), [], |r| {
        r.get::<_, i64>(0)
    }) {
        Ok(n) => {
            info!("loaded {n} rows", n: n);
            u64::try_from(n).ok()
        }
        Err(e) => {
            let error_str = e.to_string();
            warn!("could not count rows: {error}", error: error_str);
            None
        }
    };

    stage(LoadStage::Indexing);
    let indexed = create_indexes(&conn)?;

    stage(LoadStage::Finalizing);
    if let Err(e) = conn.execute_batch("CHECKPOINT") {
        let error_str = e.to_string();
        warn!("checkpoint failed: {error}", error: error_str);
    }

    Ok(LoadReport { rows, indexed })
}

fn index_name(column: &str) -> String {
    let safe: String = column
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("idx_{safe}")
}

fn create_indexes(conn: &Connection) -> Result<Vec<String>> {
    let columns = engine::read_columns(conn)?;
    let mut indexed = Vec::new();
    for column in columns.iter().filter(|c| wants_index(&c.name)) {
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {TABLE} ({})",
            quote_ident(&index_name(&column.name)),
            quote_ident(&column.name)
        );
        match conn.execute_batch(&sql) {
            Ok(()) => indexed.push(column.name.clone()),
            Err(e) => {
                let name = column.name.clone();
                let error_str = e.to_string();
                warn!("skipping index on {name}: {error}", name: name, error: error_str);
            }
        }
    }
    let count = indexed.len();
    debug!("created {count} indexes", count: count);
    Ok(indexed)
}
