// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! DuckDB plumbing shared by the loader, the handle pool and the query
//! builder: function names, identifier rules, schema reads and result
//! conversion to JSON.

use crate::Result;
use crate::error::DatasetError;
use chrono::{DateTime, NaiveDate};
use duckdb::types::{TimeUnit, Value as DuckValue};
use duckdb::{AccessMode, Config, Connection};
use sea_query::Iden;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::path::Path;

/// The single table every converted store holds.
pub const TABLE: &str = "data";

/// DuckDB functions sea-query has no builtin for.
#[derive(Iden)]
pub enum DuckFunc {
    ReadCsvAuto,
    ReadJsonAuto,
    ReadParquet,
    Median,
    Stddev,
    QuantileCont,
    Corr,
}

/// Identifiers are interpolated into SQL (quoted), so only a conservative
/// alphabet is accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 255
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(DatasetError::InvalidIdentifier(name.to_string()))
    }
}

/// Double-quote an identifier that already passed [`validate_identifier`].
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    /// Dates are recognised by name (Spanish or English) or by type.
    #[must_use]
    pub fn is_date_like(&self) -> bool {
        is_date_name(&self.name) || {
            let ty = self.data_type.to_ascii_uppercase();
            ty == "DATE" || ty.starts_with("TIMESTAMP")
        }
    }
}

#[must_use]
pub fn is_date_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("fecha") || lower.contains("date")
}

/// Column names and values of an executed query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryOutput {
    /// Rows as `column -> value` objects.
    #[must_use]
    pub fn into_maps(self) -> Vec<Map<String, Value>> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|row| columns.iter().cloned().zip(row).collect())
            .collect()
    }

    /// First column of the first row, if any.
    #[must_use]
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|r| r.first())
    }
}

pub fn open_read_only(path: &Path) -> Result<Connection> {
    let config = Config::default().access_mode(AccessMode::ReadOnly)?;
    Ok(Connection::open_with_flags(path, config)?)
}

/// Column schema of the `data` table in declaration order.
pub fn read_columns(conn: &Connection) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare(
        "SELECT column_name, data_type FROM information_schema.columns \
         WHERE table_name = ? ORDER BY ordinal_position",
    )?;
    let columns = stmt
        .query_map([TABLE], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                data_type: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Execute a prepared statement with bound values and convert every cell.
pub fn run_query(conn: &Connection, sql: &str, values: &[DuckValue]) -> Result<QueryOutput> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(duckdb::params_from_iter(values.iter()))?;

    // Column metadata is only available once the statement has executed
    let columns: Vec<String> = rows
        .as_ref()
        .map(|s| s.column_names().into_iter().map(|n| n.to_string()).collect())
        .unwrap_or_default();

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            let value: DuckValue = row.get(i)?;
            cells.push(to_json(value));
        }
        out.push(cells);
    }
    Ok(QueryOutput { columns, rows: out })
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn micros(unit: TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v.saturating_mul(1_000_000),
        TimeUnit::Millisecond => v.saturating_mul(1_000),
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

/// Convert one DuckDB cell to JSON. Dates and timestamps become ISO strings.
#[must_use]
pub fn to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(v) => Value::from(v),
        DuckValue::SmallInt(v) => Value::from(v),
        DuckValue::Int(v) => Value::from(v),
        DuckValue::BigInt(v) => Value::from(v),
        DuckValue::HugeInt(v) => i64::try_from(v).map_or_else(|_| Value::String(v.to_string()), Value::from),
        DuckValue::UTinyInt(v) => Value::from(v),
        DuckValue::USmallInt(v) => Value::from(v),
        DuckValue::UInt(v) => Value::from(v),
        DuckValue::UBigInt(v) => Value::from(v),
        DuckValue::Float(v) => float(f64::from(v)),
        DuckValue::Double(v) => float(v),
        DuckValue::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map_or_else(|_| Value::String(d.to_string()), float),
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Enum(s) => Value::String(s),
        DuckValue::Date32(days) => NaiveDate::from_num_days_from_ce_opt(719_163 + days)
            .map_or(Value::Null, |d| Value::String(d.format("%Y-%m-%d").to_string())),
        DuckValue::Timestamp(unit, v) => DateTime::from_timestamp_micros(micros(unit, v))
            .map_or(Value::Null, |t| {
                Value::String(t.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string())
            }),
        DuckValue::List(items) => Value::Array(items.into_iter().map(to_json).collect()),
        other => Value::String(format!("{other:?}")),
    }
}
