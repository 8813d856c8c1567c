// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Structured filter and aggregation requests turned into parameterized SQL.
//!
//! Every user-supplied value is bound as a parameter. Column names are
//! checked against [`validate_identifier`] and quoted. The only text
//! interpolated directly is drawn from closed sets (aggregate functions, date
//! granularities) or is a validated number (limits, quantile points).

use crate::Result;
use crate::engine::{DuckFunc, TABLE, quote_ident, validate_identifier};
use crate::error::DatasetError;
use duckdb::types::Value as DuckValue;
use sea_query::{Alias, Expr, Func, Order, Query, SelectStatement, SimpleExpr, SqliteQueryBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Column name to requested value (scalar or list). Sorted, so the generated
/// SQL does not depend on request order.
pub type Filters = BTreeMap<String, Value>;

/// Cap on distinct values listed per filter.
pub const MAX_DISTINCT_VALUES: u64 = 1000;
/// Columns with more distinct values than this are not offered as filters.
pub const CATEGORICAL_MAX_DISTINCT: i64 = 100;
pub const DEFAULT_TOP_VALUES: u64 = 10;
pub const MAX_TOP_VALUES: u64 = 1000;
pub const MAX_PERCENTILE_POINTS: usize = 100;

/// SQL text plus the values bound to its `?` placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub values: Vec<DuckValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    pub filters: Filters,
    pub limit: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationParams {
    pub filters: Filters,
    /// Aggregate function name: count, sum, avg, min, max, median, stddev.
    pub agg: Option<String>,
    /// Column the aggregate applies to; `COUNT(*)` when absent.
    pub target: Option<String>,
    pub group_by: Vec<String>,
    /// A group-by column or `total`.
    pub order_by: Option<String>,
    /// `asc` (default) or `desc`.
    pub order_dir: Option<String>,
    pub limit: u64,
    /// Truncation applied to date-like group-by columns.
    pub granularity: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Median,
    Stddev,
}

impl AggFunc {
    /// Unrecognized names fall back to counting.
    #[must_use]
    pub fn parse(name: Option<&str>) -> Self {
        match name.map(|n| n.trim().to_ascii_lowercase()).as_deref() {
            Some("sum") => AggFunc::Sum,
            Some("avg" | "mean" | "average") => AggFunc::Avg,
            Some("min") => AggFunc::Min,
            Some("max") => AggFunc::Max,
            Some("median") => AggFunc::Median,
            Some("stddev" | "std") => AggFunc::Stddev,
            _ => AggFunc::Count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Year,
    Quarter,
    Month,
    Week,
    Day,
    YearMonth,
}

impl Granularity {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "year" => Ok(Granularity::Year),
            "quarter" => Ok(Granularity::Quarter),
            "month" => Ok(Granularity::Month),
            "week" => Ok(Granularity::Week),
            "day" => Ok(Granularity::Day),
            "year_month" => Ok(Granularity::YearMonth),
            other => Err(DatasetError::InvalidParameter(format!(
                "unknown date granularity {other:?}"
            ))),
        }
    }

    fn expr(self, column: &str) -> SimpleExpr {
        let date = format!("TRY_CAST({} AS DATE)", quote_ident(column));
        let sql = match self {
            Granularity::Year => format!("date_trunc('year', {date})"),
            Granularity::Quarter => format!("date_trunc('quarter', {date})"),
            Granularity::Month => format!("date_trunc('month', {date})"),
            Granularity::Week => format!("date_trunc('week', {date})"),
            Granularity::Day => format!("date_trunc('day', {date})"),
            Granularity::YearMonth => format!("strftime({date}, '%Y-%m')"),
        };
        Expr::cust(sql)
    }
}

/// Whether a filter value means "no filter".
#[must_use]
pub fn is_sentinel(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case("all") || s.eq_ignore_ascii_case("todas")
        }
        Value::Array(items) => items.iter().all(is_sentinel),
        _ => false,
    }
}

fn bind(column: &str, value: &Value) -> Result<sea_query::Value> {
    match value {
        Value::String(s) => Ok(s.clone().into()),
        Value::Bool(b) => Ok((*b).into()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i.into())
            } else if let Some(u) = n.as_u64() {
                Ok(u.into())
            } else {
                Ok(n.as_f64().unwrap_or_default().into())
            }
        }
        _ => Err(DatasetError::InvalidParameter(format!(
            "filter on {column} must be a scalar or a list of scalars"
        ))),
    }
}

fn col(name: &str) -> Result<SimpleExpr> {
    validate_identifier(name)?;
    Ok(Expr::col(Alias::new(name)).into())
}

fn numeric(name: &str) -> Result<SimpleExpr> {
    validate_identifier(name)?;
    Ok(Expr::cust(format!("TRY_CAST({} AS DOUBLE)", quote_ident(name))))
}

fn count_all() -> SimpleExpr {
    Expr::cust("COUNT(*)")
}

/// Add a `WHERE` term per non-sentinel filter. Lists become `IN (...)`.
pub fn apply_filters(select: &mut SelectStatement, filters: &Filters) -> Result<()> {
    for (column, value) in filters {
        validate_identifier(column)?;
        if is_sentinel(value) {
            continue;
        }
        let target = Expr::col(Alias::new(column.as_str()));
        match value {
            Value::Array(items) => {
                let values = items
                    .iter()
                    .filter(|v| !is_sentinel(v))
                    .map(|v| bind(column, v))
                    .collect::<Result<Vec<_>>>()?;
                select.and_where(target.is_in(values));
            }
            scalar => {
                select.and_where(target.eq(bind(column, scalar)?));
            }
        }
    }
    Ok(())
}

/// Columns referenced by a filter set, sentinels included.
pub fn filter_columns(filters: &Filters) -> impl Iterator<Item = &str> {
    filters.keys().map(String::as_str)
}

fn to_duck(value: sea_query::Value) -> DuckValue {
    use sea_query::Value as V;
    match value {
        V::Bool(Some(b)) => DuckValue::Boolean(b),
        V::TinyInt(Some(v)) => DuckValue::BigInt(i64::from(v)),
        V::SmallInt(Some(v)) => DuckValue::BigInt(i64::from(v)),
        V::Int(Some(v)) => DuckValue::BigInt(i64::from(v)),
        V::BigInt(Some(v)) => DuckValue::BigInt(v),
        V::TinyUnsigned(Some(v)) => DuckValue::UBigInt(u64::from(v)),
        V::SmallUnsigned(Some(v)) => DuckValue::UBigInt(u64::from(v)),
        V::Unsigned(Some(v)) => DuckValue::UBigInt(u64::from(v)),
        V::BigUnsigned(Some(v)) => DuckValue::UBigInt(v),
        V::Float(Some(v)) => DuckValue::Double(f64::from(v)),
        V::Double(Some(v)) => DuckValue::Double(v),
        V::String(Some(s)) => DuckValue::Text(s.to_string()),
        V::Char(Some(c)) => DuckValue::Text(c.to_string()),
        // Only the scalar variants above are ever bound
        _ => DuckValue::Null,
    }
}

/// Render a statement, then append `LIMIT`/`OFFSET` when positive.
fn finish(select: &SelectStatement, limit: u64, offset: u64) -> BuiltQuery {
    let (mut sql, values) = select.build(SqliteQueryBuilder);
    if limit > 0 {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if offset > 0 {
        sql.push_str(&format!(" OFFSET {offset}"));
    }
    BuiltQuery {
        sql,
        values: values.0.into_iter().map(to_duck).collect(),
    }
}

fn from_data() -> SelectStatement {
    let mut select = Query::select();
    select.from(Alias::new(TABLE));
    select
}

pub fn build_filter_query(params: &FilterParams) -> Result<BuiltQuery> {
    let mut select = from_data();
    select.column(sea_query::Asterisk);
    apply_filters(&mut select, &params.filters)?;
    Ok(finish(&select, params.limit, params.offset))
}

pub fn build_distinct_count(column: &str) -> Result<BuiltQuery> {
    let mut select = from_data();
    select.expr_as(Func::count_distinct(col(column)?), Alias::new("distinct_count"));
    Ok(finish(&select, 0, 0))
}

/// Sorted non-null distinct values, at most [`MAX_DISTINCT_VALUES`].
pub fn build_distinct_values(column: &str) -> Result<BuiltQuery> {
    let mut select = from_data();
    select
        .distinct()
        .expr_as(col(column)?, Alias::new("value"))
        .and_where(Expr::col(Alias::new(column)).is_not_null())
        .order_by(Alias::new("value"), Order::Asc);
    Ok(finish(&select, MAX_DISTINCT_VALUES, 0))
}

pub fn build_min_max(column: &str) -> Result<BuiltQuery> {
    let mut select = from_data();
    select
        .expr_as(Func::min(col(column)?), Alias::new("min"))
        .expr_as(Func::max(col(column)?), Alias::new("max"));
    Ok(finish(&select, 0, 0))
}

fn aggregate(func: AggFunc, target: Option<&str>) -> Result<SimpleExpr> {
    let Some(target) = target else {
        return Ok(count_all());
    };
    Ok(match func {
        AggFunc::Count => Func::count(col(target)?).into(),
        AggFunc::Sum => Func::sum(numeric(target)?).into(),
        AggFunc::Avg => Func::avg(numeric(target)?).into(),
        AggFunc::Min => Func::min(col(target)?).into(),
        AggFunc::Max => Func::max(col(target)?).into(),
        AggFunc::Median => Func::cust(DuckFunc::Median).arg(numeric(target)?).into(),
        AggFunc::Stddev => Func::cust(DuckFunc::Stddev).arg(numeric(target)?).into(),
    })
}

fn parse_order(dir: Option<&str>) -> Result<Order> {
    match dir.map(|d| d.trim().to_ascii_lowercase()).as_deref() {
        None | Some("" | "asc") => Ok(Order::Asc),
        Some("desc") => Ok(Order::Desc),
        Some(other) => Err(DatasetError::InvalidParameter(format!(
            "order direction must be asc or desc, got {other:?}"
        ))),
    }
}

/// Group-by columns (dates optionally truncated) plus one aggregate aliased
/// `total`.
///
/// `date_columns` lists the date-like columns of the dataset; only those are
/// truncated when a granularity is given.
pub fn build_aggregation_query(
    params: &AggregationParams,
    date_columns: &[String],
) -> Result<BuiltQuery> {
    let granularity = params
        .granularity
        .as_deref()
        .filter(|g| !g.trim().is_empty())
        .map(Granularity::parse)
        .transpose()?;

    let mut select = from_data();
    for column in &params.group_by {
        validate_identifier(column)?;
        match granularity {
            Some(g) if date_columns.contains(column) => {
                select.expr_as(g.expr(column), Alias::new(column.as_str()));
            }
            _ => {
                select.column(Alias::new(column.as_str()));
            }
        }
    }

    let func = AggFunc::parse(params.agg.as_deref());
    let target = params.target.as_deref().filter(|t| !t.trim().is_empty());
    select.expr_as(aggregate(func, target)?, Alias::new("total"));

    apply_filters(&mut select, &params.filters)?;

    if !params.group_by.is_empty() {
        select.add_group_by((1..=params.group_by.len()).map(|i| Expr::cust(i.to_string())));
    }

    match params.order_by.as_deref().filter(|o| !o.trim().is_empty()) {
        Some(order_by) => {
            if order_by != "total" && !params.group_by.iter().any(|g| g == order_by) {
                return Err(DatasetError::InvalidParameter(format!(
                    "order_by must be a group_by column or total, got {order_by:?}"
                )));
            }
            let order = parse_order(params.order_dir.as_deref())?;
            select.order_by(Alias::new(order_by), order);
        }
        None => match params.group_by.first() {
            Some(first) => {
                select.order_by(Alias::new(first.as_str()), Order::Asc);
            }
            None => {
                select.order_by(Alias::new("total"), Order::Desc);
            }
        },
    }

    Ok(finish(&select, params.limit, 0))
}

/// Summary statistics of one column over the filtered rows.
pub fn build_stats_query(column: &str, filters: &Filters) -> Result<BuiltQuery> {
    let quantile = |p: &str| -> Result<SimpleExpr> {
        Ok(Func::cust(DuckFunc::QuantileCont)
            .arg(numeric(column)?)
            .arg(Expr::cust(p))
            .into())
    };

    let mut select = from_data();
    select
        .expr_as(count_all(), Alias::new("rows"))
        .expr_as(Func::count(col(column)?), Alias::new("non_null"))
        .expr_as(Func::count_distinct(col(column)?), Alias::new("distinct_count"))
        .expr_as(Func::min(col(column)?), Alias::new("min"))
        .expr_as(Func::max(col(column)?), Alias::new("max"))
        .expr_as(Func::avg(numeric(column)?), Alias::new("mean"))
        .expr_as(
            Func::cust(DuckFunc::Median).arg(numeric(column)?),
            Alias::new("median"),
        )
        .expr_as(
            Func::cust(DuckFunc::Stddev).arg(numeric(column)?),
            Alias::new("stddev"),
        )
        .expr_as(quantile("0.25")?, Alias::new("q25"))
        .expr_as(quantile("0.75")?, Alias::new("q75"));
    apply_filters(&mut select, filters)?;
    Ok(finish(&select, 0, 0))
}

/// Most frequent values with their share of the filtered rows.
pub fn build_top_values_query(column: &str, limit: u64, filters: &Filters) -> Result<BuiltQuery> {
    let limit = match limit {
        0 => DEFAULT_TOP_VALUES,
        n => n.min(MAX_TOP_VALUES),
    };
    let mut select = from_data();
    select
        .expr_as(col(column)?, Alias::new("value"))
        .expr_as(count_all(), Alias::new("count"))
        .expr_as(
            Expr::cust("COUNT(*) * 100.0 / SUM(COUNT(*)) OVER ()"),
            Alias::new("percentage"),
        );
    apply_filters(&mut select, filters)?;
    select
        .add_group_by([Expr::cust("1")])
        .order_by(Alias::new("count"), Order::Desc)
        .order_by(Alias::new("value"), Order::Asc);
    Ok(finish(&select, limit, 0))
}

/// Daily series of `agg(value_column)` (or a row count) along a date column.
pub fn build_time_series_query(
    date_column: &str,
    value_column: Option<&str>,
    agg: Option<&str>,
    filters: &Filters,
) -> Result<BuiltQuery> {
    let params = AggregationParams {
        filters: filters.clone(),
        agg: agg.map(str::to_string),
        target: value_column.map(str::to_string),
        group_by: vec![date_column.to_string()],
        granularity: Some("day".to_string()),
        ..AggregationParams::default()
    };
    build_aggregation_query(&params, &[date_column.to_string()])
}

/// Aggregate over every (row, column) pair; pivoted by the caller.
pub fn build_cross_tab_query(
    row_var: &str,
    col_var: &str,
    value_var: Option<&str>,
    agg: Option<&str>,
    filters: &Filters,
) -> Result<BuiltQuery> {
    let params = AggregationParams {
        filters: filters.clone(),
        agg: agg.map(str::to_string),
        target: value_var.map(str::to_string),
        group_by: vec![row_var.to_string(), col_var.to_string()],
        ..AggregationParams::default()
    };
    build_aggregation_query(&params, &[])
}

/// One `quantile_cont` per point, aliased `p0`, `p1`, ... in input order.
pub fn build_percentiles_query(column: &str, points: &[f64], filters: &Filters) -> Result<BuiltQuery> {
    if points.is_empty() || points.len() > MAX_PERCENTILE_POINTS {
        return Err(DatasetError::InvalidParameter(format!(
            "between 1 and {MAX_PERCENTILE_POINTS} percentile points are required"
        )));
    }
    let mut select = from_data();
    for (i, p) in points.iter().enumerate() {
        if !p.is_finite() || !(0.0..=1.0).contains(p) {
            return Err(DatasetError::InvalidParameter(format!(
                "percentile point {p} is outside [0, 1]"
            )));
        }
        select.expr_as(
            Func::cust(DuckFunc::QuantileCont)
                .arg(numeric(column)?)
                .arg(Expr::cust(p.to_string())),
            Alias::new(format!("p{i}")),
        );
    }
    apply_filters(&mut select, filters)?;
    Ok(finish(&select, 0, 0))
}

/// Pearson correlation of two columns plus the number of rows considered.
pub fn build_correlation_query(first: &str, second: &str, filters: &Filters) -> Result<BuiltQuery> {
    let mut select = from_data();
    select
        .expr_as(
            Func::cust(DuckFunc::Corr)
                .arg(numeric(first)?)
                .arg(numeric(second)?),
            Alias::new("correlation"),
        )
        .expr_as(count_all(), Alias::new("rows"));
    apply_filters(&mut select, filters)?;
    Ok(finish(&select, 0, 0))
}
