// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

pub mod cache;
pub mod download;
pub mod query;

pub use cache::{cache_command, config_command};
pub use download::{download_command, status_command};
pub use query::{
    aggregate_command, correlation_command, cross_tab_command, data_command, filters_command,
    metadata_command, percentiles_command, series_command, stats_command, top_command,
};

use anyhow::{Context, Result, anyhow};
use dataset::Filters;
use serde::Serialize;
use serde_json::Value;

/// Pretty JSON for command output.
pub fn render<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to render output")
}

/// A bare number or boolean stays typed; anything else is a string.
fn parse_scalar(raw: &str) -> Value {
    let raw = raw.trim();
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
        _ => Value::String(raw.to_string()),
    }
}

/// Parse `column=value` or `column=a,b,c` arguments into a filter set.
pub fn parse_filters(args: &[String]) -> Result<Filters> {
    let mut filters = Filters::new();
    for arg in args {
        let (column, value) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("Filter must look like column=value, got {arg:?}"))?;
        let column = column.trim();
        if column.is_empty() {
            anyhow::bail!("Filter column is empty in {arg:?}");
        }
        let value = if value.contains(',') {
            Value::Array(value.split(',').map(parse_scalar).collect())
        } else {
            parse_scalar(value)
        };
        let _ = filters.insert(column.to_string(), value);
    }
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_filters() -> Result<()> {
        let filters = parse_filters(&[
            "estado=Jalisco,Colima".to_string(),
            "edad=30".to_string(),
            "activo=true".to_string(),
            "sexo=todas".to_string(),
        ])?;
        assert_eq!(filters["estado"], json!(["Jalisco", "Colima"]));
        assert_eq!(filters["edad"], json!(30));
        assert_eq!(filters["activo"], json!(true));
        assert_eq!(filters["sexo"], json!("todas"));
        Ok(())
    }

    #[test]
    fn test_parse_filters_rejects_malformed() {
        assert!(parse_filters(&["estado".to_string()]).is_err());
        assert!(parse_filters(&["=Jalisco".to_string()]).is_err());
    }
}
