// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Deterministic result-cache keys.
//!
//! A fingerprint is `<prefix>:<hex sha256>` over a canonical JSON rendering of
//! the dataset id and the request parameters. Object keys are sorted at every
//! depth, so two requests differing only in map order share a key. Array
//! order is significant.

use crate::Result;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Render a JSON value with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out)?;
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

#[derive(Serialize)]
struct Keyed<'a, T: Serialize> {
    dataset_id: &'a str,
    params: &'a T,
}

/// Compute the cache key for `params` against `dataset_id`.
pub fn fingerprint<T: Serialize>(prefix: &str, dataset_id: &str, params: &T) -> Result<String> {
    let value = serde_json::to_value(Keyed { dataset_id, params })?;
    let canonical = canonical_json(&value)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{prefix}:{}", hex::encode(digest)))
}
