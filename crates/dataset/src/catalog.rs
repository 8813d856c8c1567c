// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Thin client for the CKAN action API.

use crate::Result;
use crate::error::DatasetError;
use diagnostics::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use url::Url;

/// A downloadable file in the catalog.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub format: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub description: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub created: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub last_modified: String,
    /// CKAN reports size as a number, a numeric string or null.
    #[serde(default, deserialize_with = "lenient_size")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub title: String,
    #[serde(default, alias = "notes", deserialize_with = "nullable_string")]
    pub description: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    success: bool,
    result: Option<T>,
}

fn nullable_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

fn lenient_size<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Clone)]
pub struct CkanClient {
    base: Url,
    http: reqwest::Client,
}

impl CkanClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        // Url::join drops the last path segment unless it ends in '/'
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base, http })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub async fn get_resource(&self, resource_id: &str) -> Result<Resource> {
        self.action("resource_show", resource_id).await
    }

    pub async fn get_package(&self, package_id: &str) -> Result<Package> {
        self.action("package_show", package_id).await
    }

    async fn action<T: DeserializeOwned>(&self, action: &str, id: &str) -> Result<T> {
        let url = self.base.join(action)?;
        debug!("catalog {action} for {id}", action: action, id: id);

        let response = self.http.get(url).query(&[("id", id)]).send().await?;
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            return Err(DatasetError::Catalog(format!(
                "{action} for {id} returned HTTP {code}"
            )));
        }

        let envelope: Envelope<T> = response.json().await?;
        match envelope {
            Envelope {
                success: true,
                result: Some(result),
            } => Ok(result),
            _ => Err(DatasetError::Catalog(format!(
                "{action} for {id} returned success=false"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_tolerates_ckan_quirks() {
        let resource: Resource = serde_json::from_str(
            r#"{"id": "r1", "url": "http://x/a.csv", "format": "CSV",
                "description": null, "size": "2048"}"#,
        )
        .expect("parse");
        assert_eq!(resource.size, Some(2048));
        assert_eq!(resource.description, "");

        let resource: Resource =
            serde_json::from_str(r#"{"id": "r2", "url": "u", "size": null}"#).expect("parse");
        assert_eq!(resource.size, None);
        assert_eq!(resource.format, "");
    }

    #[test]
    fn test_package_reads_notes_as_description() {
        let package: Package = serde_json::from_str(
            r#"{"id": "p", "name": "n", "title": "T", "notes": "about",
                "resources": [{"id": "r", "url": "u", "size": 10}]}"#,
        )
        .expect("parse");
        assert_eq!(package.description, "about");
        assert_eq!(package.resources.len(), 1);
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let client =
            CkanClient::new("http://catalog/api/3/action", Duration::from_secs(1)).expect("client");
        assert_eq!(
            client.base_url().join("resource_show").expect("join").as_str(),
            "http://catalog/api/3/action/resource_show"
        );
    }
}
