//! HTTP client for the sensor release catalog
//!
//! Endpoints, relative to the catalog base URL:
//!
//! - `GET v1/sensors/{sensor}/channels/{channel}/latest` → `{"version": "..."}`
//! - `GET v1/registry/token` → `{"token": "..."}`
//!
//! Requests carry the operator's bearer token when one is configured.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use warden_common::catalog::{SensorCatalog, SensorKind};
use warden_common::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct LatestRelease {
    version: String,
}

#[derive(Debug, Deserialize)]
struct RegistryToken {
    token: String,
}

/// [`SensorCatalog`] served over HTTP
#[derive(Clone, Debug)]
pub struct HttpCatalog {
    base_url: String,
    bearer: Option<String>,
    client: reqwest::Client,
}

impl HttpCatalog {
    /// Client for the catalog at `base_url`
    pub fn new(base_url: &str, bearer: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context("catalog", e.to_string()))?;
        Ok(Self::with_client(base_url, bearer, client))
    }

    /// Client for the catalog at `base_url` using a preconfigured HTTP client
    pub fn with_client(base_url: &str, bearer: Option<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer: bearer.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
            client,
        }
    }

    fn latest_url(&self, sensor: SensorKind, channel: &str) -> String {
        format!(
            "{}/v1/sensors/{}/channels/{}/latest",
            self.base_url,
            sensor.as_str(),
            channel
        )
    }

    fn token_url(&self) -> String {
        format!("{}/v1/registry/token", self.base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        dependency: &str,
        url: &str,
    ) -> Result<T> {
        debug!(url = %url, "querying catalog");
        let mut request = self.client.get(url);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::dependency(dependency, format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::dependency(
                dependency,
                format!("HTTP {} from {url}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| Error::dependency(dependency, format!("invalid response: {e}")))
    }
}

#[async_trait]
impl SensorCatalog for HttpCatalog {
    async fn latest_version(&self, sensor: SensorKind, channel: &str) -> Result<String> {
        let release: LatestRelease = self
            .get_json("version-query", &self.latest_url(sensor, channel))
            .await?;
        parse_version(release)
    }

    async fn pull_token(&self) -> Result<Vec<u8>> {
        let token: RegistryToken = self.get_json("pull-token", &self.token_url()).await?;
        if token.token.is_empty() {
            return Err(Error::dependency("pull-token", "catalog returned an empty token"));
        }
        Ok(token.token.into_bytes())
    }
}

fn parse_version(release: LatestRelease) -> Result<String> {
    let version = release.version.trim();
    if version.is_empty() {
        return Err(Error::dependency("version-query", "catalog returned an empty version"));
    }
    Ok(version.to_string())
}
