//! Sensor release catalog
//!
//! The catalog is the external source of truth for sensor versions and for
//! the token that authorizes pulls from the operator's registry. Controllers
//! only see the [`SensorCatalog`] trait; the HTTP client lives in the
//! operator binary.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
#[cfg(test)]
use mockall::automock;
use serde_json::json;

use crate::{Error, Result};

/// Which sensor a catalog query is about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// Per-node DaemonSet sensor
    Node,
    /// Admission webhook sensor
    Admission,
}

impl SensorKind {
    /// Identifier used in catalog queries
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Admission => "admission",
        }
    }

    /// Image repository within the operator registry
    pub fn repository(&self) -> &'static str {
        match self {
            Self::Node => "sensors/node",
            Self::Admission => "sensors/admission",
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of sensor versions and registry credentials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SensorCatalog: Send + Sync {
    /// Latest released version of `sensor` on `channel`
    async fn latest_version(&self, sensor: SensorKind, channel: &str) -> Result<String>;

    /// Token authorizing pulls from the operator registry
    async fn pull_token(&self) -> Result<Vec<u8>>;
}

/// Image a reconciliation will deploy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Full image reference
    pub uri: String,
    /// Sensor version reported in status
    pub version: String,
    /// Whether the image is pulled from the operator registry
    pub from_registry: bool,
}

/// Decide which image to run
///
/// An explicit image wins and its tag becomes the version. A pinned version
/// is used as-is. Otherwise the catalog is asked for the latest release of
/// `channel`.
pub async fn resolve_image(
    catalog: &dyn SensorCatalog,
    registry: &str,
    sensor: SensorKind,
    image_override: Option<&str>,
    pinned: Option<&str>,
    channel: &str,
) -> Result<ResolvedImage> {
    if let Some(image) = image_override.filter(|i| !i.is_empty()) {
        return Ok(ResolvedImage {
            uri: image.to_string(),
            version: image_tag(image).to_string(),
            from_registry: image.starts_with(&format!("{registry}/")),
        });
    }

    let version = match pinned.filter(|v| !v.is_empty()) {
        Some(v) => v.to_string(),
        None => catalog.latest_version(sensor, channel).await?,
    };

    Ok(ResolvedImage {
        uri: format!("{registry}/{}:{version}", sensor.repository()),
        version,
        from_registry: true,
    })
}

/// Tag of an image reference, `latest` when it has none
///
/// Digests are ignored; `repo:1.2@sha256:..` yields `1.2`.
pub fn image_tag(image: &str) -> &str {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last_segment_start = without_digest.rfind('/').map_or(0, |i| i + 1);
    match without_digest[last_segment_start..].rfind(':') {
        Some(i) => &without_digest[last_segment_start + i + 1..],
        None => "latest",
    }
}

/// `.dockerconfigjson` payload authorizing `registry` with a catalog token
pub fn docker_config_json(registry: &str, token: &[u8]) -> Result<Vec<u8>> {
    let token = std::str::from_utf8(token)
        .map_err(|e| Error::dependency("pull-token", format!("token is not UTF-8: {e}")))?
        .trim();
    if token.is_empty() {
        return Err(Error::dependency("pull-token", "catalog returned an empty token"));
    }
    let auth = STANDARD.encode(format!("warden:{token}"));
    let config = json!({
        "auths": {
            registry: {
                "username": "warden",
                "password": token,
                "auth": auth,
            }
        }
    });
    Ok(serde_json::to_vec(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_tag_parsing() {
        assert_eq!(image_tag("registry.warden.dev/sensors/node:7.10.0"), "7.10.0");
        assert_eq!(image_tag("localhost:5000/sensor"), "latest");
        assert_eq!(image_tag("localhost:5000/sensor:1.2"), "1.2");
        assert_eq!(image_tag("mirror/sensor:1.2@sha256:abcd"), "1.2");
        assert_eq!(image_tag("sensor"), "latest");
    }

    /// Story: an explicit image never consults the catalog
    #[tokio::test]
    async fn story_override_skips_catalog() {
        let mut catalog = MockSensorCatalog::new();
        catalog.expect_latest_version().never();

        let resolved = resolve_image(
            &catalog,
            "registry.warden.dev",
            SensorKind::Node,
            Some("mirror.local/warden/node:7.9.1"),
            None,
            "stable",
        )
        .await
        .unwrap();

        assert_eq!(resolved.version, "7.9.1");
        assert_eq!(resolved.uri, "mirror.local/warden/node:7.9.1");
        assert!(!resolved.from_registry);
    }

    /// Story: without pinning, the channel's latest release is deployed from
    /// the operator registry
    #[tokio::test]
    async fn story_catalog_supplies_latest_version() {
        let mut catalog = MockSensorCatalog::new();
        catalog
            .expect_latest_version()
            .withf(|sensor, channel| *sensor == SensorKind::Admission && channel == "beta")
            .times(1)
            .returning(|_, _| Ok("2.4.0".to_string()));

        let resolved = resolve_image(
            &catalog,
            "registry.warden.dev",
            SensorKind::Admission,
            None,
            None,
            "beta",
        )
        .await
        .unwrap();

        assert_eq!(resolved.uri, "registry.warden.dev/sensors/admission:2.4.0");
        assert_eq!(resolved.version, "2.4.0");
        assert!(resolved.from_registry);
    }

    #[tokio::test]
    async fn test_pinned_version_and_catalog_errors() {
        let mut catalog = MockSensorCatalog::new();
        catalog
            .expect_latest_version()
            .returning(|_, _| Err(Error::dependency("version-query", "unreachable")));

        let pinned = resolve_image(&catalog, "r.io", SensorKind::Node, None, Some("1.0.0"), "stable")
            .await
            .unwrap();
        assert_eq!(pinned.uri, "r.io/sensors/node:1.0.0");

        let err = resolve_image(&catalog, "r.io", SensorKind::Node, None, None, "stable")
            .await
            .unwrap_err();
        assert_eq!(err.context(), Some("version-query"));
    }

    #[test]
    fn test_docker_config_json() {
        let payload = docker_config_json("registry.warden.dev", b"tok\n").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        let entry = &value["auths"]["registry.warden.dev"];
        assert_eq!(entry["password"], "tok");
        assert_eq!(entry["auth"], STANDARD.encode("warden:tok"));

        assert!(docker_config_json("r", b"  ").is_err());
    }
}
