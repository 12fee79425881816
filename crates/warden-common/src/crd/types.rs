//! Supporting types shared by the sensor CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tri-state value of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One entry of `status.conditions`
///
/// Field order and names are the persisted contract consumed by CLIs and
/// dashboards reading `status.conditions`.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// `DaemonSetReady`, `Success`, ...
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    /// CamelCase cause, stable across releases
    pub reason: String,

    pub message: String,

    /// Generation of the resource this condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Moves only when `status` flips
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Condition stamped with the current time
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: Utc::now(),
        }
    }

    /// Record the sensor generation this was computed from
    pub fn observed(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

/// Sensor options rendered into the sensor ConfigMap
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorOptions {
    /// Customer identifier the sensor registers with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,

    /// Grouping tags reported by the sensor
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Proxy the sensor uses to reach its backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,

    /// Sensor trace level (none, err, warn, info, debug)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_level: Option<String>,

    /// Additional sensor settings passed through verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Sensor proxy settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    /// Proxy host name or address
    pub host: String,

    /// Proxy port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Keep the proxy configured but disabled
    #[serde(default)]
    pub disabled: bool,
}

/// How the operator reacts to new sensor releases
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Never poll for releases
    #[default]
    Off,
    /// Re-reconcile when the catalog reports a different version
    Normal,
    /// Re-reconcile on every poll, whether or not the version changed
    Force,
}

/// Auto-update policy of a sensor
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoUpdateSpec {
    /// Update mode
    #[serde(default)]
    pub mode: UpdateMode,

    /// Release channel queried in the catalog (default "stable")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// Default release channel
pub const DEFAULT_CHANNEL: &str = "stable";

impl AutoUpdateSpec {
    /// Whether the sensor wants release tracking at all
    pub fn enabled(&self) -> bool {
        self.mode != UpdateMode::Off
    }

    /// Whether every poll should trigger a reconcile
    pub fn forced(&self) -> bool {
        self.mode == UpdateMode::Force
    }

    /// Release channel, with default fallback
    pub fn channel(&self) -> &str {
        self.channel.as_deref().unwrap_or(DEFAULT_CHANNEL)
    }
}

/// Status shared by both sensor kinds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorStatus {
    /// Installation progress, one entry per condition type
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Sensor version currently applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_version: Option<String>,

    /// Image URI currently applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl SensorStatus {
    /// Find the condition of the given type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Validate a name as an RFC 1123 DNS label
pub(crate) fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
