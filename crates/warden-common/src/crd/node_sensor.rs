//! NodeSensor CRD types
//!
//! A `NodeSensor` declares a per-node sensor installation: one DaemonSet pod
//! on every schedulable node, plus the namespace, permissions and
//! configuration it needs.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DaemonSetUpdateStrategy;
use k8s_openapi::api::core::v1::{NodeAffinity, ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{is_dns_label, AutoUpdateSpec, SensorOptions, SensorStatus};
use crate::Error;

/// Default namespace for node sensor workloads
pub const DEFAULT_NODE_NAMESPACE: &str = "warden-system";

/// Name generated for a deployed priority class when none is given
pub const DEFAULT_PRIORITY_CLASS_NAME: &str = "warden-node-sensor-priority-class";

/// Default termination grace period for sensor pods, in seconds
pub const DEFAULT_TERMINATION_GRACE_SECONDS: i64 = 60;

/// Upper bound the API server accepts for user-defined priority classes
pub const MAX_PRIORITY_VALUE: i32 = 1_000_000_000;

/// Specification for a NodeSensor
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "warden.dev",
    version = "v1alpha1",
    kind = "NodeSensor",
    plural = "nodesensors",
    shortname = "ns-sensor",
    status = "SensorStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.sensorVersion"}"#,
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".spec.installNamespace"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Success\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeSensorSpec {
    /// Namespace the sensor workloads are installed into
    #[serde(default = "default_node_namespace")]
    pub install_namespace: String,

    /// Sensor configuration rendered into the sensor ConfigMap
    #[serde(default)]
    pub sensor: SensorOptions,

    /// Node workload settings
    #[serde(default)]
    pub node: NodeSettings,

    /// Release tracking policy
    #[serde(default)]
    pub auto_update: AutoUpdateSpec,
}

fn default_node_namespace() -> String {
    DEFAULT_NODE_NAMESPACE.to_string()
}

/// Kernel integration used by the sensor
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Loadable kernel module
    #[default]
    Kernel,
    /// eBPF programs
    Bpf,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kernel => write!(f, "kernel"),
            Self::Bpf => write!(f, "bpf"),
        }
    }
}

/// Priority class the sensor pods run under
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriorityClassSpec {
    /// Name of the priority class. Generated when `deploy` is set and this is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Have the operator create the priority class
    #[serde(default)]
    pub deploy: bool,

    /// Priority value of a deployed class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i32>,
}

/// DaemonSet settings for the node sensor
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSettings {
    /// Full image reference. Overrides registry lookup and disables catalog queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Pinned sensor version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Image pull policy (default "Always")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Additional pull secrets for the sensor image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    /// Tolerations for the sensor pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Node affinity for the sensor pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinity>,

    /// Priority class settings
    #[serde(default)]
    pub priority_class: PriorityClassSpec,

    /// Resource requirements of the sensor container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// DaemonSet rollout strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<DaemonSetUpdateStrategy>,

    /// Termination grace period of sensor pods (default 60)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,

    /// Kernel integration backend
    #[serde(default)]
    pub backend: Backend,

    /// Skip host cleanup when the sensor is deleted
    #[serde(default)]
    pub disable_cleanup: bool,

    /// Annotations placed on the sensor service account
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_account_annotations: BTreeMap<String, String>,
}

impl NodeSettings {
    /// Pull policy with default fallback
    pub fn pull_policy(&self) -> &str {
        self.image_pull_policy.as_deref().unwrap_or("Always")
    }

    /// Termination grace period with default fallback
    pub fn termination_grace_period(&self) -> i64 {
        self.termination_grace_period_seconds
            .unwrap_or(DEFAULT_TERMINATION_GRACE_SECONDS)
    }
}

impl NodeSensorSpec {
    /// Validate the spec, naming the offending field on failure
    pub fn validate(&self, resource: &str) -> Result<(), Error> {
        if !is_dns_label(&self.install_namespace) {
            return Err(Error::validation_for_field(
                resource,
                "spec.installNamespace",
                format!("'{}' is not a valid DNS-1123 label", self.install_namespace),
            ));
        }

        if let Some(value) = self.node.priority_class.value {
            if !(1..=MAX_PRIORITY_VALUE).contains(&value) {
                return Err(Error::validation_for_field(
                    resource,
                    "spec.node.priorityClass.value",
                    format!("{value} is outside [1, {MAX_PRIORITY_VALUE}]"),
                ));
            }
        }

        if self.auto_update.enabled() {
            if self.node.version.is_some() {
                return Err(Error::validation_for_field(
                    resource,
                    "spec.autoUpdate.mode",
                    "auto-update cannot be combined with a pinned node.version",
                ));
            }
            if self.node.image.is_some() {
                return Err(Error::validation_for_field(
                    resource,
                    "spec.autoUpdate.mode",
                    "auto-update cannot be combined with a node.image override",
                ));
            }
        }

        Ok(())
    }

    /// Fill in values the operator generates
    pub fn normalize(&mut self) {
        let pc = &mut self.node.priority_class;
        if pc.deploy && pc.name.as_deref().map_or(true, str::is_empty) {
            pc.name = Some(DEFAULT_PRIORITY_CLASS_NAME.to_string());
        }
    }

    /// Priority class name the pods reference, if any
    pub fn priority_class_name(&self) -> Option<&str> {
        self.node
            .priority_class
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::UpdateMode;

    fn spec() -> NodeSensorSpec {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }

    #[test]
    fn test_defaults_from_empty_spec() {
        let spec = spec();
        assert_eq!(spec.install_namespace, "warden-system");
        assert_eq!(spec.node.backend, Backend::Kernel);
        assert_eq!(spec.node.pull_policy(), "Always");
        assert_eq!(spec.node.termination_grace_period(), 60);
        assert_eq!(spec.auto_update.mode, UpdateMode::Off);
        assert!(spec.validate("default").is_ok());
    }

    /// Story: asking for a priority class without naming it gets the
    /// operator's well-known name
    #[test]
    fn story_priority_class_name_is_generated() {
        let mut spec = spec();
        spec.node.priority_class.deploy = true;
        assert_eq!(spec.priority_class_name(), None);

        spec.normalize();
        assert_eq!(
            spec.priority_class_name(),
            Some("warden-node-sensor-priority-class")
        );

        spec.node.priority_class.name = Some("custom".to_string());
        spec.normalize();
        assert_eq!(spec.priority_class_name(), Some("custom"));
    }

    #[test]
    fn test_priority_value_bounds() {
        let mut spec = spec();
        spec.node.priority_class.value = Some(0);
        let err = spec.validate("default").unwrap_err();
        assert!(err.to_string().contains("outside"));

        spec.node.priority_class.value = Some(MAX_PRIORITY_VALUE);
        assert!(spec.validate("default").is_ok());

        spec.node.priority_class.value = Some(MAX_PRIORITY_VALUE + 1);
        assert!(spec.validate("default").is_err());
    }

    /// Story: pinning a version and asking for auto-updates contradict each
    /// other, so the spec is rejected instead of guessing
    #[test]
    fn story_auto_update_conflicts_with_pinning() {
        let mut spec = spec();
        spec.auto_update.mode = UpdateMode::Normal;
        spec.node.version = Some("7.10.0".to_string());
        assert!(!spec.validate("default").unwrap_err().is_retryable());

        spec.node.version = None;
        spec.node.image = Some("mirror.local/sensor:7.10.0".to_string());
        assert!(spec.validate("default").is_err());

        spec.auto_update.mode = UpdateMode::Off;
        assert!(spec.validate("default").is_ok());
    }

    #[test]
    fn test_invalid_namespace_rejected() {
        let mut spec = spec();
        spec.install_namespace = "Not_Valid".to_string();
        match spec.validate("default").unwrap_err() {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.installNamespace"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
