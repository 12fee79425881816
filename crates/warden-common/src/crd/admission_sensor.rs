//! AdmissionSensor CRD types
//!
//! An `AdmissionSensor` declares the admission-control sensor: a replicated
//! Deployment serving a mutating webhook, fronted by a Service.

use k8s_openapi::api::core::v1::{NodeAffinity, ResourceRequirements, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{is_dns_label, AutoUpdateSpec, SensorOptions, SensorStatus};
use crate::Error;

/// Default namespace for the admission sensor
pub const DEFAULT_ADMISSION_NAMESPACE: &str = "warden-admission";

/// Specification for an AdmissionSensor
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "warden.dev",
    version = "v1alpha1",
    kind = "AdmissionSensor",
    plural = "admissionsensors",
    shortname = "as-sensor",
    status = "SensorStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.sensorVersion"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.admission.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Success\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionSensorSpec {
    /// Namespace the webhook workload is installed into
    #[serde(default = "default_admission_namespace")]
    pub install_namespace: String,

    /// Sensor configuration rendered into the sensor ConfigMap
    #[serde(default)]
    pub sensor: SensorOptions,

    /// Webhook workload settings
    pub admission: AdmissionSettings,

    /// Release tracking policy
    #[serde(default)]
    pub auto_update: AutoUpdateSpec,
}

fn default_admission_namespace() -> String {
    DEFAULT_ADMISSION_NAMESPACE.to_string()
}

/// Webhook failure policy
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Reject the request when the webhook is unreachable
    Fail,
    /// Admit the request when the webhook is unreachable
    #[default]
    Ignore,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => write!(f, "Fail"),
            Self::Ignore => write!(f, "Ignore"),
        }
    }
}

/// Deployment and webhook settings for the admission sensor
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionSettings {
    /// Full image reference. Overrides registry lookup and disables catalog queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Pinned sensor version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Number of webhook replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Container port the webhook listens on
    #[serde(default = "default_port")]
    pub port: i32,

    /// Secret holding `tls.crt`, `tls.key` and `ca.crt` for the webhook
    pub tls_secret: String,

    /// What the API server does when the webhook is unreachable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Namespaces excluded from admission, in addition to the install namespace and kube-system
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_namespaces: Vec<String>,

    /// Image pull policy (default "Always")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Additional pull secrets for the webhook image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    /// Resource requirements of the webhook container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Tolerations for the webhook pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Node affinity for the webhook pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinity>,
}

fn default_replicas() -> i32 {
    2
}

fn default_port() -> i32 {
    4443
}

impl AdmissionSettings {
    /// Pull policy with default fallback
    pub fn pull_policy(&self) -> &str {
        self.image_pull_policy.as_deref().unwrap_or("Always")
    }
}

impl AdmissionSensorSpec {
    /// Validate the spec, naming the offending field on failure
    pub fn validate(&self, resource: &str) -> Result<(), Error> {
        if !is_dns_label(&self.install_namespace) {
            return Err(Error::validation_for_field(
                resource,
                "spec.installNamespace",
                format!("'{}' is not a valid DNS-1123 label", self.install_namespace),
            ));
        }

        if self.admission.tls_secret.is_empty() {
            return Err(Error::validation_for_field(
                resource,
                "spec.admission.tlsSecret",
                "a TLS secret is required to serve the webhook",
            ));
        }

        if self.admission.replicas < 1 {
            return Err(Error::validation_for_field(
                resource,
                "spec.admission.replicas",
                "at least one replica is required",
            ));
        }

        if !(1..=65535).contains(&self.admission.port) {
            return Err(Error::validation_for_field(
                resource,
                "spec.admission.port",
                format!("{} is not a valid port", self.admission.port),
            ));
        }

        if self.auto_update.enabled()
            && (self.admission.version.is_some() || self.admission.image.is_some())
        {
            return Err(Error::validation_for_field(
                resource,
                "spec.autoUpdate.mode",
                "auto-update cannot be combined with a pinned version or image override",
            ));
        }

        Ok(())
    }

    /// Namespaces the webhook never intercepts
    pub fn excluded_namespaces(&self) -> Vec<String> {
        let mut excluded = vec![self.install_namespace.clone(), "kube-system".to_string()];
        for ns in &self.admission.disabled_namespaces {
            if !excluded.contains(ns) {
                excluded.push(ns.clone());
            }
        }
        excluded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::UpdateMode;

    fn spec() -> AdmissionSensorSpec {
        serde_json::from_value(serde_json::json!({
            "admission": { "tlsSecret": "warden-webhook-tls" }
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let spec = spec();
        assert_eq!(spec.install_namespace, "warden-admission");
        assert_eq!(spec.admission.replicas, 2);
        assert_eq!(spec.admission.port, 4443);
        assert_eq!(spec.admission.failure_policy, FailurePolicy::Ignore);
        assert!(spec.validate("default").is_ok());
    }

    #[test]
    fn test_excluded_namespaces_deduplicated() {
        let mut spec = spec();
        spec.admission.disabled_namespaces =
            vec!["kube-system".to_string(), "monitoring".to_string()];
        assert_eq!(
            spec.excluded_namespaces(),
            vec!["warden-admission", "kube-system", "monitoring"]
        );
    }

    #[test]
    fn test_validation_failures() {
        let mut spec = spec();
        spec.admission.replicas = 0;
        assert!(spec.validate("default").is_err());

        let mut spec = self::spec();
        spec.admission.port = 70000;
        assert!(spec.validate("default").is_err());

        let mut spec = self::spec();
        spec.admission.tls_secret.clear();
        assert!(spec.validate("default").is_err());

        let mut spec = self::spec();
        spec.auto_update.mode = UpdateMode::Force;
        spec.admission.version = Some("1.2.3".to_string());
        assert!(spec.validate("default").is_err());
    }
}
