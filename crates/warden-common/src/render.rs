//! Child objects shared by both sensor kinds
//!
//! Everything here is a pure function of the sensor spec and the values
//! resolved during reconciliation. Renderers set the fields the API server
//! would otherwise default, so a freshly rendered object compares equal to
//! its live counterpart.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, EnvVar, EnvVarSource, LocalObjectReference, Namespace, ObjectFieldSelector, Secret,
    ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use crate::catalog::docker_config_json;
use crate::crd::SensorOptions;
use crate::{Result, CONFIG_MAP_NAME, PULL_SECRET_NAME};

/// Proxy variables forwarded from the operator into sensor containers
pub const PROXY_ENV_VARS: [&str; 3] = ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"];

/// Metadata for a child object
pub fn meta(
    name: &str,
    namespace: Option<&str>,
    labels: &BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

/// Install namespace
pub fn namespace(name: &str, labels: &BTreeMap<String, String>) -> Namespace {
    Namespace {
        metadata: meta(name, None, labels),
        ..Default::default()
    }
}

/// Service account the sensor pods run as
pub fn service_account(
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
    pull_secrets: &[LocalObjectReference],
) -> ServiceAccount {
    let mut metadata = meta(name, Some(namespace), labels);
    if !annotations.is_empty() {
        metadata.annotations = Some(annotations.clone());
    }
    ServiceAccount {
        metadata,
        image_pull_secrets: (!pull_secrets.is_empty()).then(|| pull_secrets.to_vec()),
        ..Default::default()
    }
}

/// Binding of a service account to a pre-installed cluster role
pub fn cluster_role_binding(
    name: &str,
    role: &str,
    namespace: &str,
    service_account: &str,
    labels: &BTreeMap<String, String>,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: meta(name, None, labels),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

/// Sensor configuration as `WARDEN_*` keys
///
/// Keys from `extra` are copied verbatim and win over generated ones.
pub fn sensor_config(options: &SensorOptions) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    if let Some(cid) = options.customer_id.as_deref().filter(|c| !c.is_empty()) {
        data.insert("WARDEN_CID".to_string(), cid.to_string());
    }
    if !options.tags.is_empty() {
        data.insert("WARDEN_TAGS".to_string(), options.tags.join(","));
    }
    if let Some(proxy) = &options.proxy {
        data.insert("WARDEN_APD".to_string(), proxy.disabled.to_string());
        if !proxy.host.is_empty() {
            data.insert("WARDEN_APH".to_string(), proxy.host.clone());
        }
        if let Some(port) = proxy.port {
            data.insert("WARDEN_APP".to_string(), port.to_string());
        }
    }
    if let Some(trace) = options.trace_level.as_deref().filter(|t| !t.is_empty()) {
        data.insert("WARDEN_TRACE".to_string(), trace.to_string());
    }
    data.extend(options.extra.clone());
    data
}

/// Sensor configuration ConfigMap
pub fn config_map(
    namespace: &str,
    labels: &BTreeMap<String, String>,
    data: BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: meta(CONFIG_MAP_NAME, Some(namespace), labels),
        data: Some(data),
        ..Default::default()
    }
}

/// Registry pull secret built from a catalog token
pub fn pull_secret(
    namespace: &str,
    labels: &BTreeMap<String, String>,
    registry: &str,
    token: &[u8],
) -> Result<Secret> {
    let payload = docker_config_json(registry, token)?;
    Ok(Secret {
        metadata: meta(PULL_SECRET_NAME, Some(namespace), labels),
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(payload),
        )])),
        ..Default::default()
    })
}

/// Pull secret references for a workload
///
/// The operator's pull secret comes first when the image is served by the
/// operator registry.
pub fn pull_secret_refs(user_secrets: &[String], operator_secret: bool) -> Vec<LocalObjectReference> {
    operator_secret
        .then(|| PULL_SECRET_NAME.to_string())
        .into_iter()
        .chain(user_secrets.iter().cloned())
        .map(|name| LocalObjectReference { name })
        .collect()
}

/// Proxy settings of the current process, for forwarding into containers
pub fn proxy_from_env() -> BTreeMap<String, String> {
    PROXY_ENV_VARS
        .iter()
        .filter_map(|key| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (key.to_string(), v))
        })
        .collect()
}

/// Container environment: forwarded proxy settings plus the node name
pub fn sensor_env(proxy: &BTreeMap<String, String>) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = proxy
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    env.push(EnvVar {
        name: "NODE_NAME".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: "spec.nodeName".to_string(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    });
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ProxySpec;

    #[test]
    fn test_sensor_config_keys() {
        let options = SensorOptions {
            customer_id: Some("CID-123".to_string()),
            tags: vec!["prod".to_string(), "eu".to_string()],
            proxy: Some(ProxySpec {
                host: "proxy.local".to_string(),
                port: Some(3128),
                disabled: false,
            }),
            trace_level: Some("debug".to_string()),
            extra: BTreeMap::from([("WARDEN_TRACE".to_string(), "info".to_string())]),
        };

        let data = sensor_config(&options);
        assert_eq!(data["WARDEN_CID"], "CID-123");
        assert_eq!(data["WARDEN_TAGS"], "prod,eu");
        assert_eq!(data["WARDEN_APD"], "false");
        assert_eq!(data["WARDEN_APH"], "proxy.local");
        assert_eq!(data["WARDEN_APP"], "3128");
        assert_eq!(data["WARDEN_TRACE"], "info", "extra keys override");
    }

    #[test]
    fn test_empty_options_render_no_keys() {
        assert!(sensor_config(&SensorOptions::default()).is_empty());
    }

    #[test]
    fn test_pull_secret_refs_order() {
        let refs = pull_secret_refs(&["mine".to_string()], true);
        let names: Vec<_> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec![PULL_SECRET_NAME, "mine"]);
        assert_eq!(pull_secret_refs(&[], false).len(), 0);
    }

    #[test]
    fn test_pull_secret_type_and_payload() {
        let labels = BTreeMap::new();
        let secret = pull_secret("warden-system", &labels, "registry.warden.dev", b"tok").unwrap();
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));
        assert!(secret.data.unwrap().contains_key(".dockerconfigjson"));
    }

    #[test]
    fn test_sensor_env_forwards_proxy_then_node_name() {
        let proxy = BTreeMap::from([("HTTPS_PROXY".to_string(), "http://p:3128".to_string())]);
        let env = sensor_env(&proxy);
        assert_eq!(env[0].name, "HTTPS_PROXY");
        assert_eq!(env.last().map(|e| e.name.as_str()), Some("NODE_NAME"));
    }
}
