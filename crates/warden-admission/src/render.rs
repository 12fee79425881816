//! Desired child objects of an AdmissionSensor

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource,
    LocalObjectReference, Namespace, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource,
    Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::ResourceExt;

use warden_common::catalog::ResolvedImage;
use warden_common::crd::AdmissionSensor;
use warden_common::kube_utils::{hash_map_values, standard_labels};
use warden_common::reconcile::Settings;
use warden_common::render::{self, meta};
use warden_common::{
    Error, Result, ANNOTATION_CONFIG_HASH, CONFIG_MAP_NAME, LABEL_COMPONENT, LABEL_INSTANCE,
};

use crate::{CLUSTER_ROLE, COMPONENT, SENSOR_NAME, WEBHOOK_NAME};

const TLS_VOLUME: &str = "webhook-tls";
const TLS_MOUNT_PATH: &str = "/etc/warden/tls";
/// 0644, what the API server fills in when the mode is left unset
const TLS_FILE_MODE: i32 = 0o644;
const CA_KEY: &str = "ca.crt";
const SERVICE_PORT: i32 = 443;
const WEBHOOK_PATH: &str = "/mutate";
const WEBHOOK_TIMEOUT_SECONDS: i32 = 10;
const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Desired children of an AdmissionSensor, in convergence order
#[derive(Clone, Debug)]
pub struct AdmissionChildren {
    /// Install namespace
    pub namespace: Namespace,
    /// Webhook service account
    pub service_account: ServiceAccount,
    /// Binding to the admission cluster role
    pub cluster_role_binding: ClusterRoleBinding,
    /// Sensor configuration
    pub config_map: ConfigMap,
    /// Registry credentials, when the image comes from the operator registry
    pub pull_secret: Option<Secret>,
    /// Webhook server
    pub deployment: Deployment,
    /// Service in front of the webhook pods
    pub service: Service,
    /// Registration with the API server
    pub webhook: MutatingWebhookConfiguration,
}

/// Labels selecting the webhook pods of one sensor
pub fn selector_labels(instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_COMPONENT.to_string(), COMPONENT.to_string()),
        (LABEL_INSTANCE.to_string(), instance.to_string()),
    ])
}

/// CA bundle the API server uses to verify the webhook
///
/// Read from `ca.crt` of the externally provisioned TLS secret.
pub fn ca_bundle(tls_secret: &Secret) -> Result<ByteString> {
    tls_secret
        .data
        .as_ref()
        .and_then(|d| d.get(CA_KEY))
        .filter(|ca| !ca.0.is_empty())
        .cloned()
        .ok_or_else(|| {
            Error::dependency(
                "tls-secret",
                format!("secret {} has no {CA_KEY}", tls_secret.name_any()),
            )
        })
}

/// Sensor ConfigMap data: sensor options plus the webhook listener
pub fn config_data(sensor: &AdmissionSensor) -> BTreeMap<String, String> {
    let mut data = render::sensor_config(&sensor.spec.sensor);
    data.entry("WARDEN_WEBHOOK_PORT".to_string())
        .or_insert_with(|| sensor.spec.admission.port.to_string());
    data.entry("WARDEN_TLS_DIR".to_string())
        .or_insert_with(|| TLS_MOUNT_PATH.to_string());
    data
}

/// Render every child of `sensor`
///
/// The spec is expected to be validated. `ca_bundle` comes from
/// [`ca_bundle`]; `pull_token` is only given for operator registry images.
pub fn render(
    sensor: &AdmissionSensor,
    image: &ResolvedImage,
    pull_token: Option<&[u8]>,
    ca_bundle: ByteString,
    settings: &Settings,
) -> Result<AdmissionChildren> {
    let instance = sensor.name_any();
    let spec = &sensor.spec;
    let ns = spec.install_namespace.as_str();
    let labels = standard_labels(COMPONENT, &instance);

    let pull_secret = pull_token
        .map(|token| render::pull_secret(ns, &labels, &settings.registry, token))
        .transpose()?;
    let pull_secrets =
        render::pull_secret_refs(&spec.admission.image_pull_secrets, pull_secret.is_some());
    let data = config_data(sensor);
    let config_hash = hash_map_values(&data);

    Ok(AdmissionChildren {
        namespace: render::namespace(ns, &labels),
        service_account: render::service_account(
            ns,
            SENSOR_NAME,
            &labels,
            &BTreeMap::new(),
            &pull_secrets,
        ),
        cluster_role_binding: render::cluster_role_binding(
            SENSOR_NAME,
            CLUSTER_ROLE,
            ns,
            SENSOR_NAME,
            &labels,
        ),
        config_map: render::config_map(ns, &labels, data),
        pull_secret,
        deployment: deployment(sensor, image, &pull_secrets, &config_hash, settings),
        service: service(sensor, &labels),
        webhook: webhook_configuration(sensor, &labels, ca_bundle),
    })
}

fn deployment(
    sensor: &AdmissionSensor,
    image: &ResolvedImage,
    pull_secrets: &[LocalObjectReference],
    config_hash: &str,
    settings: &Settings,
) -> Deployment {
    let instance = sensor.name_any();
    let admission = &sensor.spec.admission;
    let labels = standard_labels(COMPONENT, &instance);

    let container = Container {
        name: "webhook".to_string(),
        image: Some(image.uri.clone()),
        image_pull_policy: Some(admission.pull_policy().to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("https".to_string()),
            container_port: admission.port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env_from: Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: CONFIG_MAP_NAME.to_string(),
                optional: None,
            }),
            ..Default::default()
        }]),
        env: Some(render::sensor_env(&settings.proxy_env)),
        resources: admission.resources.clone(),
        volume_mounts: Some(vec![VolumeMount {
            name: TLS_VOLUME.to_string(),
            mount_path: TLS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let pod = PodSpec {
        containers: vec![container],
        service_account_name: Some(SENSOR_NAME.to_string()),
        tolerations: (!admission.tolerations.is_empty()).then(|| admission.tolerations.clone()),
        affinity: admission.node_affinity.clone().map(|node_affinity| Affinity {
            node_affinity: Some(node_affinity),
            ..Default::default()
        }),
        image_pull_secrets: (!pull_secrets.is_empty()).then(|| pull_secrets.to_vec()),
        volumes: Some(vec![Volume {
            name: TLS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(admission.tls_secret.clone()),
                default_mode: Some(TLS_FILE_MODE),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Deployment {
        metadata: meta(SENSOR_NAME, Some(&sensor.spec.install_namespace), &labels),
        spec: Some(DeploymentSpec {
            replicas: Some(admission.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&instance)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        ANNOTATION_CONFIG_HASH.to_string(),
                        config_hash.to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service(sensor: &AdmissionSensor, labels: &BTreeMap<String, String>) -> Service {
    Service {
        metadata: meta(SENSOR_NAME, Some(&sensor.spec.install_namespace), labels),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(&sensor.name_any())),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                protocol: Some("TCP".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(sensor.spec.admission.port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn webhook_configuration(
    sensor: &AdmissionSensor,
    labels: &BTreeMap<String, String>,
    ca_bundle: ByteString,
) -> MutatingWebhookConfiguration {
    let spec = &sensor.spec;
    let webhook = MutatingWebhook {
        name: WEBHOOK_NAME.to_string(),
        admission_review_versions: vec!["v1".to_string()],
        client_config: WebhookClientConfig {
            ca_bundle: Some(ca_bundle),
            service: Some(ServiceReference {
                name: SENSOR_NAME.to_string(),
                namespace: spec.install_namespace.clone(),
                path: Some(WEBHOOK_PATH.to_string()),
                port: Some(SERVICE_PORT),
            }),
            url: None,
        },
        rules: Some(vec![RuleWithOperations {
            api_groups: Some(vec!["".to_string(), "apps".to_string(), "batch".to_string()]),
            api_versions: Some(vec!["*".to_string()]),
            operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
            resources: Some(
                [
                    "pods",
                    "deployments",
                    "daemonsets",
                    "statefulsets",
                    "replicasets",
                    "jobs",
                    "cronjobs",
                ]
                .map(str::to_string)
                .to_vec(),
            ),
            scope: Some("*".to_string()),
        }]),
        failure_policy: Some(spec.admission.failure_policy.to_string()),
        match_conditions: None,
        match_policy: Some("Equivalent".to_string()),
        namespace_selector: Some(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: NAMESPACE_NAME_LABEL.to_string(),
                operator: "NotIn".to_string(),
                values: Some(spec.excluded_namespaces()),
            }]),
            ..Default::default()
        }),
        object_selector: Some(LabelSelector::default()),
        side_effects: "None".to_string(),
        timeout_seconds: Some(WEBHOOK_TIMEOUT_SECONDS),
        reinvocation_policy: Some("Never".to_string()),
    };

    MutatingWebhookConfiguration {
        metadata: meta(SENSOR_NAME, None, labels),
        webhooks: Some(vec![webhook]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::converge::Convergent;
    use warden_common::crd::{AdmissionSensorSpec, FailurePolicy};
    use warden_common::PULL_SECRET_NAME;

    fn sensor() -> AdmissionSensor {
        let spec: AdmissionSensorSpec = serde_json::from_value(serde_json::json!({
            "admission": {
                "tlsSecret": "warden-webhook-tls",
                "failurePolicy": "Fail",
                "disabledNamespaces": ["monitoring"]
            }
        }))
        .unwrap();
        AdmissionSensor::new("default", spec)
    }

    fn image() -> ResolvedImage {
        ResolvedImage {
            uri: "registry.warden.dev/sensors/admission:3.2.0".to_string(),
            version: "3.2.0".to_string(),
            from_registry: true,
        }
    }

    fn tls_secret(ca: Option<&[u8]>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("warden-webhook-tls".to_string()),
                ..Default::default()
            },
            data: ca.map(|ca| BTreeMap::from([(CA_KEY.to_string(), ByteString(ca.to_vec()))])),
            ..Default::default()
        }
    }

    fn rendered() -> AdmissionChildren {
        render(
            &sensor(),
            &image(),
            Some(b"tok"),
            ByteString(b"CA".to_vec()),
            &Settings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_ca_bundle_requires_ca_entry() {
        assert_eq!(
            ca_bundle(&tls_secret(Some(b"CA"))).unwrap(),
            ByteString(b"CA".to_vec())
        );
        for secret in [tls_secret(None), tls_secret(Some(b""))] {
            let err = ca_bundle(&secret).unwrap_err();
            assert!(matches!(err, Error::Dependency { .. }));
            assert!(err.to_string().contains("warden-webhook-tls"));
        }
    }

    #[test]
    fn test_webhook_targets_service_with_ca() {
        let children = rendered();
        let webhooks = children.webhook.webhooks.unwrap();
        assert_eq!(webhooks.len(), 1);
        let hook = &webhooks[0];
        assert_eq!(hook.name, WEBHOOK_NAME);
        assert_eq!(hook.failure_policy.as_deref(), Some("Fail"));
        assert_eq!(hook.client_config.ca_bundle, Some(ByteString(b"CA".to_vec())));

        let svc = hook.client_config.service.as_ref().unwrap();
        assert_eq!(svc.name, SENSOR_NAME);
        assert_eq!(svc.namespace, "warden-admission");
        assert_eq!(svc.port, Some(SERVICE_PORT));

        let excluded = hook.namespace_selector.as_ref().unwrap().match_expressions.as_ref().unwrap();
        assert_eq!(
            excluded[0].values.as_deref().unwrap(),
            ["warden-admission", "kube-system", "monitoring"]
        );
    }

    /// Story: the API server fills in the secret volume's file mode; a
    /// Deployment read back with that default must not count as drift
    #[test]
    fn story_server_defaulted_volume_is_not_drift() {
        let desired = rendered().deployment;
        let mut live = desired.clone();
        let pod = live.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        let secret = pod.volumes.as_mut().unwrap()[0].secret.as_mut().unwrap();
        secret.default_mode = Some(420);

        assert!(!Deployment::drifted(&live, &desired));
    }

    #[test]
    fn test_service_routes_to_container_port() {
        let children = rendered();
        let spec = children.service.spec.unwrap();
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 443);
        assert_eq!(port.target_port, Some(IntOrString::Int(4443)));
        assert_eq!(spec.selector, Some(selector_labels("default")));

        let deployment = children.deployment.spec.unwrap();
        assert_eq!(deployment.replicas, Some(2));
        assert_eq!(deployment.selector.match_labels, Some(selector_labels("default")));
        let pod = deployment.template.spec.unwrap();
        assert_eq!(pod.containers[0].ports.as_ref().unwrap()[0].container_port, 4443);
    }

    #[test]
    fn test_pull_secret_only_for_registry_images() {
        let with = rendered();
        assert!(with.pull_secret.is_some());
        let pod = with.deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, PULL_SECRET_NAME);

        let without = render(
            &sensor(),
            &image(),
            None,
            ByteString(b"CA".to_vec()),
            &Settings::default(),
        )
        .unwrap();
        assert!(without.pull_secret.is_none());
        let pod = without.deployment.spec.unwrap().template.spec.unwrap();
        assert!(pod.image_pull_secrets.is_none());
    }

    #[test]
    fn test_config_change_rolls_pods() {
        let before = rendered();
        let mut changed = sensor();
        changed.spec.sensor.tags = vec!["prod".to_string()];
        changed.spec.admission.failure_policy = FailurePolicy::Ignore;
        let after = render(
            &changed,
            &image(),
            Some(b"tok"),
            ByteString(b"CA".to_vec()),
            &Settings::default(),
        )
        .unwrap();

        let hash = |d: &Deployment| {
            d.spec.as_ref().unwrap().template.metadata.as_ref().unwrap().annotations.clone()
        };
        assert_ne!(hash(&before.deployment), hash(&after.deployment));
        assert_eq!(after.config_map.data.unwrap()["WARDEN_WEBHOOK_PORT"], "4443");
    }
}
