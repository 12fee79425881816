//! Desired child objects of a NodeSensor

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapEnvSource, Container, EnvFromSource, HostPathVolumeSource,
    LocalObjectReference, Namespace, PodSpec, PodTemplateSpec, Secret, SecurityContext,
    ServiceAccount, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use warden_common::catalog::ResolvedImage;
use warden_common::crd::{NodeSensor, NodeSettings, MAX_PRIORITY_VALUE};
use warden_common::kube_utils::{hash_map_values, label_selector, standard_labels};
use warden_common::reconcile::Settings;
use warden_common::render::{self, meta};
use warden_common::{Result, ANNOTATION_CONFIG_HASH, CONFIG_MAP_NAME, LABEL_COMPONENT, LABEL_INSTANCE};

use crate::{CLEANUP_COMPONENT, CLEANUP_NAME, CLUSTER_ROLE, COMPONENT, SENSOR_NAME};

const HOST_VOLUME: &str = "host-root";
const HOST_MOUNT_PATH: &str = "/host";

/// Desired children of a NodeSensor, in convergence order
#[derive(Clone, Debug)]
pub struct NodeChildren {
    /// Install namespace
    pub namespace: Namespace,
    /// Sensor service account
    pub service_account: ServiceAccount,
    /// Binding to the sensor cluster role
    pub cluster_role_binding: ClusterRoleBinding,
    /// Priority class, when the sensor deploys its own
    pub priority_class: Option<PriorityClass>,
    /// Sensor configuration
    pub config_map: ConfigMap,
    /// Registry credentials, when the image comes from the operator registry
    pub pull_secret: Option<Secret>,
    /// The sensor itself
    pub daemonset: DaemonSet,
}

/// Labels selecting the pods of `component` for one sensor
pub fn selector_labels(component: &str, instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_COMPONENT.to_string(), component.to_string()),
        (LABEL_INSTANCE.to_string(), instance.to_string()),
    ])
}

/// Label selector of the cleanup pods of one sensor
pub fn cleanup_selector(instance: &str) -> String {
    label_selector(&selector_labels(CLEANUP_COMPONENT, instance))
}

/// Sensor ConfigMap data: sensor options plus the kernel backend
pub fn config_data(sensor: &NodeSensor) -> BTreeMap<String, String> {
    let mut data = render::sensor_config(&sensor.spec.sensor);
    data.entry("WARDEN_BACKEND".to_string())
        .or_insert_with(|| sensor.spec.node.backend.to_string());
    data
}

/// Render every child of `sensor`
///
/// The spec is expected to be validated and normalized. `pull_token` is
/// only given when the image is served by the operator registry.
pub fn render(
    sensor: &NodeSensor,
    image: &ResolvedImage,
    pull_token: Option<&[u8]>,
    settings: &Settings,
) -> Result<NodeChildren> {
    let instance = sensor.name_any();
    let spec = &sensor.spec;
    let ns = spec.install_namespace.as_str();
    let labels = standard_labels(COMPONENT, &instance);

    let pull_secret = pull_token
        .map(|token| render::pull_secret(ns, &labels, &settings.registry, token))
        .transpose()?;
    let pull_secrets = render::pull_secret_refs(&spec.node.image_pull_secrets, pull_secret.is_some());

    let data = config_data(sensor);
    let config_hash = hash_map_values(&data);

    Ok(NodeChildren {
        namespace: render::namespace(ns, &labels),
        service_account: render::service_account(
            ns,
            SENSOR_NAME,
            &labels,
            &spec.node.service_account_annotations,
            &pull_secrets,
        ),
        cluster_role_binding: render::cluster_role_binding(
            SENSOR_NAME,
            CLUSTER_ROLE,
            ns,
            SENSOR_NAME,
            &labels,
        ),
        priority_class: priority_class(sensor, &labels),
        config_map: render::config_map(ns, &labels, data),
        pull_secret,
        daemonset: sensor_daemonset(sensor, image, &pull_secrets, &config_hash, settings),
    })
}

fn priority_class(sensor: &NodeSensor, labels: &BTreeMap<String, String>) -> Option<PriorityClass> {
    let spec = &sensor.spec.node.priority_class;
    if !spec.deploy {
        return None;
    }
    let name = sensor.spec.priority_class_name()?;
    Some(PriorityClass {
        metadata: meta(name, None, labels),
        value: spec.value.unwrap_or(MAX_PRIORITY_VALUE),
        global_default: Some(false),
        preemption_policy: Some("PreemptLowerPriority".to_string()),
        description: Some("Keeps the Warden node sensor scheduled on every node".to_string()),
    })
}

fn tolerations(node: &NodeSettings) -> Vec<Toleration> {
    if node.tolerations.is_empty() {
        // Run everywhere unless told otherwise
        vec![Toleration {
            operator: Some("Exists".to_string()),
            ..Default::default()
        }]
    } else {
        node.tolerations.clone()
    }
}

fn host_volume() -> Volume {
    Volume {
        name: HOST_VOLUME.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: "/".to_string(),
            type_: Some("Directory".to_string()),
        }),
        ..Default::default()
    }
}

fn host_mount(read_only: bool) -> VolumeMount {
    VolumeMount {
        name: HOST_VOLUME.to_string(),
        mount_path: HOST_MOUNT_PATH.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

fn privileged() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        ..Default::default()
    }
}

/// Pod spec shared by the sensor and the cleanup DaemonSet
fn node_pod_spec(
    sensor: &NodeSensor,
    container: Container,
    pull_secrets: &[LocalObjectReference],
) -> PodSpec {
    let node = &sensor.spec.node;
    PodSpec {
        containers: vec![container],
        service_account_name: Some(SENSOR_NAME.to_string()),
        host_pid: Some(true),
        tolerations: Some(tolerations(node)),
        affinity: node.node_affinity.clone().map(|node_affinity| Affinity {
            node_affinity: Some(node_affinity),
            ..Default::default()
        }),
        priority_class_name: sensor.spec.priority_class_name().map(str::to_string),
        image_pull_secrets: (!pull_secrets.is_empty()).then(|| pull_secrets.to_vec()),
        termination_grace_period_seconds: Some(node.termination_grace_period()),
        volumes: Some(vec![host_volume()]),
        ..Default::default()
    }
}

fn daemonset(
    name: &str,
    namespace: &str,
    component: &str,
    instance: &str,
    template_annotations: Option<BTreeMap<String, String>>,
    pod: PodSpec,
) -> DaemonSet {
    let labels = standard_labels(component, instance);
    DaemonSet {
        metadata: meta(name, Some(namespace), &labels),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector_labels(component, instance)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: template_annotations,
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn sensor_daemonset(
    sensor: &NodeSensor,
    image: &ResolvedImage,
    pull_secrets: &[LocalObjectReference],
    config_hash: &str,
    settings: &Settings,
) -> DaemonSet {
    let node = &sensor.spec.node;
    let container = Container {
        name: "sensor".to_string(),
        image: Some(image.uri.clone()),
        image_pull_policy: Some(node.pull_policy().to_string()),
        env_from: Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: CONFIG_MAP_NAME.to_string(),
                optional: None,
            }),
            ..Default::default()
        }]),
        env: Some(render::sensor_env(&settings.proxy_env)),
        resources: node.resources.clone(),
        security_context: Some(privileged()),
        volume_mounts: Some(vec![host_mount(true)]),
        ..Default::default()
    };

    let mut ds = daemonset(
        SENSOR_NAME,
        &sensor.spec.install_namespace,
        COMPONENT,
        &sensor.name_any(),
        Some(BTreeMap::from([(
            ANNOTATION_CONFIG_HASH.to_string(),
            config_hash.to_string(),
        )])),
        node_pod_spec(sensor, container, pull_secrets),
    );
    if let Some(spec) = ds.spec.as_mut() {
        spec.update_strategy = node.update_strategy.clone();
    }
    ds
}

/// DaemonSet removing sensor state from every node
///
/// Runs the sensor image in cleanup mode; each pod stays running once its
/// node is clean.
pub fn cleanup_daemonset(sensor: &NodeSensor, image: &str, settings: &Settings) -> DaemonSet {
    let node = &sensor.spec.node;
    let operator_secret = sensor
        .status
        .as_ref()
        .and_then(|s| s.image.as_deref())
        .is_some_and(|i| i.starts_with(&format!("{}/", settings.registry)));
    let pull_secrets = render::pull_secret_refs(&node.image_pull_secrets, operator_secret);

    let container = Container {
        name: "cleanup".to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some(node.pull_policy().to_string()),
        args: Some(vec!["--cleanup".to_string()]),
        env: Some(render::sensor_env(&settings.proxy_env)),
        security_context: Some(privileged()),
        volume_mounts: Some(vec![host_mount(false)]),
        ..Default::default()
    };

    daemonset(
        CLEANUP_NAME,
        &sensor.spec.install_namespace,
        CLEANUP_COMPONENT,
        &sensor.name_any(),
        None,
        node_pod_spec(sensor, container, &pull_secrets),
    )
}
