//! Significant field sets of the child kinds
//!
//! Comparison treats a missing list or map like an empty one, and ignores
//! fields the API server fills in when the desired object leaves them unset
//! (update strategies, termination grace period, preemption policy, secret
//! type). Labels and annotations are compared as "desired is a subset of
//! live" so that other controllers may add their own.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{MutatingWebhook, MutatingWebhookConfiguration};
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetUpdateStrategy, Deployment, DeploymentStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, Namespace, PodSpec, PodTemplateSpec, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::sealed::Sealed;
use super::Convergent;

fn list<T>(v: &Option<Vec<T>>) -> &[T] {
    v.as_deref().unwrap_or_default()
}

fn flag(v: Option<bool>) -> bool {
    v.unwrap_or(false)
}

/// Equality where `None` and the type's default are interchangeable
fn opt_eq<T: Default + PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (None, None) => true,
        (Some(x), None) | (None, Some(x)) => *x == T::default(),
    }
}

fn map_eq<V: PartialEq>(a: &Option<BTreeMap<String, V>>, b: &Option<BTreeMap<String, V>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (None, None) => true,
        (Some(m), None) | (None, Some(m)) => m.is_empty(),
    }
}

fn contains_all(
    live: Option<&BTreeMap<String, String>>,
    desired: Option<&BTreeMap<String, String>>,
) -> bool {
    desired
        .into_iter()
        .flatten()
        .all(|(k, v)| live.and_then(|l| l.get(k)) == Some(v))
}

fn merge_into(live: &mut Option<BTreeMap<String, String>>, desired: Option<&BTreeMap<String, String>>) {
    if let Some(desired) = desired.filter(|d| !d.is_empty()) {
        live.get_or_insert_with(BTreeMap::new)
            .extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

fn labels_and_annotations_contained(live: &ObjectMeta, desired: &ObjectMeta) -> bool {
    contains_all(live.labels.as_ref(), desired.labels.as_ref())
        && contains_all(live.annotations.as_ref(), desired.annotations.as_ref())
}

fn merge_labels_and_annotations(live: &mut ObjectMeta, desired: &ObjectMeta) {
    merge_into(&mut live.labels, desired.labels.as_ref());
    merge_into(&mut live.annotations, desired.annotations.as_ref());
}

// =============================================================================
// Pod templates
// =============================================================================

fn container_drifted(live: &Container, desired: &Container) -> bool {
    let live_sc = live.security_context.as_ref();
    let desired_sc = desired.security_context.as_ref();

    live.name != desired.name
        || live.image != desired.image
        || list(&live.command) != list(&desired.command)
        || list(&live.args) != list(&desired.args)
        || list(&live.env) != list(&desired.env)
        || list(&live.env_from) != list(&desired.env_from)
        || list(&live.ports) != list(&desired.ports)
        || !opt_eq(&live.resources, &desired.resources)
        || live_sc.and_then(|s| s.capabilities.as_ref())
            != desired_sc.and_then(|s| s.capabilities.as_ref())
        || flag(live_sc.and_then(|s| s.privileged)) != flag(desired_sc.and_then(|s| s.privileged))
        || list(&live.volume_mounts) != list(&desired.volume_mounts)
        || live.image_pull_policy != desired.image_pull_policy
}

fn containers_drifted(live: &[Container], desired: &[Container]) -> bool {
    live.len() != desired.len()
        || live
            .iter()
            .zip(desired)
            .any(|(l, d)| container_drifted(l, d))
}

fn copy_container(live: &mut Container, desired: &Container) {
    live.image = desired.image.clone();
    live.command = desired.command.clone();
    live.args = desired.args.clone();
    live.env = desired.env.clone();
    live.env_from = desired.env_from.clone();
    live.ports = desired.ports.clone();
    live.resources = desired.resources.clone();
    let desired_sc = desired.security_context.as_ref();
    let sc = live.security_context.get_or_insert_with(Default::default);
    sc.capabilities = desired_sc.and_then(|s| s.capabilities.clone());
    sc.privileged = desired_sc.and_then(|s| s.privileged);
    live.volume_mounts = desired.volume_mounts.clone();
    live.image_pull_policy = desired.image_pull_policy.clone();
}

fn copy_containers(live: &mut Vec<Container>, desired: &[Container]) {
    let same_shape = live.len() == desired.len()
        && live.iter().zip(desired).all(|(l, d)| l.name == d.name);
    if same_shape {
        for (l, d) in live.iter_mut().zip(desired) {
            copy_container(l, d);
        }
    } else {
        *live = desired.to_vec();
    }
}

fn pod_spec_drifted(live: &PodSpec, desired: &PodSpec) -> bool {
    containers_drifted(&live.containers, &desired.containers)
        || containers_drifted(list(&live.init_containers), list(&desired.init_containers))
        || list(&live.tolerations) != list(&desired.tolerations)
        || !opt_eq(&live.affinity, &desired.affinity)
        || !map_eq(&live.node_selector, &desired.node_selector)
        || live.priority_class_name != desired.priority_class_name
        || live.service_account_name != desired.service_account_name
        || flag(live.host_pid) != flag(desired.host_pid)
        || flag(live.host_network) != flag(desired.host_network)
        || list(&live.volumes) != list(&desired.volumes)
        || list(&live.image_pull_secrets) != list(&desired.image_pull_secrets)
        || (desired.termination_grace_period_seconds.is_some()
            && live.termination_grace_period_seconds != desired.termination_grace_period_seconds)
}

fn copy_pod_spec(live: &mut PodSpec, desired: &PodSpec) {
    copy_containers(&mut live.containers, &desired.containers);
    let mut init = live.init_containers.take().unwrap_or_default();
    copy_containers(&mut init, list(&desired.init_containers));
    live.init_containers = (!init.is_empty()).then_some(init);
    live.tolerations = desired.tolerations.clone();
    live.affinity = desired.affinity.clone();
    live.node_selector = desired.node_selector.clone();
    live.priority_class_name = desired.priority_class_name.clone();
    live.service_account_name = desired.service_account_name.clone();
    live.host_pid = desired.host_pid;
    live.host_network = desired.host_network;
    live.volumes = desired.volumes.clone();
    live.image_pull_secrets = desired.image_pull_secrets.clone();
    if desired.termination_grace_period_seconds.is_some() {
        live.termination_grace_period_seconds = desired.termination_grace_period_seconds;
    }
}

fn template_drifted(live: &PodTemplateSpec, desired: &PodTemplateSpec) -> bool {
    let empty_meta = ObjectMeta::default();
    let empty_spec = PodSpec::default();
    !labels_and_annotations_contained(
        live.metadata.as_ref().unwrap_or(&empty_meta),
        desired.metadata.as_ref().unwrap_or(&empty_meta),
    ) || pod_spec_drifted(
        live.spec.as_ref().unwrap_or(&empty_spec),
        desired.spec.as_ref().unwrap_or(&empty_spec),
    )
}

fn copy_template(live: &mut PodTemplateSpec, desired: &PodTemplateSpec) {
    if let Some(meta) = desired.metadata.as_ref() {
        merge_labels_and_annotations(live.metadata.get_or_insert_with(Default::default), meta);
    }
    if let Some(spec) = desired.spec.as_ref() {
        copy_pod_spec(live.spec.get_or_insert_with(Default::default), spec);
    }
}

fn daemonset_strategy_drifted(
    live: Option<&DaemonSetUpdateStrategy>,
    desired: Option<&DaemonSetUpdateStrategy>,
) -> bool {
    let Some(desired) = desired else {
        return false;
    };
    let Some(live) = live else {
        return true;
    };
    live.type_ != desired.type_
        || (desired.rolling_update.is_some() && live.rolling_update != desired.rolling_update)
}

fn deployment_strategy_drifted(
    live: Option<&DeploymentStrategy>,
    desired: Option<&DeploymentStrategy>,
) -> bool {
    let Some(desired) = desired else {
        return false;
    };
    let Some(live) = live else {
        return true;
    };
    live.type_ != desired.type_
        || (desired.rolling_update.is_some() && live.rolling_update != desired.rolling_update)
}

// =============================================================================
// Kinds
// =============================================================================

impl Sealed for Namespace {}
impl Convergent for Namespace {
    // Namespaces outlive the sensor that asked for them
    const OWNED: bool = false;

    fn drifted(live: &Self, desired: &Self) -> bool {
        !contains_all(live.metadata.labels.as_ref(), desired.metadata.labels.as_ref())
    }

    fn copy_significant(live: &mut Self, desired: &Self) {
        merge_into(&mut live.metadata.labels, desired.metadata.labels.as_ref());
    }
}

impl Sealed for ServiceAccount {}
impl Convergent for ServiceAccount {
    fn drifted(live: &Self, desired: &Self) -> bool {
        !contains_all(
            live.metadata.annotations.as_ref(),
            desired.metadata.annotations.as_ref(),
        ) || list(&live.image_pull_secrets) != list(&desired.image_pull_secrets)
    }

    fn copy_significant(live: &mut Self, desired: &Self) {
        merge_into(
            &mut live.metadata.annotations,
            desired.metadata.annotations.as_ref(),
        );
        live.image_pull_secrets = desired.image_pull_secrets.clone();
    }
}

impl Sealed for ClusterRoleBinding {}
impl Convergent for ClusterRoleBinding {
    fn drifted(live: &Self, desired: &Self) -> bool {
        list(&live.subjects) != list(&desired.subjects)
    }

    fn copy_significant(live: &mut Self, desired: &Self) {
        live.subjects = desired.subjects.clone();
    }

    fn requires_replacement(live: &Self, desired: &Self) -> bool {
        live.role_ref != desired.role_ref
    }
}

impl Sealed for PriorityClass {}
impl Convergent for PriorityClass {
    fn drifted(live: &Self, desired: &Self) -> bool {
        live.description != desired.description
            || flag(live.global_default) != flag(desired.global_default)
    }

    fn copy_significant(live: &mut Self, desired: &Self) {
        live.description = desired.description.clone();
        live.global_default = desired.global_default;
    }

    fn requires_replacement(live: &Self, desired: &Self) -> bool {
        live.value != desired.value
            || (desired.preemption_policy.is_some()
                && live.preemption_policy != desired.preemption_policy)
    }
}

impl Sealed for ConfigMap {}
impl Convergent for ConfigMap {
    fn drifted(live: &Self, desired: &Self) -> bool {
        !map_eq(&live.data, &desired.data) || !map_eq(&live.binary_data, &desired.binary_data)
    }

    fn copy_significant(live: &mut Self, desired: &Self) {
        live.data = desired.data.clone();
        live.binary_data = desired.binary_data.clone();
    }
}

impl Sealed for Secret {}
impl Convergent for Secret {
    fn drifted(live: &Self, desired: &Self) -> bool {
        !map_eq(&live.data, &desired.data)
    }

    fn copy_significant(live: &mut Self, desired: &Self) {
        live.data = desired.data.clone();
    }

    fn requires_replacement(live: &Self, desired: &Self) -> bool {
        let live_type = live.type_.as_deref().unwrap_or("Opaque");
        desired
            .type_
            .as_deref()
            .is_some_and(|desired_type| desired_type != live_type)
    }
}

impl Sealed for DaemonSet {}
impl Convergent for DaemonSet {
    fn drifted(live: &Self, desired: &Self) -> bool {
        match (live.spec.as_ref(), desired.spec.as_ref()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(l), Some(d)) => {
                template_drifted(&l.template, &d.template)
                    || daemonset_strategy_drifted(
                        l.update_strategy.as_ref(),
                        d.update_strategy.as_ref(),
                    )
            }
        }
    }

    fn copy_significant(live: &mut Self, desired: &Self) {
        let Some(d) = desired.spec.as_ref() else {
            return;
        };
        let l = live.spec.get_or_insert_with(Default::default);
        copy_template(&mut l.template, &d.template);
        if d.update_strategy.is_some() {
            l.update_strategy = d.update_strategy.clone();
        }
    }

    fn immutable_conflict(live: &Self, desired: &Self) -> Option<&'static str> {
        match (live.spec.as_ref(), desired.spec.as_ref()) {
            (Some(l), Some(d)) if l.selector != d.selector => Some("spec.selector"),
            _ => None,
        }
    }
}

impl Sealed for Deployment {}
impl Convergent for Deployment {
    fn drifted(live: &Self, desired: &Self) -> bool {
        match (live.spec.as_ref(), desired.spec.as_ref()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(l), Some(d)) => {
                template_drifted(&l.template, &d.template)
                    || l.replicas != d.replicas
                    || deployment_strategy_drifted(l.strategy.as_ref(), d.strategy.as_ref())
            }
        }
    }

    fn copy_significant(live: &mut Self, desired: &Self) {
        let Some(d) = desired.spec.as_ref() else {
            return;
        };
        let l = live.spec.get_or_insert_with(Default::default);
        copy_template(&mut l.template, &d.template);
        l.replicas = d.replicas;
        if d.strategy.is_some() {
            l.strategy = d.strategy.clone();
        }
    }

    fn immutable_conflict(live: &Self, desired: &Self) -> Option<&'static str> {
        match (live.spec.as_ref(), desired.spec.as_ref()) {
            (Some(l), Some(d)) if l.selector != d.selector => Some("spec.selector"),
            _ => None,
        }
    }
}

impl Sealed for Service {}
impl Convergent for Service {
    fn drifted(live: &Self, desired: &Self) -> bool {
        match (live.spec.as_ref(), desired.spec.as_ref()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(l), Some(d)) => {
                list(&l.ports) != list(&d.ports)
                    || !map_eq(&l.selector, &d.selector)
                    || l.type_.as_deref().unwrap_or("ClusterIP")
                        != d.type_.as_deref().unwrap_or("ClusterIP")
            }
        }
    }

    fn copy_significant(live: &mut Self, desired: &Self) {
        let Some(d) = desired.spec.as_ref() else {
            return;
        };
        let l = live.spec.get_or_insert_with(Default::default);
        l.ports = d.ports.clone();
        l.selector = d.selector.clone();
        l.type_ = d.type_.clone();
    }
}

fn webhook_drifted(live: &MutatingWebhook, desired: &MutatingWebhook) -> bool {
    live.name != desired.name
        || live.client_config != desired.client_config
        || list(&live.rules) != list(&desired.rules)
        || live.failure_policy != desired.failure_policy
        || live.match_policy != desired.match_policy
        || !opt_eq(&live.namespace_selector, &desired.namespace_selector)
        || !opt_eq(&live.object_selector, &desired.object_selector)
        || live.side_effects != desired.side_effects
        || live.admission_review_versions != desired.admission_review_versions
        || live.timeout_seconds != desired.timeout_seconds
        || live.reinvocation_policy != desired.reinvocation_policy
}

impl Sealed for MutatingWebhookConfiguration {}
impl Convergent for MutatingWebhookConfiguration {
    fn drifted(live: &Self, desired: &Self) -> bool {
        let (live, desired) = (list(&live.webhooks), list(&desired.webhooks));
        live.len() != desired.len()
            || live
                .iter()
                .zip(desired)
                .any(|(l, d)| webhook_drifted(l, d))
    }

    fn copy_significant(live: &mut Self, desired: &Self) {
        live.webhooks = desired.webhooks.clone();
    }
}
