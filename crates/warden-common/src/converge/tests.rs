use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, Namespace, PodSpec, PodTemplateSpec, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;

use super::*;
use crate::testing::MemoryStore;

fn owner() -> OwnerReference {
    OwnerReference {
        api_version: "warden.dev/v1alpha1".to_string(),
        kind: "NodeSensor".to_string(),
        name: "default".to_string(),
        uid: "sensor-uid".to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn daemonset(image: &str, selector: &str) -> DaemonSet {
    let pod_labels = labels(&[("app", selector)]);
    DaemonSet {
        metadata: ObjectMeta {
            name: Some("warden-node-sensor".to_string()),
            namespace: Some("warden-system".to_string()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "sensor".to_string(),
                        image: Some(image.to_string()),
                        image_pull_policy: Some("Always".to_string()),
                        ..Default::default()
                    }],
                    service_account_name: Some("warden-node-sensor".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn config_map(value: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some("warden-sensor-config".to_string()),
            namespace: Some("warden-system".to_string()),
            ..Default::default()
        },
        data: Some(labels(&[("WARDEN_CID", value)])),
        ..Default::default()
    }
}

/// Story: the second pass over an unchanged cluster performs no write
#[tokio::test]
async fn story_converge_is_idempotent() {
    let store = MemoryStore::new();
    let desired = daemonset("registry.warden.dev/sensors/node:7.10.0", "sensor");

    let first = converge(&store, Some(&owner()), desired.clone()).await.unwrap();
    assert_eq!(first.outcome, Outcome::Created);
    assert!(first.mutated());
    assert_eq!(
        first.object.metadata.owner_references.as_deref(),
        Some(&[owner()][..])
    );

    let writes = store.writes();
    let second = converge(&store, Some(&owner()), desired).await.unwrap();
    assert_eq!(second.outcome, Outcome::Unchanged);
    assert!(!second.mutated());
    assert_eq!(store.writes(), writes);
    assert_eq!(second.object, first.object);
}

/// Story: someone edited the image by hand; the next pass puts every
/// significant field back with one update and leaves server-owned fields
#[tokio::test]
async fn story_drift_is_corrected_with_single_update() {
    let store = MemoryStore::new();
    let desired = daemonset("registry.warden.dev/sensors/node:7.10.0", "sensor");
    let created = converge(&store, Some(&owner()), desired.clone())
        .await
        .unwrap()
        .object;

    let mut edited = created.clone();
    {
        let spec = edited.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        spec.containers[0].image = Some("evil/image:latest".to_string());
        spec.dns_policy = Some("ClusterFirst".to_string());
    }
    let edited: DaemonSet = StateStore::update(&store, &edited).await.unwrap();

    let writes = store.writes();
    let result = converge(&store, Some(&owner()), desired.clone()).await.unwrap();
    assert_eq!(result.outcome, Outcome::Updated);
    assert_eq!(store.writes(), writes + 1);

    let live_spec = result.object.spec.as_ref().unwrap();
    let pod = live_spec.template.spec.as_ref().unwrap();
    assert_eq!(
        pod.containers[0].image.as_deref(),
        Some("registry.warden.dev/sensors/node:7.10.0")
    );
    assert_eq!(pod.dns_policy.as_deref(), Some("ClusterFirst"));
    assert!(!DaemonSet::drifted(&result.object, &desired));
    assert_eq!(
        result.object.metadata.uid, edited.metadata.uid,
        "updated in place, not recreated"
    );
}

/// Story: a selector can never be changed in place; the engine refuses
/// without writing and the error says which field and object
#[tokio::test]
async fn story_selector_mismatch_is_immutable_error() {
    let store = MemoryStore::new();
    converge(&store, Some(&owner()), daemonset("img:1", "sensor"))
        .await
        .unwrap();

    let writes = store.writes();
    let err = converge(&store, Some(&owner()), daemonset("img:2", "other"))
        .await
        .unwrap_err();

    assert_eq!(store.writes(), writes);
    assert!(!err.is_retryable());
    match err.root() {
        Error::ImmutableField { kind, name, field } => {
            assert_eq!(kind, "DaemonSet");
            assert_eq!(name, "warden-node-sensor");
            assert_eq!(field, "spec.selector");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err, Error::Child { .. }));
}

/// Story: a secret's type is part of its identity, so changing it means
/// delete and recreate, keeping the original owner
#[tokio::test]
async fn story_secret_type_change_replaces_object() {
    let store = MemoryStore::new();
    let secret = |type_: &str| Secret {
        metadata: ObjectMeta {
            name: Some("warden-pull-secret".to_string()),
            namespace: Some("warden-system".to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(b"{}".to_vec()),
        )])),
        type_: Some(type_.to_string()),
        ..Default::default()
    };

    let first = converge(&store, Some(&owner()), secret("Opaque"))
        .await
        .unwrap();
    let replaced = converge(&store, None, secret("kubernetes.io/dockerconfigjson"))
        .await
        .unwrap();

    assert_eq!(replaced.outcome, Outcome::Replaced);
    assert_ne!(replaced.object.metadata.uid, first.object.metadata.uid);
    assert_eq!(
        replaced.object.type_.as_deref(),
        Some("kubernetes.io/dockerconfigjson")
    );
    assert_eq!(
        replaced.object.metadata.owner_references,
        first.object.metadata.owner_references
    );
}

/// Story: namespaces are shared infrastructure and never get an owner
#[tokio::test]
async fn story_namespace_is_not_owned() {
    let store = MemoryStore::new();
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some("warden-system".to_string()),
            labels: Some(labels(&[("app.kubernetes.io/managed-by", "warden-operator")])),
            ..Default::default()
        },
        ..Default::default()
    };

    let created = converge(&store, Some(&owner()), ns).await.unwrap();
    assert_eq!(created.outcome, Outcome::Created);
    assert!(created.object.metadata.owner_references.is_none());
}

/// Story: existing objects never get ownership retrofitted, only their
/// significant fields change
#[tokio::test]
async fn story_existing_objects_keep_their_ownership() {
    let store = MemoryStore::new();
    StateStore::create(&store, &config_map("old")).await.unwrap();

    let result = converge(&store, Some(&owner()), config_map("new"))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::Updated);
    assert!(result.object.metadata.owner_references.is_none());
    assert_eq!(
        result.object.data.as_ref().unwrap().get("WARDEN_CID").map(String::as_str),
        Some("new")
    );
}

/// Story: a write failure surfaces with the child it happened on
#[tokio::test]
async fn story_write_errors_carry_child_context() {
    let store = MemoryStore::new();
    store.fail_writes("ConfigMap", 403, "Forbidden");

    let err = converge(&store, Some(&owner()), config_map("x"))
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .starts_with("converging ConfigMap warden-sensor-config"));
    assert!(!err.is_retryable());
}

/// Story: the reader cache has not seen an existing object yet; the engine
/// falls back to the authoritative read instead of creating a duplicate
#[tokio::test]
async fn story_cache_miss_falls_back_to_latest_read() {
    let store = MemoryStore::new();
    let desired = config_map("CID-1");
    converge(&store, Some(&owner()), desired.clone()).await.unwrap();

    store.miss_reads(1);
    let writes = store.writes();
    let result = converge(&store, Some(&owner()), desired).await.unwrap();
    assert_eq!(result.outcome, Outcome::Unchanged);
    assert_eq!(store.writes(), writes);
}

/// Story: another writer created the object between our reads and our
/// create; the engine re-reads it and converges it in place
#[tokio::test]
async fn story_create_race_updates_the_winner() {
    let store = MemoryStore::new();
    converge(&store, Some(&owner()), config_map("old")).await.unwrap();

    store.miss_reads(2);
    let writes = store.writes();
    let result = converge(&store, Some(&owner()), config_map("new")).await.unwrap();
    assert_eq!(result.outcome, Outcome::Updated);
    assert_eq!(store.writes(), writes + 1);
    assert_eq!(
        result.object.data.as_ref().unwrap().get("WARDEN_CID").map(String::as_str),
        Some("new")
    );
}
