//! Kubernetes helpers shared by the sensor controllers

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::retry::{retry_if, RetryConfig};
use crate::store::{Object, ObjectKey, StateStore};
use crate::{Error, Result, FINALIZER, LABEL_COMPONENT, LABEL_INSTANCE, LABEL_MANAGED_BY, MANAGER};

/// Controller owner reference pointing at a sensor resource
///
/// Fails when the owner has not been persisted yet (no uid).
pub fn owner_reference<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "owner-reference",
            format!("{} {} has no uid", K::kind(&()), owner.name_any()),
        )
    })
}

/// Standard labels stamped on every child object
pub fn standard_labels(component: &str, instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
        (LABEL_COMPONENT.to_string(), component.to_string()),
        (LABEL_INSTANCE.to_string(), instance.to_string()),
    ])
}

/// Render labels as an equality selector (`k=v,k2=v2`)
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether the object carries the Warden finalizer
pub fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add the Warden finalizer, retrying on conflicts
///
/// Returns whether a write happened.
pub async fn ensure_finalizer<K, S>(store: &S, retry: &RetryConfig, obj: &K) -> Result<bool>
where
    K: Object,
    S: StateStore<K> + ?Sized,
{
    if has_finalizer(obj) {
        return Ok(false);
    }
    edit_finalizers(store, retry, &ObjectKey::of(obj), |finalizers| {
        if finalizers.iter().any(|f| f == FINALIZER) {
            return false;
        }
        finalizers.push(FINALIZER.to_string());
        true
    })
    .await
}

/// Remove the Warden finalizer, retrying on conflicts
///
/// Returns whether a write happened.
pub async fn remove_finalizer<K, S>(store: &S, retry: &RetryConfig, obj: &K) -> Result<bool>
where
    K: Object,
    S: StateStore<K> + ?Sized,
{
    if !has_finalizer(obj) {
        return Ok(false);
    }
    edit_finalizers(store, retry, &ObjectKey::of(obj), |finalizers| {
        let before = finalizers.len();
        finalizers.retain(|f| f != FINALIZER);
        finalizers.len() != before
    })
    .await
}

async fn edit_finalizers<K, S, F>(
    store: &S,
    retry: &RetryConfig,
    key: &ObjectKey,
    edit: F,
) -> Result<bool>
where
    K: Object,
    S: StateStore<K> + ?Sized,
    F: Fn(&mut Vec<String>) -> bool,
{
    let edit = &edit;
    retry_if(retry, "edit_finalizers", Error::is_conflict, || async move {
        let Some(mut latest) = store.get_latest(key).await? else {
            debug!(object = %key, "object gone before finalizer edit");
            return Ok(false);
        };
        let finalizers = latest.meta_mut().finalizers.get_or_insert_with(Vec::new);
        if !edit(finalizers) {
            return Ok(false);
        }
        store.update(&latest).await?;
        Ok(true)
    })
    .await
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Truncated SHA-256, stable across toolchains, suitable for persisted
/// annotations such as the pod template config hash.
pub fn deterministic_hash(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    hash[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Hash a string map in key order
pub fn hash_map_values(data: &BTreeMap<String, String>) -> String {
    let joined = data
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");
    deterministic_hash(&joined)
}
