//! Access to cluster objects
//!
//! [`StateStore`] is the seam between controllers and the API server. It is
//! generic over the object kind so the convergence engine, the condition
//! machine and the finalizer all share one implementation per backend:
//! [`KubeStore`] in production and `MemoryStore` (feature `testing`) in tests.
//!
//! Two read paths exist. [`StateStore::get`] may be served from the API
//! server's watch cache and can lag behind writes; [`StateStore::get_latest`]
//! is a quorum read. Callers fall back to the latter when they need to see
//! their own writes.

use std::fmt::{self, Debug};

use async_trait::async_trait;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GetParams, ListParams, Patch, PatchParams,
    PostParams,
};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use crate::crd::{AdmissionSensor, NodeSensor};
use crate::{Error, Result};

/// Bounds shared by every kind a store can hold
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Identity of an object within its kind
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Read and write access to objects of kind `K`
///
/// Missing objects are `Ok(None)` / `Ok(false)`, never errors. Writes carry
/// the object's `resourceVersion`, so a stale copy fails with a conflict
/// ([`Error::is_conflict`]).
#[async_trait]
pub trait StateStore<K: Object>: Send + Sync {
    /// Read through the cache-backed path
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// Read the latest committed version
    async fn get_latest(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// List objects matching an equality label selector (`k=v,k2=v2`)
    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>>;

    /// Create an object; a duplicate fails with [`Error::is_already_exists`]
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an object guarded by its `resourceVersion`
    async fn update(&self, obj: &K) -> Result<K>;

    /// Delete an object with background propagation; returns whether it existed
    async fn delete(&self, key: &ObjectKey) -> Result<bool>;

    /// Write the status subresource guarded by the `resourceVersion`
    async fn update_status(&self, obj: &K) -> Result<K>;
}

/// Every kind the sensor controllers read or write
///
/// Implemented for any store that covers them all, so controllers can hold a
/// single `Arc<dyn ClusterStore>`.
pub trait ClusterStore:
    StateStore<NodeSensor>
    + StateStore<AdmissionSensor>
    + StateStore<Namespace>
    + StateStore<ServiceAccount>
    + StateStore<ClusterRoleBinding>
    + StateStore<PriorityClass>
    + StateStore<ConfigMap>
    + StateStore<Secret>
    + StateStore<DaemonSet>
    + StateStore<Deployment>
    + StateStore<Service>
    + StateStore<MutatingWebhookConfiguration>
    + StateStore<Pod>
    + Send
    + Sync
    + 'static
{
}

impl<T> ClusterStore for T where
    T: StateStore<NodeSensor>
        + StateStore<AdmissionSensor>
        + StateStore<Namespace>
        + StateStore<ServiceAccount>
        + StateStore<ClusterRoleBinding>
        + StateStore<PriorityClass>
        + StateStore<ConfigMap>
        + StateStore<Secret>
        + StateStore<DaemonSet>
        + StateStore<Deployment>
        + StateStore<Service>
        + StateStore<MutatingWebhookConfiguration>
        + StateStore<Pod>
        + Send
        + Sync
        + 'static
{
}

/// [`StateStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a store over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: Object>(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = ApiResource::erase::<K>(&());
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn to_dynamic<K: Object>(obj: &K) -> Result<DynamicObject> {
    serde_json::from_value(serde_json::to_value(obj)?)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string()))
}

fn from_dynamic<K: Object>(obj: DynamicObject) -> Result<K> {
    serde_json::from_value(serde_json::to_value(obj)?)
        .map_err(|e| Error::serialization_for_kind(K::kind(&()).to_string(), e.to_string()))
}

fn not_found_as_none<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result.map_err(Error::from) {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl<K: Object> StateStore<K> for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        let api = self.api::<K>(key.namespace.as_deref());
        not_found_as_none(api.get_with(&key.name, &GetParams::any()).await)?
            .map(from_dynamic::<K>)
            .transpose()
    }

    async fn get_latest(&self, key: &ObjectKey) -> Result<Option<K>> {
        let api = self.api::<K>(key.namespace.as_deref());
        not_found_as_none(api.get(&key.name).await)?
            .map(from_dynamic::<K>)
            .transpose()
    }

    async fn list(&self, namespace: Option<&str>, label_selector: &str) -> Result<Vec<K>> {
        let api = self.api::<K>(namespace);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        list.items.into_iter().map(from_dynamic::<K>).collect()
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let api = self.api::<K>(obj.meta().namespace.as_deref());
        let created = api.create(&PostParams::default(), &to_dynamic(obj)?).await?;
        from_dynamic(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let api = self.api::<K>(obj.meta().namespace.as_deref());
        let replaced = api
            .replace(&obj.name_any(), &PostParams::default(), &to_dynamic(obj)?)
            .await?;
        from_dynamic(replaced)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        let api = self.api::<K>(key.namespace.as_deref());
        Ok(not_found_as_none(api.delete(&key.name, &DeleteParams::background()).await)?.is_some())
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let api = self.api::<K>(obj.meta().namespace.as_deref());
        let value = serde_json::to_value(obj)?;
        // Merge patch with resourceVersion set is rejected with 409 when stale
        let patch = json!({
            "metadata": { "resourceVersion": obj.meta().resource_version },
            "status": value.get("status").cloned().unwrap_or_default(),
        });
        let patched = api
            .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        from_dynamic(patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::cluster("default").to_string(), "default");
        assert_eq!(
            ObjectKey::namespaced("warden-system", "sensor-config").to_string(),
            "warden-system/sensor-config"
        );
    }

    #[test]
    fn test_object_key_of_object() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("sensor-config".to_string()),
                namespace: Some("warden-system".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            ObjectKey::of(&cm),
            ObjectKey::namespaced("warden-system", "sensor-config")
        );
    }

    #[test]
    fn test_dynamic_conversion_keeps_type_information() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("sensor-config".to_string()),
                ..Default::default()
            },
            data: Some([("WARDEN_CID".to_string(), "abc".to_string())].into()),
            ..Default::default()
        };
        let dynamic = to_dynamic(&cm).unwrap();
        assert_eq!(dynamic.types.as_ref().map(|t| t.kind.as_str()), Some("ConfigMap"));
        let back: ConfigMap = from_dynamic(dynamic).unwrap();
        assert_eq!(back, cm);
    }
}
