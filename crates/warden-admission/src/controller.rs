//! AdmissionSensor reconciliation
//!
//! Same pass as the node sensor, with the webhook CA read from the TLS
//! secret before rendering. Deletion needs no host cleanup: children are
//! owned and left to garbage collection.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use warden_common::catalog::{resolve_image, SensorCatalog, SensorKind};
use warden_common::crd::AdmissionSensor;
use warden_common::kube_utils::{ensure_finalizer, has_finalizer, owner_reference, remove_finalizer};
use warden_common::reconcile::{
    converge_child, mark_pending, record_failure, record_success, requeue_after_error, Settings,
};
use warden_common::store::{ClusterStore, ObjectKey, StateStore};
use warden_common::{Error, Result};
use warden_tracker::{catalog_query, resync_handler, TrackId, TrackerHandle};

use crate::render::{ca_bundle, render};

/// Shared state of the AdmissionSensor controller
pub struct Context {
    /// Cluster access, including the externally provisioned TLS secret
    pub store: Arc<dyn ClusterStore>,
    /// Sensor release catalog
    pub catalog: Arc<dyn SensorCatalog>,
    /// Version tracker registrations
    pub tracker: TrackerHandle,
    /// Reconcile requests raised by the tracker
    pub resync: mpsc::Sender<ObjectKey>,
    /// Operator settings
    pub settings: Settings,
}

impl Context {
    /// Assemble a controller context
    pub fn new(
        store: Arc<dyn ClusterStore>,
        catalog: Arc<dyn SensorCatalog>,
        tracker: TrackerHandle,
        resync: mpsc::Sender<ObjectKey>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            catalog,
            tracker,
            resync,
            settings,
        }
    }

    fn track_id(sensor: &AdmissionSensor) -> TrackId {
        TrackId::new(SensorKind::Admission, ObjectKey::of(sensor))
    }
}

/// Reconcile an AdmissionSensor
#[instrument(skip(sensor, ctx), fields(sensor = %sensor.name_any()))]
pub async fn reconcile(sensor: Arc<AdmissionSensor>, ctx: Arc<Context>) -> Result<Action> {
    if sensor.metadata.deletion_timestamp.is_some() {
        finalize(&sensor, &ctx).await?;
        return Ok(Action::await_change());
    }

    let result = apply(&sensor, &ctx).await;
    if let Err(e) = &result {
        record_failure::<AdmissionSensor, _>(
            ctx.store.as_ref(),
            &ctx.settings.status_retry,
            &ObjectKey::of(sensor.as_ref()),
            e,
        )
        .await;
    }
    result
}

async fn apply(sensor: &AdmissionSensor, ctx: &Context) -> Result<Action> {
    let store = ctx.store.as_ref();
    let retry = &ctx.settings.status_retry;
    let key = ObjectKey::of(sensor);
    info!("reconciling admission sensor");

    if ensure_finalizer::<AdmissionSensor, _>(store, retry, sensor).await? {
        debug!("added finalizer");
    }
    mark_pending(store, retry, sensor).await?;

    let spec = &sensor.spec;
    spec.validate(&sensor.name_any())?;

    let admission = &spec.admission;
    let image = resolve_image(
        ctx.catalog.as_ref(),
        &ctx.settings.registry,
        SensorKind::Admission,
        admission.image.as_deref(),
        admission.version.as_deref(),
        spec.auto_update.channel(),
    )
    .await?;
    let token = if image.from_registry {
        Some(ctx.catalog.pull_token().await?)
    } else {
        None
    };

    let tls_key = ObjectKey::namespaced(spec.install_namespace.as_str(), admission.tls_secret.as_str());
    let tls_secret = StateStore::<Secret>::get(store, &tls_key).await?.ok_or_else(|| {
        Error::dependency("tls-secret", format!("secret {tls_key} not found"))
    })?;

    let children = render(sensor, &image, token.as_deref(), ca_bundle(&tls_secret)?, &ctx.settings)?;
    let owner = owner_reference(sensor)?;

    converge_child::<AdmissionSensor, _, _>(store, retry, &key, &owner, children.namespace).await?;
    converge_child::<AdmissionSensor, _, _>(store, retry, &key, &owner, children.service_account)
        .await?;
    converge_child::<AdmissionSensor, _, _>(
        store,
        retry,
        &key,
        &owner,
        children.cluster_role_binding,
    )
    .await?;
    converge_child::<AdmissionSensor, _, _>(store, retry, &key, &owner, children.config_map)
        .await?;
    if let Some(secret) = children.pull_secret {
        converge_child::<AdmissionSensor, _, _>(store, retry, &key, &owner, secret).await?;
    }
    converge_child::<AdmissionSensor, _, _>(store, retry, &key, &owner, children.deployment)
        .await?;
    converge_child::<AdmissionSensor, _, _>(store, retry, &key, &owner, children.service).await?;
    converge_child::<AdmissionSensor, _, _>(store, retry, &key, &owner, children.webhook).await?;

    record_success::<AdmissionSensor, _>(store, retry, &key, &image).await?;

    let policy = &spec.auto_update;
    ctx.tracker
        .sync(
            Context::track_id(sensor),
            policy,
            catalog_query(ctx.catalog.clone(), SensorKind::Admission, policy.channel()),
            resync_handler::<AdmissionSensor, _>(ctx.store.clone(), ctx.resync.clone()),
        )
        .await?;

    info!(version = %image.version, image = %image.uri, "admission sensor reconciled");
    Ok(Action::requeue(ctx.settings.resync_interval))
}

/// Stop tracking and release the finalizer; owned children are garbage collected
async fn finalize(sensor: &AdmissionSensor, ctx: &Context) -> Result<()> {
    if !has_finalizer(sensor) {
        return Ok(());
    }
    ctx.tracker.stop_tracking(Context::track_id(sensor)).await?;
    remove_finalizer::<AdmissionSensor, _>(ctx.store.as_ref(), &ctx.settings.status_retry, sensor)
        .await?;
    info!("admission sensor finalized");
    Ok(())
}

/// Requeue policy after a failed reconciliation
pub fn error_policy(sensor: Arc<AdmissionSensor>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        sensor = %sensor.name_any(),
        retryable = error.is_retryable(),
        "admission sensor reconciliation failed"
    );
    requeue_after_error(error)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use tokio_util::sync::CancellationToken;

    use warden_common::conditions::{find_condition, is_true, ConditionedResource, FAILED, SUCCESS};
    use warden_common::crd::{AdmissionSensorSpec, UpdateMode};
    use warden_common::retry::RetryConfig;
    use warden_common::testing::{FixedCatalog, MemoryStore};
    use warden_tracker::TrackerMessage;

    use super::*;
    use crate::SENSOR_NAME;

    struct Harness {
        store: MemoryStore,
        catalog: Arc<FixedCatalog>,
        ctx: Arc<Context>,
        tracker_rx: mpsc::Receiver<TrackerMessage>,
        _resync_rx: mpsc::Receiver<ObjectKey>,
    }

    fn harness() -> Harness {
        let store = MemoryStore::new();
        let catalog = Arc::new(FixedCatalog::new("3.2.0"));
        let (tracker, tracker_rx) = TrackerHandle::new(CancellationToken::new());
        let (resync, resync_rx) = mpsc::channel(8);
        let settings = Settings {
            status_retry: RetryConfig {
                initial_delay: Duration::from_millis(1),
                ..RetryConfig::conflicts(5)
            },
            ..Default::default()
        };
        let ctx = Arc::new(Context::new(
            Arc::new(store.clone()),
            catalog.clone(),
            tracker,
            resync,
            settings,
        ));
        Harness {
            store,
            catalog,
            ctx,
            tracker_rx,
            _resync_rx: resync_rx,
        }
    }

    fn spec() -> AdmissionSensorSpec {
        serde_json::from_value(serde_json::json!({
            "admission": { "tlsSecret": "warden-webhook-tls" }
        }))
        .unwrap()
    }

    fn sensor_key() -> ObjectKey {
        ObjectKey::cluster("default")
    }

    impl Harness {
        async fn create(&self, spec: AdmissionSensorSpec) -> Arc<AdmissionSensor> {
            let sensor = AdmissionSensor::new("default", spec);
            Arc::new(StateStore::create(&self.store, &sensor).await.unwrap())
        }

        async fn provision_tls(&self, ca: &[u8]) {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some("warden-webhook-tls".to_string()),
                    namespace: Some("warden-admission".to_string()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(
                    "ca.crt".to_string(),
                    ByteString(ca.to_vec()),
                )])),
                ..Default::default()
            };
            StateStore::<Secret>::create(&self.store, &secret).await.unwrap();
        }

        fn current(&self) -> Option<AdmissionSensor> {
            self.store.object(&sensor_key())
        }
    }

    /// Story: with its TLS secret in place the webhook is installed end to end
    #[tokio::test]
    async fn story_install_registers_webhook() {
        let h = harness();
        h.provision_tls(b"CA-PEM").await;
        let sensor = h.create(spec()).await;

        let action = reconcile(sensor, h.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(600)));

        let deployment: Deployment = h
            .store
            .object(&ObjectKey::namespaced("warden-admission", SENSOR_NAME))
            .unwrap();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("registry.warden.dev/sensors/admission:3.2.0")
        );
        assert!(h
            .store
            .contains::<Service>(&ObjectKey::namespaced("warden-admission", SENSOR_NAME)));

        let webhook: MutatingWebhookConfiguration =
            h.store.object(&ObjectKey::cluster(SENSOR_NAME)).unwrap();
        assert_eq!(
            webhook.webhooks.unwrap()[0].client_config.ca_bundle,
            Some(ByteString(b"CA-PEM".to_vec()))
        );

        let current = h.current().unwrap();
        assert!(is_true(current.conditions(), SUCCESS));
        assert!(is_true(current.conditions(), "MutatingWebhookConfigurationReady"));
        assert_eq!(
            current.status.unwrap().sensor_version.as_deref(),
            Some("3.2.0")
        );
    }

    /// Story: a missing TLS secret is a retryable dependency failure and no
    /// workload is created until it shows up
    #[tokio::test]
    async fn story_missing_tls_secret_waits() {
        let h = harness();
        let sensor = h.create(spec()).await;

        let err = reconcile(sensor.clone(), h.ctx.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Dependency { .. }));
        assert_eq!(
            error_policy(sensor, &err, h.ctx.clone()),
            Action::requeue(Duration::from_secs(30))
        );
        let current = h.current().unwrap();
        let failed = find_condition(current.conditions(), FAILED).unwrap();
        assert!(failed.message.contains("warden-webhook-tls"));
        assert!(!h
            .store
            .contains::<Deployment>(&ObjectKey::namespaced("warden-admission", SENSOR_NAME)));

        h.provision_tls(b"CA-PEM").await;
        reconcile(Arc::new(h.current().unwrap()), h.ctx.clone())
            .await
            .unwrap();
        let current = h.current().unwrap();
        assert!(!is_true(current.conditions(), FAILED));
        assert!(is_true(current.conditions(), SUCCESS));
    }

    /// Story: reconciling again without changes writes nothing
    #[tokio::test]
    async fn story_steady_state_writes_nothing() {
        let h = harness();
        h.provision_tls(b"CA-PEM").await;
        let sensor = h.create(spec()).await;
        reconcile(sensor, h.ctx.clone()).await.unwrap();

        let writes = h.store.writes();
        reconcile(Arc::new(h.current().unwrap()), h.ctx.clone())
            .await
            .unwrap();
        assert_eq!(h.store.writes(), writes);
        assert_eq!(h.catalog.version_calls(), 2);
    }

    /// Story: deleting the sensor unregisters it from the tracker and
    /// releases the finalizer without waiting on anything
    #[tokio::test]
    async fn story_delete_releases_finalizer() {
        let mut h = harness();
        h.provision_tls(b"CA-PEM").await;
        let mut spec = spec();
        spec.auto_update.mode = UpdateMode::Normal;
        let sensor = h.create(spec).await;
        reconcile(sensor, h.ctx.clone()).await.unwrap();
        assert!(matches!(
            h.tracker_rx.try_recv().unwrap(),
            TrackerMessage::Upsert { force: false, .. }
        ));

        StateStore::<AdmissionSensor>::delete(&h.store, &sensor_key())
            .await
            .unwrap();
        let deleted = Arc::new(h.current().expect("held by finalizer"));
        let action = reconcile(deleted, h.ctx.clone()).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(h.current().is_none());
        match h.tracker_rx.try_recv().unwrap() {
            TrackerMessage::Remove { id } => {
                assert_eq!(id, TrackId::new(SensorKind::Admission, sensor_key()))
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    /// Story: a zero replica count is rejected before anything is touched
    #[tokio::test]
    async fn story_invalid_replicas_rejected() {
        let h = harness();
        h.provision_tls(b"CA-PEM").await;
        let mut spec = spec();
        spec.admission.replicas = 0;
        let sensor = h.create(spec).await;

        let err = reconcile(sensor.clone(), h.ctx.clone()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(
            error_policy(sensor, &err, h.ctx.clone()),
            Action::requeue(Duration::from_secs(300))
        );
        assert_eq!(h.catalog.version_calls(), 0);
    }
}
