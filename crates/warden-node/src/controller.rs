//! NodeSensor reconciliation
//!
//! Each pass validates the spec, resolves the image to run, converges the
//! children in dependency order (namespace, permissions, configuration,
//! workload) and reports the result on the status. Resources with an active
//! auto-update policy are registered with the version tracker so a new
//! catalog release triggers another pass.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use warden_common::catalog::{resolve_image, SensorCatalog, SensorKind};
use warden_common::crd::NodeSensor;
use warden_common::kube_utils::{ensure_finalizer, owner_reference};
use warden_common::reconcile::{
    converge_child, mark_pending, record_failure, record_success, requeue_after_error, Settings,
};
use warden_common::store::{ClusterStore, ObjectKey};
use warden_common::{Error, Result};
use warden_tracker::{catalog_query, resync_handler, TrackId, TrackerHandle};

use crate::finalize;
use crate::render::render;

/// Shared state of the NodeSensor controller
pub struct Context {
    /// Cluster access
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

    /// Tracker identity of `sensor`
    pub(crate) fn track_id(sensor: &NodeSensor) -> TrackId {
        TrackId::new(SensorKind::Node, ObjectKey::of(sensor))
    }
}

/// Reconcile a NodeSensor
///
/// Deleted resources are handed to [`finalize::finalize`]. Any other failure
/// is recorded in the `Failed` condition before being returned.
#[instrument(skip(sensor, ctx), fields(sensor = %sensor.name_any()))]
pub async fn reconcile(sensor: Arc<NodeSensor>, ctx: Arc<Context>) -> Result<Action> {
    if sensor.metadata.deletion_timestamp.is_some() {
        finalize::finalize(&sensor, &ctx).await?;
        return Ok(Action::await_change());
    }

    match apply(&sensor, &ctx).await {
        Ok(action) => Ok(action),
        Err(e) => {
            record_failure::<NodeSensor, _>(
                ctx.store.as_ref(),
                &ctx.settings.status_retry,
                &ObjectKey::of(sensor.as_ref()),
                &e,
            )
            .await;
            Err(e)
        }
    }
}

async fn apply(sensor: &NodeSensor, ctx: &Context) -> Result<Action> {
    let store = ctx.store.as_ref();
    let retry = &ctx.settings.status_retry;
    let key = ObjectKey::of(sensor);
    info!("reconciling node sensor");

    if ensure_finalizer::<NodeSensor, _>(store, retry, sensor).await? {
        debug!("added finalizer");
    }
    mark_pending(store, retry, sensor).await?;

    let mut sensor = sensor.clone();
    sensor.spec.validate(&sensor.name_any())?;
    sensor.spec.normalize();

    let node = &sensor.spec.node;
    let image = resolve_image(
        ctx.catalog.as_ref(),
        &ctx.settings.registry,
        SensorKind::Node,
        node.image.as_deref(),
        node.version.as_deref(),
        sensor.spec.auto_update.channel(),
    )
    .await?;
    let token = if image.from_registry {
        Some(ctx.catalog.pull_token().await?)
    } else {
        None
    };

    let children = render(&sensor, &image, token.as_deref(), &ctx.settings)?;
    let owner = owner_reference(&sensor)?;

    converge_child::<NodeSensor, _, _>(store, retry, &key, &owner, children.namespace).await?;
    converge_child::<NodeSensor, _, _>(store, retry, &key, &owner, children.service_account)
        .await?;
    converge_child::<NodeSensor, _, _>(store, retry, &key, &owner, children.cluster_role_binding)
        .await?;
    if let Some(priority_class) = children.priority_class {
        converge_child::<NodeSensor, _, _>(store, retry, &key, &owner, priority_class).await?;
    }
    converge_child::<NodeSensor, _, _>(store, retry, &key, &owner, children.config_map).await?;
    if let Some(secret) = children.pull_secret {
        converge_child::<NodeSensor, _, _>(store, retry, &key, &owner, secret).await?;
    }
    converge_child::<NodeSensor, _, _>(store, retry, &key, &owner, children.daemonset).await?;

    record_success::<NodeSensor, _>(store, retry, &key, &image).await?;
    sync_tracker(&sensor, ctx).await?;

    info!(version = %image.version, image = %image.uri, "node sensor reconciled");
    Ok(Action::requeue(ctx.settings.resync_interval))
}

/// Register or unregister `sensor` with the tracker per its auto-update mode
async fn sync_tracker(sensor: &NodeSensor, ctx: &Context) -> Result<()> {
    let policy = &sensor.spec.auto_update;
    ctx.tracker
        .sync(
            Context::track_id(sensor),
            policy,
            catalog_query(ctx.catalog.clone(), SensorKind::Node, policy.channel()),
            resync_handler::<NodeSensor, _>(ctx.store.clone(), ctx.resync.clone()),
        )
        .await
}

/// Requeue policy after a failed reconciliation
pub fn error_policy(sensor: Arc<NodeSensor>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        sensor = %sensor.name_any(),
        retryable = error.is_retryable(),
        "node sensor reconciliation failed"
    );
    requeue_after_error(error)
}
