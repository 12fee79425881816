//! Controller wiring
//!
//! Each sensor kind gets a kube-runtime `Controller` watching its CRD, fed
//! additionally by the tracker's resync channel so version-triggered passes
//! are serialized with watch events.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use warden_common::catalog::SensorCatalog;
use warden_common::crd::{AdmissionSensor, NodeSensor};
use warden_common::reconcile::Settings;
use warden_common::store::{ClusterStore, ObjectKey};
use warden_tracker::TrackerHandle;

/// Watch timeout in seconds, below the client read timeout so idle watches
/// are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Capacity of each resync channel
const RESYNC_CAPACITY: usize = 64;

pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Everything the controllers share
#[derive(Clone)]
pub struct Shared {
    pub client: Client,
    pub store: Arc<dyn ClusterStore>,
    pub catalog: Arc<dyn SensorCatalog>,
    pub tracker: TrackerHandle,
    pub settings: Settings,
    pub concurrency: u16,
}

/// Map tracker resync requests onto controller triggers
fn resync_stream<K>(
    rx: mpsc::Receiver<ObjectKey>,
) -> impl futures::Stream<Item = ObjectRef<K>> + Send + 'static
where
    K: kube::Resource<DynamicType = ()> + 'static,
{
    ReceiverStream::new(rx).map(|key| ObjectRef::<K>::new(&key.name))
}

/// NodeSensor controller future
pub fn node_controller(shared: &Shared) -> ControllerFuture {
    let (resync, rx) = mpsc::channel(RESYNC_CAPACITY);
    let ctx = Arc::new(warden_node::Context::new(
        shared.store.clone(),
        shared.catalog.clone(),
        shared.tracker.clone(),
        resync,
        shared.settings.clone(),
    ));
    let sensors: Api<NodeSensor> = Api::all(shared.client.clone());

    tracing::info!("- NodeSensor controller");
    Box::pin(
        Controller::new(sensors, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .with_config(ControllerConfig::default().concurrency(shared.concurrency))
            .reconcile_on(resync_stream::<NodeSensor>(rx))
            .shutdown_on_signal()
            .run(warden_node::reconcile, warden_node::error_policy, ctx)
            .for_each(log_reconcile_result("NodeSensor")),
    )
}

/// AdmissionSensor controller future
pub fn admission_controller(shared: &Shared) -> ControllerFuture {
    let (resync, rx) = mpsc::channel(RESYNC_CAPACITY);
    let ctx = Arc::new(warden_admission::Context::new(
        shared.store.clone(),
        shared.catalog.clone(),
        shared.tracker.clone(),
        resync,
        shared.settings.clone(),
    ));
    let sensors: Api<AdmissionSensor> = Api::all(shared.client.clone());

    tracing::info!("- AdmissionSensor controller");
    Box::pin(
        Controller::new(sensors, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .with_config(ControllerConfig::default().concurrency(shared.concurrency))
            .reconcile_on(resync_stream::<AdmissionSensor>(rx))
            .shutdown_on_signal()
            .run(warden_admission::reconcile, warden_admission::error_policy, ctx)
            .for_each(log_reconcile_result("AdmissionSensor")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
