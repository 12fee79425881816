//! NodeSensor teardown
//!
//! The sensor leaves state on every host it ran on. Before the finalizer is
//! released, the sensor DaemonSet is removed and a cleanup DaemonSet runs the
//! sensor image in cleanup mode on every node. Completion is polled without a
//! deadline; a node that never finishes keeps the resource around.

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use warden_common::crd::NodeSensor;
use warden_common::kube_utils::{has_finalizer, owner_reference, remove_finalizer};
use warden_common::store::{ObjectKey, StateStore};
use warden_common::{Error, Result};

use crate::controller::Context;
use crate::render::{cleanup_daemonset, cleanup_selector};
use crate::{CLEANUP_NAME, SENSOR_NAME};

/// Progress of the node cleanup, rebuilt on every poll
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FinalizationRun {
    /// Nodes the cleanup DaemonSet should run on
    pub desired: i32,
    /// Nodes whose cleanup pod is running, finished or given up on
    pub completed: i32,
    /// Nodes whose cleanup pod is crash looping
    pub crash_looping: Vec<String>,
}

impl FinalizationRun {
    /// Every desired node has been handled
    pub fn complete(&self) -> bool {
        self.completed >= self.desired
    }
}

/// Where the cleanup stands on one poll
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupState {
    /// The cleanup DaemonSet no longer exists
    Gone,
    /// The DaemonSet controller has not reported a node count yet
    Unscheduled,
    /// Pods are being counted
    Running(FinalizationRun),
}

/// Tear down a deleted NodeSensor and release its finalizer
pub async fn finalize(sensor: &NodeSensor, ctx: &Context) -> Result<()> {
    if !has_finalizer(sensor) {
        debug!("no finalizer, nothing to clean up");
        return Ok(());
    }
    let store = ctx.store.as_ref();
    let namespace = sensor.spec.install_namespace.as_str();

    if sensor.spec.node.disable_cleanup {
        info!("host cleanup disabled");
    } else {
        let sensor_ds = ObjectKey::namespaced(namespace, SENSOR_NAME);
        if StateStore::<DaemonSet>::delete(store, &sensor_ds).await? {
            info!(daemonset = %sensor_ds, "deleted sensor DaemonSet");
        }

        match installed_image(sensor) {
            Some(image) => run_cleanup(sensor, image, ctx).await?,
            None => info!("sensor was never installed, skipping host cleanup"),
        }
    }

    ctx.tracker.stop_tracking(Context::track_id(sensor)).await?;
    remove_finalizer::<NodeSensor, _>(store, &ctx.settings.status_retry, sensor).await?;
    info!("node sensor finalized");
    Ok(())
}

/// Image of the last successful installation
fn installed_image(sensor: &NodeSensor) -> Option<&str> {
    sensor
        .status
        .as_ref()
        .and_then(|s| s.image.as_deref())
        .filter(|i| !i.is_empty())
}

async fn run_cleanup(sensor: &NodeSensor, image: &str, ctx: &Context) -> Result<()> {
    let store = ctx.store.as_ref();
    let key = ObjectKey::namespaced(sensor.spec.install_namespace.as_str(), CLEANUP_NAME);

    if StateStore::<DaemonSet>::get_latest(store, &key).await?.is_none() {
        let mut normalized = sensor.clone();
        normalized.spec.normalize();
        let mut ds = cleanup_daemonset(&normalized, image, &ctx.settings);
        ds.metadata.owner_references = Some(vec![owner_reference(sensor)?]);
        match StateStore::<DaemonSet>::create(store, &ds).await {
            Ok(_) => info!(daemonset = %key, "started node cleanup"),
            Err(e) if e.is_already_exists() => debug!(daemonset = %key, "cleanup already running"),
            Err(e) => return Err(Error::child("DaemonSet", CLEANUP_NAME, e)),
        }
    }

    wait_for_cleanup(sensor, ctx).await?;

    if StateStore::<DaemonSet>::delete(store, &key).await? {
        info!(daemonset = %key, "deleted cleanup DaemonSet");
    }
    Ok(())
}

async fn wait_for_cleanup(sensor: &NodeSensor, ctx: &Context) -> Result<()> {
    loop {
        match cleanup_state(sensor, ctx).await? {
            CleanupState::Gone => {
                warn!("cleanup DaemonSet disappeared, assuming cleanup is over");
                return Ok(());
            }
            CleanupState::Unscheduled => debug!("cleanup DaemonSet not scheduled yet"),
            CleanupState::Running(run) => {
                for node in &run.crash_looping {
                    warn!(node = %node, "cleanup pod crash looping, counting node as done");
                }
                if run.complete() {
                    info!(nodes = run.completed, "node cleanup complete");
                    return Ok(());
                }
                info!(
                    desired = run.desired,
                    completed = run.completed,
                    "waiting for node cleanup"
                );
            }
        }
        tokio::time::sleep(ctx.settings.cleanup_poll_interval).await;
    }
}

/// One poll of the cleanup progress
///
/// The desired node count is re-read every time, since nodes may join or
/// leave while the cleanup runs.
pub async fn cleanup_state(sensor: &NodeSensor, ctx: &Context) -> Result<CleanupState> {
    let store = ctx.store.as_ref();
    let namespace = sensor.spec.install_namespace.as_str();

    let pods =
        StateStore::<Pod>::list(store, Some(namespace), &cleanup_selector(&sensor.name_any()))
            .await?;
    let Some(ds) =
        StateStore::<DaemonSet>::get_latest(store, &ObjectKey::namespaced(namespace, CLEANUP_NAME))
            .await?
    else {
        return Ok(CleanupState::Gone);
    };
    let Some(status) = ds.status else {
        return Ok(CleanupState::Unscheduled);
    };

    let (completed, crash_looping) = count_completed(&pods);
    Ok(CleanupState::Running(FinalizationRun {
        desired: status.desired_number_scheduled,
        completed,
        crash_looping,
    }))
}

/// Count cleanup pods that are done with their node
///
/// Running and Succeeded pods count as done. Pending pods stuck in
/// `CrashLoopBackOff` count too, and their nodes are returned so they can be
/// reported.
pub fn count_completed(pods: &[Pod]) -> (i32, Vec<String>) {
    let mut completed = 0;
    let mut crash_looping = Vec::new();
    for pod in pods {
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        match phase {
            Some("Running") | Some("Succeeded") => completed += 1,
            Some("Pending") if is_crash_looping(pod) => {
                completed += 1;
                crash_looping.push(
                    pod.spec
                        .as_ref()
                        .and_then(|s| s.node_name.clone())
                        .unwrap_or_else(|| pod.name_any()),
                );
            }
            _ => {}
        }
    }
    (completed, crash_looping)
}

fn is_crash_looping(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status
        .container_statuses
        .iter()
        .flatten()
        .chain(status.init_container_statuses.iter().flatten())
        .filter_map(|c| c.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
        .any(|reason| reason == "CrashLoopBackOff")
}
