//! Steps shared by the sensor reconcilers
//!
//! Both controllers walk the same sequence: mark new resources pending,
//! converge children while recording a `{Kind}Ready` condition per mutating
//! step, then report the applied version. Failures land in the `Failed`
//! condition and pick a requeue delay from [`Error::is_retryable`].

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::catalog::ResolvedImage;
use crate::conditions::{
    self, ConditionedResource, FAILED, PENDING, REASON_RECONCILED, REASON_RECONCILE_ERROR,
    REASON_RECONCILING, SUCCESS,
};
use crate::converge::{converge, Converged, Convergent};
use crate::crd::ConditionStatus;
use crate::retry::RetryConfig;
use crate::store::{ObjectKey, StateStore};
use crate::{Error, Result};

/// Default registry sensor images are pulled from
pub const DEFAULT_REGISTRY: &str = "registry.warden.dev";

/// Default periodic resync of every sensor
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Default pause between cleanup completion checks
pub const DEFAULT_CLEANUP_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of attempts for conflicting status writes
pub const DEFAULT_STATUS_RETRIES: u32 = 5;

/// Requeue delay after an error that may resolve on its own
pub const REQUEUE_RETRYABLE: Duration = Duration::from_secs(30);

/// Requeue delay after an error that needs a spec or cluster change
pub const REQUEUE_PERMANENT: Duration = Duration::from_secs(300);

/// Operator-wide settings both controllers read
#[derive(Clone, Debug)]
pub struct Settings {
    /// Registry sensor images are pulled from
    pub registry: String,
    /// Retry budget for status and finalizer writes
    pub status_retry: RetryConfig,
    /// Requeue delay after a successful reconciliation
    pub resync_interval: Duration,
    /// Pause between cleanup completion checks
    pub cleanup_poll_interval: Duration,
    /// Proxy variables forwarded into sensor containers
    pub proxy_env: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.to_string(),
            status_retry: RetryConfig::conflicts(DEFAULT_STATUS_RETRIES),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            cleanup_poll_interval: DEFAULT_CLEANUP_POLL_INTERVAL,
            proxy_env: BTreeMap::new(),
        }
    }
}

/// Requeue action for a failed reconciliation
pub fn requeue_after_error(error: &Error) -> Action {
    if error.is_retryable() {
        Action::requeue(REQUEUE_RETRYABLE)
    } else {
        Action::requeue(REQUEUE_PERMANENT)
    }
}

/// Record `Pending=True` on a resource that has no conditions yet
pub async fn mark_pending<K, S>(store: &S, retry: &RetryConfig, obj: &K) -> Result<()>
where
    K: ConditionedResource,
    S: StateStore<K> + ?Sized,
{
    if !obj.conditions().is_empty() {
        return Ok(());
    }
    conditions::set_condition(
        store,
        retry,
        &ObjectKey::of(obj),
        PENDING,
        ConditionStatus::True,
        REASON_RECONCILING,
        "installation started",
    )
    .await?;
    Ok(())
}

/// Converge one child of `sensor` and record `{Kind}Ready` when it changed
pub async fn converge_child<K, C, S>(
    store: &S,
    retry: &RetryConfig,
    sensor: &ObjectKey,
    owner: &OwnerReference,
    desired: C,
) -> Result<Converged<C>>
where
    K: ConditionedResource,
    C: Convergent,
    S: StateStore<K> + StateStore<C> + ?Sized,
{
    let converged = converge(store, Some(owner), desired).await?;
    if converged.mutated() {
        let kind = C::kind(&());
        let reason = converged.outcome.reason();
        conditions::set_condition::<K, S>(
            store,
            retry,
            sensor,
            &conditions::ready_type(&kind),
            ConditionStatus::True,
            reason,
            &format!("{kind} {} {}", converged.object.name_any(), reason.to_lowercase()),
        )
        .await?;
    }
    Ok(converged)
}

/// Report the applied image and close out a successful reconciliation
pub async fn record_success<K, S>(
    store: &S,
    retry: &RetryConfig,
    sensor: &ObjectKey,
    image: &ResolvedImage,
) -> Result<()>
where
    K: ConditionedResource,
    S: StateStore<K> + ?Sized,
{
    conditions::update_status::<K, S, _>(store, retry, sensor, |status| {
        let changed = status.sensor_version.as_deref() != Some(image.version.as_str())
            || status.image.as_deref() != Some(image.uri.as_str());
        status.sensor_version = Some(image.version.clone());
        status.image = Some(image.uri.clone());
        changed
    })
    .await?;

    let message = format!("sensor {} installed", image.version);
    for (type_, status) in [
        (SUCCESS, ConditionStatus::True),
        (PENDING, ConditionStatus::False),
        (FAILED, ConditionStatus::False),
    ] {
        conditions::set_condition::<K, S>(
            store,
            retry,
            sensor,
            type_,
            status,
            REASON_RECONCILED,
            &message,
        )
        .await?;
    }
    Ok(())
}

/// Record `Failed=True` and `Success=False` with the error message
///
/// Best effort: a failing write is logged and the original error is what
/// the caller returns.
pub async fn record_failure<K, S>(store: &S, retry: &RetryConfig, sensor: &ObjectKey, error: &Error)
where
    K: ConditionedResource,
    S: StateStore<K> + ?Sized,
{
    let message = error.to_string();
    for (type_, status) in [
        (FAILED, ConditionStatus::True),
        (SUCCESS, ConditionStatus::False),
    ] {
        let recorded = conditions::set_condition::<K, S>(
            store,
            retry,
            sensor,
            type_,
            status,
            REASON_RECONCILE_ERROR,
            &message,
        )
        .await;
        match recorded {
            Ok(written) => debug!(sensor = %sensor, condition = type_, written, "recorded reconcile failure"),
            Err(e) => {
                warn!(sensor = %sensor, error = %e, "failed to record reconcile failure");
                return;
            }
        }
    }
}
