//! Installation progress reporting
//!
//! Sensor status holds at most one condition per type. A transition only
//! happens when the status of a type changes, which is the only moment
//! `lastTransitionTime` moves. Every persisted change re-reads the latest
//! object and retries on optimistic-concurrency conflicts, so concurrent
//! writers never lose each other's conditions.

use kube::Resource;
use tracing::debug;

use crate::crd::{AdmissionSensor, Condition, ConditionStatus, NodeSensor, SensorStatus};
use crate::retry::{retry_if, RetryConfig};
use crate::store::{Object, ObjectKey, StateStore};
use crate::{Error, Result};

/// Installation in progress
pub const PENDING: &str = "Pending";
/// Last reconciliation failed
pub const FAILED: &str = "Failed";
/// Every child converged
pub const SUCCESS: &str = "Success";

/// Reason recorded when a reconciliation starts from scratch
pub const REASON_RECONCILING: &str = "Reconciling";
/// Reason recorded on reconcile failure
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
/// Reason recorded when every child converged
pub const REASON_RECONCILED: &str = "Reconciled";

/// Condition type reporting a child kind, e.g. `DaemonSetReady`
pub fn ready_type(kind: &str) -> String {
    format!("{kind}Ready")
}

/// Custom resources that carry a [`SensorStatus`]
pub trait ConditionedResource: Object {
    /// Current status, if any was ever written
    fn sensor_status(&self) -> Option<&SensorStatus>;

    /// Mutable status, created empty when missing
    fn sensor_status_mut(&mut self) -> &mut SensorStatus;

    /// Conditions currently recorded
    fn conditions(&self) -> &[Condition] {
        self.sensor_status()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

impl ConditionedResource for NodeSensor {
    fn sensor_status(&self) -> Option<&SensorStatus> {
        self.status.as_ref()
    }

    fn sensor_status_mut(&mut self) -> &mut SensorStatus {
        self.status.get_or_insert_with(SensorStatus::default)
    }
}

impl ConditionedResource for AdmissionSensor {
    fn sensor_status(&self) -> Option<&SensorStatus> {
        self.status.as_ref()
    }

    fn sensor_status_mut(&mut self) -> &mut SensorStatus {
        self.status.get_or_insert_with(SensorStatus::default)
    }
}

/// Record `condition` in `status`
///
/// Returns `false` without touching anything when a condition of the same
/// type already has the same status. Otherwise the entry for that type is
/// replaced in place (or appended) and `true` is returned.
pub fn apply_condition(status: &mut SensorStatus, condition: Condition) -> bool {
    match status
        .conditions
        .iter_mut()
        .find(|c| c.type_ == condition.type_)
    {
        Some(existing) if existing.status == condition.status => false,
        Some(existing) => {
            *existing = condition;
            true
        }
        None => {
            status.conditions.push(condition);
            true
        }
    }
}

/// Set a condition on the object at `key` and persist it
///
/// Returns whether a write happened. Conflicts re-read the object through
/// the writer path and re-apply the transition until the budget runs out.
pub async fn set_condition<K, S>(
    store: &S,
    retry: &RetryConfig,
    key: &ObjectKey,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> Result<bool>
where
    K: ConditionedResource,
    S: StateStore<K> + ?Sized,
{
    let written = modify_status(store, retry, key, "set_condition", |obj: &mut K| {
        let condition =
            Condition::new(type_, status, reason, message).observed(obj.meta().generation);
        apply_condition(obj.sensor_status_mut(), condition)
    })
    .await?;

    if written.is_some() {
        debug!(object = %key, condition = type_, status = %status, reason, "condition transition");
    }
    Ok(written.is_some())
}

/// Apply `mutate` to the latest status of the object at `key` and persist it
///
/// `mutate` returns whether it changed anything; unchanged objects are not
/// written. Returns the written object, if any.
pub async fn update_status<K, S, F>(
    store: &S,
    retry: &RetryConfig,
    key: &ObjectKey,
    mutate: F,
) -> Result<Option<K>>
where
    K: ConditionedResource,
    S: StateStore<K> + ?Sized,
    F: Fn(&mut SensorStatus) -> bool,
{
    modify_status(store, retry, key, "update_status", |obj: &mut K| {
        mutate(obj.sensor_status_mut())
    })
    .await
}

async fn modify_status<K, S, F>(
    store: &S,
    retry: &RetryConfig,
    key: &ObjectKey,
    operation: &str,
    mutate: F,
) -> Result<Option<K>>
where
    K: ConditionedResource,
    S: StateStore<K> + ?Sized,
    F: Fn(&mut K) -> bool,
{
    let mutate = &mutate;
    retry_if(retry, operation, Error::is_conflict, || async move {
        let Some(mut latest) = store.get_latest(key).await? else {
            debug!(object = %key, operation, "object gone, skipping status write");
            return Ok(None);
        };
        if !mutate(&mut latest) {
            return Ok(None);
        }
        store.update_status(&latest).await.map(Some)
    })
    .await
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether `type_` is present with status True
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NodeSensorSpec;
    use crate::testing::MemoryStore;
    use kube::api::ObjectMeta;
    use std::time::Duration;

    fn sensor() -> NodeSensor {
        let mut sensor = NodeSensor::new("default", NodeSensorSpec::default());
        sensor.metadata = ObjectMeta {
            name: Some("default".to_string()),
            generation: Some(4),
            ..Default::default()
        };
        sensor
    }

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    async fn seeded() -> (MemoryStore, ObjectKey) {
        let store = MemoryStore::new();
        let created = StateStore::<NodeSensor>::create(&store, &sensor()).await.unwrap();
        (store, ObjectKey::of(&created))
    }

    async fn current(store: &MemoryStore, key: &ObjectKey) -> NodeSensor {
        StateStore::<NodeSensor>::get_latest(store, key)
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_apply_condition_replaces_in_place() {
        let mut status = SensorStatus::default();
        assert!(apply_condition(
            &mut status,
            Condition::new(PENDING, ConditionStatus::True, REASON_RECONCILING, "")
        ));
        assert!(apply_condition(
            &mut status,
            Condition::new(FAILED, ConditionStatus::False, "", "")
        ));
        assert!(apply_condition(
            &mut status,
            Condition::new(PENDING, ConditionStatus::False, REASON_RECONCILED, "")
        ));

        assert_eq!(status.conditions.len(), 2);
        assert_eq!(status.conditions[0].type_, PENDING);
        assert_eq!(status.conditions[0].status, ConditionStatus::False);
        assert_eq!(status.conditions[1].type_, FAILED);
    }

    /// Story: repeating the same status never moves lastTransitionTime and
    /// never writes
    #[tokio::test]
    async fn story_repeated_status_is_a_no_op() {
        let (store, key) = seeded().await;
        let retry = fast_retry(3);

        let wrote = set_condition::<NodeSensor, _>(
            &store,
            &retry,
            &key,
            "DaemonSetReady",
            ConditionStatus::True,
            "Created",
            "created",
        )
        .await
        .unwrap();
        assert!(wrote);
        let first = current(&store, &key).await;
        let first_time = first.conditions()[0].last_transition_time;
        assert_eq!(first.conditions()[0].observed_generation, Some(4));

        let writes = store.writes();
        for reason in ["Updated", "Replaced"] {
            let wrote = set_condition::<NodeSensor, _>(
                &store,
                &retry,
                &key,
                "DaemonSetReady",
                ConditionStatus::True,
                reason,
                "again",
            )
            .await
            .unwrap();
            assert!(!wrote);
        }

        assert_eq!(store.writes(), writes);
        let after = current(&store, &key).await;
        assert_eq!(after.conditions().len(), 1);
        assert_eq!(after.conditions()[0].last_transition_time, first_time);
        assert_eq!(after.conditions()[0].reason, "Created");
    }

    /// Story: every flip of the status is a transition with a fresh timestamp
    #[tokio::test]
    async fn story_alternating_status_moves_transition_time() {
        let (store, key) = seeded().await;
        let retry = fast_retry(3);
        let mut last = None;

        for status in [
            ConditionStatus::True,
            ConditionStatus::False,
            ConditionStatus::True,
        ] {
            tokio::time::sleep(Duration::from_millis(2)).await;
            let wrote =
                set_condition::<NodeSensor, _>(&store, &retry, &key, FAILED, status, "r", "m")
                    .await
                    .unwrap();
            assert!(wrote);
            let time = current(&store, &key).await.conditions()[0].last_transition_time;
            if let Some(prev) = last {
                assert!(time > prev);
            }
            last = Some(time);
        }
    }

    /// Story: a concurrent writer bumped the resourceVersion; the transition
    /// is re-applied on the fresh copy instead of being dropped
    #[tokio::test]
    async fn story_conflicts_are_retried_against_latest() {
        let (store, key) = seeded().await;
        store.inject_conflicts(2);

        let wrote = set_condition::<NodeSensor, _>(
            &store,
            &fast_retry(5),
            &key,
            SUCCESS,
            ConditionStatus::True,
            REASON_RECONCILED,
            "",
        )
        .await
        .unwrap();

        assert!(wrote);
        assert!(is_true(current(&store, &key).await.conditions(), SUCCESS));
    }

    /// Story: when conflicts outlast the budget the caller sees the conflict
    #[tokio::test]
    async fn story_exhausted_budget_surfaces_conflict() {
        let (store, key) = seeded().await;
        store.inject_conflicts(10);

        let err = set_condition::<NodeSensor, _>(
            &store,
            &fast_retry(3),
            &key,
            SUCCESS,
            ConditionStatus::True,
            REASON_RECONCILED,
            "",
        )
        .await
        .unwrap_err();

        assert!(err.is_conflict());
        assert!(current(&store, &key).await.conditions().is_empty());
    }

    #[tokio::test]
    async fn test_update_status_writes_scalars_only_when_changed() {
        let (store, key) = seeded().await;
        let retry = fast_retry(3);

        let set_version = |s: &mut SensorStatus| {
            if s.sensor_version.as_deref() == Some("7.10.0") {
                return false;
            }
            s.sensor_version = Some("7.10.0".to_string());
            true
        };

        let written = update_status::<NodeSensor, _, _>(&store, &retry, &key, set_version)
            .await
            .unwrap();
        assert!(written.is_some());
        let writes = store.writes();

        let written = update_status::<NodeSensor, _, _>(&store, &retry, &key, set_version)
            .await
            .unwrap();
        assert!(written.is_none());
        assert_eq!(store.writes(), writes);
    }

    #[test]
    fn test_ready_type_and_lookup() {
        assert_eq!(ready_type("DaemonSet"), "DaemonSetReady");
        let conditions = vec![Condition::new(SUCCESS, ConditionStatus::False, "", "")];
        assert!(!is_true(&conditions, SUCCESS));
        assert!(find_condition(&conditions, FAILED).is_none());
    }
}
