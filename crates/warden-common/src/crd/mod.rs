//! Custom Resource Definitions for Warden
//!
//! Both sensor kinds are cluster-scoped and share their status shape, sensor
//! options and auto-update policy.

mod admission_sensor;
mod node_sensor;
mod types;

pub use admission_sensor::{
    AdmissionSensor, AdmissionSensorSpec, AdmissionSettings, FailurePolicy,
    DEFAULT_ADMISSION_NAMESPACE,
};
pub use node_sensor::{
    Backend, NodeSensor, NodeSensorSpec, NodeSettings, PriorityClassSpec,
    DEFAULT_NODE_NAMESPACE, DEFAULT_PRIORITY_CLASS_NAME, DEFAULT_TERMINATION_GRACE_SECONDS,
    MAX_PRIORITY_VALUE,
};
pub use types::{
    AutoUpdateSpec, Condition, ConditionStatus, ProxySpec, SensorOptions, SensorStatus,
    UpdateMode, DEFAULT_CHANNEL,
};
