//! NodeSensor controller
//!
//! Installs the per-node sensor as a DaemonSet together with its namespace,
//! service account, role binding, optional priority class, configuration and
//! pull secret. Deleting a `NodeSensor` runs a cleanup DaemonSet on every
//! node before the finalizer is released, so host-level sensor state does not
//! outlive the installation.
//!
//! - [`render`]: desired child objects
//! - [`controller`]: reconcile and error policy
//! - [`finalize`]: teardown with host cleanup

pub mod controller;
pub mod finalize;
pub mod render;

pub use controller::{error_policy, reconcile, Context};

/// Name of the sensor DaemonSet and its service account
pub const SENSOR_NAME: &str = "warden-node-sensor";

/// Name of the DaemonSet that cleans nodes on uninstall
pub const CLEANUP_NAME: &str = "warden-node-sensor-cleanup";

/// Cluster role the sensor service account is bound to, installed with the operator
pub const CLUSTER_ROLE: &str = "warden-node-sensor-role";

/// `app.kubernetes.io/component` of sensor objects
pub const COMPONENT: &str = "node-sensor";

/// `app.kubernetes.io/component` of cleanup objects
pub const CLEANUP_COMPONENT: &str = "node-sensor-cleanup";
