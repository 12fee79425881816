//! Common types for Warden: CRDs, errors, convergence and status handling

#![warn(missing_docs)]

pub mod catalog;
pub mod conditions;
pub mod converge;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod reconcile;
pub mod render;
pub mod retry;
pub mod store;
pub mod telemetry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer guarding sensor teardown
pub const FINALIZER: &str = "warden.dev/cleanup";

/// Field manager and `managed-by` label value of the operator
pub const MANAGER: &str = "warden-operator";

/// Label key naming the tool managing an object
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label key naming the sensor component (node-sensor, admission-sensor)
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Label key naming the sensor resource a child belongs to
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// Pod template annotation carrying the hash of the sensor configuration
pub const ANNOTATION_CONFIG_HASH: &str = "warden.dev/config-hash";

/// Name of the rendered sensor configuration ConfigMap
pub const CONFIG_MAP_NAME: &str = "warden-sensor-config";

/// Name of the pull secret rendered from the catalog token
pub const PULL_SECRET_NAME: &str = "warden-pull-secret";
