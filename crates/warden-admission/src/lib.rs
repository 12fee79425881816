//! AdmissionSensor controller
//!
//! Installs the admission-control sensor: a replicated Deployment serving a
//! mutating webhook, the Service in front of it and the
//! MutatingWebhookConfiguration pointing the API server at it. The webhook
//! certificate is provisioned outside the operator; its CA is copied into
//! the webhook configuration on every pass.

pub mod controller;
pub mod render;

pub use controller::{error_policy, reconcile, Context};

/// Name of the Deployment, Service, service account and webhook configuration
pub const SENSOR_NAME: &str = "warden-admission-sensor";

/// Cluster role the webhook service account is bound to, installed with the operator
pub const CLUSTER_ROLE: &str = "warden-admission-role";

/// `app.kubernetes.io/component` of admission objects
pub const COMPONENT: &str = "admission-sensor";

/// Fully qualified name of the webhook inside its configuration
pub const WEBHOOK_NAME: &str = "admission.warden.dev";
