//! Operator errors
//!
//! Each variant carries the context a controller needs to decide whether to retry:
//! the sensor or child object involved, the failing dependency, or the field
//! that blocked convergence.

use thiserror::Error;

/// Placeholder for errors raised without a named resource or context
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status code the API server uses for both conflicts and duplicates
const HTTP_CONFLICT: u16 = 409;

/// Reason string distinguishing a duplicate create from a stale write
const REASON_ALREADY_EXISTS: &str = "AlreadyExists";

/// Everything a reconcile pass can fail with
#[derive(Debug, Error)]
pub enum Error {
    /// API server or transport failure
    #[error("kube api: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    /// Sensor spec rejected before anything is written
    #[error("invalid sensor {resource}: {message}")]
    Validation {
        resource: String,
        message: String,
        /// Offending path, e.g. `spec.node.priorityClass.value`
        field: Option<String>,
    },

    /// A live object differs from the desired one in a field the API server
    /// refuses to change in place. Requires manual recreation.
    #[error("immutable field {field} differs on {kind} {name}; delete the object to recreate it")]
    ImmutableField {
        /// Kind of the child object
        kind: String,
        /// Name of the child object
        name: String,
        /// Path of the field that cannot be changed
        field: String,
    },

    /// Failure of an external collaborator (version catalog, pull token,
    /// externally provisioned secrets)
    #[error("dependency error [{dependency}]: {message}")]
    Dependency {
        /// `version-query`, `pull-token`, `tls-secret`
        dependency: String,
        message: String,
    },

    /// Convergence of one child object failed
    #[error("converging {kind} {name}: {source}")]
    Child {
        /// Kind of the child object
        kind: String,
        /// Name of the child object
        name: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Object could not be encoded or decoded
    #[error("encoding: {message}")]
    Serialization {
        message: String,
        kind: Option<String>,
    },

    /// The version tracker is no longer accepting registrations
    #[error("version tracker stopped")]
    TrackerStopped,

    /// Broken assumption inside the operator
    #[error("internal [{context}]: {message}")]
    Internal {
        message: String,
        /// Where it happened: `reconciler`, `finalizer`, ...
        context: String,
    },
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Rejection of one field of a named sensor
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    pub fn immutable_field(
        kind: impl Into<String>,
        name: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self::ImmutableField {
            kind: kind.into(),
            name: name.into(),
            field: field.into(),
        }
    }

    pub fn dependency(dependency: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Dependency {
            dependency: dependency.into(),
            message: msg.into(),
        }
    }

    /// Wrap an error with the child object it occurred on
    pub fn child(kind: impl Into<String>, name: impl Into<String>, source: Error) -> Self {
        Self::Child {
            kind: kind.into(),
            name: name.into(),
            source: Box::new(source),
        }
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Strip `Child` wrappers down to the error that actually happened
    pub fn root(&self) -> &Error {
        match self {
            Error::Child { source, .. } => source.root(),
            other => other,
        }
    }

    /// Optimistic-concurrency conflict (stale resourceVersion)
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.root(),
            Error::Kube { source: kube::Error::Api(ae) }
                if ae.code == HTTP_CONFLICT && ae.reason != REASON_ALREADY_EXISTS
        )
    }

    /// A create raced with another writer
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self.root(),
            Error::Kube { source: kube::Error::Api(ae) }
                if ae.code == HTTP_CONFLICT && ae.reason == REASON_ALREADY_EXISTS
        )
    }

    /// The API server reported the object missing
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404
        )
    }

    /// Whether requeueing soon can help
    ///
    /// Validation, immutable-field and serialization errors need a human to
    /// change something. Kubernetes errors retry unless they are 4xx, with
    /// conflicts being the exception: a re-fetch resolves them.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == HTTP_CONFLICT => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::ImmutableField { .. } => false,
            Error::Dependency { .. } => true,
            Error::Child { source, .. } => source.is_retryable(),
            Error::Serialization { .. } => false,
            Error::TrackerStopped => true,
            Error::Internal { .. } => true,
        }
    }

    /// Collaborator or operator context, when the variant records one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Dependency { dependency, .. } => Some(dependency),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

/// Build the error the API server returns for `code`/`reason`
#[cfg(any(test, feature = "testing"))]
pub fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    }))
}
