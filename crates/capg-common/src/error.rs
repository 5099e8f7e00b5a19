//! Error types for the GKE provider
//!
//! Errors carry the resource they concern so the scheduler can log, record
//! events and pick a requeue policy without re-deriving context. The
//! scheduler alone decides retry/backoff/drop; reconcile logic only reports.

use std::time::Duration;

use thiserror::Error;

use crate::crd::MachinePoolStatusError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for provider operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error not classified at the store boundary
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A scope could not be opened because a required input was absent
    #[error("failed to create {scope} scope: {message}")]
    Construction {
        /// Scope being opened (e.g. "GKEMachinePool")
        scope: String,
        /// Which input was missing
        message: String,
    },

    /// Conditional write rejected because the stored version moved on
    #[error("conflict updating {resource}: resourceVersion {expected_version} is stale")]
    Conflict {
        /// Resource identity (namespace/name)
        resource: String,
        /// Version the writer last observed
        expected_version: String,
    },

    /// The resource no longer exists
    #[error("{resource} not found")]
    NotFound {
        /// Resource identity (namespace/name)
        resource: String,
    },

    /// The reconcile deadline passed before the operation finished
    #[error("reconcile of {resource} timed out after {elapsed:?}")]
    Timeout {
        /// Resource identity (namespace/name)
        resource: String,
        /// Time the invocation was allowed to run
        elapsed: Duration,
    },

    /// The invocation was cancelled (leadership lost or shutting down)
    #[error("reconcile of {resource} cancelled")]
    Cancelled {
        /// Resource identity (namespace/name)
        resource: String,
    },

    /// Store or network failure not covered by a more specific variant
    #[error("transport error [{context}]: {message}")]
    Transport {
        /// Where the failure happened (e.g. "gke", "watch", "lease")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Failure reported by domain logic
    #[error("{resource}: {message}")]
    Domain {
        /// Resource identity (namespace/name)
        resource: String,
        /// Terminal failure classification, if any
        reason: Option<MachinePoolStatusError>,
        /// Description of what failed
        message: String,
        /// Whether the scheduler should retry with backoff
        retryable: bool,
    },

    /// Invalid configuration or spec
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a construction error for the given scope
    pub fn construction(scope: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Construction {
            scope: scope.into(),
            message: msg.into(),
        }
    }

    /// Create a conflict error
    pub fn conflict(resource: impl Into<String>, expected_version: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            expected_version: expected_version.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(resource: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            resource: resource.into(),
            elapsed,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(resource: impl Into<String>) -> Self {
        Self::Cancelled {
            resource: resource.into(),
        }
    }

    /// Create a transport error without specific context
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            context: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a transport error with context
    pub fn transport_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable domain error
    pub fn domain(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Domain {
            resource: resource.into(),
            reason: None,
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a terminal domain error carrying a status failure reason
    pub fn domain_permanent(
        resource: impl Into<String>,
        reason: MachinePoolStatusError,
        msg: impl Into<String>,
    ) -> Self {
        Self::Domain {
            resource: resource.into(),
            reason: Some(reason),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Construction, not-found, validation and serialization errors need an
    /// external change before another attempt can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Construction { .. } => false,
            Error::Conflict { .. } => true,
            Error::NotFound { .. } => false,
            Error::Timeout { .. } => true,
            Error::Cancelled { .. } => true,
            Error::Transport { .. } => true,
            Error::Domain { retryable, .. } => *retryable,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
        }
    }

    /// True for stale-version write rejections
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// True when the resource vanished
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Get the resource identity if this error concerns a specific resource
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Conflict { resource, .. }
            | Error::NotFound { resource }
            | Error::Timeout { resource, .. }
            | Error::Cancelled { resource }
            | Error::Domain { resource, .. } => Some(resource),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
