//! Error types for the machine actuator
//!
//! Errors carry the identifiers needed to log which Cluster/Machine and which
//! operation failed. The `RequeueAfter` variant is not a failure: it is the
//! routine "not yet possible, come back later" signal consumed by the
//! controller framework.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for actuator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Precondition or configuration error (missing cluster, malformed scope)
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster the invalid input belongs to
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.providerSpec.instanceType")
        field: Option<String>,
    },

    /// The operation cannot make progress yet and should be rescheduled
    #[error("requeue after {after:?}: {reason}")]
    RequeueAfter {
        /// How long the caller should wait before retrying
        after: Duration,
        /// Why the operation was deferred
        reason: String,
    },

    /// An Update tried to change one or more create-time-only fields
    #[error(
        "found attempt to change immutable state for machine {machine}: {}",
        .violations.join("; ")
    )]
    ImmutableFieldChange {
        /// Name of the machine being updated
        machine: String,
        /// Every violated field, rendered as "<field> cannot be mutated from X to Y"
        violations: Vec<String>,
    },

    /// Cloud provider collaborator error
    #[error("provider error [{provider}] {operation} for {target}: {message}")]
    Provider {
        /// Provider name (e.g. "aws")
        provider: String,
        /// Operation that failed (e.g. "terminate instance")
        operation: String,
        /// Target identifier (instance id, machine name)
        target: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Bootstrap token issuance or control plane client construction failed
    #[error("bootstrap error [{context}]: {message}")]
    Bootstrap {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "token", "kubeconfig")
        context: String,
    },

    /// A collaborator call did not complete within its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out
        operation: String,
        /// The deadline that was exceeded
        after: Duration,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "scope", "locker")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retry-after signal
    pub fn requeue_after(after: Duration, reason: impl Into<String>) -> Self {
        Self::RequeueAfter {
            after,
            reason: reason.into(),
        }
    }

    /// Create an aggregated immutable-field error
    pub fn immutable_fields(machine: impl Into<String>, violations: Vec<String>) -> Self {
        Self::ImmutableFieldChange {
            machine: machine.into(),
            violations,
        }
    }

    /// Create a retryable provider error with full context
    pub fn provider_for(
        provider: impl Into<String>,
        operation: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            operation: operation.into(),
            target: target.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., rejected request)
    pub fn provider_permanent(
        provider: impl Into<String>,
        operation: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            operation: operation.into(),
            target: target.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a bootstrap error with context
    pub fn bootstrap_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Bootstrap {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Prefix the message of a wrapped collaborator error with more context.
    ///
    /// Variants without a free-form message are returned unchanged.
    pub fn context(self, ctx: impl AsRef<str>) -> Self {
        let ctx = ctx.as_ref();
        match self {
            Error::Provider {
                provider,
                operation,
                target,
                message,
                retryable,
            } => Error::Provider {
                provider,
                operation,
                target,
                message: format!("{}: {}", ctx, message),
                retryable,
            },
            Error::Bootstrap { message, context } => Error::Bootstrap {
                message: format!("{}: {}", ctx, message),
                context,
            },
            Error::Internal { message, context } => Error::Internal {
                message: format!("{}: {}", ctx, message),
                context,
            },
            other => other,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, immutable-field and serialization errors need a spec fix.
    /// Requeue signals and timeouts always are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::RequeueAfter { .. } => true,
            Error::ImmutableFieldChange { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Bootstrap { .. } => true,
            Error::Timeout { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// The requested delay if this is a retry-after signal
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            Error::RequeueAfter { after, .. } => Some(*after),
            _ => None,
        }
    }
}
