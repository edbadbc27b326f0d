//! Error types for the nimbus controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant carries contextual information like cluster ids,
//! the collaborator that failed, or the node a command ran on.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for nimbus operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid cluster definition or request
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Cluster the request targeted
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// A stored record does not exist
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind (cluster, node, instance, object)
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// External collaborator failure (compute, security groups, load balancer, storage, queue)
    #[error("provider error [{service}] for {cluster}: {message}")]
    Provider {
        /// Cluster being operated on
        cluster: String,
        /// Collaborating service that failed
        service: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Remote command failed on a node
    #[error("command failed on {node}: {message}")]
    Executor {
        /// Address or instance the command ran on
        node: String,
        /// Description of what failed (includes the stderr excerpt)
        message: String,
        /// Combined stdout and stderr, when the command produced any
        output: Option<String>,
    },

    /// A bounded wait ran out of time
    #[error("timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// How long we waited
        after: Duration,
    },

    /// A provisioning phase failed
    #[error("provision phase '{phase}' failed for {cluster}: {message}")]
    Phase {
        /// Cluster being provisioned
        cluster: String,
        /// Phase name (security-group, control-plane, workers, finalize, commit)
        phase: String,
        /// Underlying failure
        message: String,
    },

    /// One or more nodes failed to upgrade
    #[error("upgrade of {cluster} to {version} failed on {} node(s): {}", .failures.len(), .failures.join("; "))]
    Upgrade {
        /// Cluster being upgraded
        cluster: String,
        /// Target version
        version: String,
        /// One entry per failed node, prefixed with the node name
        failures: Vec<String>,
    },

    /// Encryption or decryption through the Secrets service failed
    #[error("crypto error: {message}")]
    Crypto {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The payload kind being processed (if known)
        kind: Option<String>,
    },

    /// Feature deliberately not available yet
    #[error("not implemented: {feature}")]
    NotImplemented {
        /// Feature that was requested
        feature: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "worker", "reconciler")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a provider error without cluster context
    pub fn provider(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            cluster: UNKNOWN_CONTEXT.to_string(),
            service: service.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a provider error with full context
    pub fn provider_for(
        cluster: impl Into<String>,
        service: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            service: service.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., quota or configuration problem)
    pub fn provider_permanent(
        cluster: impl Into<String>,
        service: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            service: service.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an executor error without captured output
    pub fn executor(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Executor {
            node: node.into(),
            message: msg.into(),
            output: None,
        }
    }

    /// Create an executor error carrying the command's combined output
    pub fn executor_with_output(
        node: impl Into<String>,
        msg: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::Executor {
            node: node.into(),
            message: msg.into(),
            output: Some(output.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Wrap a failure in the provisioning phase it happened in
    pub fn phase(cluster: impl Into<String>, phase: impl Into<String>, source: &Error) -> Self {
        Self::Phase {
            cluster: cluster.into(),
            phase: phase.into(),
            message: source.to_string(),
        }
    }

    /// Create a crypto error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with payload kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a not-implemented error
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, crypto and serialization errors need a fix before a retry can
    /// succeed. Remote command and collaborator failures may be transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation { .. } => false,
            Error::NotFound { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Executor { .. } => true,
            Error::Timeout { .. } => true,
            Error::Phase { .. } => false,
            Error::Upgrade { .. } => true,
            Error::Crypto { .. } => false,
            Error::Serialization { .. } => false,
            Error::NotImplemented { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Combined command output, for executor failures
    pub fn output(&self) -> Option<&str> {
        match self {
            Error::Executor { output, .. } => output.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
