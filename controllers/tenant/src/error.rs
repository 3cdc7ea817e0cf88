//! Controller-specific error types.
//!
//! This module defines error types specific to the tenancy controller
//! that are not covered by upstream library errors.

use cluster_client::ClusterError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the tenancy controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Cluster API error from a typed client call
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Kubernetes client error outside the typed client (bootstrap, events)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Generated object could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource quantity that does not parse
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Object lacks a label it is required to carry
    #[error("Missing label {label} on {object}")]
    MissingLabel { object: String, label: String },

    /// Object content the controller cannot act on
    #[error("Invalid resource {object}: {reason}")]
    InvalidResource { object: String, reason: String },

    /// Lease acquisition or renewal failed
    #[error("Leader election failed: {0}")]
    LeaderElection(String),

    /// Readiness gate could not be initialised
    #[error("Readiness gate failed: {0}")]
    Readiness(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether retrying the same request can succeed.
    ///
    /// Non-transient errors are dropped by the runner once its retry budget
    /// for them is exhausted.
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Cluster(e) => e.is_transient(),
            ControllerError::Kube(_)
            | ControllerError::LeaderElection(_)
            | ControllerError::Readiness(_)
            | ControllerError::Watch(_) => true,
            ControllerError::Serialization(_)
            | ControllerError::InvalidConfig(_)
            | ControllerError::InvalidQuantity(_)
            | ControllerError::MissingLabel { .. }
            | ControllerError::InvalidResource { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_failures_are_transient() {
        assert!(ControllerError::from(ClusterError::Unavailable("etcd".into())).is_transient());
        assert!(ControllerError::from(ClusterError::Conflict("rv".into())).is_transient());
    }

    #[test]
    fn test_logic_errors_are_permanent() {
        assert!(!ControllerError::InvalidQuantity("12x".into()).is_transient());
        assert!(
            !ControllerError::InvalidResource {
                object: "env".into(),
                reason: "bad policy".into()
            }
            .is_transient()
        );
        assert!(!ControllerError::from(ClusterError::InvalidRequest("no name".into())).is_transient());
        assert!(!ControllerError::from(ClusterError::Rejected("namespace \"Dev_1\" is invalid".into())).is_transient());
    }
}
