//! Cluster-facing error types

use thiserror::Error;

/// Errors raised while discovering, connecting to or querying clusters
#[derive(Debug, Error)]
pub enum K8sError {
    /// Cluster is not connected
    #[error("Cluster not connected: {0}")]
    ClusterNotConnected(String),

    /// Cluster not found in registry
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    /// Kubernetes resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    ResourceNotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Error from kube-rs client
    #[cfg(feature = "kubernetes")]
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Kubeconfig could not be parsed or lacks the requested context
    #[error("Invalid kubeconfig: {0}")]
    InvalidKubeconfig(String),

    /// Client construction or version probe failed
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The cluster does not serve the requested API
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Internal system error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<kubepatrol_common::Error> for K8sError {
    fn from(err: kubepatrol_common::Error) -> Self {
        match err {
            kubepatrol_common::Error::Validation(msg) | kubepatrol_common::Error::InvalidConfig(msg) => {
                K8sError::InvalidKubeconfig(msg)
            }
            other => K8sError::Internal(other.to_string()),
        }
    }
}

impl From<K8sError> for kubepatrol_common::Error {
    fn from(err: K8sError) -> Self {
        kubepatrol_common::Error::System(err.to_string())
    }
}

/// Result type alias for cluster operations
pub type K8sResult<T> = std::result::Result<T, K8sError>;
