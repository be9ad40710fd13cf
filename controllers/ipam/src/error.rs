//! Controller-specific error types.

use ipam::IpamError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the IPAM Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Allocator error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Probe server failed
    #[error("Probe server error: {0}")]
    Probe(#[from] std::io::Error),
}
