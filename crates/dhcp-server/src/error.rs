//! DHCP responder errors

use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while serving DHCP.
#[derive(Debug, Error)]
pub enum DhcpError {
    /// The datagram is not a usable BOOTREQUEST
    #[error("failed to parse DHCP packet: {0}")]
    Parse(String),

    #[error("failed to encode DHCP packet: {0}")]
    Encode(String),

    /// The listen socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("binding lookup failed: {0}")]
    Lookup(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for the responder.
pub type Result<T, E = DhcpError> = std::result::Result<T, E>;
