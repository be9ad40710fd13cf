//! IPAM errors

use crds::IpFamily;
use thiserror::Error;

/// Errors from CIDR/index arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidrError {
    /// The range could not be parsed
    #[error("invalid CIDR {cidr:?}: {reason}")]
    Invalid { cidr: String, reason: String },

    /// Index beyond the usable capacity of the range
    #[error("index {index} out of range for {cidr} ({capacity} usable addresses)")]
    IndexOutOfRange { cidr: String, index: u64, capacity: u64 },

    /// Address outside the usable part of the range
    #[error("address {address} is not a usable address of {cidr}")]
    AddressOutOfRange { cidr: String, address: String },
}

/// Errors from the backing cluster store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Write lost a race (stale resource version or name already taken)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Call exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// The binding spec was written but its status was not
    #[error("status not written: {0}")]
    StatusNotWritten(String),

    /// Any other store failure
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Maps a Kubernetes API error for the operation `what`.
    pub fn from_kube(what: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(format!("{what}: {}", ae.message)),
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(format!("{what}: {}", ae.message)),
            other => StoreError::Backend(format!("{what}: {other}")),
        }
    }
}

/// Errors returned by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpamError {
    /// Lookup miss
    #[error("not found: {0}")]
    NotFound(String),

    /// No pool of the family has free capacity
    #[error("no free {0} pool found")]
    PoolExhausted(IpFamily),

    /// The pod behind an attach request does not exist
    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    /// The derived MAC is already carried by another workload's binding
    #[error("MAC collision: {0}")]
    MacCollision(String),

    /// Concurrent writers kept winning; retry attempts exhausted
    #[error("store conflict: {0}")]
    StoreConflict(String),

    /// Store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Pool range is unusable
    #[error(transparent)]
    Cidr(#[from] CidrError),

    /// Invalid allocator configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
