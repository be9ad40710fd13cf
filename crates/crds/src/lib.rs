//! Histack CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the address pool ledger:
//! `ClusterIPPool` (capacity bookkeeping) and `ClusterIP` (address bindings).

pub mod cluster_ip;
pub mod cluster_ip_pool;
pub mod family;

pub use cluster_ip::*;
pub use cluster_ip_pool::*;
pub use family::*;
