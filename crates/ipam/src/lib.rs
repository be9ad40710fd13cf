//! Cluster IP address management
//!
//! Allocates addresses and MACs from `ClusterIPPool` resources and records
//! each assignment as a `ClusterIP` binding.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ipam::{Allocator, AllocatorConfig, AttachRequest, KubeDirectory, KubeRepository};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let timeout = Duration::from_secs(10);
//! let allocator = Allocator::new(
//!     Arc::new(KubeRepository::new(client.clone(), timeout)),
//!     Arc::new(KubeDirectory::new(client, timeout)),
//!     AllocatorConfig::default(),
//! );
//!
//! let allocation = allocator
//!     .allocate_or_find(&AttachRequest {
//!         namespace: "default".to_string(),
//!         pod: "virt-launcher-vm1-abcde".to_string(),
//!         interface: "eth0".to_string(),
//!         family: crds::IpFamily::V4,
//!     })
//!     .await?;
//! println!("{} {}", allocation.binding.spec.address, allocation.mac());
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod cidr;
pub mod error;
pub mod kube_store;
pub mod ledger;
pub mod mac;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod store;

pub use allocator::{Allocation, Allocator, AllocatorConfig, AttachRequest};
pub use error::{CidrError, IpamError, StoreError};
pub use kube_store::{DEFAULT_STORE_TIMEOUT, KubeDirectory, KubeRepository};
pub use mac::MacPrefix;
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryDirectory, MemoryRepository};
pub use store::{BindingQuery, KUBEVIRT_VM_LABEL, Repository, WorkloadDirectory, WorkloadKey};
