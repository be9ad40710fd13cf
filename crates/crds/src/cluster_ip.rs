//! ClusterIP CRD
//!
//! Binds one pool index (address + MAC) to a workload interface.
//! The object is retained after release so its allocation history stays
//! auditable; an empty `mac`/`resource` marks it as unbound.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::family::IpFamily;

/// One address of a pool, bound to a workload interface or free for reuse.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "ipam.histack.ir",
    version = "v1alpha1",
    kind = "ClusterIP",
    status = "ClusterIPStatus",
    selectable = ".spec.family",
    selectable = ".spec.mac",
    selectable = ".spec.containerInterface",
    selectable = ".spec.resource",
    selectable = ".spec.clusterIPPool",
    printcolumn = r#"{"name":"Resource","type":"string","jsonPath":".spec.resource"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.address"}"#,
    printcolumn = r#"{"name":"MAC","type":"string","jsonPath":".spec.mac"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIPSpec {
    /// Name of the owning ClusterIPPool
    #[serde(rename = "clusterIPPool")]
    pub cluster_ip_pool: String,

    /// Offset of `address` within the pool range
    #[serde(default)]
    pub index: u64,

    /// Assigned address (text form, no prefix length)
    pub address: String,

    /// Assigned MAC; empty while unbound
    #[serde(default)]
    pub mac: String,

    /// Interface name inside the workload; empty while unbound
    #[serde(default, rename = "containerInterface")]
    pub interface: String,

    /// Address family
    pub family: IpFamily,

    /// Workload key (`namespace/name`); empty while unbound
    #[serde(default)]
    pub resource: String,
}

/// Allocation time of the current binding and earlier bindings of this address.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIPStatus {
    /// Start of the current tenure; serialized as null once released
    #[serde(default)]
    pub allocated_at: Option<chrono::DateTime<chrono::Utc>>,

    /// Completed tenures, oldest first
    #[serde(default)]
    pub history: Vec<AllocationRecord>,
}

/// One completed tenure of a binding.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRecord {
    /// MAC the binding carried
    pub mac: String,

    /// Workload interface
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interface: String,

    /// Workload key
    pub resource: String,

    /// Tenure start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<chrono::DateTime<chrono::Utc>>,

    /// Tenure end
    pub released_at: chrono::DateTime<chrono::Utc>,
}

impl ClusterIPSpec {
    /// Whether the binding is currently held by a workload.
    pub fn is_bound(&self) -> bool {
        !self.mac.is_empty() && !self.resource.is_empty()
    }
}

impl ClusterIP {
    /// Object name for the binding that owns `index` in `pool`.
    pub fn object_name(pool: &str, index: u64) -> String {
        format!("{pool}-{index}")
    }

    /// Whether the binding is currently held by a workload.
    pub fn is_bound(&self) -> bool {
        self.spec.is_bound()
    }
}
