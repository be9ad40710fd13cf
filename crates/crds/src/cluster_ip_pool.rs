//! ClusterIPPool CRD
//!
//! Defines cluster-wide address pools and their allocation bookkeeping.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::family::IpFamily;

/// A range of addresses handed out by index.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "ipam.histack.ir",
    version = "v1alpha1",
    kind = "ClusterIPPool",
    status = "ClusterIPPoolStatus",
    selectable = ".spec.ipFamily",
    printcolumn = r#"{"name":"Family","type":"string","jsonPath":".spec.ipFamily"}"#,
    printcolumn = r#"{"name":"CIDR","type":"string","jsonPath":".spec.cidr"}"#,
    printcolumn = r#"{"name":"Free","type":"integer","jsonPath":".status.freeIPs"}"#,
    printcolumn = r#"{"name":"Allocated","type":"integer","jsonPath":".status.allocatedIPs"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIPPoolSpec {
    /// Address family served by this pool
    pub ip_family: IpFamily,

    /// Address range in CIDR notation (e.g. "10.10.0.0/24")
    pub cidr: String,

    /// Gateway handed to primary interfaces attached from this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Capacity counters and the index free list.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIPPoolStatus {
    /// Usable addresses in the range
    #[serde(default, rename = "totalIPs")]
    pub total_ips: u64,

    /// Addresses currently bound to a workload
    #[serde(default, rename = "allocatedIPs")]
    pub allocated_ips: u64,

    /// Addresses available for allocation
    #[serde(default, rename = "freeIPs")]
    pub free_ips: u64,

    /// First index never handed out (high-water mark, at most `totalIPs`)
    #[serde(default)]
    pub next_index: u64,

    /// Previously assigned, now free indexes, reused oldest first
    ///
    /// Always serialized so a merge patch can empty it.
    #[serde(default)]
    pub released_indexes: Vec<u64>,

    /// Pool conditions (e.g. `Ready`)
    #[serde(default)]
    pub conditions: Vec<PoolCondition>,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,
}

/// Condition reported on a pool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolCondition {
    /// Condition type, e.g. "Ready"
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False" or "Unknown"
    pub status: String,

    /// Machine readable reason
    pub reason: String,

    /// Human readable message
    #[serde(default)]
    pub message: String,
}

impl ClusterIPPoolStatus {
    /// Sets `condition`, replacing any existing condition of the same type.
    pub fn set_condition(&mut self, condition: PoolCondition) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}

impl ClusterIPPool {
    /// Returns the pool status, or an empty one if the pool was never reconciled.
    pub fn status_or_default(&self) -> ClusterIPPoolStatus {
        self.status.clone().unwrap_or_default()
    }
}
