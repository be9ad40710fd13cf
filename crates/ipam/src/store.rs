//! Store seams for pools, bindings and workloads.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use crds::{ClusterIP, ClusterIPPool, IpFamily};

use crate::error::StoreError;

/// Label KubeVirt puts on a virt-launcher pod naming its VirtualMachine.
pub const KUBEVIRT_VM_LABEL: &str = "vm.kubevirt.io/name";

/// Stable identity of a workload: the VM name for virt-launcher pods,
/// otherwise the pod name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    /// Namespace
    pub namespace: String,
    /// VM or pod name
    pub name: String,
}

impl WorkloadKey {
    /// Key for an explicit namespace/name pair.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for pod `pod` carrying `labels`.
    pub fn for_pod(namespace: &str, pod: &str, labels: &BTreeMap<String, String>) -> Self {
        let name = labels
            .get(KUBEVIRT_VM_LABEL)
            .filter(|vm| !vm.is_empty())
            .map_or(pod, String::as_str);
        Self::new(namespace, name)
    }

    /// Parses the `namespace/name` form stored in bindings.
    pub fn parse(resource: &str) -> Option<Self> {
        let (namespace, name) = resource.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Equality filter over binding fields. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingQuery {
    /// `spec.family`
    pub family: Option<IpFamily>,
    /// `spec.containerInterface`
    pub interface: Option<String>,
    /// `spec.resource`
    pub resource: Option<String>,
    /// `spec.mac`
    pub mac: Option<String>,
    /// `spec.clusterIPPool`
    pub pool: Option<String>,
}

impl BindingQuery {
    /// Live binding of `interface` of `workload` in `family`.
    pub fn live(family: IpFamily, interface: &str, workload: &WorkloadKey) -> Self {
        Self {
            family: Some(family),
            interface: Some(interface.to_string()),
            resource: Some(workload.to_string()),
            ..Default::default()
        }
    }

    /// Bindings carrying `mac` in `family`.
    pub fn by_mac(mac: &str, family: IpFamily) -> Self {
        Self {
            family: Some(family),
            mac: Some(mac.to_string()),
            ..Default::default()
        }
    }

    /// Bindings held by `workload`.
    pub fn by_resource(workload: &WorkloadKey) -> Self {
        Self {
            resource: Some(workload.to_string()),
            ..Default::default()
        }
    }

    /// All bindings of pool `pool`.
    pub fn in_pool(pool: &str) -> Self {
        Self {
            pool: Some(pool.to_string()),
            ..Default::default()
        }
    }

    /// Whether `binding` satisfies every set field.
    pub fn matches(&self, binding: &ClusterIP) -> bool {
        let spec = &binding.spec;
        self.family.is_none_or(|f| spec.family == f)
            && self.interface.as_ref().is_none_or(|i| &spec.interface == i)
            && self.resource.as_ref().is_none_or(|r| &spec.resource == r)
            && self.mac.as_ref().is_none_or(|m| spec.mac.eq_ignore_ascii_case(m))
            && self.pool.as_ref().is_none_or(|p| &spec.cluster_ip_pool == p)
    }

    /// Kubernetes field selector for the set fields.
    pub fn field_selector(&self) -> String {
        let mut terms = Vec::new();
        if let Some(family) = self.family {
            terms.push(format!("spec.family={family}"));
        }
        if let Some(interface) = &self.interface {
            terms.push(format!("spec.containerInterface={interface}"));
        }
        if let Some(resource) = &self.resource {
            terms.push(format!("spec.resource={resource}"));
        }
        if let Some(mac) = &self.mac {
            terms.push(format!("spec.mac={mac}"));
        }
        if let Some(pool) = &self.pool {
            terms.push(format!("spec.clusterIPPool={pool}"));
        }
        terms.join(",")
    }
}

/// Persistence for pools and bindings.
///
/// Updates are compare-and-swap on the object's resource version and fail
/// with [`StoreError::Conflict`] when another writer got there first.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Pools of `family` in listing order.
    async fn list_pools(&self, family: IpFamily) -> Result<Vec<ClusterIPPool>, StoreError>;

    /// Pool by name.
    async fn get_pool(&self, name: &str) -> Result<ClusterIPPool, StoreError>;

    /// Writes `pool.status` if `pool` still carries the current resource version.
    async fn update_pool_status(&self, pool: &ClusterIPPool) -> Result<ClusterIPPool, StoreError>;

    /// Bindings matching `query`.
    async fn find_bindings(&self, query: &BindingQuery) -> Result<Vec<ClusterIP>, StoreError>;

    /// Binding by name.
    async fn get_binding(&self, name: &str) -> Result<ClusterIP, StoreError>;

    /// Creates `binding` with its status. Conflict if the name is taken.
    ///
    /// Spec and status may be separate writes; [`StoreError::StatusNotWritten`]
    /// means the spec write took effect and only the status was lost.
    async fn create_binding(&self, binding: &ClusterIP) -> Result<ClusterIP, StoreError>;

    /// Writes spec and status of `binding` if its resource version is current.
    ///
    /// Fails with [`StoreError::StatusNotWritten`] like `create_binding`.
    async fn update_binding(&self, binding: &ClusterIP) -> Result<ClusterIP, StoreError>;
}

/// Read access to the pods behind attach requests.
#[async_trait]
pub trait WorkloadDirectory: Send + Sync {
    /// Labels of pod `namespace/pod`, or `None` when the pod does not exist.
    async fn pod_labels(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError>;
}
