//! Reconciliation logic.
//!
//! Workload deletions release bindings; pool events refresh capacity and
//! recount the pool counters from the live-binding set. Running
//! VirtualMachineInstances release the bindings of unplugged interfaces.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crds::ClusterIPPool;
use ipam::{Allocator, IpamError, KUBEVIRT_VM_LABEL, WorkloadKey};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::core::DynamicObject;
use tracing::{debug, info, warn};

use crate::error::ControllerError;

/// Condition reason set on pools whose CIDR cannot be parsed.
pub const INVALID_CIDR_REASON: &str = "InvalidCIDR";

/// Converts an API timestamp without depending on its inner representation.
fn to_utc(time: &Time) -> Option<DateTime<Utc>> {
    let raw = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(raw.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn workload_key(meta: &ObjectMeta) -> Option<WorkloadKey> {
    Some(WorkloadKey::new(meta.namespace.as_deref()?, meta.name.as_deref()?))
}

/// Phase in which a VirtualMachineInstance reports its full interface list.
const VMI_RUNNING_PHASE: &str = "Running";

/// MACs reported in `status.interfaces` of a running VirtualMachineInstance.
///
/// `None` while the instance is not running or reports no MACs, since an
/// empty list then says nothing about unplugged interfaces.
pub fn reported_macs(vmi: &DynamicObject) -> Option<BTreeSet<String>> {
    let status = vmi.data.get("status")?;
    if status.get("phase").and_then(|p| p.as_str()) != Some(VMI_RUNNING_PHASE) {
        return None;
    }
    let macs: BTreeSet<String> = status
        .get("interfaces")?
        .as_array()?
        .iter()
        .filter_map(|iface| iface.get("mac").and_then(|m| m.as_str()))
        .filter(|mac| !mac.is_empty())
        .map(ipam::mac::normalize_mac)
        .collect();
    (!macs.is_empty()).then_some(macs)
}

/// Key of a pod that is not a VM launcher pod; VM pods are released
/// through their VirtualMachine.
pub fn standalone_pod_key(pod: &Pod) -> Option<WorkloadKey> {
    let managed = pod
        .metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.contains_key(KUBEVIRT_VM_LABEL));
    if managed {
        return None;
    }
    workload_key(&pod.metadata)
}

/// Reconciles workload lifecycle events and pools against the ledger.
pub struct Reconciler {
    allocator: Arc<Allocator>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self { allocator }
    }

    /// A VirtualMachine was deleted (`deleted`) or is being deleted.
    ///
    /// Objects without a deletion timestamp are only released when the
    /// delete event itself arrives; the event time is used then.
    pub async fn reconcile_virtual_machine(&self, vm: &DynamicObject, deleted: bool) -> Result<usize, ControllerError> {
        let Some(key) = workload_key(&vm.metadata) else {
            warn!("VirtualMachine without namespace/name, skipping");
            return Ok(0);
        };
        let released_at = match vm.metadata.deletion_timestamp.as_ref().and_then(to_utc) {
            Some(at) => at,
            None if deleted => Utc::now(),
            None => return Ok(0),
        };

        debug!(workload = %key, "VirtualMachine deleted at {}", released_at);
        Ok(self.allocator.release(&key, released_at).await?)
    }

    /// A VirtualMachineInstance changed: bindings of the VM whose MAC the
    /// instance no longer reports were hot-unplugged and are released.
    pub async fn reconcile_virtual_machine_instance(&self, vmi: &DynamicObject) -> Result<usize, ControllerError> {
        if vmi.metadata.deletion_timestamp.is_some() {
            return Ok(0);
        }
        let Some(key) = workload_key(&vmi.metadata) else {
            warn!("VirtualMachineInstance without namespace/name, skipping");
            return Ok(0);
        };
        let Some(macs) = reported_macs(vmi) else {
            debug!(workload = %key, "VirtualMachineInstance reports no interfaces yet");
            return Ok(0);
        };
        Ok(self.allocator.release_unplugged(&key, &macs, Utc::now()).await?)
    }

    /// A pod was deleted.
    pub async fn reconcile_pod_deletion(&self, pod: &Pod) -> Result<usize, ControllerError> {
        let Some(key) = standalone_pod_key(pod) else {
            return Ok(0);
        };
        let released_at = pod
            .metadata
            .deletion_timestamp
            .as_ref()
            .and_then(to_utc)
            .unwrap_or_else(Utc::now);
        Ok(self.allocator.release(&key, released_at).await?)
    }

    /// Refreshes capacity and counters of `pool`, or marks it unready when
    /// its CIDR is invalid.
    pub async fn reconcile_pool(&self, pool: &ClusterIPPool) -> Result<(), ControllerError> {
        let name = pool
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidConfig("ClusterIPPool missing name".to_string()))?;

        match self.allocator.recount_pool(name).await {
            Ok(_) => Ok(()),
            Err(IpamError::Cidr(e)) => {
                info!(pool = name, "Pool has an invalid CIDR: {}", e);
                self.allocator
                    .mark_pool_unready(name, INVALID_CIDR_REASON, &e.to_string())
                    .await?;
                Ok(())
            }
            Err(IpamError::Store(ipam::StoreError::NotFound(_))) => {
                debug!(pool = name, "Pool deleted before reconciliation");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{ClusterIPPoolSpec, IpFamily};
    use ipam::{AllocatorConfig, AttachRequest, MemoryDirectory, MemoryRepository};
    use kube::core::{ApiResource, GroupVersionKind};
    use std::collections::BTreeMap;

    struct Fixture {
        store: MemoryRepository,
        allocator: Arc<Allocator>,
        reconciler: Reconciler,
    }

    fn fixture(cidr: &str) -> Fixture {
        let store = MemoryRepository::new();
        store.add_pool(ClusterIPPool::new(
            "v4-a",
            ClusterIPPoolSpec {
                ip_family: IpFamily::V4,
                cidr: cidr.to_string(),
                gateway: None,
            },
        ));
        let directory = MemoryDirectory::new();
        directory.add_vm_pod("ns", "virt-launcher-vm1-abc", "vm1");
        directory.add_pod("ns", "plain");

        let allocator = Arc::new(Allocator::new(
            Arc::new(store.clone()),
            Arc::new(directory),
            AllocatorConfig::default(),
        ));
        Fixture {
            store,
            reconciler: Reconciler::new(Arc::clone(&allocator)),
            allocator,
        }
    }

    async fn attach(f: &Fixture, pod: &str) {
        attach_interface(f, pod, "eth0").await;
    }

    async fn attach_interface(f: &Fixture, pod: &str, interface: &str) -> String {
        f.allocator
            .allocate_or_find(&AttachRequest {
                namespace: "ns".to_string(),
                pod: pod.to_string(),
                interface: interface.to_string(),
                family: IpFamily::V4,
            })
            .await
            .unwrap()
            .mac()
            .to_string()
    }

    fn vmi(phase: &str, macs: &[&str]) -> DynamicObject {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachineInstance"));
        let interfaces: Vec<_> = macs
            .iter()
            .enumerate()
            .map(|(i, mac)| serde_json::json!({ "name": format!("net{i}"), "mac": mac }))
            .collect();
        DynamicObject::new("vm1", &resource)
            .within("ns")
            .data(serde_json::json!({ "status": { "phase": phase, "interfaces": interfaces } }))
    }

    fn vm(deletion: Option<&str>) -> DynamicObject {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachine"));
        let mut vm = DynamicObject::new("vm1", &resource).within("ns");
        vm.metadata.deletion_timestamp =
            deletion.map(|ts| serde_json::from_value(serde_json::Value::String(ts.to_string())).unwrap());
        vm
    }

    fn pod(name: &str, vm: Option<&str>) -> Pod {
        let labels = vm.map(|vm| BTreeMap::from([(KUBEVIRT_VM_LABEL.to_string(), vm.to_string())]));
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                labels,
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    #[tokio::test]
    async fn pool_reconcile_initialises_counters() {
        let f = fixture("10.0.0.0/29");
        f.reconciler.reconcile_pool(&f.store.pool("v4-a").unwrap()).await.unwrap();

        let status = f.store.pool("v4-a").unwrap().status.unwrap();
        assert_eq!(status.total_ips, 6);
        assert_eq!(status.free_ips, 6);
        assert_eq!(status.conditions[0].status, "True");
    }

    #[tokio::test]
    async fn invalid_cidr_marks_pool_unready() {
        let f = fixture("10.0.0.0/99");
        f.reconciler.reconcile_pool(&f.store.pool("v4-a").unwrap()).await.unwrap();

        let status = f.store.pool("v4-a").unwrap().status.unwrap();
        assert_eq!(status.conditions[0].status, "False");
        assert_eq!(status.conditions[0].reason, INVALID_CIDR_REASON);
    }

    #[tokio::test]
    async fn deleting_vm_releases_its_bindings() {
        let f = fixture("10.0.0.0/29");
        f.reconciler.reconcile_pool(&f.store.pool("v4-a").unwrap()).await.unwrap();
        attach(&f, "virt-launcher-vm1-abc").await;

        let released = f
            .reconciler
            .reconcile_virtual_machine(&vm(Some("2025-06-01T12:00:00Z")), false)
            .await
            .unwrap();
        assert_eq!(released, 1);

        let binding = f.store.binding("v4-a-0").unwrap();
        assert!(!binding.is_bound());
        let history = binding.status.unwrap().history;
        assert_eq!(history[0].resource, "ns/vm1");
        assert_eq!(history[0].released_at.to_rfc3339(), "2025-06-01T12:00:00+00:00");

        let status = f.store.pool("v4-a").unwrap().status.unwrap();
        assert_eq!(status.free_ips, 6);
        assert_eq!(status.released_indexes, vec![0]);
    }

    #[tokio::test]
    async fn running_vm_is_left_alone() {
        let f = fixture("10.0.0.0/29");
        f.reconciler.reconcile_pool(&f.store.pool("v4-a").unwrap()).await.unwrap();
        attach(&f, "virt-launcher-vm1-abc").await;

        let released = f.reconciler.reconcile_virtual_machine(&vm(None), false).await.unwrap();
        assert_eq!(released, 0);
        assert!(f.store.binding("v4-a-0").unwrap().is_bound());

        let released = f.reconciler.reconcile_virtual_machine(&vm(None), true).await.unwrap();
        assert_eq!(released, 1);
    }

    #[tokio::test]
    async fn only_standalone_pods_release_on_deletion() {
        let f = fixture("10.0.0.0/29");
        f.reconciler.reconcile_pool(&f.store.pool("v4-a").unwrap()).await.unwrap();
        attach(&f, "virt-launcher-vm1-abc").await;
        attach(&f, "plain").await;

        let released = f
            .reconciler
            .reconcile_pod_deletion(&pod("virt-launcher-vm1-abc", Some("vm1")))
            .await
            .unwrap();
        assert_eq!(released, 0);

        let released = f.reconciler.reconcile_pod_deletion(&pod("plain", None)).await.unwrap();
        assert_eq!(released, 1);
        assert!(f.store.binding("v4-a-0").unwrap().is_bound());
        assert!(!f.store.binding("v4-a-1").unwrap().is_bound());
    }

    #[tokio::test]
    async fn recount_repairs_drifted_counters() {
        let f = fixture("10.0.0.0/29");
        f.reconciler.reconcile_pool(&f.store.pool("v4-a").unwrap()).await.unwrap();
        attach(&f, "plain").await;

        let mut drifted = f.store.pool("v4-a").unwrap();
        if let Some(status) = drifted.status.as_mut() {
            status.free_ips = 6;
            status.allocated_ips = 0;
        }
        f.store.add_pool(drifted);

        f.reconciler.reconcile_pool(&f.store.pool("v4-a").unwrap()).await.unwrap();
        let status = f.store.pool("v4-a").unwrap().status.unwrap();
        assert_eq!(status.allocated_ips, 1);
        assert_eq!(status.free_ips, 5);
    }

    #[tokio::test]
    async fn unplugged_interface_is_released() {
        let f = fixture("10.0.0.0/29");
        f.reconciler.reconcile_pool(&f.store.pool("v4-a").unwrap()).await.unwrap();
        let eth0 = attach_interface(&f, "virt-launcher-vm1-abc", "eth0").await;
        attach_interface(&f, "virt-launcher-vm1-abc", "eth1").await;

        let reported = eth0.to_ascii_uppercase();
        let released = f
            .reconciler
            .reconcile_virtual_machine_instance(&vmi("Running", &[&reported]))
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert!(f.store.binding("v4-a-0").unwrap().is_bound());
        assert!(!f.store.binding("v4-a-1").unwrap().is_bound());

        let status = f.store.pool("v4-a").unwrap().status.unwrap();
        assert_eq!(status.allocated_ips, 1);
        assert_eq!(status.released_indexes, vec![1]);
    }

    #[tokio::test]
    async fn instance_without_interfaces_releases_nothing() {
        let f = fixture("10.0.0.0/29");
        f.reconciler.reconcile_pool(&f.store.pool("v4-a").unwrap()).await.unwrap();
        let eth0 = attach_interface(&f, "virt-launcher-vm1-abc", "eth0").await;

        let pending = f.reconciler.reconcile_virtual_machine_instance(&vmi("Scheduling", &[])).await.unwrap();
        assert_eq!(pending, 0);
        let empty = f.reconciler.reconcile_virtual_machine_instance(&vmi("Running", &[])).await.unwrap();
        assert_eq!(empty, 0);
        let booting = f.reconciler.reconcile_virtual_machine_instance(&vmi("Scheduled", &[&eth0])).await.unwrap();
        assert_eq!(booting, 0);
        assert!(f.store.binding("v4-a-0").unwrap().is_bound());
    }
}
