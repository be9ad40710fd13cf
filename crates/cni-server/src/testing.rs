//! Shared fixtures for unit tests.

use std::collections::BTreeSet;
use std::sync::Arc;

use cni_protocol::CmdArgs;
use crds::{ClusterIPPool, ClusterIPPoolSpec, ClusterIPPoolStatus, IpFamily};
use ipam::{Allocator, AllocatorConfig, MemoryDirectory, MemoryRepository};
use sdn::mock::{Journal, RecordingLogicalNetwork, RecordingProvisioner, RecordingSwitch};

use crate::config::ServerConfig;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};

pub(crate) const POD_ARGS: &str = "IgnoreUnknown=1;K8S_POD_NAMESPACE=ns;K8S_POD_NAME=virt-launcher-vm1-x";

pub(crate) struct Fixture {
    pub journal: Journal,
    pub store: MemoryRepository,
    pub orchestrator: Orchestrator,
}

/// One pool named "v4-a" and one VM pod `ns/virt-launcher-vm1-x` owned by `vm1`.
pub(crate) fn fixture(cidr: &str, gateway: Option<&str>) -> Fixture {
    let store = MemoryRepository::new();
    let mut pool = ClusterIPPool::new(
        "v4-a",
        ClusterIPPoolSpec {
            ip_family: IpFamily::V4,
            cidr: cidr.to_string(),
            gateway: gateway.map(str::to_string),
        },
    );
    let mut status = ClusterIPPoolStatus::default();
    let total = ipam::cidr::usable_addresses(&ipam::cidr::parse(cidr).unwrap());
    ipam::ledger::recount(&mut status, total, &BTreeSet::new());
    pool.status = Some(status);
    store.add_pool(pool);

    let directory = MemoryDirectory::new();
    directory.add_vm_pod("ns", "virt-launcher-vm1-x", "vm1");

    let allocator = Arc::new(Allocator::new(
        Arc::new(store.clone()),
        Arc::new(directory),
        AllocatorConfig::default(),
    ));
    let journal = Journal::new();
    let orchestrator = Orchestrator::new(
        allocator,
        Arc::new(RecordingSwitch::new(journal.clone())),
        Arc::new(RecordingLogicalNetwork::new(journal.clone())),
        Arc::new(RecordingProvisioner::new(journal.clone())),
        OrchestratorSettings::from(&ServerConfig::default()),
    );
    Fixture {
        journal,
        store,
        orchestrator,
    }
}

pub(crate) fn cmd_args(if_name: &str) -> CmdArgs {
    CmdArgs {
        workload_id: "abc".to_string(),
        netns: "/var/run/netns/cni-1".to_string(),
        if_name: if_name.to_string(),
        args: POD_ARGS.to_string(),
        path: "/opt/cni/bin".to_string(),
    }
}
