//! Main controller implementation.
//!
//! Spawns the watchers and the probe server and runs until one of them exits.

use std::sync::Arc;

use crds::ClusterIPPool;
use ipam::{Allocator, AllocatorConfig, KubeDirectory, KubeRepository};
use k8s_openapi::api::core::v1::Pod;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::probes::{self, Readiness, WatchKind};
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;

type Task = JoinHandle<Result<(), ControllerError>>;

/// Main controller for binding lifecycle and pool bookkeeping.
pub struct Controller {
    vm_watcher: Option<Task>,
    vmi_watcher: Option<Task>,
    pod_watcher: Task,
    pool_watcher: Task,
    probe_server: Task,
}

async fn join(name: &str, task: &mut Task) -> Result<(), ControllerError> {
    task.await
        .map_err(|e| ControllerError::Watch(format!("{name} panicked: {e}")))??;
    Err(ControllerError::Watch(format!("{name} exited")))
}

/// Like [`join`], but never completes for a task that was not started.
async fn join_optional(name: &str, task: Option<Task>) -> Result<(), ControllerError> {
    match task {
        Some(mut task) => join(name, &mut task).await,
        None => std::future::pending().await,
    }
}

fn kubevirt_resource(kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("kubevirt.io", "v1", kind))
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: &ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing IPAM Controller");

        let client = Client::try_default().await?;

        // Releases never allocate, so the default MAC prefix is irrelevant here
        let allocator = Arc::new(Allocator::new(
            Arc::new(KubeRepository::new(Client::clone(&client), config.store_timeout)),
            Arc::new(KubeDirectory::new(Client::clone(&client), config.store_timeout)),
            AllocatorConfig::default(),
        ));
        let reconciler = Arc::new(Reconciler::new(allocator));
        let readiness = Arc::new(Readiness::default());
        let watcher = Arc::new(Watcher::new(reconciler, Arc::clone(&readiness), config.max_backoff_secs));

        let (vm_watcher, vmi_watcher) = if config.watch_virtual_machines {
            let vms: Api<DynamicObject> = Api::all_with(Client::clone(&client), &kubevirt_resource("VirtualMachine"));
            let vmis: Api<DynamicObject> =
                Api::all_with(Client::clone(&client), &kubevirt_resource("VirtualMachineInstance"));
            let vm_watcher = {
                let watcher = Arc::clone(&watcher);
                tokio::spawn(async move { watcher.watch_virtual_machines(vms).await })
            };
            let vmi_watcher = {
                let watcher = Arc::clone(&watcher);
                tokio::spawn(async move { watcher.watch_virtual_machine_instances(vmis).await })
            };
            (Some(vm_watcher), Some(vmi_watcher))
        } else {
            info!("VirtualMachine watching disabled");
            readiness.mark_synced(WatchKind::VirtualMachines);
            readiness.mark_synced(WatchKind::VirtualMachineInstances);
            (None, None)
        };

        let pods: Api<Pod> = Api::all(Client::clone(&client));
        let pod_watcher = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.watch_pods(pods).await })
        };

        let pools: Api<ClusterIPPool> = Api::all(client);
        let pool_watcher = tokio::spawn(async move { watcher.watch_pools(pools).await });

        let probe_server = tokio::spawn(probes::serve(config.probe_addr, readiness));

        Ok(Self {
            vm_watcher,
            vmi_watcher,
            pod_watcher,
            pool_watcher,
            probe_server,
        })
    }

    /// Runs the controller until a watcher or the probe server stops.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("IPAM Controller running");

        let Self {
            vm_watcher,
            vmi_watcher,
            mut pod_watcher,
            mut pool_watcher,
            mut probe_server,
        } = self;

        tokio::select! {
            result = join_optional("VirtualMachine watcher", vm_watcher) => result,
            result = join_optional("VirtualMachineInstance watcher", vmi_watcher) => result,
            result = join("Pod watcher", &mut pod_watcher) => result,
            result = join("ClusterIPPool watcher", &mut pool_watcher) => result,
            result = join("Probe server", &mut probe_server) => result,
        }
    }
}
