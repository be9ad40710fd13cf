//! Kubernetes resource watchers.
//!
//! Each watcher feeds events to the reconciler. Stream errors are logged and
//! the stream is polled again after a Fibonacci backoff; the watcher re-lists
//! on its own after an error.

use std::sync::Arc;

use crds::ClusterIPPool;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::core::DynamicObject;
use kube_runtime::watcher;
use tracing::{debug, error, info, warn};

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;
use crate::probes::{Readiness, WatchKind};
use crate::reconciler::Reconciler;

/// Only pods not launched for a VirtualMachine are watched.
const STANDALONE_POD_SELECTOR: &str = "!vm.kubevirt.io/name";

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    readiness: Arc<Readiness>,
    max_backoff_secs: u64,
}

fn name_of(meta: &ObjectMeta) -> String {
    match (meta.namespace.as_deref(), meta.name.as_deref()) {
        (Some(ns), Some(name)) => format!("{ns}/{name}"),
        (None, Some(name)) => name.to_string(),
        _ => "<unknown>".to_string(),
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(reconciler: Arc<Reconciler>, readiness: Arc<Readiness>, max_backoff_secs: u64) -> Self {
        Self {
            reconciler,
            readiness,
            max_backoff_secs,
        }
    }

    fn backoff(&self) -> FibonacciBackoff {
        FibonacciBackoff::new(1, self.max_backoff_secs)
    }

    /// Releases bindings of deleted VirtualMachines.
    pub async fn watch_virtual_machines(&self, api: Api<DynamicObject>) -> Result<(), ControllerError> {
        info!("Starting VirtualMachine watcher");
        let mut backoff = self.backoff();
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));

        loop {
            let event = match stream.try_next().await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!("VirtualMachine watch error, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            backoff.reset();

            match event {
                watcher::Event::Apply(vm) | watcher::Event::InitApply(vm) => {
                    if vm.metadata.deletion_timestamp.is_some() {
                        let name = name_of(&vm.metadata);
                        info!("VirtualMachine terminating: {}", name);
                        if let Err(e) = self.reconciler.reconcile_virtual_machine(&vm, false).await {
                            error!("Failed to release VirtualMachine {}: {}", name, e);
                        }
                    }
                }
                watcher::Event::Delete(vm) => {
                    let name = name_of(&vm.metadata);
                    info!("VirtualMachine deleted: {}", name);
                    if let Err(e) = self.reconciler.reconcile_virtual_machine(&vm, true).await {
                        error!("Failed to release VirtualMachine {}: {}", name, e);
                    }
                }
                watcher::Event::Init => {
                    debug!("VirtualMachine watcher initialized");
                }
                watcher::Event::InitDone => {
                    info!("VirtualMachine watcher initialization complete");
                    self.readiness.mark_synced(WatchKind::VirtualMachines);
                }
            }
        }

        Err(ControllerError::Watch("VirtualMachine stream ended".to_string()))
    }

    /// Releases bindings of interfaces hot-unplugged from running instances.
    pub async fn watch_virtual_machine_instances(&self, api: Api<DynamicObject>) -> Result<(), ControllerError> {
        info!("Starting VirtualMachineInstance watcher");
        let mut backoff = self.backoff();
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));

        loop {
            let event = match stream.try_next().await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!("VirtualMachineInstance watch error, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            backoff.reset();

            match event {
                watcher::Event::Apply(vmi) | watcher::Event::InitApply(vmi) => {
                    let name = name_of(&vmi.metadata);
                    match self.reconciler.reconcile_virtual_machine_instance(&vmi).await {
                        Ok(0) => {}
                        Ok(released) => info!("Released {} unplugged interface(s) of {}", released, name),
                        Err(e) => error!("Failed to reconcile VirtualMachineInstance {}: {}", name, e),
                    }
                }
                watcher::Event::Delete(_) => {}
                watcher::Event::Init => {
                    debug!("VirtualMachineInstance watcher initialized");
                }
                watcher::Event::InitDone => {
                    info!("VirtualMachineInstance watcher initialization complete");
                    self.readiness.mark_synced(WatchKind::VirtualMachineInstances);
                }
            }
        }

        Err(ControllerError::Watch("VirtualMachineInstance stream ended".to_string()))
    }

    /// Releases bindings of deleted standalone pods.
    pub async fn watch_pods(&self, api: Api<Pod>) -> Result<(), ControllerError> {
        info!("Starting Pod watcher");
        let mut backoff = self.backoff();
        let config = watcher::Config::default().labels(STANDALONE_POD_SELECTOR);
        let mut stream = Box::pin(watcher(api, config));

        loop {
            let event = match stream.try_next().await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!("Pod watch error, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            backoff.reset();

            match event {
                watcher::Event::Delete(pod) => {
                    let name = name_of(&pod.metadata);
                    debug!("Pod deleted: {}", name);
                    if let Err(e) = self.reconciler.reconcile_pod_deletion(&pod).await {
                        error!("Failed to release Pod {}: {}", name, e);
                    }
                }
                watcher::Event::InitDone => {
                    info!("Pod watcher initialization complete");
                    self.readiness.mark_synced(WatchKind::Pods);
                }
                watcher::Event::Apply(_) | watcher::Event::InitApply(_) | watcher::Event::Init => {}
            }
        }

        Err(ControllerError::Watch("Pod stream ended".to_string()))
    }

    /// Recounts pools on every change.
    pub async fn watch_pools(&self, api: Api<ClusterIPPool>) -> Result<(), ControllerError> {
        info!("Starting ClusterIPPool watcher");
        let mut backoff = self.backoff();
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));

        loop {
            let event = match stream.try_next().await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!("ClusterIPPool watch error, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            backoff.reset();

            match event {
                watcher::Event::Apply(pool) | watcher::Event::InitApply(pool) => {
                    let name = name_of(&pool.metadata);
                    debug!("ClusterIPPool applied: {}", name);
                    if let Err(e) = self.reconciler.reconcile_pool(&pool).await {
                        warn!("Failed to reconcile ClusterIPPool {}: {}", name, e);
                    }
                }
                watcher::Event::Delete(pool) => {
                    info!("ClusterIPPool deleted: {}", name_of(&pool.metadata));
                }
                watcher::Event::Init => {
                    debug!("ClusterIPPool watcher initialized");
                }
                watcher::Event::InitDone => {
                    info!("ClusterIPPool watcher initialization complete");
                    self.readiness.mark_synced(WatchKind::Pools);
                }
            }
        }

        Err(ControllerError::Watch("ClusterIPPool stream ended".to_string()))
    }
}
