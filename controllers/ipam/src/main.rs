//! IPAM Controller
//!
//! Keeps the ClusterIP ledger in step with workload lifecycles:
//! - VirtualMachine deletion releases the VM's bindings
//! - interfaces hot-unplugged from a running VirtualMachineInstance release
//!   their bindings
//! - deletion of a pod not managed by a VM releases the pod's bindings
//! - ClusterIPPool changes refresh capacity and recount the pool counters

mod backoff;
mod config;
mod controller;
mod error;
mod probes;
mod reconciler;
mod watcher;

use config::ControllerConfig;
use controller::Controller;
use crate::error::ControllerError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting IPAM Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Probe address: {}", config.probe_addr);
    info!("  Store timeout: {:?}", config.store_timeout);
    info!("  Watch VirtualMachines: {}", config.watch_virtual_machines);

    let controller = Controller::new(&config).await?;
    controller.run().await?;

    Ok(())
}
