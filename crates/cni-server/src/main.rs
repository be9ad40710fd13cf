//! Histack CNI server
//!
//! Runs on every node. Listens on a Unix socket for requests forwarded by
//! the `histack-cni` plugin binary, allocates addresses from ClusterIPPools
//! and attaches workload interfaces to OVS/OVN.

use std::sync::Arc;

use cni_server::{AttachError, CniServer, Orchestrator, OrchestratorSettings, ServerConfig};
use ipam::{Allocator, AllocatorConfig, KubeDirectory, KubeRepository};
use kube::Client;
use sdn::{CommandRunner, OvnNorthbound, OvsSwitch, ProcessRunner, VethProvisioner};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AttachError> {
    // kube's rustls-tls needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Histack CNI server");

    let config = ServerConfig::from_env()?;
    info!("Configuration:");
    info!("  Socket: {}", config.socket_path.display());
    info!("  Bridge: {} (port type {})", config.bridge, config.port_type);
    info!("  Logical switch: {}", config.logical_switch);
    info!("  OVN NB: {}", config.ovn_nb_address.as_deref().unwrap_or("local"));
    info!("  MAC prefix: {}", config.mac_prefix);
    info!("  Timeouts: request {:?}, store {:?}, command {:?}", config.request_timeout, config.store_timeout, config.command_timeout);

    let client = Client::try_default()
        .await
        .map_err(|e| AttachError::InvalidConfig(format!("failed to create Kubernetes client: {e}")))?;

    let allocator = Arc::new(Allocator::new(
        Arc::new(KubeRepository::new(Client::clone(&client), config.store_timeout)),
        Arc::new(KubeDirectory::new(client, config.store_timeout)),
        AllocatorConfig {
            mac_prefix: config.mac_prefix,
            ..AllocatorConfig::default()
        },
    ));

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(config.command_timeout));
    let orchestrator = Arc::new(Orchestrator::new(
        allocator,
        Arc::new(OvsSwitch::new(Arc::clone(&runner))),
        Arc::new(OvnNorthbound::new(Arc::clone(&runner), config.ovn_nb_address.clone())),
        Arc::new(VethProvisioner::new(runner)),
        OrchestratorSettings::from(&config),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let server = CniServer::new(orchestrator, config.max_connections, config.request_timeout);
    if let Err(e) = server.run(&config.socket_path, shutdown_rx).await {
        error!("CNI server failed: {}", e);
        return Err(e);
    }

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
