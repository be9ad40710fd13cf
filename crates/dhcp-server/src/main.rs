//! Histack DHCP responder
//!
//! Hands guests the address bound to their MAC. Configuration comes from
//! `DHCP_*` environment variables (see [`DhcpConfig`]).

use std::sync::Arc;

use dhcp_server::{AllocatorLookup, DhcpConfig, DhcpError, DhcpServer, Responder};
use ipam::{Allocator, AllocatorConfig, KubeDirectory, KubeRepository};
use kube::Client;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), DhcpError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Histack DHCP responder");

    let config = DhcpConfig::from_env()?;
    info!("Configuration:");
    info!("  Listen: {}", config.listen);
    info!("  Server identifier: {}", config.server_address);
    info!("  MAC prefix: {}", config.mac_prefix);
    info!("  DNS servers: {:?}", config.dns_servers);

    let client = Client::try_default().await?;
    let allocator = Arc::new(Allocator::new(
        Arc::new(KubeRepository::new(Client::clone(&client), config.lookup_timeout)),
        Arc::new(KubeDirectory::new(client, config.lookup_timeout)),
        AllocatorConfig {
            mac_prefix: config.mac_prefix,
            ..AllocatorConfig::default()
        },
    ));

    let lookup = Arc::new(AllocatorLookup::new(allocator, config.gateway));
    let server = DhcpServer::new(
        Arc::new(Responder::new(lookup, config.clone())),
        config.listen,
        config.max_in_flight,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await
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
