//! Liveness and readiness endpoints.
//!
//! `/healthz` answers as long as the process serves HTTP; `/readyz` once
//! every watcher has completed its initial list.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ControllerError;

/// Watch streams whose initial list gates readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    /// kubevirt.io VirtualMachines
    VirtualMachines,
    /// kubevirt.io VirtualMachineInstances
    VirtualMachineInstances,
    /// Pods not launched for a VM
    Pods,
    /// ClusterIPPools
    Pools,
}

/// Initial-list completion per watch stream.
#[derive(Debug, Default)]
pub struct Readiness {
    virtual_machines: AtomicBool,
    virtual_machine_instances: AtomicBool,
    pods: AtomicBool,
    pools: AtomicBool,
}

impl Readiness {
    fn flag(&self, kind: WatchKind) -> &AtomicBool {
        match kind {
            WatchKind::VirtualMachines => &self.virtual_machines,
            WatchKind::VirtualMachineInstances => &self.virtual_machine_instances,
            WatchKind::Pods => &self.pods,
            WatchKind::Pools => &self.pools,
        }
    }

    /// Records that the initial list of `kind` completed.
    pub fn mark_synced(&self, kind: WatchKind) {
        self.flag(kind).store(true, Ordering::Release);
    }

    /// Whether every watch completed its initial list.
    pub fn is_ready(&self) -> bool {
        [
            WatchKind::VirtualMachines,
            WatchKind::VirtualMachineInstances,
            WatchKind::Pods,
            WatchKind::Pools,
        ]
            .into_iter()
            .all(|kind| self.flag(kind).load(Ordering::Acquire))
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(readiness): State<Arc<Readiness>>) -> StatusCode {
    if readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Probe routes with request tracing.
pub fn router(readiness: Arc<Readiness>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(readiness)
        .layer(TraceLayer::new_for_http())
}

/// Serves the probe endpoints on `addr` until the process exits.
pub async fn serve(addr: SocketAddr, readiness: Arc<Readiness>) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Probe endpoints listening on {}", listener.local_addr()?);
    axum::serve(listener, router(readiness)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn ready_once_all_watches_synced() {
        let readiness = Arc::new(Readiness::default());
        assert_eq!(healthz().await, StatusCode::OK);
        assert_eq!(readyz(State(Arc::clone(&readiness))).await, StatusCode::SERVICE_UNAVAILABLE);

        readiness.mark_synced(WatchKind::Pods);
        readiness.mark_synced(WatchKind::Pools);
        assert!(!readiness.is_ready());

        readiness.mark_synced(WatchKind::VirtualMachines);
        assert!(!readiness.is_ready());

        readiness.mark_synced(WatchKind::VirtualMachineInstances);
        assert_eq!(readyz(State(readiness)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn serves_http_probes() {
        let readiness = Arc::new(Readiness::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(readiness)).await });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /readyz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 503"), "{response}");
    }
}
