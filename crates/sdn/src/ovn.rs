//! OVN logical switch ports through `ovn-nbctl`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::command::{CommandRunner, args};
use crate::control::LogicalNetworkControl;
use crate::error::SdnError;

const OVN_NBCTL: &str = "ovn-nbctl";

/// [`LogicalNetworkControl`] backed by the OVN northbound database.
pub struct OvnNorthbound {
    runner: Arc<dyn CommandRunner>,
    /// `--db` target, e.g. "tcp:10.0.0.10:6641"; local socket when `None`
    database: Option<String>,
}

impl std::fmt::Debug for OvnNorthbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OvnNorthbound")
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl OvnNorthbound {
    /// `database` is passed as `--db`; the local socket is used when `None`.
    pub fn new(runner: Arc<dyn CommandRunner>, database: Option<String>) -> Self {
        Self {
            runner,
            database: database.filter(|d| !d.is_empty()),
        }
    }

    fn command<const N: usize>(&self, parts: [&str; N]) -> Vec<String> {
        let mut argv = Vec::with_capacity(N + 1);
        if let Some(db) = &self.database {
            argv.push(format!("--db={db}"));
        }
        argv.extend(args(parts));
        argv
    }
}

#[async_trait]
impl LogicalNetworkControl for OvnNorthbound {
    async fn create_logical_port(&self, network: &str, port_id: &str, mac: &str) -> Result<(), SdnError> {
        if mac.is_empty() {
            return Err(SdnError::InvalidArgument(format!("logical port {port_id} needs a MAC")));
        }
        let argv = self.command([
            "--may-exist",
            "lsp-add",
            network,
            port_id,
            "--",
            "lsp-set-addresses",
            port_id,
            mac,
        ]);
        self.runner.run(OVN_NBCTL, &argv).await?;
        info!(network, port_id, mac, "Created logical port");
        Ok(())
    }

    async fn delete_logical_port(&self, network: &str, port_id: &str) -> Result<(), SdnError> {
        self.runner
            .run(OVN_NBCTL, &self.command(["--if-exists", "lsp-del", port_id]))
            .await?;
        debug!(network, port_id, "Deleted logical port");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingRunner;

    #[tokio::test]
    async fn create_sets_mac_address() {
        let runner = Arc::new(RecordingRunner::new());
        let ovn = OvnNorthbound::new(runner.clone(), Some("tcp:10.0.0.10:6641".to_string()));

        ovn.create_logical_port("public", "ns_pod_eth0", "02:11:22:33:44:55").await.unwrap();

        assert_eq!(
            runner.invocations(),
            vec![
                "ovn-nbctl --db=tcp:10.0.0.10:6641 --may-exist lsp-add public ns_pod_eth0 \
                 -- lsp-set-addresses ns_pod_eth0 02:11:22:33:44:55"
            ]
        );
    }

    #[tokio::test]
    async fn delete_uses_local_socket_without_database() {
        let runner = Arc::new(RecordingRunner::new());
        let ovn = OvnNorthbound::new(runner.clone(), Some(String::new()));

        ovn.delete_logical_port("public", "ns_pod_eth0").await.unwrap();
        assert_eq!(runner.invocations(), vec!["ovn-nbctl --if-exists lsp-del ns_pod_eth0"]);
    }

    #[tokio::test]
    async fn rejects_empty_mac() {
        let runner = Arc::new(RecordingRunner::new());
        let ovn = OvnNorthbound::new(runner.clone(), None);
        assert!(ovn.create_logical_port("public", "id", "").await.is_err());
        assert!(runner.invocations().is_empty());
    }
}
