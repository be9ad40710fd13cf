//! Open vSwitch port management through `ovs-vsctl`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::command::{CommandRunner, args};
use crate::control::SwitchControl;
use crate::error::SdnError;

const OVS_VSCTL: &str = "ovs-vsctl";

/// [`SwitchControl`] backed by the local Open vSwitch database.
pub struct OvsSwitch {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for OvsSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OvsSwitch").finish_non_exhaustive()
    }
}

impl OvsSwitch {
    /// Drives `ovs-vsctl` through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl SwitchControl for OvsSwitch {
    async fn add_port(&self, bridge: &str, port: &str, port_type: &str, iface_id: &str) -> Result<(), SdnError> {
        let mut argv = args(["--may-exist", "add-port", bridge, port, "--", "set", "Interface", port]);
        if !port_type.is_empty() {
            argv.push(format!("type={port_type}"));
        }
        argv.push(format!("external_ids:iface-id={iface_id}"));

        self.runner.run(OVS_VSCTL, &argv).await?;
        info!(bridge, port, iface_id, "Added switch port");
        Ok(())
    }

    async fn del_port(&self, bridge: &str, port: &str) -> Result<(), SdnError> {
        self.runner
            .run(OVS_VSCTL, &args(["--if-exists", "del-port", bridge, port]))
            .await?;
        debug!(bridge, port, "Removed switch port");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingRunner;

    #[tokio::test]
    async fn add_port_sets_type_and_iface_id() {
        let runner = Arc::new(RecordingRunner::new());
        let switch = OvsSwitch::new(runner.clone());

        switch.add_port("br-int", "veth0123abcd", "system", "ns_pod_eth0").await.unwrap();

        assert_eq!(
            runner.invocations(),
            vec![
                "ovs-vsctl --may-exist add-port br-int veth0123abcd -- set Interface veth0123abcd \
                 type=system external_ids:iface-id=ns_pod_eth0"
            ]
        );
    }

    #[tokio::test]
    async fn del_port_tolerates_missing_port() {
        let runner = Arc::new(RecordingRunner::new());
        let switch = OvsSwitch::new(runner.clone());

        switch.del_port("br-int", "veth0123abcd").await.unwrap();
        assert_eq!(
            runner.invocations(),
            vec!["ovs-vsctl --if-exists del-port br-int veth0123abcd"]
        );
    }

    #[tokio::test]
    async fn failure_is_propagated() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_matching("add-port", "database connection failed");
        let switch = OvsSwitch::new(runner);

        let err = switch.add_port("br-int", "p", "", "id").await.unwrap_err();
        assert!(matches!(err, SdnError::CommandFailed { stderr, .. } if stderr.contains("database")));
    }
}
