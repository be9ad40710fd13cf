//! ADD/DEL pipelines.
//!
//! ADD: allocate (or find) the binding, create the device pair, attach the
//! host side to the switch, create the logical port. Only the logical port
//! step has a rollback (the switch port is removed again); earlier steps are
//! left in place for a retry or a later DEL to pick up.
//!
//! DEL removes the logical port, the switch port and the host-side device
//! independently. Addresses are released by the lifecycle controller, never
//! here, so a recreated pod keeps its binding.

use std::net::IpAddr;
use std::sync::Arc;

use cni_protocol::{CmdArgs, CniRequest, CniResponse, CniResult, Command, Interface, IpConfig, KubeArgs};
use crds::IpFamily;
use ipam::{Allocation, Allocator, AttachRequest};
use ipnetwork::IpNetwork;
use sdn::{DevicePairRequest, DeviceProvisioner, LogicalNetworkControl, SwitchControl, host_device_name};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::AttachError;

/// Logical port identifier of `interface` of pod `namespace/pod`.
pub fn port_id(namespace: &str, pod: &str, interface: &str) -> String {
    format!("{namespace}_{pod}_{interface}")
}

/// Static pipeline settings.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Integration bridge host devices join
    pub bridge: String,
    /// OVS interface type for host-side devices
    pub port_type: String,
    /// OVN logical switch workloads join
    pub logical_switch: String,
    /// Interface that receives addresses in the attach result
    pub primary_interface: String,
    pub mtu: u32,
    /// Address family requested from the allocator
    pub family: IpFamily,
}

impl From<&ServerConfig> for OrchestratorSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            bridge: config.bridge.clone(),
            port_type: config.port_type.clone(),
            logical_switch: config.logical_switch.clone(),
            primary_interface: config.primary_interface.clone(),
            mtu: config.mtu,
            family: IpFamily::V4,
        }
    }
}

/// Drives the allocator and the SDN backend for attach requests.
pub struct Orchestrator {
    allocator: Arc<Allocator>,
    switch: Arc<dyn SwitchControl>,
    network: Arc<dyn LogicalNetworkControl>,
    devices: Arc<dyn DeviceProvisioner>,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn pod_args(args: &CmdArgs) -> Result<KubeArgs, AttachError> {
    if args.if_name.is_empty() {
        return Err(AttachError::InvalidRequest("ifName is empty".to_string()));
    }
    Ok(args.args.parse::<KubeArgs>()?)
}

impl Orchestrator {
    /// Wires the allocator and SDN backends into an attach pipeline.
    pub fn new(
        allocator: Arc<Allocator>,
        switch: Arc<dyn SwitchControl>,
        network: Arc<dyn LogicalNetworkControl>,
        devices: Arc<dyn DeviceProvisioner>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            allocator,
            switch,
            network,
            devices,
            settings,
        }
    }

    /// Answers one request.
    pub async fn handle(&self, request: CniRequest) -> CniResponse {
        let outcome = match request.command() {
            Some(Command::Add) => self.add(&request.cmd_args).await.map(Some),
            Some(Command::Del) => self.del(&request.cmd_args).await.map(|()| None),
            None => Err(AttachError::UnknownCommand(request.cmd.clone())),
        };

        match outcome {
            Ok(result) => CniResponse::success(result),
            Err(e) => {
                error!(cmd = %request.cmd, if_name = %request.cmd_args.if_name, "Request failed: {}", e);
                CniResponse::failure(e.to_string())
            }
        }
    }

    /// ADD pipeline.
    pub async fn add(&self, args: &CmdArgs) -> Result<CniResult, AttachError> {
        let pod = pod_args(args)?;
        if args.netns.is_empty() {
            return Err(AttachError::InvalidRequest("netns is empty".to_string()));
        }
        let port_id = port_id(&pod.pod_namespace, &pod.pod_name, &args.if_name);
        info!(port_id, netns = %args.netns, "Attaching");

        let allocation = self
            .allocator
            .allocate_or_find(&AttachRequest {
                namespace: pod.pod_namespace.clone(),
                pod: pod.pod_name.clone(),
                interface: args.if_name.clone(),
                family: self.settings.family,
            })
            .await?;

        let pair = self
            .devices
            .create_device_pair(&DevicePairRequest {
                netns: args.netns.clone(),
                interface: args.if_name.clone(),
                host_name: host_device_name(&port_id),
                mac: allocation.mac().to_string(),
                mtu: self.settings.mtu,
            })
            .await
            .map_err(|source| AttachError::DevicePair {
                port_id: port_id.clone(),
                source,
            })?;

        self.switch
            .add_port(&self.settings.bridge, &pair.host.name, &self.settings.port_type, &port_id)
            .await
            .map_err(|source| AttachError::SwitchPort {
                port_id: port_id.clone(),
                source,
            })?;

        if let Err(source) = self
            .network
            .create_logical_port(&self.settings.logical_switch, &port_id, allocation.mac())
            .await
        {
            warn!(port_id, "Logical port creation failed, removing switch port {}", pair.host.name);
            if let Err(e) = self.switch.del_port(&self.settings.bridge, &pair.host.name).await {
                error!(port_id, "Switch port rollback failed: {}", e);
            }
            return Err(AttachError::LogicalPort { port_id, source });
        }

        let mut result = CniResult::new(vec![
            Interface {
                name: pair.host.name.clone(),
                mac: Some(pair.host.mac.clone()),
                sandbox: None,
            },
            Interface {
                name: pair.workload.name.clone(),
                mac: Some(allocation.mac().to_string()),
                sandbox: pair.workload.sandbox.clone(),
            },
        ]);
        if args.if_name == self.settings.primary_interface {
            result.ips.push(self.ip_config(&allocation, 1)?);
        }

        info!(
            port_id,
            address = %allocation.binding.spec.address,
            mac = %allocation.mac(),
            "Attached"
        );
        Ok(result)
    }

    fn ip_config(&self, allocation: &Allocation, interface: usize) -> Result<IpConfig, AttachError> {
        let address = allocation.address()?;
        let prefix = ipam::cidr::prefix_len(&allocation.pool.spec.cidr).map_err(ipam::IpamError::from)?;
        let address = IpNetwork::new(address, prefix)
            .map_err(|e| AttachError::InvalidRequest(format!("address {address}/{prefix}: {e}")))?;

        let gateway = allocation.pool.spec.gateway.as_deref().and_then(|gw| {
            gw.parse::<IpAddr>()
                .inspect_err(|e| warn!(gateway = gw, "Ignoring invalid pool gateway: {}", e))
                .ok()
        });

        Ok(IpConfig {
            interface: Some(interface),
            address,
            gateway,
        })
    }

    /// DEL pipeline. Every removal is attempted even if an earlier one fails.
    pub async fn del(&self, args: &CmdArgs) -> Result<(), AttachError> {
        let pod = pod_args(args)?;
        let port_id = port_id(&pod.pod_namespace, &pod.pod_name, &args.if_name);
        let host = host_device_name(&port_id);
        info!(port_id, "Detaching");

        let mut failures = Vec::new();
        if let Err(e) = self
            .network
            .delete_logical_port(&self.settings.logical_switch, &port_id)
            .await
        {
            warn!(port_id, "Deleting logical port failed: {}", e);
            failures.push(format!("logical port: {e}"));
        }
        if let Err(e) = self.switch.del_port(&self.settings.bridge, &host).await {
            warn!(port_id, "Deleting switch port {} failed: {}", host, e);
            failures.push(format!("switch port: {e}"));
        }
        if let Err(e) = self.devices.delete_device(&host).await {
            warn!(port_id, "Deleting device {} failed: {}", host, e);
            failures.push(format!("device: {e}"));
        }

        if failures.is_empty() {
            debug!(port_id, "Detached");
            Ok(())
        } else {
            Err(AttachError::Detach {
                port_id,
                failures: failures.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cmd_args, fixture};
    use ipam::IpamError;
    use sdn::mock::{CallKind, SdnCall};

    #[test]
    fn port_id_joins_with_underscores() {
        assert_eq!(port_id("ns", "pod", "eth0"), "ns_pod_eth0");
    }

    #[tokio::test]
    async fn add_runs_pipeline_in_order() {
        let f = fixture("10.0.0.0/24", Some("10.0.0.254"));
        let result = f.orchestrator.add(&cmd_args("eth0")).await.unwrap();

        let port = port_id("ns", "virt-launcher-vm1-x", "eth0");
        let host = host_device_name(&port);
        let calls = f.journal.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(&calls[0], SdnCall::CreateDevicePair(r) if r.host_name == host && r.mtu == 1500));
        assert_eq!(
            calls[1],
            SdnCall::AddPort {
                bridge: "br-int".to_string(),
                port: host.clone(),
                port_type: "system".to_string(),
                iface_id: port.clone(),
            }
        );
        assert!(matches!(&calls[2], SdnCall::CreateLogicalPort { network, port_id, .. }
            if network == "public" && *port_id == port));

        assert_eq!(result.interfaces.len(), 2);
        assert_eq!(result.interfaces[1].sandbox.as_deref(), Some("/var/run/netns/cni-1"));
        assert_eq!(result.ips.len(), 1);
        assert_eq!(result.ips[0].address.to_string(), "10.0.0.1/24");
        assert_eq!(result.ips[0].gateway, Some("10.0.0.254".parse().unwrap()));
        assert_eq!(result.ips[0].interface, Some(1));
    }

    #[tokio::test]
    async fn binding_mac_is_used_for_device_and_logical_port() {
        let f = fixture("10.0.0.0/24", None);
        f.orchestrator.add(&cmd_args("eth0")).await.unwrap();

        let binding = f.store.binding("v4-a-0").unwrap();
        let calls = f.journal.calls();
        assert!(matches!(&calls[0], SdnCall::CreateDevicePair(r) if r.mac == binding.spec.mac));
        assert!(matches!(&calls[2], SdnCall::CreateLogicalPort { mac, .. } if *mac == binding.spec.mac));
    }

    #[tokio::test]
    async fn secondary_interface_gets_no_addresses() {
        let f = fixture("10.0.0.0/24", None);
        let result = f.orchestrator.add(&cmd_args("eth1")).await.unwrap();
        assert!(result.ips.is_empty());
        assert_eq!(result.interfaces[1].name, "eth1");
    }

    #[tokio::test]
    async fn add_retry_reuses_binding() {
        let f = fixture("10.0.0.0/24", None);
        f.orchestrator.add(&cmd_args("eth0")).await.unwrap();
        let second = f.orchestrator.add(&cmd_args("eth0")).await.unwrap();

        assert_eq!(second.ips[0].address.to_string(), "10.0.0.1/24");
        assert_eq!(f.store.bindings().len(), 1);
    }

    #[tokio::test]
    async fn logical_port_failure_rolls_back_switch_port() {
        let f = fixture("10.0.0.0/24", None);
        f.journal.fail(CallKind::CreateLogicalPort);

        let err = f.orchestrator.add(&cmd_args("eth0")).await.unwrap_err();
        assert!(matches!(err, AttachError::LogicalPort { .. }));

        let host = host_device_name(&port_id("ns", "virt-launcher-vm1-x", "eth0"));
        let calls = f.journal.calls();
        assert_eq!(
            calls.last(),
            Some(&SdnCall::DelPort {
                bridge: "br-int".to_string(),
                port: host,
            })
        );
        // The binding survives for the retry
        assert!(f.store.binding("v4-a-0").unwrap().is_bound());
    }

    #[tokio::test]
    async fn switch_failure_is_not_rolled_back() {
        let f = fixture("10.0.0.0/24", None);
        f.journal.fail(CallKind::AddPort);

        let err = f.orchestrator.add(&cmd_args("eth0")).await.unwrap_err();
        assert!(matches!(err, AttachError::SwitchPort { .. }));
        assert!(f.journal.calls_of(CallKind::CreateLogicalPort).is_empty());
        assert!(f.journal.calls_of(CallKind::DelPort).is_empty());
    }

    #[tokio::test]
    async fn allocation_failure_has_no_side_effects() {
        let f = fixture("10.0.0.0/32", None);
        f.orchestrator.add(&cmd_args("eth0")).await.unwrap();
        let journal_len = f.journal.calls().len();

        let err = f.orchestrator.add(&cmd_args("eth1")).await.unwrap_err();
        assert!(matches!(err, AttachError::Ipam(IpamError::PoolExhausted(IpFamily::V4))));
        assert_eq!(f.journal.calls().len(), journal_len);
    }

    #[tokio::test]
    async fn unknown_pod_is_rejected() {
        let f = fixture("10.0.0.0/24", None);
        let mut args = cmd_args("eth0");
        args.args = "K8S_POD_NAMESPACE=ns;K8S_POD_NAME=ghost".to_string();

        let err = f.orchestrator.add(&args).await.unwrap_err();
        assert!(matches!(err, AttachError::Ipam(IpamError::WorkloadNotFound(_))));
        assert!(f.journal.calls().is_empty());
    }

    #[tokio::test]
    async fn del_removes_everything_best_effort() {
        let f = fixture("10.0.0.0/24", None);
        f.orchestrator.add(&cmd_args("eth0")).await.unwrap();
        f.journal.fail(CallKind::DeleteLogicalPort);

        let err = f.orchestrator.del(&cmd_args("eth0")).await.unwrap_err();
        assert!(matches!(err, AttachError::Detach { .. }));
        assert_eq!(f.journal.calls_of(CallKind::DelPort).len(), 1);
        assert_eq!(f.journal.calls_of(CallKind::DeleteDevice).len(), 1);
        // Addresses stay bound until the workload is deleted
        assert!(f.store.binding("v4-a-0").unwrap().is_bound());
    }

    #[tokio::test]
    async fn del_needs_no_store_access() {
        let f = fixture("10.0.0.0/24", None);
        f.store.set_unavailable(true);
        f.orchestrator.del(&cmd_args("eth0")).await.unwrap();
        assert_eq!(f.journal.calls().len(), 3);
    }

    #[tokio::test]
    async fn handle_reports_unknown_command_and_bad_args() {
        let f = fixture("10.0.0.0/24", None);

        let response = f
            .orchestrator
            .handle(CniRequest {
                cmd: "Check".to_string(),
                cmd_args: cmd_args("eth0"),
            })
            .await;
        assert!(response.error.contains("unknown command"));

        let mut args = cmd_args("eth0");
        args.args = "K8S_POD_NAMESPACE=ns".to_string();
        let response = f.orchestrator.handle(CniRequest::new(Command::Add, args)).await;
        assert!(response.error.contains("K8S_POD_NAME"));
        assert!(response.result.is_none());
    }
}
