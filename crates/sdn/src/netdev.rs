//! veth pair provisioning with `ip` and `nsenter`.
//!
//! The host-side name is derived from the port identifier so detach can
//! find the device again without any stored state.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, args};
use crate::control::{DevicePair, DevicePairRequest, DeviceProvisioner, Link};
use crate::error::SdnError;

const IP: &str = "ip";
const NSENTER: &str = "nsenter";

/// Default MTU for workload interfaces.
pub const DEFAULT_MTU: u32 = 1500;

/// Host-side device name for logical port `port_id` (at most 15 bytes).
pub fn host_device_name(port_id: &str) -> String {
    let digest = Sha256::digest(port_id.as_bytes());
    format!(
        "veth{:02x}{:02x}{:02x}{:02x}",
        digest[0], digest[1], digest[2], digest[3]
    )
}

/// Temporary name of the workload side before it is moved and renamed.
fn peer_device_name(host_name: &str) -> String {
    format!("tmp{}", host_name.trim_start_matches("veth"))
}

/// Extracts the `link/ether` address from `ip -o link show` output.
pub fn parse_link_mac(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    words
        .by_ref()
        .find(|w| *w == "link/ether")
        .and_then(|_| words.next())
        .map(str::to_ascii_lowercase)
}

/// [`DeviceProvisioner`] creating veth pairs.
pub struct VethProvisioner {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for VethProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VethProvisioner").finish_non_exhaustive()
    }
}

impl VethProvisioner {
    /// Provisions devices with `ip` through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn in_netns(&self, netns: &str, ip_args: &[&str]) -> Result<String, SdnError> {
        let mut argv = vec![format!("--net={netns}"), IP.to_string()];
        argv.extend(ip_args.iter().map(|a| (*a).to_string()));
        self.runner.run(NSENTER, &argv).await
    }

    async fn link_mac(&self, netns: Option<&str>, name: &str) -> Result<String, SdnError> {
        let output = match netns {
            Some(ns) => self.in_netns(ns, &["-o", "link", "show", name]).await?,
            None => self.runner.run(IP, &args(["-o", "link", "show", name])).await?,
        };
        parse_link_mac(&output).ok_or_else(|| SdnError::UnexpectedOutput {
            program: IP.to_string(),
            output: output.trim().to_string(),
        })
    }
}

#[async_trait]
impl DeviceProvisioner for VethProvisioner {
    async fn create_device_pair(&self, request: &DevicePairRequest) -> Result<DevicePair, SdnError> {
        let host = request.host_name.as_str();
        let peer_name = peer_device_name(host);
        let peer = peer_name.as_str();
        let netns = request.netns.as_str();
        let interface = request.interface.as_str();
        let mtu_text = request.mtu.to_string();
        let mtu = mtu_text.as_str();

        if host.is_empty() || host.len() > 15 {
            return Err(SdnError::InvalidArgument(format!("invalid host device name {host:?}")));
        }

        // Left over from an earlier attempt for the same port
        self.delete_device(host).await?;

        self.runner
            .run(IP, &args(["link", "add", host, "mtu", mtu, "type", "veth", "peer", "name", peer, "mtu", mtu]))
            .await?;

        let configured = async {
            self.runner.run(IP, &args(["link", "set", peer, "netns", netns])).await?;
            self.in_netns(netns, &["link", "set", peer, "name", interface]).await?;
            self.in_netns(netns, &["link", "set", interface, "address", request.mac.as_str()]).await?;
            self.in_netns(netns, &["link", "set", interface, "up"]).await?;
            self.runner.run(IP, &args(["link", "set", host, "up"])).await?;
            Ok::<_, SdnError>(())
        }
        .await;

        if let Err(e) = configured {
            warn!(host, netns, "Configuring device pair failed, removing it: {}", e);
            if let Err(cleanup) = self.delete_device(host).await {
                warn!(host, "Removing half-configured device failed: {}", cleanup);
            }
            return Err(e);
        }

        let host_mac = self.link_mac(None, host).await?;
        let workload_mac = self.link_mac(Some(netns), interface).await?;
        info!(host, interface, netns, mac = %workload_mac, "Created device pair");

        Ok(DevicePair {
            host: Link {
                name: host.to_string(),
                mac: host_mac,
                sandbox: None,
            },
            workload: Link {
                name: interface.to_string(),
                mac: workload_mac,
                sandbox: Some(request.netns.clone()),
            },
        })
    }

    async fn delete_device(&self, name: &str) -> Result<(), SdnError> {
        match self.runner.run(IP, &args(["link", "del", name])).await {
            Ok(_) => {
                debug!(name, "Deleted device");
                Ok(())
            }
            Err(e) if e.is_missing_device() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
