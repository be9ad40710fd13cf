//! Narrow interfaces to the switch, the logical network and local devices.

use async_trait::async_trait;

use crate::error::SdnError;

/// Local virtual switch.
#[async_trait]
pub trait SwitchControl: Send + Sync {
    /// Attaches device `port` to `bridge`, tagging it with logical port `iface_id`.
    async fn add_port(&self, bridge: &str, port: &str, port_type: &str, iface_id: &str) -> Result<(), SdnError>;

    /// Detaches `port` from `bridge`. Missing ports are not an error.
    async fn del_port(&self, bridge: &str, port: &str) -> Result<(), SdnError>;
}

/// SDN control plane.
#[async_trait]
pub trait LogicalNetworkControl: Send + Sync {
    /// Creates logical port `port_id` with address `mac` on logical switch `network`.
    async fn create_logical_port(&self, network: &str, port_id: &str, mac: &str) -> Result<(), SdnError>;

    /// Deletes logical port `port_id`. Missing ports are not an error.
    async fn delete_logical_port(&self, network: &str, port_id: &str) -> Result<(), SdnError>;
}

/// What to create for one workload interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePairRequest {
    /// Network namespace path of the workload
    pub netns: String,
    /// Interface name inside the workload
    pub interface: String,
    /// Host-side device name
    pub host_name: String,
    /// MAC for the workload side
    pub mac: String,
    /// Applied to both ends
    pub mtu: u32,
}

/// One end of a device pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Device name
    pub name: String,
    /// Hardware address as reported by the kernel
    pub mac: String,
    /// Namespace path for the workload side; `None` for the host side
    pub sandbox: Option<String>,
}

/// Both ends of a created device pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePair {
    /// End attached to the bridge
    pub host: Link,
    /// End moved into the workload namespace
    pub workload: Link,
}

/// Local device provisioning.
#[async_trait]
pub trait DeviceProvisioner: Send + Sync {
    /// Creates a device pair with the workload side inside `request.netns`.
    ///
    /// A stale host-side device left by an earlier attempt is replaced.
    async fn create_device_pair(&self, request: &DevicePairRequest) -> Result<DevicePair, SdnError>;

    /// Removes host-side device `name`. Missing devices are not an error.
    async fn delete_device(&self, name: &str) -> Result<(), SdnError>;
}
