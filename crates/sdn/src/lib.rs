//! SDN backend for workload attachment
//!
//! Narrow traits for the three side effects of attaching a workload
//! interface, with implementations that drive the node's tooling:
//!
//! - [`SwitchControl`]: Open vSwitch ports (`ovs-vsctl`)
//! - [`LogicalNetworkControl`]: OVN logical switch ports (`ovn-nbctl`)
//! - [`DeviceProvisioner`]: veth pairs (`ip`, `nsenter`)
//!
//! Every command runs under a deadline (see [`ProcessRunner`]).

pub mod command;
pub mod control;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod netdev;
pub mod ovn;
pub mod ovs;

pub use command::{CommandRunner, DEFAULT_COMMAND_TIMEOUT, ProcessRunner};
pub use control::{DevicePair, DevicePairRequest, DeviceProvisioner, Link, LogicalNetworkControl, SwitchControl};
pub use error::SdnError;
pub use netdev::{DEFAULT_MTU, VethProvisioner, host_device_name};
pub use ovn::OvnNorthbound;
pub use ovs::OvsSwitch;
