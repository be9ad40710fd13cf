//! Server configuration from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use cni_protocol::DEFAULT_SOCKET_PATH;
use ipam::MacPrefix;
use sdn::DEFAULT_MTU;

use crate::error::AttachError;

/// Attachment server settings, read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unix socket the plugin connects to
    pub socket_path: PathBuf,
    /// Integration bridge
    pub bridge: String,
    /// OVS interface type for host-side devices
    pub port_type: String,
    /// OVN logical switch workloads join
    pub logical_switch: String,
    /// OVN northbound database (`--db`), local socket when unset
    pub ovn_nb_address: Option<String>,
    /// Leading MAC byte for derived addresses
    pub mac_prefix: MacPrefix,
    /// Interface that receives addresses in the attach result
    pub primary_interface: String,
    /// MTU applied to both ends of the device pair
    pub mtu: u32,
    /// Connections handled concurrently
    pub max_connections: usize,
    /// Deadline for one whole attach/detach pipeline
    pub request_timeout: Duration,
    /// Deadline for one cluster store call
    pub store_timeout: Duration,
    /// Deadline for one ovs/ovn/ip command
    pub command_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            bridge: "br-int".to_string(),
            port_type: "system".to_string(),
            logical_switch: "public".to_string(),
            ovn_nb_address: None,
            mac_prefix: MacPrefix::default(),
            primary_interface: "eth0".to_string(),
            mtu: DEFAULT_MTU,
            max_connections: 64,
            request_timeout: Duration::from_secs(60),
            store_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, AttachError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AttachError::InvalidConfig(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration, AttachError> {
    let secs = parsed(lookup, key, default.as_secs())?;
    if secs == 0 {
        return Err(AttachError::InvalidConfig(format!("{key} must be positive")));
    }
    Ok(Duration::from_secs(secs))
}

impl ServerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, AttachError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AttachError> {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).filter(|v| !v.is_empty()).unwrap_or(default);

        let mac_prefix = match lookup("MAC_PREFIX").filter(|v| !v.is_empty()) {
            Some(raw) => raw
                .parse::<MacPrefix>()
                .map_err(|e| AttachError::InvalidConfig(e.to_string()))?,
            None => defaults.mac_prefix,
        };
        let max_connections = parsed(&lookup, "MAX_CONNECTIONS", defaults.max_connections)?;
        if max_connections == 0 {
            return Err(AttachError::InvalidConfig("MAX_CONNECTIONS must be positive".to_string()));
        }

        Ok(Self {
            socket_path: lookup("CNI_SOCKET")
                .filter(|v| !v.is_empty())
                .map_or(defaults.socket_path, PathBuf::from),
            bridge: text("OVS_BRIDGE", defaults.bridge),
            port_type: text("OVS_PORT_TYPE", defaults.port_type),
            logical_switch: text("OVN_LOGICAL_SWITCH", defaults.logical_switch),
            ovn_nb_address: lookup("OVN_NB_ADDRESS").filter(|v| !v.is_empty()),
            mac_prefix,
            primary_interface: text("PRIMARY_INTERFACE", defaults.primary_interface),
            mtu: parsed(&lookup, "MTU", defaults.mtu)?,
            max_connections,
            request_timeout: seconds(&lookup, "REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            store_timeout: seconds(&lookup, "STORE_TIMEOUT_SECS", defaults.store_timeout)?,
            command_timeout: seconds(&lookup, "COMMAND_TIMEOUT_SECS", defaults.command_timeout)?,
        })
    }
}
