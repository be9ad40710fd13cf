//! CNI 1.0 attachment result.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// CNI spec version produced by the server.
pub const CNI_VERSION: &str = "1.0.0";

/// CNI spec versions the plugin understands.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Device name, host side or inside the sandbox
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// Index into `interfaces`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// Address with the pool prefix length
    pub address: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,
}

impl CniResult {
    /// Result listing `interfaces` with no addresses.
    pub fn new(interfaces: Vec<Interface>) -> Self {
        Self {
            cni_version: CNI_VERSION.to_string(),
            interfaces,
            ips: Vec::new(),
        }
    }
}

/// Output of the CNI `VERSION` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            cni_version: CNI_VERSION.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| (*v).to_string()).collect(),
        }
    }
}

/// CNI error object printed by the plugin on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniErrorReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Well-known CNI error code
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl CniErrorReply {
    /// Well-known code 11: try again later.
    pub const TRY_AGAIN_LATER: u32 = 11;
    /// Well-known code 4: invalid network config.
    pub const INVALID_CONFIG: u32 = 4;
    /// Well-known code 7: invalid environment variables.
    pub const INVALID_ENVIRONMENT: u32 = 7;
    /// First code available to plugins.
    pub const PLUGIN_ERROR: u32 = 100;

    /// Error reply at the current CNI version.
    pub fn new(code: u32, msg: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            cni_version: CNI_VERSION.to_string(),
            code,
            msg: msg.into(),
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_cni_1_0_layout() {
        let mut result = CniResult::new(vec![Interface {
            name: "eth0".to_string(),
            mac: Some("02:aa:bb:cc:dd:ee".to_string()),
            sandbox: Some("/var/run/netns/x".to_string()),
        }]);
        result.ips.push(IpConfig {
            interface: Some(0),
            address: "10.0.0.5/24".parse().unwrap(),
            gateway: Some("10.0.0.1".parse().unwrap()),
        });

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["cniVersion"], "1.0.0");
        assert_eq!(value["interfaces"][0]["mac"], "02:aa:bb:cc:dd:ee");
        assert_eq!(value["ips"][0]["address"], "10.0.0.5/24");
        assert_eq!(value["ips"][0]["gateway"], "10.0.0.1");
        assert_eq!(value["ips"][0]["interface"], 0);
    }

    #[test]
    fn secondary_interface_has_no_ips_key() {
        let result = CniResult::new(vec![Interface {
            name: "eth1".to_string(),
            mac: None,
            sandbox: None,
        }]);
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("ips").is_none());
    }
}
