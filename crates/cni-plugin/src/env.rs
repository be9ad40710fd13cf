//! CNI invocation contract: `CNI_*` environment variables and the network
//! configuration on stdin.

use anyhow::{Context, bail};
use cni_protocol::{CmdArgs, DEFAULT_SOCKET_PATH};
use serde::Deserialize;

/// Command requested by the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    Add,
    Del,
    Check,
    Version,
}

impl Invocation {
    fn parse(command: &str) -> anyhow::Result<Self> {
        match command {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "CHECK" => Ok(Self::Check),
            "VERSION" => Ok(Self::Version),
            other => bail!("unsupported CNI_COMMAND {other:?}"),
        }
    }
}

/// Parsed `CNI_*` variables.
#[derive(Debug, Clone)]
pub struct CniEnv {
    pub command: Invocation,
    pub args: CmdArgs,
}

impl CniEnv {
    /// Reads the variables through `lookup`. Only `CNI_COMMAND` is required
    /// for `VERSION`; `ADD` needs a netns and `ADD`/`DEL` need an interface.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).unwrap_or_default();
        let command = Invocation::parse(&lookup("CNI_COMMAND").context("CNI_COMMAND is not set")?)?;

        let args = CmdArgs {
            workload_id: get("CNI_CONTAINERID"),
            netns: get("CNI_NETNS"),
            if_name: get("CNI_IFNAME"),
            args: get("CNI_ARGS"),
            path: get("CNI_PATH"),
        };

        if matches!(command, Invocation::Add | Invocation::Del) && args.if_name.is_empty() {
            bail!("CNI_IFNAME is not set");
        }
        if command == Invocation::Add && args.netns.is_empty() {
            bail!("CNI_NETNS is not set");
        }
        Ok(Self { command, args })
    }
}

/// Fields of the network configuration the plugin uses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    /// Attachment server socket
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

impl NetConf {
    pub fn parse(raw: &[u8]) -> anyhow::Result<Self> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            bail!("network configuration on stdin is empty");
        }
        serde_json::from_slice(raw).context("invalid network configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> anyhow::Result<CniEnv> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        CniEnv::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn add_reads_all_variables() {
        let parsed = env(&[
            ("CNI_COMMAND", "ADD"),
            ("CNI_CONTAINERID", "abc"),
            ("CNI_NETNS", "/var/run/netns/x"),
            ("CNI_IFNAME", "eth0"),
            ("CNI_ARGS", "K8S_POD_NAMESPACE=ns;K8S_POD_NAME=p"),
            ("CNI_PATH", "/opt/cni/bin"),
        ])
        .unwrap();
        assert_eq!(parsed.command, Invocation::Add);
        assert_eq!(parsed.args.workload_id, "abc");
        assert_eq!(parsed.args.if_name, "eth0");
        assert_eq!(parsed.args.args, "K8S_POD_NAMESPACE=ns;K8S_POD_NAME=p");
    }

    #[test]
    fn version_needs_only_the_command() {
        assert_eq!(env(&[("CNI_COMMAND", "VERSION")]).unwrap().command, Invocation::Version);
    }

    #[test]
    fn missing_variables_are_rejected() {
        assert!(env(&[]).is_err());
        assert!(env(&[("CNI_COMMAND", "ADD"), ("CNI_IFNAME", "eth0")]).is_err());
        assert!(env(&[("CNI_COMMAND", "DEL")]).is_err());
        assert!(env(&[("CNI_COMMAND", "GC")]).is_err());
        // DEL may arrive after the namespace is gone
        assert!(env(&[("CNI_COMMAND", "DEL"), ("CNI_IFNAME", "eth0")]).is_ok());
    }

    #[test]
    fn netconf_defaults_socket_path() {
        let conf = NetConf::parse(br#"{"cniVersion":"1.0.0","name":"histack","type":"histack-cni"}"#).unwrap();
        assert_eq!(conf.socket_path, "/var/run/histack-ovn-cni.sock");

        let conf = NetConf::parse(br#"{"cniVersion":"0.4.0","socketPath":"/tmp/cni.sock"}"#).unwrap();
        assert_eq!(conf.socket_path, "/tmp/cni.sock");
        assert!(NetConf::parse(b"  ").is_err());
    }
}
