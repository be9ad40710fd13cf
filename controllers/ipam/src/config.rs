//! Controller configuration from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ControllerError;

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Probe endpoint listen address (`PROBE_ADDR`)
    pub probe_addr: SocketAddr,
    /// Deadline for one store call (`STORE_TIMEOUT_SECS`)
    pub store_timeout: Duration,
    /// Watch `kubevirt.io/v1` VirtualMachines and VirtualMachineInstances (`WATCH_VIRTUAL_MACHINES`);
    /// disable on clusters without KubeVirt
    pub watch_virtual_machines: bool,
    /// Upper bound of the watch retry backoff (`WATCH_BACKOFF_MAX_SECS`)
    pub max_backoff_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            probe_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            store_timeout: ipam::DEFAULT_STORE_TIMEOUT,
            watch_virtual_machines: true,
            max_backoff_secs: 60,
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

impl ControllerConfig {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, so tests can supply their own variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let defaults = Self::default();
        let store_timeout = parsed(&lookup, "STORE_TIMEOUT_SECS", defaults.store_timeout.as_secs())?;
        if store_timeout == 0 {
            return Err(ControllerError::InvalidConfig("STORE_TIMEOUT_SECS must be positive".to_string()));
        }

        Ok(Self {
            probe_addr: parsed(&lookup, "PROBE_ADDR", defaults.probe_addr)?,
            store_timeout: Duration::from_secs(store_timeout),
            watch_virtual_machines: parsed(&lookup, "WATCH_VIRTUAL_MACHINES", defaults.watch_virtual_machines)?,
            max_backoff_secs: parsed(&lookup, "WATCH_BACKOFF_MAX_SECS", defaults.max_backoff_secs)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<ControllerConfig, ControllerError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ControllerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = from(&[]).unwrap();
        assert_eq!(config.probe_addr.port(), 8080);
        assert!(config.watch_virtual_machines);
        assert_eq!(config.store_timeout, Duration::from_secs(10));
    }

    #[test]
    fn overrides_and_errors() {
        let config = from(&[("PROBE_ADDR", "127.0.0.1:9090"), ("WATCH_VIRTUAL_MACHINES", "false")]).unwrap();
        assert_eq!(config.probe_addr.to_string(), "127.0.0.1:9090");
        assert!(!config.watch_virtual_machines);

        assert!(from(&[("PROBE_ADDR", "nowhere")]).is_err());
        assert!(from(&[("STORE_TIMEOUT_SECS", "0")]).is_err());
        assert!(from(&[("WATCH_VIRTUAL_MACHINES", "maybe")]).is_err());
    }
}
