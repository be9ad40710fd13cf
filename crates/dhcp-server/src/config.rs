//! Responder configuration from environment variables.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use ipam::MacPrefix;

use crate::error::{DhcpError, Result};

/// Static responder configuration.
#[derive(Debug, Clone)]
pub struct DhcpConfig {
    /// UDP listen address (`DHCP_LISTEN`)
    pub listen: SocketAddr,
    /// Server identifier, option 54 (`DHCP_SERVER_ADDRESS`)
    pub server_address: Ipv4Addr,
    /// Gateway used when the binding's pool has none (`DHCP_GATEWAY`)
    pub gateway: Option<Ipv4Addr>,
    /// Option 6 (`DHCP_DNS_SERVERS`, comma separated)
    pub dns_servers: Vec<Ipv4Addr>,
    /// Only clients whose MAC starts with this byte are served (`MAC_PREFIX`)
    pub mac_prefix: MacPrefix,
    /// Option 51 (`DHCP_LEASE_SECS`)
    pub lease_time: u32,
    /// Datagrams handled concurrently (`DHCP_MAX_IN_FLIGHT`)
    pub max_in_flight: usize,
    /// Deadline for one binding lookup (`STORE_TIMEOUT_SECS`)
    pub lookup_timeout: Duration,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 67)),
            server_address: Ipv4Addr::UNSPECIFIED,
            gateway: None,
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            mac_prefix: MacPrefix::default(),
            lease_time: 86_400,
            max_in_flight: 256,
            lookup_timeout: Duration::from_secs(5),
        }
    }
}

fn invalid(key: &str, raw: &str, e: impl std::fmt::Display) -> DhcpError {
    DhcpError::InvalidConfig(format!("{key}={raw:?}: {e}"))
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw.trim().parse().map(Some).map_err(|e| invalid(key, &raw, e)),
        None => Ok(None),
    }
}

impl DhcpConfig {
    /// Reads settings from `DHCP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// The server address defaults to the listen address; one of the two must
    /// be a concrete address since it is sent as the server identifier.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let listen: SocketAddr = parsed(&lookup, "DHCP_LISTEN")?.unwrap_or(defaults.listen);
        let server_address = match parsed::<Ipv4Addr>(&lookup, "DHCP_SERVER_ADDRESS")? {
            Some(addr) => addr,
            None => match listen {
                SocketAddr::V4(v4) => *v4.ip(),
                SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            },
        };
        if server_address.is_unspecified() {
            return Err(DhcpError::InvalidConfig(
                "DHCP_SERVER_ADDRESS is required when listening on a wildcard address".to_string(),
            ));
        }

        let dns_servers = match lookup("DHCP_DNS_SERVERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<Ipv4Addr>().map_err(|e| invalid("DHCP_DNS_SERVERS", s, e)))
                .collect::<Result<Vec<_>>>()?,
            None => defaults.dns_servers,
        };

        let max_in_flight = parsed(&lookup, "DHCP_MAX_IN_FLIGHT")?.unwrap_or(defaults.max_in_flight);
        if max_in_flight == 0 {
            return Err(DhcpError::InvalidConfig("DHCP_MAX_IN_FLIGHT must be positive".to_string()));
        }
        let lookup_timeout = match parsed::<u64>(&lookup, "STORE_TIMEOUT_SECS")? {
            Some(0) => return Err(DhcpError::InvalidConfig("STORE_TIMEOUT_SECS must be positive".to_string())),
            Some(secs) => Duration::from_secs(secs),
            None => defaults.lookup_timeout,
        };

        Ok(Self {
            listen,
            server_address,
            gateway: parsed(&lookup, "DHCP_GATEWAY")?,
            dns_servers,
            mac_prefix: parsed(&lookup, "MAC_PREFIX")?.unwrap_or(defaults.mac_prefix),
            lease_time: parsed(&lookup, "DHCP_LEASE_SECS")?.unwrap_or(defaults.lease_time),
            max_in_flight,
            lookup_timeout,
        })
    }
}
