//! Deterministic MAC derivation.
//!
//! A binding's MAC is the configured prefix byte followed by the first five
//! bytes of `SHA-256(workload_key|interface)`, so the same workload interface
//! always gets the same MAC.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::IpamError;

/// Default first octet: locally administered, unicast.
pub const DEFAULT_MAC_PREFIX: u8 = 0x02;

/// First MAC octet used for every derived address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacPrefix(u8);

impl MacPrefix {
    /// Validates `octet`: it must be locally administered and unicast.
    pub fn new(octet: u8) -> Result<Self, IpamError> {
        if octet & 0x01 != 0 {
            return Err(IpamError::InvalidConfig(format!(
                "MAC prefix {octet:02x} is a multicast octet"
            )));
        }
        if octet & 0x02 == 0 {
            return Err(IpamError::InvalidConfig(format!(
                "MAC prefix {octet:02x} is not locally administered"
            )));
        }
        Ok(Self(octet))
    }

    /// The prefix octet.
    pub fn octet(self) -> u8 {
        self.0
    }

    /// Whether `mac` (colon separated, any case) starts with this prefix.
    pub fn matches(self, mac: &str) -> bool {
        mac.split(':')
            .next()
            .and_then(|first| u8::from_str_radix(first, 16).ok())
            .is_some_and(|first| first == self.0)
    }
}

impl Default for MacPrefix {
    fn default() -> Self {
        Self(DEFAULT_MAC_PREFIX)
    }
}

impl fmt::Display for MacPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

impl FromStr for MacPrefix {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches(':');
        let octet = u8::from_str_radix(trimmed, 16)
            .map_err(|e| IpamError::InvalidConfig(format!("MAC prefix {s:?}: {e}")))?;
        Self::new(octet)
    }
}

/// MAC for `interface` of the workload identified by `workload_key`.
pub fn derive_mac(prefix: MacPrefix, workload_key: &str, interface: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workload_key.as_bytes());
    hasher.update(b"|");
    hasher.update(interface.as_bytes());
    let hash = hasher.finalize();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        prefix.octet(),
        hash[0],
        hash[1],
        hash[2],
        hash[3],
        hash[4]
    )
}

/// Lower-cases a colon separated MAC for comparison and lookup.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable_and_prefixed() {
        let prefix = MacPrefix::default();
        let first = derive_mac(prefix, "default/vm1", "eth0");
        let second = derive_mac(prefix, "default/vm1", "eth0");
        assert_eq!(first, second);
        assert!(first.starts_with("02:"));
        assert_eq!(first.len(), 17);
        assert!(prefix.matches(&first));
    }

    #[test]
    fn interfaces_get_distinct_macs() {
        let prefix = MacPrefix::default();
        assert_ne!(
            derive_mac(prefix, "default/vm1", "eth0"),
            derive_mac(prefix, "default/vm1", "eth1")
        );
        assert_ne!(
            derive_mac(prefix, "default/vm1", "eth0"),
            derive_mac(prefix, "default/vm2", "eth0")
        );
    }

    #[test]
    fn tail_is_digest_prefix() {
        let digest = Sha256::digest(b"default/vm1|eth0");
        let expected = format!(
            "0a:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            digest[0], digest[1], digest[2], digest[3], digest[4]
        );
        let prefix: MacPrefix = "0a".parse().unwrap();
        assert_eq!(derive_mac(prefix, "default/vm1", "eth0"), expected);
    }

    #[test]
    fn prefix_validation() {
        assert_eq!("02".parse::<MacPrefix>().unwrap().octet(), 0x02);
        assert_eq!("0a".parse::<MacPrefix>().unwrap().to_string(), "0a");
        assert!("01".parse::<MacPrefix>().is_err());
        assert!("00".parse::<MacPrefix>().is_err());
        assert!("zz".parse::<MacPrefix>().is_err());
    }

    #[test]
    fn prefix_match_is_case_insensitive() {
        let prefix: MacPrefix = "0a".parse().unwrap();
        assert!(prefix.matches("0A:11:22:33:44:55"));
        assert!(!prefix.matches("02:11:22:33:44:55"));
        assert!(!prefix.matches(""));
    }
}
