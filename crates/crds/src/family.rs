//! IP address family shared by pools and bindings.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Address family of a pool or binding.
///
/// Serializes as "v4"/"v6", which is also the value used in field selectors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum IpFamily {
    /// IPv4
    #[default]
    #[serde(rename = "v4")]
    V4,

    /// IPv6
    #[serde(rename = "v6")]
    V6,
}

impl IpFamily {
    /// Wire/selector representation.
    pub fn as_str(self) -> &'static str {
        match self {
            IpFamily::V4 => "v4",
            IpFamily::V6 => "v6",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown family string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown IP family {0:?} (expected \"v4\" or \"v6\")")]
pub struct ParseIpFamilyError(pub String);

impl FromStr for IpFamily {
    type Err = ParseIpFamilyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v4" | "ipv4" | "4" => Ok(IpFamily::V4),
            "v6" | "ipv6" | "6" => Ok(IpFamily::V6),
            other => Err(ParseIpFamilyError(other.to_string())),
        }
    }
}
