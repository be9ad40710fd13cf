//! Index <-> address arithmetic over a pool range.
//!
//! Index 0 is the first usable address. IPv4 ranges with a prefix of /30 or
//! shorter exclude the network and broadcast addresses; /31, /32 and every
//! IPv6 range use all addresses. Capacity is capped at `i64::MAX` so it fits
//! the signed integers of the Kubernetes API.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;

use crate::error::CidrError;

/// Largest capacity reported for any range.
pub const MAX_CAPACITY: u64 = i64::MAX as u64;

/// Parses a pool range.
pub fn parse(cidr: &str) -> Result<IpNetwork, CidrError> {
    cidr.trim().parse::<IpNetwork>().map_err(|e| CidrError::Invalid {
        cidr: cidr.to_string(),
        reason: e.to_string(),
    })
}

fn excludes_boundaries(net: &IpNetwork) -> bool {
    matches!(net, IpNetwork::V4(n) if n.prefix() <= 30)
}

fn first_host_offset(net: &IpNetwork) -> u128 {
    u128::from(excludes_boundaries(net))
}

fn base(net: &IpNetwork) -> u128 {
    match net {
        IpNetwork::V4(n) => u128::from(u32::from(n.network())),
        IpNetwork::V6(n) => u128::from(n.network()),
    }
}

fn value_of(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u128::from(u32::from(a)),
        IpAddr::V6(a) => u128::from(a),
    }
}

/// Number of assignable addresses in `net`.
pub fn usable_addresses(net: &IpNetwork) -> u64 {
    let host_bits = match net {
        IpNetwork::V4(n) => 32 - u32::from(n.prefix()),
        IpNetwork::V6(n) => 128 - u32::from(n.prefix()),
    };
    let span = 1u128.checked_shl(host_bits).unwrap_or(u128::MAX);
    let usable = if excludes_boundaries(net) { span - 2 } else { span };
    u64::try_from(usable).unwrap_or(MAX_CAPACITY).min(MAX_CAPACITY)
}

/// Address at `index` in `cidr`.
pub fn address_at(cidr: &str, index: u64) -> Result<IpAddr, CidrError> {
    let net = parse(cidr)?;
    let capacity = usable_addresses(&net);
    if index >= capacity {
        return Err(CidrError::IndexOutOfRange {
            cidr: cidr.to_string(),
            index,
            capacity,
        });
    }

    let out_of_range = || CidrError::IndexOutOfRange {
        cidr: cidr.to_string(),
        index,
        capacity,
    };
    let value = base(&net)
        .checked_add(first_host_offset(&net) + u128::from(index))
        .ok_or_else(out_of_range)?;

    match net {
        IpNetwork::V4(_) => {
            let raw = u32::try_from(value).map_err(|_| out_of_range())?;
            Ok(IpAddr::V4(Ipv4Addr::from(raw)))
        }
        IpNetwork::V6(_) => Ok(IpAddr::V6(Ipv6Addr::from(value))),
    }
}

/// Index of `address` in `cidr`; inverse of [`address_at`].
pub fn index_of(cidr: &str, address: IpAddr) -> Result<u64, CidrError> {
    let net = parse(cidr)?;
    let out_of_range = || CidrError::AddressOutOfRange {
        cidr: cidr.to_string(),
        address: address.to_string(),
    };

    if net.is_ipv4() != address.is_ipv4() || !net.contains(address) {
        return Err(out_of_range());
    }

    let offset = value_of(address) - base(&net);
    let index = offset
        .checked_sub(first_host_offset(&net))
        .ok_or_else(out_of_range)?;
    let index = u64::try_from(index).map_err(|_| out_of_range())?;
    if index >= usable_addresses(&net) {
        return Err(out_of_range());
    }
    Ok(index)
}

/// Netmask of `cidr` (e.g. 255.255.255.0 for a /24).
pub fn netmask(cidr: &str) -> Result<IpAddr, CidrError> {
    Ok(parse(cidr)?.mask())
}

/// Prefix length of `cidr`.
pub fn prefix_len(cidr: &str) -> Result<u8, CidrError> {
    Ok(parse(cidr)?.prefix())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity(cidr: &str) -> u64 {
        usable_addresses(&parse(cidr).unwrap())
    }

    #[test]
    fn capacity_by_prefix() {
        assert_eq!(capacity("10.0.0.0/24"), 254);
        assert_eq!(capacity("10.0.0.0/30"), 2);
        assert_eq!(capacity("10.0.0.0/31"), 2);
        assert_eq!(capacity("10.0.0.7/32"), 1);
        assert_eq!(capacity("0.0.0.0/0"), (1u64 << 32) - 2);
        assert_eq!(capacity("fd00::/126"), 4);
        assert_eq!(capacity("fd00::/64"), MAX_CAPACITY);
        assert_eq!(capacity("::/0"), MAX_CAPACITY);
    }

    #[test]
    fn v4_skips_network_address() {
        assert_eq!(address_at("10.0.0.0/30", 0).unwrap(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(address_at("10.0.0.0/30", 1).unwrap(), "10.0.0.2".parse::<IpAddr>().unwrap());
        assert!(matches!(
            address_at("10.0.0.0/30", 2),
            Err(CidrError::IndexOutOfRange { capacity: 2, .. })
        ));
    }

    #[test]
    fn point_to_point_and_host_ranges_use_every_address() {
        assert_eq!(address_at("10.0.0.0/31", 0).unwrap(), "10.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(address_at("10.0.0.0/31", 1).unwrap(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(address_at("192.0.2.9/32", 0).unwrap(), "192.0.2.9".parse::<IpAddr>().unwrap());
        assert_eq!(address_at("fd00::/120", 0).unwrap(), "fd00::".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn index_round_trips_over_small_ranges() {
        for cidr in ["10.1.2.0/29", "10.1.2.0/31", "fd00:1::/125"] {
            for index in 0..capacity(cidr) {
                let address = address_at(cidr, index).unwrap();
                assert_eq!(index_of(cidr, address).unwrap(), index, "{cidr} #{index}");
            }
        }
    }

    #[test]
    fn large_v6_index_round_trips() {
        let index = MAX_CAPACITY - 1;
        let address = address_at("fd00::/64", index).unwrap();
        assert_eq!(index_of("fd00::/64", address).unwrap(), index);
    }

    #[test]
    fn index_of_rejects_boundaries_and_foreign_addresses() {
        let cidr = "10.0.0.0/24";
        assert!(index_of(cidr, "10.0.0.0".parse().unwrap()).is_err());
        assert!(index_of(cidr, "10.0.0.255".parse().unwrap()).is_err());
        assert!(index_of(cidr, "10.0.1.1".parse().unwrap()).is_err());
        assert!(index_of(cidr, "fd00::1".parse().unwrap()).is_err());
        assert_eq!(index_of(cidr, "10.0.0.254".parse().unwrap()).unwrap(), 253);
    }

    #[test]
    fn netmask_and_prefix() {
        assert_eq!(netmask("10.0.0.0/24").unwrap(), "255.255.255.0".parse::<IpAddr>().unwrap());
        assert_eq!(prefix_len("fd00::/64").unwrap(), 64);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(parse("not-a-cidr"), Err(CidrError::Invalid { .. })));
        assert!(address_at("10.0.0.0/33", 0).is_err());
    }
}
