//! CIDR ranges for the IP blacklist and whitelist.
//!
//! Accepts `address/prefix` notation as well as a bare address, which is
//! treated as a single-host range (`/32` or `/128`).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::{Error, Result};

/// A contiguous block of IP addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CidrRange {
    /// IPv4 block; `network` has the host bits cleared
    V4 {
        /// Network address
        network: u32,
        /// Prefix length (0-32)
        prefix: u8,
    },
    /// IPv6 block; `network` has the host bits cleared
    V6 {
        /// Network address
        network: u128,
        /// Prefix length (0-128)
        prefix: u8,
    },
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) }
}

fn mask_v6(prefix: u8) -> u128 {
    if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) }
}

fn parse_prefix(raw: Option<&str>, max: u8, range: &str) -> Result<u8> {
    let Some(raw) = raw else {
        return Ok(max);
    };
    match raw.trim().parse::<u8>() {
        Ok(prefix) if prefix <= max => Ok(prefix),
        _ => Err(Error::Config(format!(
            "invalid prefix length in CIDR range '{range}'"
        ))),
    }
}

impl CidrRange {
    /// Check whether `addr` falls inside this range.
    ///
    /// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) also match the IPv4
    /// range of the embedded address.
    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        let canonical = addr.to_canonical();
        self.contains_exact(addr) || (canonical != addr && self.contains_exact(canonical))
    }

    fn contains_exact(&self, addr: IpAddr) -> bool {
        match (*self, addr) {
            (Self::V4 { network, prefix }, IpAddr::V4(v4)) => {
                u32::from(v4) & mask_v4(prefix) == network
            }
            (Self::V6 { network, prefix }, IpAddr::V6(v6)) => {
                u128::from(v6) & mask_v6(prefix) == network
            }
            _ => false,
        }
    }
}

impl FromStr for CidrRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid CIDR range '{s}': {e}")))?;

        Ok(match addr {
            IpAddr::V4(v4) => {
                let prefix = parse_prefix(prefix, 32, s)?;
                Self::V4 {
                    network: u32::from(v4) & mask_v4(prefix),
                    prefix,
                }
            }
            IpAddr::V6(v6) => {
                let prefix = parse_prefix(prefix, 128, s)?;
                Self::V6 {
                    network: u128::from(v6) & mask_v6(prefix),
                    prefix,
                }
            }
        })
    }
}

impl fmt::Display for CidrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::V4 { network, prefix } => write!(f, "{}/{prefix}", Ipv4Addr::from(network)),
            Self::V6 { network, prefix } => write!(f, "{}/{prefix}", Ipv6Addr::from(network)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(s: &str) -> CidrRange {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn ipv4_range_membership() {
        let r = range("10.0.0.0/8");
        assert!(r.contains(ip("10.0.0.1")));
        assert!(r.contains(ip("10.255.255.255")));
        assert!(!r.contains(ip("11.0.0.0")));
        assert!(!r.contains(ip("8.8.8.8")));
    }

    #[test]
    fn ipv4_odd_prefix() {
        let r = range("172.16.0.0/12");
        assert!(r.contains(ip("172.31.255.255")));
        assert!(!r.contains(ip("172.32.0.0")));
    }

    #[test]
    fn host_bits_are_cleared() {
        assert_eq!(range("192.168.1.77/24"), range("192.168.1.0/24"));
        assert_eq!(range("192.168.1.77/24").to_string(), "192.168.1.0/24");
    }

    #[test]
    fn bare_address_is_single_host() {
        let r = range("1.2.3.4");
        assert!(r.contains(ip("1.2.3.4")));
        assert!(!r.contains(ip("1.2.3.5")));
        assert_eq!(r.to_string(), "1.2.3.4/32");
    }

    #[test]
    fn zero_prefix_matches_family() {
        let r = range("0.0.0.0/0");
        assert!(r.contains(ip("203.0.113.9")));
        assert!(!r.contains(ip("2001:db8::1")));
    }

    #[test]
    fn ipv6_ranges() {
        let ula = range("fc00::/7");
        assert!(ula.contains(ip("fd12:3456::1")));
        assert!(!ula.contains(ip("2001:db8::1")));

        let loopback = range("::1/128");
        assert!(loopback.contains(ip("::1")));
        assert!(!loopback.contains(ip("::2")));
    }

    #[test]
    fn ipv4_mapped_matches_ipv4_range() {
        let r = range("127.0.0.0/8");
        assert!(r.contains(ip("::ffff:127.0.0.1")));
        assert!(!r.contains(ip("::ffff:8.8.8.8")));
    }

    #[test]
    fn families_do_not_mix() {
        assert!(!range("::/0").contains(ip("10.0.0.1")));
        assert!(!range("0.0.0.0/0").contains(ip("::1")));
    }

    #[test]
    fn invalid_ranges_rejected() {
        assert!("10.0.0.0/33".parse::<CidrRange>().is_err());
        assert!("::/129".parse::<CidrRange>().is_err());
        assert!("not-an-ip/8".parse::<CidrRange>().is_err());
        assert!("10.0.0.0/x".parse::<CidrRange>().is_err());
    }
}
