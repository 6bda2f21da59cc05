//! Host and IP allow/deny policy for outbound calls.
//!
//! Compiles the four independent rule sets from [`AccessConfig`] once at
//! startup and evaluates `(source, destination host, resolved IPs)` triples
//! against them. The compiled policy is immutable and shared by reference.
//!
//! # Evaluation order
//!
//! Each enabled rule is a short-circuiting deny:
//! 1. Host blacklisted → deny.
//! 2. **Any** resolved IP inside **any** blacklisted range → deny.
//! 3. Host not whitelisted → deny.
//! 4. **Any** resolved IP outside **every** whitelisted range → deny.
//!
//! A request that survives all enabled rules is allowed.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::cidr::CidrRange;
use crate::Result;

/// Ranges blacklisted unless configured otherwise: loopback, private,
/// link-local and multicast blocks.
const DEFAULT_BLACKLISTED_IPS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "224.0.0.0/4",
    "::1/128",
    "::/128",
    "fc00::/7",
    "fe80::/10",
];

/// Access policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Deny hosts listed in `blacklisted_hosts`
    pub blacklist_hosts: bool,
    /// Deny hosts resolving into `blacklisted_ips`
    pub blacklist_ip: bool,
    /// Deny hosts missing from `whitelisted_hosts`
    pub whitelist_hosts: bool,
    /// Deny hosts with any resolved address outside `whitelisted_ips`
    pub whitelist_ip: bool,
    /// Host names (case-insensitive)
    pub blacklisted_hosts: Vec<String>,
    /// CIDR ranges
    pub blacklisted_ips: Vec<String>,
    /// Host names (case-insensitive)
    pub whitelisted_hosts: Vec<String>,
    /// CIDR ranges
    pub whitelisted_ips: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            blacklist_hosts: false,
            blacklist_ip: true,
            whitelist_hosts: true,
            whitelist_ip: false,
            blacklisted_hosts: Vec::new(),
            blacklisted_ips: DEFAULT_BLACKLISTED_IPS
                .iter()
                .map(ToString::to_string)
                .collect(),
            whitelisted_hosts: Vec::new(),
            whitelisted_ips: Vec::new(),
        }
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Host is on the blacklist
    BlacklistedHost,
    /// Host resolves to a blacklisted address
    BlacklistedIp(IpAddr),
    /// Host is not on the whitelist
    HostNotWhitelisted,
    /// Host resolves to an address outside the whitelist
    IpNotWhitelisted(IpAddr),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlacklistedHost => f.write_str("host is blacklisted"),
            Self::BlacklistedIp(ip) => write!(f, "host resolves to blacklisted IP {ip}"),
            Self::HostNotWhitelisted => f.write_str("host is not whitelisted"),
            Self::IpNotWhitelisted(ip) => write!(f, "host resolves to non-whitelisted IP {ip}"),
        }
    }
}

/// Result of evaluating a destination against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// The call may be made.
    Allow,
    /// The call is forbidden.
    Deny(DenyReason),
}

impl AccessDecision {
    /// Whether the decision allows the call
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Compiled access policy. A `None` rule set is disabled.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    blacklisted_hosts: Option<HashSet<String>>,
    blacklisted_ranges: Option<Vec<CidrRange>>,
    whitelisted_hosts: Option<HashSet<String>>,
    whitelisted_ranges: Option<Vec<CidrRange>>,
}

fn host_set(hosts: &[String]) -> HashSet<String> {
    hosts.iter().map(|h| h.trim().to_ascii_lowercase()).collect()
}

fn ranges(raw: &[String]) -> Result<Vec<CidrRange>> {
    raw.iter().map(|r| r.parse()).collect()
}

impl AccessPolicy {
    /// Compile the policy from configuration.
    ///
    /// Every CIDR list is parsed, including the ones whose toggle is off,
    /// so a typo surfaces at startup rather than when the toggle flips.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if any CIDR range is invalid.
    pub fn from_config(config: &AccessConfig) -> Result<Self> {
        let blacklisted_ranges = ranges(&config.blacklisted_ips)?;
        let whitelisted_ranges = ranges(&config.whitelisted_ips)?;

        Ok(Self {
            blacklisted_hosts: config
                .blacklist_hosts
                .then(|| host_set(&config.blacklisted_hosts)),
            blacklisted_ranges: config.blacklist_ip.then_some(blacklisted_ranges),
            whitelisted_hosts: config
                .whitelist_hosts
                .then(|| host_set(&config.whitelisted_hosts)),
            whitelisted_ranges: config.whitelist_ip.then_some(whitelisted_ranges),
        })
    }

    /// A policy with every rule disabled
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Evaluate a destination.
    ///
    /// `host_ips` are the already-resolved addresses of `host`; every one of
    /// them is checked. Denials are logged with the source address.
    #[must_use]
    pub fn validate(
        &self,
        source: Option<IpAddr>,
        host_ips: &[IpAddr],
        host: &str,
    ) -> AccessDecision {
        let decision = self.evaluate(host_ips, host);
        if let AccessDecision::Deny(reason) = decision {
            warn!(
                source = %source.map_or_else(|| "unknown".to_string(), |ip| ip.to_string()),
                destination = %host,
                reason = %reason,
                "Blocked outbound request"
            );
        }
        decision
    }

    fn evaluate(&self, host_ips: &[IpAddr], host: &str) -> AccessDecision {
        let host = host.to_ascii_lowercase();

        if let Some(ref hosts) = self.blacklisted_hosts {
            if hosts.contains(&host) {
                return AccessDecision::Deny(DenyReason::BlacklistedHost);
            }
        }

        if let Some(ref ranges) = self.blacklisted_ranges {
            if let Some(ip) = host_ips
                .iter()
                .find(|ip| ranges.iter().any(|r| r.contains(**ip)))
            {
                return AccessDecision::Deny(DenyReason::BlacklistedIp(*ip));
            }
        }

        if let Some(ref hosts) = self.whitelisted_hosts {
            if !hosts.contains(&host) {
                return AccessDecision::Deny(DenyReason::HostNotWhitelisted);
            }
        }

        if let Some(ref ranges) = self.whitelisted_ranges {
            if let Some(ip) = host_ips
                .iter()
                .find(|ip| !ranges.iter().any(|r| r.contains(**ip)))
            {
                return AccessDecision::Deny(DenyReason::IpNotWhitelisted(*ip));
            }
        }

        AccessDecision::Allow
    }
}
