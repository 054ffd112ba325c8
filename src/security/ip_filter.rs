//! CIDR allow/deny filtering of peer addresses.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

use crate::config::{IpFilterConfig, MatchPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrParseError {
    #[error("invalid address")]
    Address,

    #[error("invalid prefix length")]
    Prefix,
}

/// An address range in CIDR notation. A bare address is a full-length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, CidrParseError> {
        // ::ffff:a.b.c.d/n covers the same addresses as a.b.c.d/(n - 96).
        let (addr, prefix) = match addr {
            IpAddr::V6(v6) if (96..=128).contains(&prefix) => v6
                .to_ipv4_mapped()
                .map_or((addr, prefix), |v4| (IpAddr::V4(v4), prefix - 96)),
            other => (other, prefix),
        };
        let max = max_prefix(&addr);
        if prefix > max {
            return Err(CidrParseError::Prefix);
        }
        let network = match addr {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask_v4(prefix))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask_v6(prefix))),
        };
        Ok(Self { network, prefix })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, normalize(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                u32::from(ip) & mask_v4(self.prefix) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & mask_v6(self.prefix) == u128::from(net)
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = CidrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| CidrParseError::Address)?;
                let prefix: u8 = prefix.parse().map_err(|_| CidrParseError::Prefix)?;
                Cidr::new(addr, prefix)
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| CidrParseError::Address)?;
                let addr = normalize(addr);
                Cidr::new(addr, max_prefix(&addr))
            }
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask_v4(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn mask_v6(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}

/// Outcome of evaluating a peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Deny,
}

/// Allow/deny table with an explicit conflict policy.
#[derive(Debug, Clone, Default)]
pub struct IpFilter {
    allow: Vec<Cidr>,
    deny: Vec<Cidr>,
    policy: MatchPolicy,
}

impl IpFilter {
    pub fn new(allow: Vec<Cidr>, deny: Vec<Cidr>, policy: MatchPolicy) -> Self {
        Self { allow, deny, policy }
    }

    pub fn from_config(config: &IpFilterConfig) -> Result<Self, CidrParseError> {
        let parse = |entries: &[String]| {
            entries
                .iter()
                .map(|e| e.parse::<Cidr>())
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self::new(
            parse(&config.allow)?,
            parse(&config.deny)?,
            config.policy,
        ))
    }

    /// True when no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    pub fn evaluate(&self, ip: IpAddr) -> FilterDecision {
        let decision = match self.policy {
            MatchPolicy::DenyWins => {
                if self.deny.iter().any(|c| c.contains(ip)) {
                    false
                } else {
                    self.allow.is_empty() || self.allow.iter().any(|c| c.contains(ip))
                }
            }
            MatchPolicy::MostSpecific => {
                let longest = |rules: &[Cidr]| {
                    rules
                        .iter()
                        .filter(|c| c.contains(ip))
                        .map(Cidr::prefix)
                        .max()
                };
                match (longest(&self.allow), longest(&self.deny)) {
                    (None, None) => self.allow.is_empty(),
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (Some(allow), Some(deny)) => allow > deny,
                }
            }
        };

        if decision {
            FilterDecision::Allow
        } else {
            FilterDecision::Deny
        }
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        self.evaluate(ip) == FilterDecision::Allow
    }
}
