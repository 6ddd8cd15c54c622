//! Client IP allow-list checked at accept time

use std::collections::HashSet;
use std::net::IpAddr;

use crate::error::{GateError, Result};

/// Set of client addresses allowed to use the proxy
///
/// An empty list admits everyone.
#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    allowed: HashSet<IpAddr>,
}

impl IpAllowList {
    pub fn new(allowed: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Parse a comma-separated list of IP addresses
    pub fn parse(raw: &str) -> Result<Self> {
        let allowed = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|_| GateError::InvalidConfig(format!("invalid allow-list IP: {}", s)))
            })
            .collect::<Result<HashSet<_>>>()?;

        Ok(Self { allowed })
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        // IPv4 clients on a dual-stack listener show up as mapped IPv6
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            IpAddr::V4(_) => ip,
        };
        self.allowed.contains(&ip)
    }
}
