// SPDX-License-Identifier: MIT
//! Trusted proxy networks and client IP resolution.

use axum::http::HeaderMap;
use std::net::IpAddr;

use crate::config::ConfigError;

/// Headers consulted, in order, when the peer is a trusted proxy.
const REMOTE_IP_HEADERS: [&str; 2] = ["x-forwarded-for", "x-real-ip"];

/// An IP network in CIDR form. A bare address is a single-host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidNetwork(raw.to_string());
        let (addr, prefix) = match raw.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (raw, None),
        };
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.trim().parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// Which peers may set forwarding headers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TrustedProxies {
    /// Every peer is a trusted proxy.
    All,
    /// No peer is trusted; the client IP is always the peer address.
    #[default]
    None,
    Networks(Vec<Network>),
}

impl TrustedProxies {
    /// Parse `all`, an empty string, or a `;`-delimited list of networks.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::None);
        }
        if raw.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        raw.split(';')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(Network::parse)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::Networks)
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Networks(nets) => nets.iter().any(|n| n.contains(ip)),
        }
    }

    /// Resolve the originating client of a request received from `peer`.
    ///
    /// Forwarding headers are honoured only when `peer` is trusted. The
    /// `X-Forwarded-For` chain is walked right to left and the first untrusted
    /// hop wins; a chain made only of trusted hops resolves to its leftmost
    /// entry. A malformed entry makes the header unusable.
    pub fn client_ip(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        if !self.is_trusted(peer) {
            return peer;
        }
        for name in REMOTE_IP_HEADERS {
            let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            if let Some(ip) = self.walk_chain(value) {
                return ip;
            }
        }
        peer
    }

    fn walk_chain(&self, value: &str) -> Option<IpAddr> {
        let hops: Vec<&str> = value.split(',').map(str::trim).collect();
        for (i, hop) in hops.iter().enumerate().rev() {
            let ip: IpAddr = hop.parse().ok()?;
            if i == 0 || !self.is_trusted(ip) {
                return Some(ip);
            }
        }
        None
    }
}
