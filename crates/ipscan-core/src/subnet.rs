//! IPv4 subnet arithmetic.
//!
//! Everything here is pure: no state, no I/O. Functions take `Ipv4Addr`
//! so IPv6 is rejected at the parsing edge (`parse_ipv4`, `require_ipv4`,
//! `parse_cidr`) rather than deep inside the math.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Mask used when an interface reports none.
pub const DEFAULT_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// `ip AND mask`.
pub fn network_address(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) & u32::from(mask))
}

/// `ip OR NOT mask`.
pub fn broadcast_address(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(mask))
}

/// All addresses strictly between the network and broadcast address.
///
/// The returned iterator is lazy, so a /8 or wider never materializes its
/// millions of addresses. Clone it (or call again) to restart.
pub fn host_addresses(ip: Ipv4Addr, mask: Ipv4Addr) -> HostAddresses {
    let network = u32::from(network_address(ip, mask));
    let broadcast = u32::from(broadcast_address(ip, mask));

    HostAddresses {
        next: network.saturating_add(1),
        end: broadcast,
    }
}

/// Usable host count for a mask: `2^(32 - prefix) - 2`, or 0 for /31 and /32.
pub fn host_count(mask: Ipv4Addr) -> u32 {
    let prefix = u32::from(prefix_length(mask));
    if prefix >= 31 {
        return 0;
    }
    ((1u64 << (32 - prefix)) - 2) as u32
}

/// Number of leading one-bits in the mask.
///
/// Counting stops at the first zero bit, so a non-contiguous mask such as
/// `255.0.255.0` yields 8. Such masks are not rejected.
pub fn prefix_length(mask: Ipv4Addr) -> u8 {
    (!u32::from(mask)).leading_zeros() as u8
}

/// Mask with the top `prefix_len` bits set.
pub fn mask_from_prefix(prefix_len: u32) -> Result<Ipv4Addr, ValidationError> {
    match prefix_len {
        0 => Ok(Ipv4Addr::UNSPECIFIED),
        1..=32 => Ok(Ipv4Addr::from(u32::MAX << (32 - prefix_len))),
        _ => Err(ValidationError::PrefixOutOfRange(prefix_len)),
    }
}

/// Parse `a.b.c.d/p` into the subnet that contains `a.b.c.d`.
///
/// The address is normalized to its network address, so
/// `192.168.1.100/24` gives `192.168.1.0/24`. Anything malformed
/// (missing slash, IPv6, prefix outside 0..=32) gives `None`.
pub fn parse_cidr(text: &str) -> Option<Subnet> {
    let (addr, prefix) = text.trim().split_once('/')?;
    if prefix.contains('/') {
        return None;
    }

    let ip: Ipv4Addr = addr.parse().ok()?;
    let prefix_len: u8 = prefix.parse().ok()?;
    let net = Ipv4Net::new(ip, prefix_len).ok()?.trunc();

    Some(Subnet {
        network: net.network(),
        prefix_len,
    })
}

/// `"{network}/{prefix}"` for an address and mask.
pub fn cidr_notation(ip: Ipv4Addr, mask: Ipv4Addr) -> String {
    format!("{}/{}", network_address(ip, mask), prefix_length(mask))
}

/// Narrow an `IpAddr` to IPv4.
pub fn require_ipv4(addr: IpAddr) -> Result<Ipv4Addr, ValidationError> {
    match addr {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(v6) => Err(ValidationError::NotIpv4(v6.to_string())),
    }
}

/// Parse a dotted-quad string, rejecting IPv6 and garbage.
pub fn parse_ipv4(text: &str) -> Result<Ipv4Addr, ValidationError> {
    let addr: IpAddr = text
        .trim()
        .parse()
        .map_err(|_| ValidationError::NotIpv4(text.to_string()))?;
    require_ipv4(addr)
}

// ── Subnet ────────────────────────────────────────────────────────

/// An IPv4 network: network address plus prefix length.
///
/// The network address always has its host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    /// Build the subnet containing `ip` with the given prefix.
    pub fn new(ip: Ipv4Addr, prefix_len: u8) -> Result<Self, ValidationError> {
        let mask = mask_from_prefix(u32::from(prefix_len))?;
        Ok(Self {
            network: network_address(ip, mask),
            prefix_len,
        })
    }

    /// Build the subnet containing `ip` under `mask`.
    ///
    /// A non-contiguous mask is cut at its first zero bit, the same way
    /// [`prefix_length`] reads it.
    pub fn from_ip_mask(ip: Ipv4Addr, mask: Ipv4Addr) -> Self {
        let prefix_len = prefix_length(mask);
        let mask = mask_from_prefix(u32::from(prefix_len)).unwrap_or(Ipv4Addr::BROADCAST);
        Self {
            network: network_address(ip, mask),
            prefix_len,
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn mask(&self) -> Ipv4Addr {
        // prefix_len is validated on construction
        mask_from_prefix(u32::from(self.prefix_len)).unwrap_or(Ipv4Addr::BROADCAST)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        broadcast_address(self.network, self.mask())
    }

    pub fn hosts(&self) -> HostAddresses {
        host_addresses(self.network, self.mask())
    }

    pub fn host_count(&self) -> u32 {
        host_count(self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        Ipv4Net::new(self.network, self.prefix_len)
            .map(|net| net.contains(&ip))
            .unwrap_or(false)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Subnet {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_cidr(s).ok_or_else(|| ValidationError::MalformedCidr(s.to_string()))
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

impl TryFrom<String> for Subnet {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ── Host iteration ────────────────────────────────────────────────

/// Lazy iterator over the usable hosts of a subnet.
#[derive(Debug, Clone)]
pub struct HostAddresses {
    next: u32,
    end: u32,
}

impl Iterator for HostAddresses {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let addr = Ipv4Addr::from(self.next);
        self.next += 1;
        Some(addr)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for HostAddresses {}

impl std::iter::FusedIterator for HostAddresses {}
