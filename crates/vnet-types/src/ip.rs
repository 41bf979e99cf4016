//! IPv4 and IPv6 codecs with the fixed-width forms ranges store.

use crate::{MacAddress, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Parses a dotted-quad IPv4 address into its 32-bit value.
///
/// Exactly four dot-separated decimal octets are accepted, each in
/// `[0, 255]`. Leading zeros are tolerated (`010.0.0.1` is `10.0.0.1`).
pub fn parse_ipv4(s: &str) -> Result<u32, ParseError> {
    let err = || ParseError::InvalidIpv4Address(s.to_string());

    let parts: Vec<&str> = s.trim().split('.').collect();
    if parts.len() != 4 {
        return Err(err());
    }

    let mut value = 0u32;
    for part in parts {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let octet: u32 = part.parse().map_err(|_| err())?;
        if octet > 255 {
            return Err(err());
        }
        value = (value << 8) | octet;
    }

    Ok(value)
}

/// Renders a 32-bit IPv4 value in dotted-quad form.
pub fn format_ipv4(value: u32) -> String {
    Ipv4Addr::from(value).to_string()
}

/// Parses an IPv6 address using the standard textual syntax.
pub fn parse_ipv6(s: &str) -> Result<u128, ParseError> {
    s.trim()
        .parse::<Ipv6Addr>()
        .map(u128::from)
        .map_err(|_| ParseError::InvalidIpv6Address(s.to_string()))
}

/// Renders a 128-bit IPv6 value in canonical compressed form.
pub fn format_ipv6(value: u128) -> String {
    Ipv6Addr::from(value).to_string()
}

/// Splits a 128-bit address into four words, most significant first.
pub const fn ipv6_words(value: u128) -> [u32; 4] {
    [
        (value >> 96) as u32,
        (value >> 64) as u32,
        (value >> 32) as u32,
        value as u32,
    ]
}

/// The upper 64 bits of an IPv6 address (a `/64` network prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv6Prefix(u64);

/// `fe80::/64`, used for the link-local address of every SLAAC lease.
pub const LINK_LOCAL_PREFIX: Ipv6Prefix = Ipv6Prefix(0xfe80_0000_0000_0000);

impl Ipv6Prefix {
    pub const ZERO: Ipv6Prefix = Ipv6Prefix(0);

    pub const fn new(value: u64) -> Self {
        Ipv6Prefix(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Returns the prefix as `[upper 32 bits, lower 32 bits]`.
    pub const fn words(&self) -> [u32; 2] {
        [(self.0 >> 32) as u32, self.0 as u32]
    }

    /// Returns true if `addr` lies inside this `/64`.
    pub const fn contains(&self, addr: u128) -> bool {
        (addr >> 64) as u64 == self.0
    }
}

impl fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ipv6Addr::from((self.0 as u128) << 64).fmt(f)
    }
}

impl FromStr for Ipv6Prefix {
    type Err = ParseError;

    /// Parses a prefix; the empty string is the all-zero prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Ipv6Prefix::ZERO);
        }

        let addr = s
            .parse::<Ipv6Addr>()
            .map_err(|_| ParseError::InvalidIpv6Prefix(s.to_string()))?;
        Ok(Ipv6Prefix((u128::from(addr) >> 64) as u64))
    }
}

impl TryFrom<String> for Ipv6Prefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv6Prefix> for String {
    fn from(prefix: Ipv6Prefix) -> String {
        prefix.to_string()
    }
}

/// Derives the SLAAC address for `mac` inside `prefix`.
///
/// # Examples
///
/// ```
/// use vnet_types::{slaac, Ipv6Prefix, MacAddress};
///
/// let prefix: Ipv6Prefix = "2001:db8::".parse().unwrap();
/// let mac: MacAddress = "00:11:22:33:44:55".parse().unwrap();
/// assert_eq!(slaac(prefix, mac).to_string(), "2001:db8::211:22ff:fe33:4455");
/// ```
pub fn slaac(prefix: Ipv6Prefix, mac: MacAddress) -> Ipv6Addr {
    Ipv6Addr::from(((prefix.value() as u128) << 64) | mac.interface_id() as u128)
}
