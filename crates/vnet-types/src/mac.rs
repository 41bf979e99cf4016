//! MAC address type and the arithmetic address ranges need.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAC_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// A 48-bit Ethernet MAC address.
///
/// Address ranges treat MACs as integers: the first lease of a range is the
/// base MAC, the n-th lease is `base + n`. The value is therefore kept as a
/// `u64` whose upper 16 bits are always zero.
///
/// # Examples
///
/// ```
/// use vnet_types::MacAddress;
///
/// let mac: MacAddress = "02:00:0a:00:00:0a".parse().unwrap();
/// assert_eq!(mac.to_parts(), [0x0a00_000a, 0x0200]);
/// assert_eq!(mac.offset(2).unwrap().to_string(), "02:00:0a:00:00:0c");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(u64);

impl MacAddress {
    /// The zero MAC address (00:00:00:00:00:00).
    pub const ZERO: MacAddress = MacAddress(0);

    /// Highest representable MAC address.
    pub const MAX: MacAddress = MacAddress(MAC_MASK);

    /// Creates a MAC address from its integer value, discarding bits above 48.
    pub const fn from_u64(value: u64) -> Self {
        MacAddress(value & MAC_MASK)
    }

    /// Creates a MAC address from the `(upper 16 bits, lower 32 bits)` pair.
    pub const fn from_parts(upper: u16, lower: u32) -> Self {
        MacAddress(((upper as u64) << 32) | lower as u64)
    }

    /// Returns the words `[lower 32 bits, upper 16 bits]`.
    pub const fn to_parts(&self) -> [u32; 2] {
        [(self.0 & 0xffff_ffff) as u32, (self.0 >> 32) as u32]
    }

    pub const fn to_u64(&self) -> u64 {
        self.0
    }

    pub fn octets(&self) -> [u8; 6] {
        let b = self.0.to_be_bytes();
        [b[2], b[3], b[4], b[5], b[6], b[7]]
    }

    /// Returns `self + n`, or `None` when the result leaves the 48-bit space.
    pub fn offset(&self, n: u64) -> Option<MacAddress> {
        let value = self.0.checked_add(n)?;
        (value <= MAC_MASK).then_some(MacAddress(value))
    }

    /// Returns the distance from `base` to `self` if `self >= base`.
    pub fn distance_from(&self, base: MacAddress) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    /// Returns the modified EUI-64 interface identifier of this MAC.
    ///
    /// The universal/local bit of the first octet is flipped and `0xFFFE`
    /// is inserted between the upper and lower 24 bits.
    pub const fn interface_id(&self) -> u64 {
        let upper = (self.0 >> 24) ^ 0x02_0000;
        let lower = self.0 & 0xff_ffff;
        (upper << 40) | (0xfffe << 24) | lower
    }

    /// Inverse of [`interface_id`](Self::interface_id).
    ///
    /// Returns `None` when the identifier does not carry the `0xFFFE` marker.
    pub const fn from_interface_id(iid: u64) -> Option<MacAddress> {
        if (iid >> 24) & 0xffff != 0xfffe {
            return None;
        }
        let upper = (iid >> 40) ^ 0x02_0000;
        let lower = iid & 0xff_ffff;
        Some(MacAddress((upper << 24) | lower))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.octets();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let separator = if s.contains(':') { ':' } else { '-' };

        let parts: Vec<&str> = s.trim().split(separator).collect();
        if parts.len() != 6 {
            return Err(ParseError::InvalidMacAddress(s.to_string()));
        }

        let mut value = 0u64;
        for part in parts {
            if part.is_empty() || part.len() > 2 {
                return Err(ParseError::InvalidMacAddress(s.to_string()));
            }
            let octet = u8::from_str_radix(part, 16)
                .map_err(|_| ParseError::InvalidMacAddress(s.to_string()))?;
            value = (value << 8) | octet as u64;
        }

        Ok(MacAddress(value))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        let mut value = 0u64;
        for b in bytes {
            value = (value << 8) | b as u64;
        }
        MacAddress(value)
    }
}
