//! Address family combinations a range can carry.

use crate::error::RangeError;
use std::fmt;
use std::str::FromStr;

const ETHER_BIT: u32 = 0x1;
const IP4_BIT: u32 = 0x2;
const IP6_SLAAC_BIT: u32 = 0x4;
const IP6_STATIC_BIT: u32 = 0x8;

/// Family combination of an address range. Every kind includes Ethernet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Ether,
    Ip4,
    /// IPv6 addresses derived from prefixes and the lease MAC.
    Ip6,
    /// IPv6 addresses counted from an explicit start address.
    Ip6Static,
    Ip4_6,
    Ip4_6Static,
}

impl AddressType {
    pub const ALL: [AddressType; 6] = [
        AddressType::Ether,
        AddressType::Ip4,
        AddressType::Ip6,
        AddressType::Ip6Static,
        AddressType::Ip4_6,
        AddressType::Ip4_6Static,
    ];

    pub const fn bits(&self) -> u32 {
        match self {
            AddressType::Ether => ETHER_BIT,
            AddressType::Ip4 => ETHER_BIT | IP4_BIT,
            AddressType::Ip6 => ETHER_BIT | IP6_SLAAC_BIT,
            AddressType::Ip6Static => ETHER_BIT | IP6_STATIC_BIT,
            AddressType::Ip4_6 => ETHER_BIT | IP4_BIT | IP6_SLAAC_BIT,
            AddressType::Ip4_6Static => ETHER_BIT | IP4_BIT | IP6_STATIC_BIT,
        }
    }

    pub const fn has_ip4(&self) -> bool {
        self.bits() & IP4_BIT != 0
    }

    pub const fn has_slaac(&self) -> bool {
        self.bits() & IP6_SLAAC_BIT != 0
    }

    pub const fn has_ip6_static(&self) -> bool {
        self.bits() & IP6_STATIC_BIT != 0
    }

    pub const fn has_ip6(&self) -> bool {
        self.has_slaac() || self.has_ip6_static()
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            AddressType::Ether => "ETHER",
            AddressType::Ip4 => "IP4",
            AddressType::Ip6 => "IP6",
            AddressType::Ip6Static => "IP6_STATIC",
            AddressType::Ip4_6 => "IP4_6",
            AddressType::Ip4_6Static => "IP4_6_STATIC",
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressType {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        AddressType::ALL
            .into_iter()
            .find(|t| t.as_str() == upper)
            .ok_or_else(|| RangeError::invalid_field("TYPE", format!("unknown address type '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for t in AddressType::ALL {
            assert_eq!(t.as_str().parse::<AddressType>().unwrap(), t);
        }
        assert_eq!("ip4_6".parse::<AddressType>().unwrap(), AddressType::Ip4_6);
        assert!("IP5".parse::<AddressType>().is_err());
    }

    #[test]
    fn test_family_bits() {
        assert_eq!(AddressType::Ip4_6Static.bits(), 0xB);
        assert!(AddressType::Ip4_6Static.has_ip4());
        assert!(AddressType::Ip4_6Static.has_ip6_static());
        assert!(!AddressType::Ip4_6Static.has_slaac());
        assert!(AddressType::Ip6.has_ip6());
        assert!(!AddressType::Ether.has_ip6());
        for t in AddressType::ALL {
            assert_eq!(t.bits() & ETHER_BIT, ETHER_BIT);
        }
    }
}
