//! Parsing and validation of range definitions.

use crate::address_type::AddressType;
use crate::error::{RangeError, RangeResult};
use std::collections::BTreeSet;
use vnet_types::{parse_ipv4, parse_ipv6, Ipv6Prefix, MacAddress, Template};

const MAX_PORT: u64 = 65535;

/// Per-lease port block for NAT-style port forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBlock {
    pub start: u32,
    pub size: u32,
}

impl PortBlock {
    fn first_external(&self, offset: u64) -> u64 {
        u64::from(self.start) + 1 + offset * u64::from(self.size)
    }

    /// `first:last` external ports of the block at `offset`.
    pub fn external_range(&self, offset: u64) -> String {
        let first = self.first_external(offset);
        let last = u64::from(self.start) + (offset + 1) * u64::from(self.size);
        format!("{first}:{last}")
    }

    /// `1-size/first`: internal ports mapped onto the external block.
    pub fn internal_range(&self, offset: u64) -> String {
        format!("1-{}/{}", self.size, self.first_external(offset))
    }
}

/// Typed view of a range definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RangeSpec {
    pub kind: AddressType,
    pub size: u64,
    pub mac: MacAddress,
    pub ip: u32,
    pub ip6: u128,
    pub ula_prefix: Ipv6Prefix,
    pub global_prefix: Ipv6Prefix,
    pub prefix_length: Option<u8>,
    pub ports: Option<PortBlock>,
    pub security_groups: BTreeSet<u32>,
    pub parent: Option<u32>,
}

fn required<'a>(attrs: &'a Template, field: &str) -> RangeResult<&'a str> {
    attrs
        .get_trimmed(field)
        .ok_or_else(|| RangeError::missing_field(field))
}

fn optional_number<T: std::str::FromStr>(attrs: &Template, field: &str) -> RangeResult<Option<T>> {
    attrs
        .parse::<T>(field)
        .transpose()
        .map_err(|_| RangeError::invalid_field(field, "not a valid number"))
}

fn parse_prefix(attrs: &Template, field: &str) -> RangeResult<Ipv6Prefix> {
    attrs
        .get(field)
        .unwrap_or("")
        .parse()
        .map_err(|e: vnet_types::ParseError| RangeError::invalid_field(field, e.to_string()))
}

pub(crate) fn parse_security_groups(text: &str) -> RangeResult<BTreeSet<u32>> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>().map_err(|_| {
                RangeError::invalid_field("SECURITY_GROUPS", format!("'{s}' is not a group id"))
            })
        })
        .collect()
}

pub(crate) fn format_security_groups(groups: &BTreeSet<u32>) -> String {
    groups
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Size of a static IPv6 range covering the rest of its prefix.
///
/// A prefix of 64 bits or shorter counts as a full /64. Host bits already
/// set in `start` are subtracted. Sizes beyond `u64` saturate.
pub(crate) fn ip6_prefix_size(start: u128, prefix_length: u8) -> u64 {
    let total: u128 = if prefix_length <= 64 {
        1 << 64
    } else {
        1 << (128 - u32::from(prefix_length))
    };
    let consumed = start & (total - 1);
    u64::try_from(total - consumed).unwrap_or(u64::MAX)
}

impl RangeSpec {
    /// Parses `attrs` into a typed definition.
    ///
    /// Derived values (normalized TYPE, synthesized MAC, derived SIZE) are
    /// written back into `attrs` so reloading the definition reproduces the
    /// same range.
    pub(crate) fn parse(attrs: &mut Template, mac_prefix: u16) -> RangeResult<Self> {
        let kind: AddressType = required(attrs, "TYPE")?.parse()?;
        attrs.set("TYPE", kind);

        let ip = if kind.has_ip4() {
            parse_ipv4(required(attrs, "IP")?)
                .map_err(|e| RangeError::invalid_field("IP", e.to_string()))?
        } else {
            0
        };

        let (ip6, prefix_length) = if kind.has_ip6_static() {
            let ip6 = parse_ipv6(required(attrs, "IP6")?)
                .map_err(|e| RangeError::invalid_field("IP6", e.to_string()))?;
            let prefix_length: u8 = required(attrs, "PREFIX_LENGTH")?
                .parse()
                .ok()
                .filter(|p| *p <= 128)
                .ok_or_else(|| RangeError::invalid_field("PREFIX_LENGTH", "must be 0-128"))?;
            (ip6, Some(prefix_length))
        } else {
            (0, None)
        };

        let (ula_prefix, global_prefix) = if kind.has_slaac() {
            (parse_prefix(attrs, "ULA_PREFIX")?, parse_prefix(attrs, "GLOBAL_PREFIX")?)
        } else {
            (Ipv6Prefix::ZERO, Ipv6Prefix::ZERO)
        };

        let size = match (optional_number::<u64>(attrs, "SIZE")?, prefix_length) {
            (Some(0), _) => {
                return Err(RangeError::invalid_field("SIZE", "must be greater than zero"))
            }
            (Some(size), _) => size,
            (None, Some(prefix_length)) => {
                let size = ip6_prefix_size(ip6, prefix_length);
                attrs.set("SIZE", size);
                size
            }
            (None, None) => return Err(RangeError::missing_field("SIZE")),
        };

        let mac = match attrs.get_trimmed("MAC") {
            Some(text) => text
                .parse::<MacAddress>()
                .map_err(|e| RangeError::invalid_field("MAC", e.to_string()))?,
            None => {
                let low = if kind.has_ip4() { ip } else { rand::random::<u32>() };
                let mac = MacAddress::from_parts(mac_prefix, low);
                attrs.set("MAC", mac);
                mac
            }
        };

        let last = size - 1;
        if mac.offset(last).is_none() {
            return Err(RangeError::invalid_field(
                "SIZE",
                "range runs past the last MAC address",
            ));
        }
        if kind.has_ip4() && u64::from(ip) + last > u64::from(u32::MAX) {
            return Err(RangeError::invalid_field(
                "SIZE",
                "range runs past 255.255.255.255",
            ));
        }
        if kind.has_ip6_static() && ip6.checked_add(u128::from(last)).is_none() {
            return Err(RangeError::invalid_field(
                "SIZE",
                "range runs past the last IPv6 address",
            ));
        }

        let port_start = optional_number::<u32>(attrs, "PORT_START")?;
        let ports = match optional_number::<u32>(attrs, "PORT_SIZE")? {
            None => None,
            Some(0) => return Err(RangeError::invalid_field("PORT_SIZE", "must be greater than zero")),
            Some(port_size) => {
                let start = port_start.ok_or_else(|| RangeError::missing_field("PORT_START"))?;
                let end = size
                    .checked_mul(u64::from(port_size))
                    .and_then(|n| n.checked_add(u64::from(start)));
                if end.map_or(true, |end| end > MAX_PORT) {
                    return Err(RangeError::invalid_field(
                        "PORT_SIZE",
                        format!("port blocks run past {MAX_PORT}"),
                    ));
                }
                Some(PortBlock {
                    start,
                    size: port_size,
                })
            }
        };

        let security_groups = match attrs.get_trimmed("SECURITY_GROUPS") {
            Some(text) => parse_security_groups(text)?,
            None => BTreeSet::new(),
        };

        let parent = optional_number::<u32>(attrs, "PARENT_NETWORK_AR_ID")?;

        Ok(Self {
            kind,
            size,
            mac,
            ip,
            ip6,
            ula_prefix,
            global_prefix,
            prefix_length,
            ports,
            security_groups,
            parent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(pairs: &[(&str, &str)]) -> RangeResult<(RangeSpec, Template)> {
        let mut attrs: Template = pairs.iter().copied().collect();
        RangeSpec::parse(&mut attrs, 0x0200).map(|spec| (spec, attrs))
    }

    fn assert_field(result: RangeResult<(RangeSpec, Template)>, field: &str) {
        match result {
            Err(RangeError::InvalidField { field: f, .. }) | Err(RangeError::MissingField { field: f }) => {
                assert_eq!(f, field)
            }
            other => panic!("expected error on {field}, got {other:?}"),
        }
    }

    #[test]
    fn test_ip4_mac_seeded_from_ip() {
        let (spec, attrs) = parse(&[("TYPE", "ip4"), ("IP", "10.0.0.10"), ("SIZE", "3")]).unwrap();
        assert_eq!(spec.kind, AddressType::Ip4);
        assert_eq!(spec.ip, 0x0a00_000a);
        assert_eq!(spec.mac.to_string(), "02:00:0a:00:00:0a");
        assert_eq!(attrs.get("MAC"), Some("02:00:0a:00:00:0a"));
        assert_eq!(attrs.get("TYPE"), Some("IP4"));
    }

    #[test]
    fn test_ether_gets_random_mac_with_prefix() {
        let (spec, attrs) = parse(&[("TYPE", "ETHER"), ("SIZE", "8")]).unwrap();
        assert_eq!(spec.mac.to_parts()[1], 0x0200);
        assert!(attrs.contains("MAC"));
    }

    #[test]
    fn test_mandatory_fields_named() {
        assert_field(parse(&[("SIZE", "3")]), "TYPE");
        assert_field(parse(&[("TYPE", "IP4"), ("SIZE", "3")]), "IP");
        assert_field(parse(&[("TYPE", "IP4"), ("IP", "10.0.0.1")]), "SIZE");
        assert_field(parse(&[("TYPE", "IP4"), ("IP", "10.0.0"), ("SIZE", "3")]), "IP");
        assert_field(parse(&[("TYPE", "ETHER"), ("SIZE", "0")]), "SIZE");
        assert_field(parse(&[("TYPE", "ETHER"), ("SIZE", "x")]), "SIZE");
        assert_field(parse(&[("TYPE", "ETHER"), ("SIZE", "2"), ("MAC", "02:00:00")]), "MAC");
        assert_field(parse(&[("TYPE", "IP6_STATIC"), ("IP6", "2001:db8::1")]), "PREFIX_LENGTH");
        assert_field(
            parse(&[("TYPE", "IP6"), ("SIZE", "2"), ("ULA_PREFIX", "zz::")]),
            "ULA_PREFIX",
        );
        assert_field(
            parse(&[("TYPE", "ETHER"), ("SIZE", "2"), ("SECURITY_GROUPS", "0,a")]),
            "SECURITY_GROUPS",
        );
    }

    #[test]
    fn test_bounds() {
        assert_field(
            parse(&[("TYPE", "IP4"), ("IP", "255.255.255.250"), ("SIZE", "7")]),
            "SIZE",
        );
        assert!(parse(&[("TYPE", "IP4"), ("IP", "255.255.255.250"), ("SIZE", "6")]).is_ok());
        assert_field(
            parse(&[("TYPE", "ETHER"), ("MAC", "ff:ff:ff:ff:ff:ff"), ("SIZE", "2")]),
            "SIZE",
        );
    }

    #[test]
    fn test_ip6_static_size_derivation() {
        let (spec, attrs) = parse(&[
            ("TYPE", "IP6_STATIC"),
            ("IP6", "2001:db8::10"),
            ("PREFIX_LENGTH", "120"),
            ("MAC", "02:00:00:00:00:01"),
        ])
        .unwrap();
        assert_eq!(spec.size, 256 - 0x10);
        assert_eq!(attrs.get("SIZE"), Some("240"));

        assert_eq!(ip6_prefix_size(0, 64), u64::MAX);
        assert_eq!(ip6_prefix_size(5, 48), u64::MAX - 4);
        assert_eq!(ip6_prefix_size(0, 128), 1);
        assert_eq!(ip6_prefix_size(0xff, 120), 1);
    }

    #[test]
    fn test_port_blocks() {
        let (spec, _) = parse(&[
            ("TYPE", "ETHER"),
            ("SIZE", "3"),
            ("PORT_START", "10000"),
            ("PORT_SIZE", "100"),
        ])
        .unwrap();
        let ports = spec.ports.unwrap();
        assert_eq!(ports.external_range(2), "10201:10300");
        assert_eq!(ports.internal_range(2), "1-100/10201");

        assert_field(
            parse(&[("TYPE", "ETHER"), ("SIZE", "3"), ("PORT_SIZE", "100")]),
            "PORT_START",
        );
        assert_field(
            parse(&[
                ("TYPE", "ETHER"),
                ("SIZE", "10"),
                ("PORT_START", "65000"),
                ("PORT_SIZE", "100"),
            ]),
            "PORT_SIZE",
        );
    }

    #[test]
    fn test_security_groups_and_parent() {
        let (spec, _) = parse(&[
            ("TYPE", "ETHER"),
            ("SIZE", "3"),
            ("SECURITY_GROUPS", "0, 4,2"),
            ("PARENT_NETWORK_AR_ID", "7"),
        ])
        .unwrap();
        assert_eq!(format_security_groups(&spec.security_groups), "0,2,4");
        assert_eq!(spec.parent, Some(7));
    }
}
