//! Address primitives shared by the virtual network address-range crates.
//!
//! This crate provides the fixed-width encodings every address range is
//! built on:
//!
//! - [`MacAddress`]: 48-bit Ethernet addresses, splittable into the
//!   `(upper 16, lower 32)` word pair used by range arithmetic
//! - [`parse_ipv4`] / [`format_ipv4`]: strict dotted-quad IPv4 codec
//! - [`Ipv6Prefix`], [`parse_ipv6`]: 64-bit prefixes and 128-bit addresses
//! - [`slaac`]: EUI-64 address derivation from a prefix and a MAC
//! - [`Template`]: the open key/value attribute record ranges and leases
//!   are described with

mod ip;
mod mac;
mod template;

pub use ip::{
    format_ipv4, format_ipv6, ipv6_words, parse_ipv4, parse_ipv6, slaac, Ipv6Prefix,
    LINK_LOCAL_PREFIX,
};
pub use mac::MacAddress;
pub use template::Template;

/// Error returned when address text cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IPv4 address: {0}")]
    InvalidIpv4Address(String),

    #[error("invalid IPv6 address: {0}")]
    InvalidIpv6Address(String),

    #[error("invalid IPv6 prefix: {0}")]
    InvalidIpv6Prefix(String),
}
