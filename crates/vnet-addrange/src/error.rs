//! Error types for address range and pool operations.

use std::io;
use thiserror::Error;
use vnet_ipam::IpamError;

/// Result type alias for address range operations.
pub type RangeResult<T> = Result<T, RangeError>;

/// Broad failure classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad syntax or a missing mandatory field; nothing was changed.
    Malformed,
    /// Address taken, range full or reservation overlapping leases.
    Capacity,
    /// Persisted state that cannot be rebuilt.
    Inconsistent,
    /// The IPAM plugin failed or did not answer.
    External,
    /// Change to a restricted or immutable field.
    Privilege,
}

/// Errors that can occur in address range operations.
///
/// Every operation validates before it mutates, so an error always means
/// the range (and pool) are unchanged unless the variant says otherwise.
#[derive(Debug, Error)]
pub enum RangeError {
    /// A definition attribute is present but malformed.
    #[error("invalid {field}: {message}")]
    InvalidField { field: String, message: String },

    /// A mandatory definition attribute is absent.
    #[error("missing mandatory attribute {field}")]
    MissingField { field: String },

    #[error("no free address")]
    NoFreeAddress,

    /// The address does not belong to the range.
    #[error("address {address} is not part of address range {range}")]
    OutOfRange { address: String, range: u32 },

    /// No range in the pool contains the address.
    #[error("address {address} does not belong to any address range")]
    AddressNotInPool { address: String },

    #[error("address {address} is already in use")]
    AddressInUse { address: String },

    #[error("address {address} is not leased")]
    NotLeased { address: String },

    /// The lease exists but belongs to someone else.
    #[error("address {address} is leased to {holder}, not to {owner}")]
    OwnerMismatch {
        address: String,
        holder: String,
        owner: String,
    },

    #[error("address range {0} not found")]
    RangeNotFound(u32),

    /// Removal refused while leases are outstanding.
    #[error("address range {id} has {used} addresses in use")]
    RangeInUse { id: u32, used: u64 },

    /// New size would orphan an allocated offset.
    #[error("cannot shrink address range to {size}: offset {offset} is in use")]
    ShrinkInUse { size: u64, offset: u64 },

    /// Persisted allocation data does not fit the range.
    #[error("inconsistent address range {range}: {message}")]
    Inconsistent { range: String, message: String },

    #[error("attribute {field} cannot be changed")]
    Immutable { field: String },

    #[error("attribute {field} is restricted and requires privileged access")]
    Restricted { field: String },

    /// The plugin picked an address the range cannot accept.
    #[error("IPAM plugin returned an unusable address: {reason}")]
    UntrustedAddress { reason: String },

    #[error("address range uses IPAM driver {mad} but no driver is connected")]
    NoIpamDriver { mad: String },

    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error("invalid configuration for {field}: {message}")]
    Config { field: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RangeError {
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn inconsistent(range: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Inconsistent {
            range: range.into(),
            message: message.into(),
        }
    }

    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn untrusted(reason: impl Into<String>) -> Self {
        Self::UntrustedAddress {
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RangeError::InvalidField { .. }
            | RangeError::MissingField { .. }
            | RangeError::OutOfRange { .. }
            | RangeError::AddressNotInPool { .. }
            | RangeError::RangeNotFound(_)
            | RangeError::Config { .. }
            | RangeError::Io(_) => ErrorClass::Malformed,

            RangeError::NoFreeAddress
            | RangeError::AddressInUse { .. }
            | RangeError::NotLeased { .. }
            | RangeError::OwnerMismatch { .. }
            | RangeError::RangeInUse { .. }
            | RangeError::ShrinkInUse { .. } => ErrorClass::Capacity,

            RangeError::Inconsistent { .. } => ErrorClass::Inconsistent,

            RangeError::UntrustedAddress { .. }
            | RangeError::NoIpamDriver { .. }
            | RangeError::Ipam(_) => ErrorClass::External,

            RangeError::Immutable { .. } | RangeError::Restricted { .. } => ErrorClass::Privilege,
        }
    }
}
