//! Lease owners and their packed token form.

use crate::error::RangeError;
use std::fmt;
use std::str::FromStr;

const KIND_MASK: u64 = 0xFFFF_FFFF_0000_0000;
const ID_MASK: u64 = 0x0000_0000_FFFF_FFFF;

/// Kind of entity holding a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OwnerKind {
    None,
    Vm,
    Network,
    VRouter,
}

impl OwnerKind {
    /// Flag bits of this kind in a packed token.
    pub const fn bits(&self) -> u64 {
        match self {
            OwnerKind::None => 0,
            OwnerKind::Vm => 0x0000_0010_0000_0000,
            OwnerKind::Network => 0x0000_0040_0000_0000,
            OwnerKind::VRouter => 0x0004_0000_0000_0000,
        }
    }

    pub const fn from_bits(bits: u64) -> Option<OwnerKind> {
        match bits {
            0 => Some(OwnerKind::None),
            0x0000_0010_0000_0000 => Some(OwnerKind::Vm),
            0x0000_0040_0000_0000 => Some(OwnerKind::Network),
            0x0004_0000_0000_0000 => Some(OwnerKind::VRouter),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::None => "none",
            OwnerKind::Vm => "vm",
            OwnerKind::Network => "net",
            OwnerKind::VRouter => "vrouter",
        }
    }
}

/// The entity a lease belongs to.
///
/// Kind and id stay separate in memory; [`Owner::to_token`] packs them for
/// the persisted allocation index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner {
    kind: OwnerKind,
    id: i32,
}

impl Owner {
    pub const fn new(kind: OwnerKind, id: i32) -> Self {
        Self { kind, id }
    }

    pub const fn vm(id: i32) -> Self {
        Self::new(OwnerKind::Vm, id)
    }

    pub const fn network(id: i32) -> Self {
        Self::new(OwnerKind::Network, id)
    }

    pub const fn vrouter(id: i32) -> Self {
        Self::new(OwnerKind::VRouter, id)
    }

    /// Placeholder owner of addresses put on hold by an operator.
    pub const fn hold() -> Self {
        Self::new(OwnerKind::Vm, -1)
    }

    pub const fn is_hold(&self) -> bool {
        matches!(self.kind, OwnerKind::Vm) && self.id == -1
    }

    pub const fn kind(&self) -> OwnerKind {
        self.kind
    }

    pub const fn id(&self) -> i32 {
        self.id
    }

    pub const fn to_token(&self) -> u64 {
        self.kind.bits() | (self.id as u32 as u64)
    }

    pub fn from_token(token: u64) -> Result<Self, RangeError> {
        let kind = OwnerKind::from_bits(token & KIND_MASK).ok_or_else(|| {
            RangeError::invalid_field("ALLOCATED", format!("unknown owner kind in token {token}"))
        })?;
        let id = (token & ID_MASK) as u32 as i32;
        Ok(Self { kind, id })
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_hold() {
            return f.write_str("hold");
        }
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Parses `kind:id` (`vm:12`, `net:3`, `vrouter:1`) or `hold`.
impl FromStr for Owner {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("hold") {
            return Ok(Owner::hold());
        }
        let bad = || RangeError::invalid_field("OWNER", format!("expected kind:id, got '{s}'"));
        let (kind, id) = s.split_once(':').ok_or_else(bad)?;
        let kind = match kind.to_ascii_lowercase().as_str() {
            "vm" => OwnerKind::Vm,
            "net" | "network" => OwnerKind::Network,
            "vrouter" => OwnerKind::VRouter,
            "none" => OwnerKind::None,
            _ => return Err(bad()),
        };
        let id = id.parse::<i32>().map_err(|_| bad())?;
        Ok(Owner::new(kind, id))
    }
}
