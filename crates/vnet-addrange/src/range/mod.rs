//! A contiguous block of leasable addresses.
//!
//! An [`AddressRange`] is built from a definition [`Template`] and keeps:
//!
//! - the typed definition (family, size, first address of each family,
//!   ports, security groups, parent reservation)
//! - the open attribute record it was defined with
//! - its [`AllocationIndex`]
//! - the allocator chosen from `IPAM_MAD`
//!
//! Offset `n` of a range maps to `MAC + n`, `IP + n` and `IP6 + n`; SLAAC
//! addresses are derived from the offset's MAC.

mod allocator;
mod definition;
mod update;

pub use definition::PortBlock;
pub use update::UpdateReport;

use crate::address_type::AddressType;
use crate::allocation::AllocationIndex;
use crate::config::RangeContext;
use crate::error::{RangeError, RangeResult};
use crate::owner::Owner;
use allocator::Allocator;
use definition::{format_security_groups, parse_security_groups, RangeSpec};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};
use vnet_types::{format_ipv4, format_ipv6, slaac, MacAddress, Template, LINK_LOCAL_PREFIX};

/// Which address an allocation or release is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressTarget {
    /// Any free address.
    Next,
    Mac(MacAddress),
    Ip(u32),
    /// Static IPv6 address, or a SLAAC address under one of the range
    /// prefixes.
    Ip6(u128),
}

impl fmt::Display for AddressTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressTarget::Next => f.write_str("next free address"),
            AddressTarget::Mac(mac) => write!(f, "{mac}"),
            AddressTarget::Ip(ip) => f.write_str(&format_ipv4(*ip)),
            AddressTarget::Ip6(ip6) => f.write_str(&format_ipv6(*ip6)),
        }
    }
}

/// How an explicit address is checked before it is leased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FreeCheck {
    /// The address must be free.
    #[default]
    Strict,
    /// An address already leased to the same owner is re-issued instead of
    /// refused. Used when re-attaching a known lease.
    Reattach,
}

/// One lease as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    pub offset: u64,
    pub owner: Owner,
    pub lease: Template,
}

impl LeaseInfo {
    pub fn to_template(&self) -> Template {
        let mut t = self.lease.clone();
        t.set("OWNER", self.owner);
        t
    }
}

pub struct AddressRange {
    id: u32,
    spec: RangeSpec,
    /// Definition attributes; `ALLOCATED` is rendered from the index.
    attrs: Template,
    allocated: AllocationIndex,
    allocator: Allocator,
    ctx: RangeContext,
}

impl fmt::Debug for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressRange")
            .field("id", &self.id)
            .field("kind", &self.spec.kind)
            .field("size", &self.spec.size)
            .field("used", &self.used())
            .field("ipam_mad", &self.allocator.ipam_mad())
            .finish()
    }
}

impl AddressRange {
    /// Builds a new range from `definition`.
    ///
    /// IPAM-backed ranges are registered with their plugin first and adopt
    /// the attributes it returns. Any `ALLOCATED` value in the definition is
    /// ignored; a new range starts empty.
    pub async fn create(id: u32, definition: &Template, ctx: &RangeContext) -> RangeResult<Self> {
        let mut attrs = definition.clone();
        attrs.remove("ALLOCATED");
        attrs.set("AR_ID", id);

        let allocator = Allocator::select(&attrs, ctx)?;
        if let Some(manager) = allocator.manager() {
            let effective = manager.register_address_range(&attrs).await?;
            attrs.merge(&effective);
            attrs.remove("ALLOCATED");
            attrs.set("AR_ID", id);
        }

        let spec = match RangeSpec::parse(&mut attrs, ctx.mac_prefix()) {
            Ok(spec) => spec,
            Err(e) => {
                if let Some(manager) = allocator.manager() {
                    if let Err(unregister) = manager.unregister_address_range(&attrs).await {
                        warn!(ar_id = id, error = %unregister, "cannot unregister rejected address range");
                    }
                }
                return Err(e);
            }
        };

        info!(
            ar_id = id,
            kind = %spec.kind,
            size = spec.size,
            ipam_mad = allocator.ipam_mad().unwrap_or("internal"),
            "address range created"
        );

        Ok(Self {
            id,
            spec,
            attrs,
            allocated: AllocationIndex::new(),
            allocator,
            ctx: ctx.clone(),
        })
    }

    /// Rebuilds a range from its persisted template, without plugin traffic.
    pub fn restore(template: &Template, ctx: &RangeContext) -> RangeResult<Self> {
        let mut attrs = template.clone();
        let id = match attrs.parse::<u32>("AR_ID") {
            Some(Ok(id)) => id,
            Some(Err(_)) => return Err(RangeError::invalid_field("AR_ID", "not a valid range id")),
            None => return Err(RangeError::missing_field("AR_ID")),
        };
        let allocated_text = attrs.remove("ALLOCATED").unwrap_or_default();

        let allocator = Allocator::select(&attrs, ctx)?;
        let spec = RangeSpec::parse(&mut attrs, ctx.mac_prefix())?;
        let allocated = AllocationIndex::from_text(&allocated_text, spec.size, &id.to_string())?;

        debug!(ar_id = id, used = allocated.len(), "address range restored");

        Ok(Self {
            id,
            spec,
            attrs,
            allocated,
            allocator,
            ctx: ctx.clone(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> AddressType {
        self.spec.kind
    }

    pub fn size(&self) -> u64 {
        self.spec.size
    }

    pub fn used(&self) -> u64 {
        self.allocated.len() as u64
    }

    pub fn free_count(&self) -> u64 {
        self.spec.size - self.used()
    }

    pub fn first_mac(&self) -> MacAddress {
        self.spec.mac
    }

    pub fn ports(&self) -> Option<PortBlock> {
        self.spec.ports
    }

    pub fn security_groups(&self) -> &BTreeSet<u32> {
        &self.spec.security_groups
    }

    /// Id of the range this reservation was carved from.
    pub fn parent(&self) -> Option<u32> {
        self.spec.parent
    }

    pub fn is_ipam(&self) -> bool {
        self.allocator.ipam_mad().is_some()
    }

    pub fn ipam_mad(&self) -> Option<&str> {
        self.allocator.ipam_mad()
    }

    pub fn allocation(&self) -> &AllocationIndex {
        &self.allocated
    }

    pub fn attributes(&self) -> &Template {
        &self.attrs
    }

    /// True if `target` names an address of this range.
    pub fn contains(&self, target: &AddressTarget) -> bool {
        !matches!(target, AddressTarget::Next) && self.offset_of(target).is_ok()
    }

    pub fn owner_of(&self, target: &AddressTarget) -> Option<Owner> {
        self.offset_of(target)
            .ok()
            .and_then(|offset| self.allocated.get(offset))
    }

    fn mac_at(&self, offset: u64) -> MacAddress {
        self.spec.mac.offset(offset).unwrap_or(MacAddress::MAX)
    }

    fn ip_at(&self, offset: u64) -> u32 {
        self.spec.ip.wrapping_add(offset as u32)
    }

    fn ip6_at(&self, offset: u64) -> u128 {
        self.spec.ip6.wrapping_add(u128::from(offset))
    }

    /// Primary address of `offset`, for messages.
    fn describe(&self, offset: u64) -> String {
        if self.spec.kind.has_ip4() {
            format_ipv4(self.ip_at(offset))
        } else if self.spec.kind.has_ip6_static() {
            format_ipv6(self.ip6_at(offset))
        } else {
            self.mac_at(offset).to_string()
        }
    }

    /// Zero-based offset of `target` inside the range.
    pub fn offset_of(&self, target: &AddressTarget) -> RangeResult<u64> {
        let size = self.spec.size;
        let kind = self.spec.kind;
        let offset = match *target {
            AddressTarget::Next => {
                return Err(RangeError::invalid_field("ADDRESS", "an explicit address is required"))
            }
            AddressTarget::Mac(mac) => mac.distance_from(self.spec.mac),
            AddressTarget::Ip(ip) if kind.has_ip4() => ip.checked_sub(self.spec.ip).map(u64::from),
            AddressTarget::Ip(_) => None,
            AddressTarget::Ip6(ip6) if kind.has_ip6_static() => ip6
                .checked_sub(self.spec.ip6)
                .and_then(|d| u64::try_from(d).ok()),
            AddressTarget::Ip6(ip6) if kind.has_slaac() => {
                let prefix = (ip6 >> 64) as u64;
                let known = [self.spec.ula_prefix, self.spec.global_prefix]
                    .iter()
                    .any(|p| !p.is_zero() && p.value() == prefix);
                if known {
                    MacAddress::from_interface_id(ip6 as u64)
                        .and_then(|mac| mac.distance_from(self.spec.mac))
                } else {
                    None
                }
            }
            AddressTarget::Ip6(_) => None,
        };

        offset.filter(|o| *o < size).ok_or_else(|| RangeError::OutOfRange {
            address: target.to_string(),
            range: self.id,
        })
    }

    /// Fills `lease` with the addresses and inherited attributes of
    /// `offset`.
    fn write_lease(&self, offset: u64, lease: &mut Template) {
        let kind = self.spec.kind;
        let mac = self.mac_at(offset);

        lease.set("AR_ID", self.id);
        lease.set("MAC", mac);

        if kind.has_ip4() {
            lease.set("IP", format_ipv4(self.ip_at(offset)));
        }
        if kind.has_slaac() {
            if !self.spec.ula_prefix.is_zero() {
                lease.set("IP6_ULA", slaac(self.spec.ula_prefix, mac));
            }
            if !self.spec.global_prefix.is_zero() {
                lease.set("IP6_GLOBAL", slaac(self.spec.global_prefix, mac));
            }
        }
        if kind.has_ip6() {
            lease.set("IP6_LINK", slaac(LINK_LOCAL_PREFIX, mac));
        }
        if kind.has_ip6_static() {
            lease.set("IP6", format_ipv6(self.ip6_at(offset)));
            if let Some(prefix_length) = self.spec.prefix_length {
                lease.set("IP6_PREFIX_LENGTH", prefix_length);
            }
        }

        if let Some(ports) = self.spec.ports {
            lease.set("EXTERNAL_PORT_RANGE", ports.external_range(offset));
            lease.set("INTERNAL_PORT_RANGE", ports.internal_range(offset));
        }

        if !self.spec.security_groups.is_empty() {
            let mut groups = lease
                .get_trimmed("SECURITY_GROUPS")
                .and_then(|text| parse_security_groups(text).ok())
                .unwrap_or_default();
            groups.extend(self.spec.security_groups.iter().copied());
            lease.set("SECURITY_GROUPS", format_security_groups(&groups));
        }

        for attr in &self.ctx.config().inherited_attrs {
            if lease.contains(attr) {
                continue;
            }
            if let Some(value) = self.attrs.get(attr) {
                lease.set(attr, value);
            }
        }
    }

    /// Leases an address to `owner` and describes it in `lease`.
    ///
    /// Returns the leased offset. On error neither the range nor `lease`
    /// is changed.
    pub async fn allocate(
        &mut self,
        target: &AddressTarget,
        owner: Owner,
        lease: &mut Template,
        check: FreeCheck,
    ) -> RangeResult<u64> {
        let offset = match target {
            AddressTarget::Next => self.get_addr(1).await?,
            _ => {
                let offset = self.offset_of(target)?;
                match self.allocated.get(offset) {
                    None => self.allocate_addr(offset, 1).await?,
                    Some(current) if check == FreeCheck::Reattach && current == owner => {}
                    Some(_) => {
                        return Err(RangeError::AddressInUse {
                            address: target.to_string(),
                        })
                    }
                }
                offset
            }
        };

        self.write_lease(offset, lease);
        self.allocated.insert(offset, owner);
        debug!(ar_id = self.id, offset, owner = %owner, address = %self.describe(offset), "address leased");
        Ok(offset)
    }

    /// Puts an explicit address on hold so it is never handed out.
    pub async fn hold(&mut self, target: &AddressTarget) -> RangeResult<u64> {
        if matches!(target, AddressTarget::Next) {
            return Err(RangeError::invalid_field("ADDRESS", "hold requires an explicit address"));
        }
        let mut discard = Template::new();
        self.allocate(target, Owner::hold(), &mut discard, FreeCheck::Strict)
            .await
    }

    /// Releases the lease of `target` if it belongs to `owner`.
    pub async fn free(&mut self, target: &AddressTarget, owner: Owner) -> RangeResult<u64> {
        let offset = self.offset_of(target)?;
        match self.allocated.get(offset) {
            None => {
                return Err(RangeError::NotLeased {
                    address: target.to_string(),
                })
            }
            Some(holder) if holder != owner => {
                return Err(RangeError::OwnerMismatch {
                    address: target.to_string(),
                    holder: holder.to_string(),
                    owner: owner.to_string(),
                })
            }
            Some(_) => {}
        }

        self.free_addr(offset, 1).await?;
        self.allocated.remove(offset);
        debug!(ar_id = self.id, offset, owner = %owner, "address released");
        Ok(offset)
    }

    /// Releases the leases of `owner` among `count` addresses starting at
    /// `start`. Offsets leased to anyone else are left alone.
    ///
    /// Returns how many addresses were released. With an IPAM plugin each
    /// address is released separately; a plugin failure stops the walk and
    /// the addresses released before it stay released.
    ///
    /// This is the one operation that can fail with partial state: frees
    /// the plugin already confirmed cannot be taken back, so the index
    /// keeps them released and only the remaining leases are kept.
    pub async fn free_range(
        &mut self,
        start: &AddressTarget,
        count: u64,
        owner: Owner,
    ) -> RangeResult<u64> {
        let first = self.offset_of(start)?;
        let end = first.saturating_add(count).min(self.spec.size);
        let offsets: Vec<u64> = self
            .allocated
            .iter()
            .filter(|(offset, o)| *offset >= first && *offset < end && *o == owner)
            .map(|(offset, _)| offset)
            .collect();
        self.release_offsets(&offsets).await
    }

    /// Releases every lease of `owner`.
    ///
    /// Like [`free_range`](Self::free_range), a plugin failure part way
    /// through leaves the earlier releases in place.
    pub async fn free_by_owner(&mut self, owner: Owner) -> RangeResult<u64> {
        let offsets = self.allocated.offsets_of(owner);
        self.release_offsets(&offsets).await
    }

    async fn release_offsets(&mut self, offsets: &[u64]) -> RangeResult<u64> {
        let mut freed = 0;
        for &offset in offsets {
            self.free_addr(offset, 1).await?;
            self.allocated.remove(offset);
            freed += 1;
        }
        if freed > 0 {
            debug!(ar_id = self.id, freed, "addresses released");
        }
        Ok(freed)
    }

    /// Carves `size` addresses out of this range for `network_id`.
    ///
    /// The carved offsets are leased to the network, and the returned
    /// definition describes the new reservation range: it starts at the
    /// first carved address and points back to this range through
    /// `PARENT_NETWORK_AR_ID`.
    pub async fn reserve(
        &mut self,
        network_id: i32,
        size: u64,
        start: Option<&AddressTarget>,
    ) -> RangeResult<Template> {
        if size == 0 {
            return Err(RangeError::invalid_field("SIZE", "must be greater than zero"));
        }

        let offset = match start {
            None => self.get_addr(size).await?,
            Some(target) => {
                let offset = self.offset_of(target)?;
                if offset.checked_add(size).map_or(true, |end| end > self.spec.size) {
                    return Err(RangeError::OutOfRange {
                        address: format!("{target} + {size}"),
                        range: self.id,
                    });
                }
                if !self.allocated.is_run_free(offset, size) {
                    return Err(RangeError::AddressInUse {
                        address: target.to_string(),
                    });
                }
                self.allocate_addr(offset, size).await?;
                offset
            }
        };

        let owner = Owner::network(network_id);
        for i in 0..size {
            self.allocated.insert(offset + i, owner);
        }

        let mut definition = self.attrs.clone();
        for key in ["ALLOCATED", "AR_ID", "IPAM_MAD"] {
            definition.remove(key);
        }
        definition.set("SIZE", size);
        definition.set("MAC", self.mac_at(offset));
        if self.spec.kind.has_ip4() {
            definition.set("IP", format_ipv4(self.ip_at(offset)));
        }
        if self.spec.kind.has_ip6_static() {
            definition.set("IP6", format_ipv6(self.ip6_at(offset)));
        }
        if let Some(ports) = self.spec.ports {
            definition.set("PORT_START", u64::from(ports.start) + offset * u64::from(ports.size));
        }
        definition.set("PARENT_NETWORK_AR_ID", self.id);

        info!(ar_id = self.id, network_id, offset, size, "addresses reserved");
        Ok(definition)
    }

    /// Tells the plugin this range is going away. No-op for local ranges.
    pub async fn unregister(&self) -> RangeResult<()> {
        if let Some(manager) = self.allocator.manager() {
            manager.unregister_address_range(&self.to_template()).await?;
        }
        Ok(())
    }

    /// Persisted form, including `ALLOCATED`.
    pub fn to_template(&self) -> Template {
        let mut t = self.attrs.clone();
        t.set("AR_ID", self.id);
        t.set("ALLOCATED", self.allocated.to_text());
        t
    }

    /// Client-facing form: the persisted attributes plus the last address
    /// of each family and the lease count.
    pub fn to_extended(&self) -> Template {
        let mut t = self.to_template();
        let kind = self.spec.kind;
        let last = self.spec.size - 1;
        let first_mac = self.mac_at(0);
        let last_mac = self.mac_at(last);

        t.set("MAC_END", last_mac);
        if kind.has_ip4() {
            t.set("IP_END", format_ipv4(self.ip_at(last)));
        }
        if kind.has_slaac() {
            if !self.spec.ula_prefix.is_zero() {
                t.set("IP6_ULA", slaac(self.spec.ula_prefix, first_mac));
                t.set("IP6_ULA_END", slaac(self.spec.ula_prefix, last_mac));
            }
            if !self.spec.global_prefix.is_zero() {
                t.set("IP6_GLOBAL", slaac(self.spec.global_prefix, first_mac));
                t.set("IP6_GLOBAL_END", slaac(self.spec.global_prefix, last_mac));
            }
        }
        if kind.has_ip6_static() {
            t.set("IP6_END", format_ipv6(self.ip6_at(last)));
        }
        t.set("USED_LEASES", self.used());
        t
    }

    pub fn leases(&self) -> Vec<LeaseInfo> {
        self.allocated
            .iter()
            .map(|(offset, owner)| {
                let mut lease = Template::new();
                self.write_lease(offset, &mut lease);
                LeaseInfo {
                    offset,
                    owner,
                    lease,
                }
            })
            .collect()
    }
}
