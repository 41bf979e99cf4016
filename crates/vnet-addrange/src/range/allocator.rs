//! Local and IPAM-delegated address selection.
//!
//! A range picks its allocator once, from `IPAM_MAD`: absent or `internal`
//! selects the local allocator, any other value names the plugin that owns
//! the address space. Both expose the same three primitives on
//! [`AddressRange`]: pick free offsets, confirm a chosen block and release
//! a block.

use super::{AddressRange, AddressTarget};
use crate::config::RangeContext;
use crate::error::{RangeError, RangeResult};
use std::sync::Arc;
use tracing::debug;
use vnet_ipam::IpamManager;
use vnet_types::{parse_ipv4, parse_ipv6, Template};

pub(crate) enum Allocator {
    Internal(InternalAllocator),
    Ipam(IpamAllocator),
}

/// Local allocator: a circular cursor for single addresses, first fit for
/// blocks.
#[derive(Debug, Default)]
pub(crate) struct InternalAllocator {
    next: u64,
}

pub(crate) struct IpamAllocator {
    pub(crate) manager: Arc<IpamManager>,
    pub(crate) mad: String,
}

impl Allocator {
    pub(crate) fn select(attrs: &Template, ctx: &RangeContext) -> RangeResult<Self> {
        match attrs.get_trimmed("IPAM_MAD") {
            None => Ok(Allocator::Internal(InternalAllocator::default())),
            Some(mad) if mad.eq_ignore_ascii_case("internal") => {
                Ok(Allocator::Internal(InternalAllocator::default()))
            }
            Some(mad) => {
                let manager = ctx.ipam().cloned().ok_or_else(|| RangeError::NoIpamDriver {
                    mad: mad.to_string(),
                })?;
                Ok(Allocator::Ipam(IpamAllocator {
                    manager,
                    mad: mad.to_string(),
                }))
            }
        }
    }

    pub(crate) fn ipam_mad(&self) -> Option<&str> {
        match self {
            Allocator::Internal(_) => None,
            Allocator::Ipam(ipam) => Some(&ipam.mad),
        }
    }

    pub(crate) fn manager(&self) -> Option<Arc<IpamManager>> {
        match self {
            Allocator::Internal(_) => None,
            Allocator::Ipam(ipam) => Some(Arc::clone(&ipam.manager)),
        }
    }
}

impl AddressRange {
    /// Picks `count` consecutive free offsets.
    ///
    /// Offsets chosen by a plugin are checked against the range bounds and
    /// the local index before they are returned.
    pub(crate) async fn get_addr(&mut self, count: u64) -> RangeResult<u64> {
        let manager = match &mut self.allocator {
            Allocator::Internal(local) => {
                let size = self.spec.size;
                let found = if count == 1 {
                    self.allocated.next_free_from(local.next, size)
                } else {
                    self.allocated.first_free_run(size, count)
                };
                let offset = found.ok_or(RangeError::NoFreeAddress)?;
                if count == 1 {
                    local.next = (offset + 1) % size;
                }
                return Ok(offset);
            }
            Allocator::Ipam(ipam) => Arc::clone(&ipam.manager),
        };

        let reply = manager.get_address(&self.to_template(), count).await?;
        let offset = self.offset_from_reply(&reply)?;
        debug!(ar_id = self.id, offset, count, "IPAM plugin picked address");

        if offset
            .checked_add(count)
            .map_or(true, |end| end > self.spec.size)
        {
            return Err(RangeError::untrusted(format!(
                "block of {count} at offset {offset} runs past address range {}",
                self.id
            )));
        }
        if !self.allocated.is_run_free(offset, count) {
            return Err(RangeError::untrusted(format!(
                "{} is already in use in address range {}",
                self.describe(offset),
                self.id
            )));
        }
        Ok(offset)
    }

    /// Confirms a block picked by the caller.
    pub(crate) async fn allocate_addr(&self, offset: u64, count: u64) -> RangeResult<()> {
        if let Some(manager) = self.allocator.manager() {
            manager
                .allocate_address(&self.to_template(), self.address_payload(offset, count))
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn free_addr(&self, offset: u64, count: u64) -> RangeResult<()> {
        if let Some(manager) = self.allocator.manager() {
            manager
                .free_address(&self.to_template(), self.address_payload(offset, count))
                .await?;
        }
        Ok(())
    }

    /// First address of a block in the family the plugin works with.
    fn address_payload(&self, offset: u64, count: u64) -> Template {
        let mut address = Template::new();
        address.set("MAC", self.mac_at(offset));
        if self.spec.kind.has_ip4() {
            address.set("IP", vnet_types::format_ipv4(self.ip_at(offset)));
        }
        if self.spec.kind.has_ip6_static() {
            address.set("IP6", vnet_types::format_ipv6(self.ip6_at(offset)));
        }
        address.set("SIZE", count);
        address
    }

    fn offset_from_reply(&self, reply: &Template) -> RangeResult<u64> {
        let kind = self.spec.kind;
        let target = if kind.has_ip4() {
            let text = reply
                .get_trimmed("IP")
                .ok_or_else(|| RangeError::untrusted("reply carries no IP"))?;
            AddressTarget::Ip(parse_ipv4(text).map_err(|e| RangeError::untrusted(e.to_string()))?)
        } else if kind.has_ip6_static() {
            let text = reply
                .get_trimmed("IP6")
                .ok_or_else(|| RangeError::untrusted("reply carries no IP6"))?;
            AddressTarget::Ip6(parse_ipv6(text).map_err(|e| RangeError::untrusted(e.to_string()))?)
        } else {
            let text = reply
                .get_trimmed("MAC")
                .ok_or_else(|| RangeError::untrusted("reply carries no MAC"))?;
            AddressTarget::Mac(text.parse().map_err(|e: vnet_types::ParseError| {
                RangeError::untrusted(e.to_string())
            })?)
        };
        self.offset_of(&target)
            .map_err(|e| RangeError::untrusted(e.to_string()))
    }
}
