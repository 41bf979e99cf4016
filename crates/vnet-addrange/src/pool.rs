//! The set of address ranges of one virtual network.
//!
//! A [`RangePool`] routes lease requests to its ranges in ascending id
//! order (which is insertion order), creates and removes ranges, and keeps
//! an aggregate count of leased addresses. The count is adjusted by each
//! range's before/after difference, so partial work done by a failing
//! operation is still accounted for.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::config::RangeContext;
use crate::error::{ErrorClass, RangeError, RangeResult};
use crate::owner::Owner;
use crate::range::{AddressRange, AddressTarget, FreeCheck, LeaseInfo, UpdateReport};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};
use vnet_types::Template;

const SOURCE: &str = "RangePool";

pub struct RangePool {
    ranges: BTreeMap<u32, AddressRange>,
    next_id: u32,
    used: u64,
    ctx: RangeContext,
}

impl fmt::Debug for RangePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangePool")
            .field("ranges", &self.ranges.values().collect::<Vec<_>>())
            .field("next_id", &self.next_id)
            .field("used", &self.used)
            .finish()
    }
}

fn adjust(used: &mut u64, before: u64, after: u64) {
    *used = (*used + after).saturating_sub(before);
}

impl RangePool {
    pub fn new(ctx: RangeContext) -> Self {
        Self {
            ranges: BTreeMap::new(),
            next_id: 0,
            used: 0,
            ctx,
        }
    }

    /// Rebuilds a pool from persisted range templates.
    ///
    /// Fails on the first template that cannot be restored. New ranges get
    /// ids above the highest restored one.
    pub fn restore(templates: &[Template], ctx: RangeContext) -> RangeResult<Self> {
        let mut pool = Self::new(ctx);
        for template in templates {
            let range = AddressRange::restore(template, &pool.ctx)?;
            let id = range.id();
            if pool.ranges.contains_key(&id) {
                return Err(RangeError::inconsistent(
                    id.to_string(),
                    "address range id appears twice",
                ));
            }
            pool.used += range.used();
            pool.next_id = pool.next_id.max(id.saturating_add(1));
            pool.ranges.insert(id, range);
        }
        pool.check_used();
        debug!(ranges = pool.ranges.len(), used = pool.used, "address pool restored");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&AddressRange> {
        self.ranges.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressRange> {
        self.ranges.values()
    }

    /// Leased addresses across all ranges.
    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn context(&self) -> &RangeContext {
        &self.ctx
    }

    fn check_used(&self) {
        debug_assert_eq!(
            self.used,
            self.ranges.values().map(AddressRange::used).sum::<u64>(),
            "pool used counter drifted from its ranges"
        );
    }

    fn range_mut(&mut self, id: u32) -> RangeResult<&mut AddressRange> {
        self.ranges.get_mut(&id).ok_or(RangeError::RangeNotFound(id))
    }

    /// First range, in id order, that owns `target`.
    fn locate(&self, target: &AddressTarget) -> RangeResult<u32> {
        self.ranges
            .values()
            .find(|range| range.contains(target))
            .map(AddressRange::id)
            .ok_or_else(|| RangeError::AddressNotInPool {
                address: target.to_string(),
            })
    }

    /// Creates a range from `definition` and returns its id.
    pub async fn add_range(&mut self, definition: &Template) -> RangeResult<u32> {
        let id = self.next_id;
        let range = match AddressRange::create(id, definition, &self.ctx).await {
            Ok(range) => range,
            Err(e) => {
                crate::audit_log!(AuditRecord::new(AuditCategory::RangeCreate, SOURCE, "add_range")
                    .with_object_id(id.to_string())
                    .with_error(e.to_string()));
                return Err(e);
            }
        };

        crate::audit_log!(AuditRecord::new(AuditCategory::RangeCreate, SOURCE, "add_range")
            .with_object_id(id.to_string())
            .with_details(serde_json::json!({
                "type": range.kind().as_str(),
                "size": range.size(),
                "ipam_mad": range.ipam_mad(),
                "parent": range.parent(),
            })));

        self.next_id = id.saturating_add(1);
        self.ranges.insert(id, range);
        Ok(id)
    }

    /// Removes a range and returns it.
    ///
    /// Without `force`, a range with leases is refused and an IPAM plugin
    /// that fails to unregister the range aborts the removal.
    pub async fn remove_range(&mut self, id: u32, force: bool) -> RangeResult<AddressRange> {
        let range = self.ranges.get(&id).ok_or(RangeError::RangeNotFound(id))?;

        if range.used() > 0 && !force {
            let err = RangeError::RangeInUse {
                id,
                used: range.used(),
            };
            crate::audit_log!(AuditRecord::new(AuditCategory::RangeDelete, SOURCE, "remove_range")
                .with_outcome(AuditOutcome::Denied)
                .with_object_id(id.to_string())
                .with_error(err.to_string()));
            return Err(err);
        }

        if let Err(e) = range.unregister().await {
            if !force {
                crate::audit_log!(AuditRecord::new(AuditCategory::RangeDelete, SOURCE, "remove_range")
                    .with_object_id(id.to_string())
                    .with_error(e.to_string()));
                return Err(e);
            }
            warn!(ar_id = id, error = %e, "IPAM plugin did not unregister address range, removing anyway");
        }

        let range = self.ranges.remove(&id).ok_or(RangeError::RangeNotFound(id))?;
        self.used = self.used.saturating_sub(range.used());
        self.check_used();

        crate::audit_log!(AuditRecord::new(AuditCategory::RangeDelete, SOURCE, "remove_range")
            .with_object_id(id.to_string())
            .with_details(serde_json::json!({ "force": force, "released": range.used() })));
        Ok(range)
    }

    /// Leases an address to `owner` and returns the id of the range it came
    /// from.
    ///
    /// With `ar_id` only that range is asked. Otherwise a request for any
    /// address tries every range in order and an explicit address goes to
    /// the first range that contains it.
    pub async fn allocate(
        &mut self,
        target: &AddressTarget,
        owner: Owner,
        lease: &mut Template,
        ar_id: Option<u32>,
        check: FreeCheck,
    ) -> RangeResult<u32> {
        let id = match (ar_id, target) {
            (Some(id), _) => id,
            (None, AddressTarget::Next) => return self.allocate_any(owner, lease).await,
            (None, _) => self.locate(target)?,
        };

        let range = self.ranges.get_mut(&id).ok_or(RangeError::RangeNotFound(id))?;
        let before = range.used();
        let result = range.allocate(target, owner, lease, check).await;
        adjust(&mut self.used, before, range.used());
        self.check_used();
        result.map(|_| id)
    }

    async fn allocate_any(&mut self, owner: Owner, lease: &mut Template) -> RangeResult<u32> {
        let mut outcome = Err(RangeError::NoFreeAddress);
        for (&id, range) in self.ranges.iter_mut() {
            let before = range.used();
            let result = range
                .allocate(&AddressTarget::Next, owner, lease, FreeCheck::Strict)
                .await;
            adjust(&mut self.used, before, range.used());
            match result {
                Ok(_) => {
                    outcome = Ok(id);
                    break;
                }
                Err(e) => {
                    debug!(ar_id = id, error = %e, "address range cannot lease, trying next");
                    outcome = Err(e);
                }
            }
        }
        self.check_used();
        outcome
    }

    /// Puts an explicit address on hold.
    pub async fn hold(&mut self, target: &AddressTarget, ar_id: Option<u32>) -> RangeResult<u32> {
        let id = match ar_id {
            Some(id) => id,
            None => self.locate(target)?,
        };
        let range = self.ranges.get_mut(&id).ok_or(RangeError::RangeNotFound(id))?;
        let before = range.used();
        let result = range.hold(target).await;
        adjust(&mut self.used, before, range.used());
        self.check_used();

        let record = AuditRecord::new(AuditCategory::AdminAction, SOURCE, "hold")
            .with_object_id(id.to_string())
            .with_details(serde_json::json!({ "address": target.to_string() }));
        match &result {
            Ok(_) => {
                crate::audit_log!(record);
            }
            Err(e) => {
                crate::audit_log!(record.with_error(e.to_string()));
            }
        }
        result.map(|_| id)
    }

    /// Releases the lease of `target` held by `owner`.
    pub async fn free(
        &mut self,
        target: &AddressTarget,
        owner: Owner,
        ar_id: Option<u32>,
    ) -> RangeResult<u32> {
        let id = match ar_id {
            Some(id) => id,
            None => self.locate(target)?,
        };
        let range = self.ranges.get_mut(&id).ok_or(RangeError::RangeNotFound(id))?;
        let before = range.used();
        let result = range.free(target, owner).await;
        adjust(&mut self.used, before, range.used());
        self.check_used();

        if owner.is_hold() && result.is_ok() {
            crate::audit_log!(AuditRecord::new(AuditCategory::AdminAction, SOURCE, "release_hold")
                .with_object_id(id.to_string())
                .with_details(serde_json::json!({ "address": target.to_string() })));
        }
        result.map(|_| id)
    }

    /// Releases the leases of `owner` among `count` addresses of range
    /// `ar_id` starting at `start`.
    pub async fn free_range(
        &mut self,
        ar_id: u32,
        start: &AddressTarget,
        count: u64,
        owner: Owner,
    ) -> RangeResult<u64> {
        let range = self.ranges.get_mut(&ar_id).ok_or(RangeError::RangeNotFound(ar_id))?;
        let before = range.used();
        let result = range.free_range(start, count, owner).await;
        adjust(&mut self.used, before, range.used());
        self.check_used();
        result
    }

    /// Releases every lease of `owner` in every range.
    ///
    /// Stops at the first range that fails; leases released before the
    /// failure stay released.
    pub async fn free_by_owner(&mut self, owner: Owner) -> RangeResult<u64> {
        let mut freed = 0;
        let mut failure = None;
        for range in self.ranges.values_mut() {
            let before = range.used();
            let result = range.free_by_owner(owner).await;
            adjust(&mut self.used, before, range.used());
            match result {
                Ok(n) => freed += n,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.check_used();
        match failure {
            Some(e) => Err(e),
            None => Ok(freed),
        }
    }

    /// Carves `size` addresses for `network_id` and returns the definition
    /// of the reservation range.
    ///
    /// Without `ar_id` the first range with enough free addresses that can
    /// satisfy the request is used. A `start` address requires `ar_id`.
    pub async fn reserve(
        &mut self,
        network_id: i32,
        size: u64,
        ar_id: Option<u32>,
        start: Option<&AddressTarget>,
    ) -> RangeResult<Template> {
        let result = match ar_id {
            Some(id) => self.reserve_in(id, network_id, size, start).await,
            None if start.is_some() => Err(RangeError::invalid_field(
                "AR_ID",
                "a reservation at an explicit address needs the range id",
            )),
            None => self.reserve_any(network_id, size).await,
        };

        let record = AuditRecord::new(AuditCategory::Reservation, SOURCE, "reserve")
            .with_details(serde_json::json!({ "network": network_id, "size": size }));
        match &result {
            Ok(definition) => {
                let parent = definition.get("PARENT_NETWORK_AR_ID").unwrap_or("");
                crate::audit_log!(record.with_object_id(parent));
            }
            Err(e) => {
                crate::audit_log!(record.with_error(e.to_string()));
            }
        }
        result
    }

    async fn reserve_in(
        &mut self,
        id: u32,
        network_id: i32,
        size: u64,
        start: Option<&AddressTarget>,
    ) -> RangeResult<Template> {
        let range = self.ranges.get_mut(&id).ok_or(RangeError::RangeNotFound(id))?;
        let before = range.used();
        let result = range.reserve(network_id, size, start).await;
        adjust(&mut self.used, before, range.used());
        self.check_used();
        result
    }

    async fn reserve_any(&mut self, network_id: i32, size: u64) -> RangeResult<Template> {
        let mut outcome = Err(RangeError::NoFreeAddress);
        for range in self.ranges.values_mut() {
            if range.free_count() < size {
                continue;
            }
            let before = range.used();
            outcome = range.reserve(network_id, size, None).await;
            adjust(&mut self.used, before, range.used());
            if outcome.is_ok() {
                break;
            }
        }
        self.check_used();
        outcome
    }

    /// Applies `replacement` to the range named by its `AR_ID`.
    pub fn update(&mut self, replacement: &Template, privileged: bool) -> RangeResult<UpdateReport> {
        let id = match replacement.parse::<u32>("AR_ID") {
            Some(Ok(id)) => id,
            Some(Err(_)) => return Err(RangeError::invalid_field("AR_ID", "not a valid range id")),
            None => return Err(RangeError::missing_field("AR_ID")),
        };
        let result = self.range_mut(id)?.update(replacement, privileged);

        let record = AuditRecord::new(AuditCategory::RangeModify, SOURCE, "update")
            .with_object_id(id.to_string());
        match &result {
            Ok(report) => {
                crate::audit_log!(record.with_details(serde_json::json!({
                    "privileged": privileged,
                    "changed_inherited": report.changed_inherited,
                    "security_groups_added": report.security_groups_added,
                    "security_groups_removed": report.security_groups_removed,
                })));
            }
            Err(e) if e.class() == ErrorClass::Privilege => {
                crate::audit_log!(record
                    .with_outcome(AuditOutcome::Denied)
                    .with_error(e.to_string()));
            }
            Err(e) => {
                crate::audit_log!(record.with_error(e.to_string()));
            }
        }
        result
    }

    /// Persisted form of every range, in id order.
    pub fn to_templates(&self) -> Vec<Template> {
        self.ranges.values().map(AddressRange::to_template).collect()
    }

    pub fn to_extended(&self) -> Vec<Template> {
        self.ranges.values().map(AddressRange::to_extended).collect()
    }

    /// Leases of every range, tagged with the range id.
    pub fn leases(&self) -> Vec<(u32, LeaseInfo)> {
        self.ranges
            .values()
            .flat_map(|range| range.leases().into_iter().map(move |l| (range.id(), l)))
            .collect()
    }

    /// Union of the security groups of all ranges.
    pub fn security_groups(&self) -> BTreeSet<u32> {
        self.ranges
            .values()
            .flat_map(|range| range.security_groups().iter().copied())
            .collect()
    }

    /// Range a reservation range was carved from.
    pub fn parent_of(&self, ar_id: u32) -> RangeResult<Option<u32>> {
        self.ranges
            .get(&ar_id)
            .map(AddressRange::parent)
            .ok_or(RangeError::RangeNotFound(ar_id))
    }
}
