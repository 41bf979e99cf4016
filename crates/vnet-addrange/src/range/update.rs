//! In-place update of a range definition.

use super::definition::RangeSpec;
use super::AddressRange;
use crate::address_type::AddressType;
use crate::error::{RangeError, RangeResult};
use std::collections::BTreeSet;
use tracing::{debug, info};
use vnet_types::Template;

/// Attributes an update never changes; the current values are kept.
const RETAINED: [&str; 7] = [
    "AR_ID",
    "MAC",
    "IP",
    "IP6",
    "ALLOCATED",
    "IPAM_MAD",
    "PARENT_NETWORK_AR_ID",
];

/// Kept at their current value when the replacement leaves them out.
const DEFAULTED: [&str; 3] = ["TYPE", "SIZE", "PREFIX_LENGTH"];

/// What an update changed that issued leases may still reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Inherited attributes whose value changed, was added or was removed.
    pub changed_inherited: Vec<String>,
    pub security_groups_added: BTreeSet<u32>,
    pub security_groups_removed: BTreeSet<u32>,
}

impl UpdateReport {
    pub fn is_empty(&self) -> bool {
        self.changed_inherited.is_empty()
            && self.security_groups_added.is_empty()
            && self.security_groups_removed.is_empty()
    }
}

impl AddressRange {
    /// Replaces the definition attributes with `replacement`.
    ///
    /// Nothing changes unless every check passes. Only `privileged`
    /// callers may touch the configured restricted attributes.
    pub fn update(&mut self, replacement: &Template, privileged: bool) -> RangeResult<UpdateReport> {
        let mut merged = Template::new();
        for (key, value) in replacement.iter() {
            if !RETAINED.contains(&key) {
                merged.set(key, value);
            }
        }
        for key in RETAINED.iter().chain(DEFAULTED.iter()) {
            if merged.contains(key) {
                continue;
            }
            if let Some(value) = self.attrs.get(key) {
                merged.set(key, value);
            }
        }

        if let Some(text) = merged.get_trimmed("TYPE") {
            let kind: AddressType = text.parse()?;
            if kind != self.spec.kind {
                return Err(RangeError::Immutable {
                    field: "TYPE".to_string(),
                });
            }
        }

        if !privileged {
            let config = self.ctx.config();
            if let Some(field) = config
                .restricted_attrs
                .iter()
                .find(|attr| self.attrs.get(attr) != merged.get(attr))
            {
                return Err(RangeError::Restricted {
                    field: field.clone(),
                });
            }
        }

        let spec = RangeSpec::parse(&mut merged, self.ctx.mac_prefix())?;

        if spec.size != self.spec.size {
            if self.spec.parent.is_some() {
                return Err(RangeError::Immutable {
                    field: "SIZE".to_string(),
                });
            }
            if let Some(offset) = self.allocated.max_offset().filter(|o| *o >= spec.size) {
                return Err(RangeError::ShrinkInUse {
                    size: spec.size,
                    offset,
                });
            }
        }

        let changed_inherited: Vec<String> = self
            .ctx
            .config()
            .inherited_attrs
            .iter()
            .filter(|attr| self.attrs.get(attr) != merged.get(attr))
            .cloned()
            .collect();
        let report = UpdateReport {
            changed_inherited,
            security_groups_added: spec
                .security_groups
                .difference(&self.spec.security_groups)
                .copied()
                .collect(),
            security_groups_removed: self
                .spec
                .security_groups
                .difference(&spec.security_groups)
                .copied()
                .collect(),
        };

        if spec.size != self.spec.size {
            info!(ar_id = self.id, from = self.spec.size, to = spec.size, "address range resized");
        }
        debug!(ar_id = self.id, ?report, "address range updated");

        self.spec = spec;
        self.attrs = merged;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RangeContext;
    use crate::owner::Owner;
    use crate::range::{AddressTarget, FreeCheck};
    use pretty_assertions::assert_eq;

    fn definition(pairs: &[(&str, &str)]) -> Template {
        pairs.iter().copied().collect()
    }

    async fn range(pairs: &[(&str, &str)]) -> AddressRange {
        AddressRange::create(1, &definition(pairs), &RangeContext::default())
            .await
            .unwrap()
    }

    const BASE: [(&str, &str); 5] = [
        ("TYPE", "IP4"),
        ("IP", "10.0.0.1"),
        ("SIZE", "10"),
        ("GATEWAY", "10.0.0.254"),
        ("SECURITY_GROUPS", "0,2"),
    ];

    #[tokio::test]
    async fn test_reports_inherited_and_security_group_changes() {
        let mut ar = range(&BASE).await;
        let replacement = definition(&[
            ("GATEWAY", "10.0.0.253"),
            ("DNS", "1.1.1.1"),
            ("SECURITY_GROUPS", "2,4"),
            ("IP", "192.168.0.1"),
            ("NOTE", "free text"),
        ]);
        let report = ar.update(&replacement, false).unwrap();

        assert_eq!(report.changed_inherited, vec!["GATEWAY", "DNS"]);
        assert_eq!(report.security_groups_added, BTreeSet::from([4]));
        assert_eq!(report.security_groups_removed, BTreeSet::from([0]));

        let t = ar.to_template();
        assert_eq!(t.get("IP"), Some("10.0.0.1"));
        assert_eq!(t.get("NOTE"), Some("free text"));
        assert_eq!(t.get("SIZE"), Some("10"));
        assert_eq!(t.get("TYPE"), Some("IP4"));
    }

    #[tokio::test]
    async fn test_unchanged_update_reports_nothing() {
        let mut ar = range(&BASE).await;
        let same = ar.to_template();
        assert!(ar.update(&same, false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_type_change_refused() {
        let mut ar = range(&BASE).await;
        let err = ar.update(&definition(&[("TYPE", "ETHER")]), true).unwrap_err();
        assert!(matches!(err, RangeError::Immutable { ref field } if field == "TYPE"));
        assert!(ar.update(&definition(&[("TYPE", "ip4")]), false).is_ok());
    }

    #[tokio::test]
    async fn test_shrink_below_lease_refused() {
        let mut ar = range(&BASE).await;
        ar.allocate(
            &AddressTarget::Ip(vnet_types::parse_ipv4("10.0.0.6").unwrap()),
            Owner::vm(1),
            &mut Template::new(),
            FreeCheck::Strict,
        )
        .await
        .unwrap();
        let before = ar.to_template();

        let err = ar.update(&definition(&[("SIZE", "5")]), false).unwrap_err();
        assert!(matches!(err, RangeError::ShrinkInUse { size: 5, offset: 5 }));
        assert_eq!(ar.to_template(), before);

        ar.update(&definition(&[("SIZE", "6")]), false).unwrap();
        assert_eq!(ar.size(), 6);
        ar.update(&definition(&[("SIZE", "20")]), false).unwrap();
        assert_eq!(ar.free_count(), 19);
    }

    #[tokio::test]
    async fn test_shrink_counts_reserved_offsets() {
        let mut ar = range(&BASE).await;
        ar.reserve(3, 2, Some(&AddressTarget::Ip(vnet_types::parse_ipv4("10.0.0.8").unwrap())))
            .await
            .unwrap();
        let err = ar.update(&definition(&[("SIZE", "8")]), false).unwrap_err();
        assert!(matches!(err, RangeError::ShrinkInUse { offset: 8, .. }));
    }

    #[tokio::test]
    async fn test_reservation_size_is_fixed() {
        let mut parent = range(&BASE).await;
        let child_def = parent.reserve(5, 4, None).await.unwrap();
        let mut child = AddressRange::create(2, &child_def, &RangeContext::default())
            .await
            .unwrap();
        let err = child.update(&definition(&[("SIZE", "3")]), false).unwrap_err();
        assert!(matches!(err, RangeError::Immutable { ref field } if field == "SIZE"));
        assert_eq!(child.parent(), Some(1));
    }

    #[tokio::test]
    async fn test_restricted_attributes_need_privilege() {
        let mut ar = range(&[("TYPE", "ETHER"), ("SIZE", "4"), ("VLAN_ID", "10")]).await;

        let err = ar.update(&definition(&[("VLAN_ID", "11")]), false).unwrap_err();
        assert!(matches!(err, RangeError::Restricted { ref field } if field == "VLAN_ID"));
        // Dropping a restricted attribute is a change too.
        assert!(ar.update(&definition(&[("SIZE", "4")]), false).is_err());

        ar.update(&definition(&[("VLAN_ID", "11")]), true).unwrap();
        assert_eq!(ar.attributes().get("VLAN_ID"), Some("11"));
    }

    #[tokio::test]
    async fn test_invalid_replacement_leaves_range_alone() {
        let mut ar = range(&BASE).await;
        let before = ar.to_template();
        let err = ar
            .update(&definition(&[("SECURITY_GROUPS", "1,x")]), false)
            .unwrap_err();
        assert!(matches!(err, RangeError::InvalidField { .. }));
        assert_eq!(ar.to_template(), before);
    }
}
