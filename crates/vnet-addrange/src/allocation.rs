//! Offset-to-owner map of a range and its persisted text form.

use crate::error::{RangeError, RangeResult};
use crate::owner::Owner;
use std::collections::BTreeMap;

/// Which offsets of a range are leased, and to whom.
///
/// Offsets are zero-based from the first address of the range. The text
/// form is a whitespace-separated list of `offset token` pairs in
/// ascending offset order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationIndex {
    entries: BTreeMap<u64, Owner>,
}

impl AllocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, offset: u64) -> Option<Owner> {
        self.entries.get(&offset).copied()
    }

    pub fn is_free(&self, offset: u64) -> bool {
        !self.entries.contains_key(&offset)
    }

    pub fn insert(&mut self, offset: u64, owner: Owner) -> Option<Owner> {
        self.entries.insert(offset, owner)
    }

    pub fn remove(&mut self, offset: u64) -> Option<Owner> {
        self.entries.remove(&offset)
    }

    /// Highest leased offset.
    pub fn max_offset(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, Owner)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, *v))
    }

    /// Offsets leased to exactly `owner`, ascending.
    pub fn offsets_of(&self, owner: Owner) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, o)| **o == owner)
            .map(|(k, _)| *k)
            .collect()
    }

    /// True if no offset in `[start, start + count)` is leased.
    pub fn is_run_free(&self, start: u64, count: u64) -> bool {
        match start.checked_add(count) {
            Some(end) => self.entries.range(start..end).next().is_none(),
            None => false,
        }
    }

    /// First-fit search for `count` consecutive free offsets below `size`.
    pub fn first_free_run(&self, size: u64, count: u64) -> Option<u64> {
        if count == 0 || count > size {
            return None;
        }
        let mut candidate = 0u64;
        for &offset in self.entries.keys() {
            if offset >= size {
                break;
            }
            if offset - candidate >= count {
                return Some(candidate);
            }
            candidate = offset + 1;
        }
        (size - candidate >= count).then_some(candidate)
    }

    /// Circular search for a free offset, starting at `cursor` and wrapping
    /// at `size`.
    pub fn next_free_from(&self, cursor: u64, size: u64) -> Option<u64> {
        if size == 0 || self.entries.len() as u64 >= size {
            return None;
        }
        let cursor = cursor % size;

        let mut candidate = cursor;
        for &offset in self.entries.range(cursor..size).map(|(k, _)| k) {
            if offset != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate < size {
            return Some(candidate);
        }

        let mut candidate = 0;
        for &offset in self.entries.range(..cursor).map(|(k, _)| k) {
            if offset != candidate {
                break;
            }
            candidate += 1;
        }
        (candidate < cursor).then_some(candidate)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (offset, owner) in &self.entries {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&offset.to_string());
            out.push(' ');
            out.push_str(&owner.to_token().to_string());
        }
        out
    }

    /// Rebuilds an index from its text form, checking it against the
    /// range `size`.
    pub fn from_text(text: &str, size: u64, range: &str) -> RangeResult<Self> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() % 2 != 0 {
            return Err(RangeError::inconsistent(
                range,
                "allocation index has an odd number of fields",
            ));
        }
        if (fields.len() / 2) as u64 > size {
            return Err(RangeError::inconsistent(
                range,
                format!(
                    "allocation index holds {} leases but the range size is {size}",
                    fields.len() / 2
                ),
            ));
        }

        let mut entries = BTreeMap::new();
        for pair in fields.chunks_exact(2) {
            let offset: u64 = pair[0].parse().map_err(|_| {
                RangeError::inconsistent(range, format!("bad offset '{}' in allocation index", pair[0]))
            })?;
            let token: u64 = pair[1].parse().map_err(|_| {
                RangeError::inconsistent(range, format!("bad owner token '{}' in allocation index", pair[1]))
            })?;
            if offset >= size {
                return Err(RangeError::inconsistent(
                    range,
                    format!("offset {offset} is outside a range of size {size}"),
                ));
            }
            let owner = Owner::from_token(token)
                .map_err(|e| RangeError::inconsistent(range, e.to_string()))?;
            if entries.insert(offset, owner).is_some() {
                return Err(RangeError::inconsistent(
                    range,
                    format!("offset {offset} appears twice in allocation index"),
                ));
            }
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use pretty_assertions::assert_eq;

    fn index(leases: &[(u64, Owner)]) -> AllocationIndex {
        let mut idx = AllocationIndex::new();
        for (offset, owner) in leases {
            idx.insert(*offset, *owner);
        }
        idx
    }

    #[test]
    fn test_text_round_trip() {
        let idx = index(&[(0, Owner::vm(5)), (5, Owner::network(2)), (7, Owner::hold())]);
        let text = idx.to_text();
        assert_eq!(text, "0 68719476741 5 274877906946 7 73014444031");
        assert_eq!(AllocationIndex::from_text(&text, 8, "0").unwrap(), idx);
        assert!(AllocationIndex::from_text("", 8, "0").unwrap().is_empty());
    }

    #[test]
    fn test_from_text_rejects_inconsistent() {
        for text in [
            "0",
            "0 68719476741 1",
            "x 68719476741",
            "0 nope",
            "8 68719476741",
            "1 68719476741 1 68719476742",
        ] {
            let err = AllocationIndex::from_text(text, 8, "3").unwrap_err();
            assert_eq!(err.class(), ErrorClass::Inconsistent, "{text}");
        }

        let err = AllocationIndex::from_text("0 68719476741 1 68719476741", 1, "3").unwrap_err();
        assert!(err.to_string().contains("range size is 1"));
    }

    #[test]
    fn test_next_free_wraps() {
        let idx = index(&[(0, Owner::vm(1)), (2, Owner::vm(1)), (3, Owner::vm(1))]);
        assert_eq!(idx.next_free_from(0, 4), Some(1));
        assert_eq!(idx.next_free_from(2, 4), Some(1));
        assert_eq!(idx.next_free_from(6, 5), Some(1));
        assert_eq!(idx.next_free_from(2, 5), Some(4));

        let full = index(&[(0, Owner::vm(1)), (1, Owner::vm(1))]);
        assert_eq!(full.next_free_from(1, 2), None);
        assert_eq!(AllocationIndex::new().next_free_from(0, 0), None);
    }

    #[test]
    fn test_first_free_run() {
        let idx = index(&[(1, Owner::vm(1)), (4, Owner::vm(1))]);
        assert_eq!(idx.first_free_run(10, 1), Some(0));
        assert_eq!(idx.first_free_run(10, 2), Some(2));
        assert_eq!(idx.first_free_run(10, 5), Some(5));
        assert_eq!(idx.first_free_run(10, 6), None);
        assert_eq!(idx.first_free_run(10, 0), None);
        assert!(idx.is_run_free(2, 2));
        assert!(!idx.is_run_free(2, 3));
        assert!(!idx.is_run_free(u64::MAX, 2));
    }

    #[test]
    fn test_offsets_of_exact_owner() {
        let idx = index(&[(0, Owner::vm(1)), (1, Owner::network(1)), (2, Owner::vm(1))]);
        assert_eq!(idx.offsets_of(Owner::vm(1)), vec![0, 2]);
        assert_eq!(idx.offsets_of(Owner::vm(2)), Vec::<u64>::new());
        assert_eq!(idx.max_offset(), Some(2));
    }
}
