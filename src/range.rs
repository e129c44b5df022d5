//! Range list - records which heap owns which reserved address ranges
//!
//! Heaps register every block they reserve so that outside code (stack
//! walkers, diagnostics) can answer "does this address belong to a heap, and
//! which one" without asking the heaps themselves.

use crate::diagnostics::HeapId;
use parking_lot::Mutex;

/// One registered `[start, end)` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: usize,
    pub end: usize,
    pub owner: HeapId,
}

impl Range {
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Thread-safe registry of address ranges.
#[derive(Debug, Default)]
pub struct RangeList {
    ranges: Mutex<Vec<Range>>,
    capacity_limit: Option<usize>,
}

impl RangeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that refuses ranges beyond `limit` entries.
    pub fn with_capacity_limit(limit: usize) -> Self {
        Self {
            ranges: Mutex::new(Vec::with_capacity(limit)),
            capacity_limit: Some(limit),
        }
    }

    /// Record `[start, end)` for `owner`. Returns false if the range could
    /// not be recorded; the caller must then give the range back.
    pub fn add_range(&self, start: usize, end: usize, owner: HeapId) -> bool {
        debug_assert!(start < end, "empty range");
        let mut ranges = self.ranges.lock();
        if let Some(limit) = self.capacity_limit {
            if ranges.len() >= limit {
                return false;
            }
        }
        if ranges.try_reserve(1).is_err() {
            return false;
        }
        ranges.push(Range { start, end, owner });
        true
    }

    /// Forget every range owned by `owner`.
    pub fn remove_ranges(&self, owner: HeapId) {
        self.ranges.lock().retain(|range| range.owner != owner);
    }

    pub fn is_in_range(&self, addr: usize) -> bool {
        self.owner_of(addr).is_some()
    }

    pub fn owner_of(&self, addr: usize) -> Option<HeapId> {
        self.ranges
            .lock()
            .iter()
            .find(|range| range.contains(addr))
            .map(|range| range.owner)
    }

    /// Snapshot of all registered ranges.
    pub fn ranges(&self) -> Vec<Range> {
        self.ranges.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.ranges.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_lookup_remove() {
        let list = RangeList::new();
        let a = HeapId::next();
        let b = HeapId::next();

        assert!(list.add_range(0x1000, 0x2000, a));
        assert!(list.add_range(0x8000, 0x9000, b));

        assert_eq!(list.owner_of(0x1fff), Some(a));
        assert_eq!(list.owner_of(0x2000), None);
        assert_eq!(list.owner_of(0x8000), Some(b));

        list.remove_ranges(a);
        assert!(!list.is_in_range(0x1000));
        assert!(list.is_in_range(0x8800));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn capacity_limit_rejects() {
        let list = RangeList::with_capacity_limit(1);
        let id = HeapId::next();
        assert!(list.add_range(0, 16, id));
        assert!(!list.add_range(32, 48, id));
        assert_eq!(list.ranges().len(), 1);
    }
}
