//! Backout free list - blocks handed back out of allocation order
//!
//! Design: nodes live in a slab table and link to each other by index, so
//! the list never writes into the backed-out memory itself. Push is O(1);
//! lookup walks the list for an exact size match. Blocks are never split
//! or merged: callers allocate a handful of distinct, repeating sizes.

use tracing::debug;

/// One backed-out block: `size` bytes at `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub addr: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Used { block: FreeBlock, next: Option<u32> },
    Vacant { next_vacant: Option<u32> },
}

/// Index-linked stack of backed-out blocks.
#[derive(Debug, Default)]
pub struct FreeList {
    slots: Vec<Slot>,
    head: Option<u32>,
    vacant: Option<u32>,
    len: usize,
    bytes: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            vacant: None,
            len: 0,
            bytes: 0,
        }
    }

    /// Push a block on top of the list.
    pub fn push(&mut self, addr: usize, size: usize) {
        let block = FreeBlock { addr, size };
        let slot = Slot::Used { block, next: self.head };

        let index = match self.vacant {
            Some(index) => {
                if let Slot::Vacant { next_vacant } = self.slots[index as usize] {
                    self.vacant = next_vacant;
                }
                self.slots[index as usize] = slot;
                index
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as u32
            }
        };

        self.head = Some(index);
        self.len += 1;
        self.bytes += size;
    }

    /// Unlink and return the first block of exactly `size` bytes.
    pub fn take(&mut self, size: usize) -> Option<usize> {
        let mut prev: Option<u32> = None;
        let mut cursor = self.head;

        while let Some(index) = cursor {
            let Slot::Used { block, next } = self.slots[index as usize] else {
                unreachable!("free list links a vacant slot");
            };

            if block.size == size {
                match prev {
                    None => self.head = next,
                    Some(p) => {
                        if let Slot::Used { next: ref mut link, .. } = self.slots[p as usize] {
                            *link = next;
                        }
                    }
                }
                self.slots[index as usize] = Slot::Vacant { next_vacant: self.vacant };
                self.vacant = Some(index);
                self.len -= 1;
                self.bytes -= size;
                return Some(block.addr);
            }

            prev = Some(index);
            cursor = next;
        }

        None
    }

    /// Blocks from most recently pushed to oldest.
    pub fn iter(&self) -> FreeListIter<'_> {
        FreeListIter { list: self, cursor: self.head }
    }

    /// Whether any free block overlaps `[addr, addr + size)`.
    pub fn overlaps(&self, addr: usize, size: usize) -> bool {
        self.iter()
            .any(|block| addr < block.addr + block.size && block.addr < addr + size)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total bytes held by the list.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Log every block at debug level.
    pub fn dump(&self) {
        debug!(blocks = self.len, bytes = self.bytes, "free list");
        for block in self.iter() {
            debug!(address = format_args!("{:#x}", block.addr), size = block.size, "  free block");
        }
    }
}

pub struct FreeListIter<'a> {
    list: &'a FreeList,
    cursor: Option<u32>,
}

impl Iterator for FreeListIter<'_> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<FreeBlock> {
        let index = self.cursor?;
        match self.list.slots[index as usize] {
            Slot::Used { block, next } => {
                self.cursor = next;
                Some(block)
            }
            Slot::Vacant { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_take_exact() {
        let mut list = FreeList::new();
        list.push(0x1000, 32);
        list.push(0x2000, 64);

        assert_eq!(list.len(), 2);
        assert_eq!(list.bytes(), 96);
        assert_eq!(list.take(48), None);
        assert_eq!(list.take(32), Some(0x1000));
        assert_eq!(list.take(32), None);
        assert_eq!(list.take(64), Some(0x2000));
        assert!(list.is_empty());
        assert_eq!(list.bytes(), 0);
    }

    #[test]
    fn take_from_middle_relinks() {
        let mut list = FreeList::new();
        list.push(0x1000, 16);
        list.push(0x2000, 24);
        list.push(0x3000, 32);

        assert_eq!(list.take(24), Some(0x2000));
        let remaining: Vec<_> = list.iter().map(|b| b.addr).collect();
        assert_eq!(remaining, vec![0x3000, 0x1000]);
    }

    #[test]
    fn vacant_slots_are_recycled() {
        let mut list = FreeList::new();
        list.push(0x1000, 16);
        list.push(0x2000, 16);
        list.take(16).unwrap();
        list.take(16).unwrap();

        list.push(0x3000, 8);
        list.push(0x4000, 8);
        assert_eq!(list.slots.len(), 2, "slab must reuse vacant slots");
        assert_eq!(list.iter().count(), 2);
    }

    #[test]
    fn most_recent_match_wins() {
        let mut list = FreeList::new();
        list.push(0x1000, 16);
        list.push(0x2000, 16);
        assert_eq!(list.take(16), Some(0x2000));
    }

    #[test]
    fn overlap_detection() {
        let mut list = FreeList::new();
        list.push(0x1000, 0x40);
        assert!(list.overlaps(0x1020, 8));
        assert!(list.overlaps(0xff8, 0x10));
        assert!(!list.overlaps(0x1040, 8));
        assert!(!list.overlaps(0xfc0, 0x40));
    }
}
