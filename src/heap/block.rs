//! Reserved blocks - one entry per virtual memory reservation
//!
//! Design: the newest block is the only one that receives allocations.
//! Older blocks stay in the chain so their mappings can be enumerated and
//! released with the heap.

use crate::vm::PageProvider;
use core::ptr::NonNull;
use std::sync::Arc;

/// One reservation owned (or borrowed) by a heap.
#[derive(Debug)]
pub struct ReservedBlock {
    base: NonNull<u8>,
    size: usize,
    committed: usize,
    release: bool,
}

impl ReservedBlock {
    pub(crate) fn new(base: NonNull<u8>, size: usize, release: bool) -> Self {
        Self { base, size, committed: 0, release }
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    /// Reserved size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Committed prefix of the block in bytes.
    #[inline]
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Whether the heap releases this mapping on teardown.
    #[inline]
    pub fn owns_mapping(&self) -> bool {
        self.release
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    pub(crate) fn set_committed(&mut self, committed: usize) {
        debug_assert!(committed >= self.committed, "commit never shrinks");
        debug_assert!(committed <= self.size);
        self.committed = committed;
    }
}

/// Every block a heap has reserved, oldest first in storage. Retired blocks
/// sit in front of all others and are never current.
pub struct BlockChain {
    blocks: Vec<ReservedBlock>,
    retired: usize,
    provider: Arc<dyn PageProvider>,
}

impl BlockChain {
    pub fn new(provider: Arc<dyn PageProvider>) -> Self {
        Self {
            blocks: Vec::new(),
            retired: 0,
            provider,
        }
    }

    #[inline]
    pub fn provider(&self) -> &Arc<dyn PageProvider> {
        &self.provider
    }

    /// Make `block` the current block.
    pub fn push(&mut self, block: ReservedBlock) -> &mut ReservedBlock {
        self.blocks.push(block);
        let last = self.blocks.len() - 1;
        &mut self.blocks[last]
    }

    /// Keep `block` for ownership only. It becomes the oldest block and is
    /// never current.
    pub fn retire(&mut self, block: ReservedBlock) {
        self.blocks.insert(0, block);
        self.retired += 1;
    }

    #[inline]
    pub fn current(&self) -> Option<&ReservedBlock> {
        self.blocks[self.retired..].last()
    }

    #[inline]
    pub fn current_mut(&mut self) -> Option<&mut ReservedBlock> {
        self.blocks[self.retired..].last_mut()
    }

    /// Blocks from most recently reserved to oldest, retired blocks last.
    pub fn iter(&self) -> impl Iterator<Item = &ReservedBlock> {
        self.blocks.iter().rev()
    }

    pub fn block_containing(&self, addr: usize) -> Option<&ReservedBlock> {
        self.blocks.iter().find(|block| block.contains(addr))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn total_reserved(&self) -> usize {
        self.blocks.iter().map(ReservedBlock::size).sum()
    }
}

impl Drop for BlockChain {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            if block.release {
                // SAFETY: owned blocks are whole reservations from this provider,
                // and the heap holding the chain is going away.
                unsafe { self.provider.release(block.base, block.size) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::MockPages;

    fn block(pages: &MockPages, size: usize) -> ReservedBlock {
        ReservedBlock::new(pages.reserve(size).unwrap(), size, true)
    }

    #[test]
    fn retired_block_is_never_current() {
        let pages = Arc::new(MockPages::new());
        let mut chain = BlockChain::new(pages.clone());

        chain.retire(block(&pages, 4096));
        assert!(chain.current().is_none());
        assert_eq!(chain.len(), 1);

        let live = block(&pages, 8192);
        let start = live.start();
        chain.push(live);
        assert_eq!(chain.current().map(ReservedBlock::start), Some(start));

        chain.retire(block(&pages, 4096));
        assert_eq!(chain.current().map(ReservedBlock::start), Some(start));
        assert_eq!(chain.iter().next().map(ReservedBlock::start), Some(start));
        assert_eq!(chain.total_reserved(), 16384);
    }

    #[test]
    fn owned_blocks_are_released_on_drop() {
        let pages = Arc::new(MockPages::new());
        {
            let mut chain = BlockChain::new(pages.clone());
            chain.push(block(&pages, 4096));
            chain.retire(block(&pages, 4096));
        }
        assert_eq!(pages.reserved_bytes(), 0);
    }
}
