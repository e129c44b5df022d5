//! Region - reservation, commit and bookkeeping shared by every engine
//!
//! Design: engines own their cursor and decide *what* to commit; the region
//! decides *where* address space comes from (a caller supplied reservation
//! or a fresh one), registers it with the range list, and keeps the
//! committed/wasted totals. A failed commit leaves the region as it was.

use super::block::{BlockChain, ReservedBlock};
use crate::config::HeapKind;
use crate::diagnostics::{self, HeapDiagnostics, HeapId};
use crate::error::VmError;
use crate::range::RangeList;
use crate::vm::{checked_align_up, PageProvider, ReservedRegion};
use core::ptr::NonNull;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Bounds of a freshly installed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NewBlock {
    pub start: usize,
    pub end: usize,
}

pub(crate) struct Region {
    id: HeapId,
    kind: HeapKind,
    blocks: BlockChain,
    reserve_block_size: usize,
    pending: Option<ReservedRegion>,
    range_list: Option<Arc<RangeList>>,
    diagnostics: Option<Arc<dyn HeapDiagnostics>>,
    total_committed: usize,
    wasted: usize,
}

impl Region {
    pub fn new(
        kind: HeapKind,
        provider: Arc<dyn PageProvider>,
        reserve_block_size: usize,
        pending: Option<ReservedRegion>,
        range_list: Option<Arc<RangeList>>,
        diagnostics: Option<Arc<dyn HeapDiagnostics>>,
    ) -> Self {
        let region = Self {
            id: HeapId::next(),
            kind,
            blocks: BlockChain::new(provider),
            reserve_block_size,
            pending,
            range_list,
            diagnostics,
            total_committed: 0,
            wasted: 0,
        };
        region.sink().heap_created(region.id, kind);
        debug!(event = "heap_created", heap = %region.id, ?kind, reserve_block_size);
        region
    }

    #[inline]
    pub fn id(&self) -> HeapId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    #[inline]
    pub fn provider(&self) -> &dyn PageProvider {
        self.blocks.provider().as_ref()
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.provider().page_size()
    }

    #[inline]
    pub fn blocks(&self) -> &BlockChain {
        &self.blocks
    }

    pub fn sink(&self) -> &dyn HeapDiagnostics {
        match &self.diagnostics {
            Some(sink) => sink.as_ref(),
            None => diagnostics::global(),
        }
    }

    /// Install a caller supplied reservation to be used by the next `grow`.
    /// A previously pending region that was never used is retired.
    pub fn set_pending(&mut self, region: ReservedRegion) {
        if let Some(old) = self.pending.replace(region) {
            self.retire(old);
        }
    }

    /// Make a fresh block of at least `min_reserve` bytes current and commit
    /// its first `commit_len` bytes through `init`.
    ///
    /// The block comes from the pending region when that is large enough,
    /// otherwise from a new reservation rounded to the reserve granularity.
    /// On failure the new reservation is released (or the pending region put
    /// back) and the current block stays current.
    pub fn grow<F>(&mut self, min_reserve: usize, commit_len: usize, init: F) -> Result<NewBlock, VmError>
    where
        F: FnOnce(&dyn PageProvider, NonNull<u8>, usize) -> Result<(), VmError>,
    {
        debug_assert!(commit_len <= min_reserve);

        let from_pending = matches!(&self.pending, Some(p) if p.size() >= min_reserve);
        let block = if from_pending {
            let region = self.pending.take().ok_or_else(|| too_large(min_reserve))?;
            ReservedBlock::new(region.base(), region.size(), region.release_on_drop())
        } else {
            let granularity = self.provider().reserve_granularity();
            let size = checked_align_up(min_reserve.max(self.reserve_block_size), granularity)
                .ok_or_else(|| too_large(min_reserve))?;
            let base = self.provider().reserve(size)?;
            debug!(event = "reserve", heap = %self.id, base = format_args!("{:p}", base), size);
            ReservedBlock::new(base, size, true)
        };

        if let Err(err) = init(self.provider(), block.base(), commit_len) {
            self.discard(block, from_pending);
            return Err(err);
        }

        if let Some(ranges) = &self.range_list {
            if !ranges.add_range(block.start(), block.end(), self.id) {
                warn!(heap = %self.id, start = format_args!("{:#x}", block.start()), "range list refused block");
                self.discard(block, from_pending);
                return Err(VmError::Reserve {
                    size: min_reserve,
                    source: io::Error::new(io::ErrorKind::OutOfMemory, "range list is full"),
                });
            }
        }

        // A too-small pending region would otherwise never be used; keep it
        // owned so it is released with the heap.
        if let Some(stale) = self.pending.take() {
            self.retire(stale);
        }

        let new = NewBlock { start: block.start(), end: block.end() };
        let current = self.blocks.push(block);
        current.set_committed(commit_len);
        self.account_commit(commit_len);
        Ok(new)
    }

    /// Commit `len` bytes at `addr` inside the current block through `init`.
    pub fn commit<F>(&mut self, addr: usize, len: usize, init: F) -> Result<(), VmError>
    where
        F: FnOnce(&dyn PageProvider, NonNull<u8>, usize) -> Result<(), VmError>,
    {
        let Some(current) = self.blocks.current() else {
            return Err(too_large(len));
        };
        debug_assert!(addr >= current.start() + current.committed(), "recommit of committed pages");
        debug_assert!(addr + len <= current.end(), "commit past reservation");
        let committed = addr + len - current.start();

        let base = NonNull::new(addr as *mut u8).ok_or_else(|| too_large(len))?;
        init(self.provider(), base, len)?;

        if let Some(current) = self.blocks.current_mut() {
            current.set_committed(committed);
        }
        self.account_commit(len);
        Ok(())
    }

    fn account_commit(&mut self, len: usize) {
        self.total_committed += len;
        self.sink().bytes_committed(self.id, len);
        debug!(event = "commit", heap = %self.id, bytes = len, total = self.total_committed);
    }

    /// Committed bytes that can no longer be allocated.
    pub fn record_waste(&mut self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.wasted += bytes;
        self.sink().bytes_wasted(self.id, bytes);
    }

    fn discard(&mut self, block: ReservedBlock, from_pending: bool) {
        if from_pending {
            // SAFETY: rebuilt from the region taken above with the same bounds.
            let region = unsafe { ReservedRegion::new(block.base(), block.size(), block.owns_mapping()) };
            self.pending = Some(region);
        } else {
            // SAFETY: the block was reserved by this call and nothing points into it.
            unsafe { self.provider().release(block.base(), block.size()) };
        }
    }

    /// Keep an unused reservation with the heap. It is registered with the
    /// range list like any other block, but never allocated from.
    fn retire(&mut self, region: ReservedRegion) {
        let block = ReservedBlock::new(region.base(), region.size(), region.release_on_drop());
        if let Some(ranges) = &self.range_list {
            if !ranges.add_range(block.start(), block.end(), self.id) {
                warn!(heap = %self.id, start = format_args!("{:#x}", block.start()), "range list refused retired block");
            }
        }
        self.blocks.retire(block);
    }

    /// Total committed bytes across all blocks.
    #[inline]
    pub fn total_committed(&self) -> usize {
        self.total_committed
    }

    #[inline]
    pub fn wasted(&self) -> usize {
        self.wasted
    }

    /// Report each block's base and reserved size, most recent first, until
    /// `callback` returns false.
    pub fn enum_page_regions(&self, mut callback: impl FnMut(usize, usize) -> bool) {
        for block in self.blocks.iter() {
            if !callback(block.start(), block.size()) {
                break;
            }
        }
    }

    /// `(start, committed bytes)` of every block with committed pages.
    pub fn committed_regions(&self) -> Vec<(usize, usize)> {
        self.blocks
            .iter()
            .filter(|block| block.committed() > 0)
            .map(|block| (block.start(), block.committed()))
            .collect()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some(ranges) = &self.range_list {
            ranges.remove_ranges(self.id);
        }
        if let Some(pending) = self.pending.take() {
            if pending.release_on_drop() {
                // SAFETY: an unused pending region is one whole reservation.
                unsafe { self.provider().release(pending.base(), pending.size()) };
            }
        }
        self.sink().heap_destroyed(self.id);
        debug!(
            event = "heap_destroyed",
            heap = %self.id,
            committed = self.total_committed,
            wasted = self.wasted,
        );
    }
}

fn too_large(size: usize) -> VmError {
    VmError::Reserve {
        size,
        source: io::Error::new(io::ErrorKind::OutOfMemory, "request exceeds address space"),
    }
}
