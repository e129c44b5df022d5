//! Unlocked loader heap - bump allocation with backout
//!
//! Design: Three layers, fastest first:
//! 1. Free list (only consulted when non-empty; exact size match)
//! 2. Bump cursor (one compare against end-of-committed)
//! 3. Commit more pages / reserve a fresh block
//!
//! Backing out the most recent allocation rewinds the cursor. Anything else
//! goes onto the free list. Nothing is ever decommitted.

use super::arena::BumpArena;
use super::free_list::FreeList;
use super::{commit_protection, HeapOptions, HeapStats};
use crate::config::HeapKind;
use crate::diagnostics::HeapId;
use crate::error::{HeapError, Result};
use crate::vm::{align_up, PageProvider};
use core::mem::size_of;
use core::ptr::NonNull;
use tracing::{trace, warn};

/// Poisoned bytes appended after every allocation.
#[cfg(feature = "guard-bytes")]
pub const GUARD_SIZE: usize = 16;
#[cfg(not(feature = "guard-bytes"))]
pub const GUARD_SIZE: usize = 0;

/// Fill pattern of the guard region.
pub const GUARD_BYTE: u8 = 0xCC;

/// Bytes actually consumed by a request of `size` bytes: the request plus
/// guard bytes, rounded to pointer size. `None` on overflow.
#[inline]
pub const fn alloc_total_size(size: usize) -> Option<usize> {
    match size.checked_add(GUARD_SIZE) {
        Some(n) => crate::vm::checked_align_up(n, size_of::<usize>()),
        None => None,
    }
}

/// Single-threaded loader heap. Wrap in [`LoaderHeap`](super::LoaderHeap)
/// for shared use.
pub struct UnlockedLoaderHeap {
    arena: BumpArena,
    free_list: FreeList,
}

// SAFETY: the heap owns its reservations outright; the raw addresses it
// stores are never shared with another heap.
unsafe impl Send for UnlockedLoaderHeap {}

impl UnlockedLoaderHeap {
    pub fn new(options: HeapOptions) -> Result<Self> {
        let config = options.heap_config().clone();
        config.validate()?;
        if config.kind.is_interleaved() {
            return Err(HeapError::InvalidArgument(
                "interleaved heaps are built with UnlockedInterleavedLoaderHeap",
            ));
        }

        let protection = commit_protection(config.kind, config.wx_enabled);
        let region = options.into_region(config.kind, config.reserve_block_size);
        Ok(Self {
            arena: BumpArena::new(region, config.commit_block_size, protection),
            free_list: FreeList::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> HeapId {
        self.arena.region.id()
    }

    #[inline]
    pub fn kind(&self) -> HeapKind {
        self.arena.region.kind()
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.kind().is_executable()
    }

    /// The provider this heap commits through. Executable heaps with W^X on
    /// must write through [`ExecutableWriter`](crate::vm::ExecutableWriter)
    /// obtained from it.
    pub fn provider(&self) -> &dyn PageProvider {
        self.arena.region.provider()
    }

    /// Allocate `size` bytes, pointer-size aligned.
    ///
    /// Fresh pages read as zero; memory reused from the free list holds
    /// whatever was there before.
    pub fn alloc_mem(&mut self, size: usize) -> Result<NonNull<u8>> {
        assert!(size > 0, "zero-size loader heap allocation");
        let total = alloc_total_size(size).ok_or(HeapError::OutOfMemory { requested: size })?;

        let addr = match self.take_free(total) {
            Some(addr) => addr,
            None => self.arena.bump(total)?,
        };

        self.write_guard(addr + size);
        trace!(event = "alloc", heap = %self.id(), address = format_args!("{addr:#x}"), size);
        to_non_null(addr, size)
    }

    /// [`alloc_mem`](Self::alloc_mem) reporting failure as `None`.
    pub fn alloc_mem_no_throw(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.alloc_mem(size).ok()
    }

    #[inline]
    fn take_free(&mut self, total: usize) -> Option<usize> {
        if self.free_list.is_empty() {
            return None;
        }
        let addr = self.free_list.take(total)?;
        trace!(event = "free_list_hit", heap = %self.id(), address = format_args!("{addr:#x}"), size = total);
        Some(addr)
    }

    /// Allocate `size` bytes aligned to `alignment` (a power of two).
    ///
    /// Returns the aligned pointer and the padding in front of it. Back the
    /// allocation out with `(ptr - extra, size + extra)`. The free list is
    /// not consulted.
    pub fn alloc_aligned_mem(&mut self, size: usize, alignment: usize) -> Result<(NonNull<u8>, usize)> {
        assert!(size > 0, "zero-size loader heap allocation");
        assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");

        let room = size
            .checked_add(alignment)
            .and_then(alloc_total_size)
            .ok_or(HeapError::OutOfMemory { requested: size })?;
        if room > self.arena.cursor.committed_remaining() {
            self.arena.get_more_committed_pages(room)?;
        }

        let base = self.arena.cursor.alloc_ptr();
        let extra = align_up(base, alignment) - base;
        let total = alloc_total_size(size + extra).ok_or(HeapError::OutOfMemory { requested: size })?;
        let raw = self.arena.bump(total)?;
        debug_assert_eq!(raw, base);

        let addr = raw + extra;
        self.write_guard(addr + size);
        trace!(
            event = "alloc",
            heap = %self.id(),
            address = format_args!("{addr:#x}"),
            size,
            alignment,
            extra,
        );
        Ok((to_non_null(addr, size)?, extra))
    }

    /// [`alloc_aligned_mem`](Self::alloc_aligned_mem) reporting failure as `None`.
    pub fn alloc_aligned_mem_no_throw(&mut self, size: usize, alignment: usize) -> Option<(NonNull<u8>, usize)> {
        self.alloc_aligned_mem(size, alignment).ok()
    }

    /// Give back an allocation made by this heap. `ptr`/`size` must be exactly
    /// what was allocated (for aligned allocations, `ptr - extra` and
    /// `size + extra`). `None` is ignored.
    ///
    /// The memory must not be used afterwards: it may be handed out again.
    pub fn backout_mem(&mut self, ptr: Option<NonNull<u8>>, size: usize) {
        let Some(ptr) = ptr else {
            return;
        };
        assert!(size > 0, "zero-size backout");
        let addr = ptr.as_ptr() as usize;
        let total = match alloc_total_size(size) {
            Some(total) => total,
            None => panic!("backout of {size} bytes does not match any allocation"),
        };
        self.validate_backout(addr, total);

        let in_current = self
            .arena
            .region
            .blocks()
            .current()
            .map_or(false, |block| block.contains(addr));

        if in_current && addr + total == self.arena.cursor.alloc_ptr() {
            self.arena.cursor.rewind(addr);
        } else {
            self.free_list.push(addr, total);
        }
        trace!(event = "backout", heap = %self.id(), address = format_args!("{addr:#x}"), size);
    }

    fn validate_backout(&self, addr: usize, total: usize) {
        let region = &self.arena.region;
        let block = region.blocks().block_containing(addr);
        let committed = block.map_or(false, |block| addr + total <= block.start() + block.committed());
        assert!(
            committed,
            "backout of {addr:#x}+{total:#x} is outside the committed memory of {}",
            region.id()
        );

        if let Some(current) = region.blocks().current() {
            if current.contains(addr) {
                assert!(
                    addr + total <= self.arena.cursor.alloc_ptr(),
                    "backout of {addr:#x}+{total:#x} reaches past the allocation pointer"
                );
            }
        }
        debug_assert!(
            !self.free_list.overlaps(addr, total),
            "backout of {addr:#x}+{total:#x} overlaps a block that was already backed out"
        );
    }

    fn write_guard(&self, end_of_request: usize) {
        if GUARD_SIZE == 0 {
            return;
        }
        if let Err(err) = self.arena.fill(end_of_request, GUARD_SIZE, GUARD_BYTE) {
            warn!(heap = %self.id(), error = %err, "could not poison guard bytes");
        }
    }

    /// Total committed bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.arena.region.total_committed()
    }

    /// Bytes left in the current reservation, committed or not.
    #[inline]
    pub fn reserved_bytes_free(&self) -> usize {
        self.arena.cursor.reserved_remaining()
    }

    #[inline]
    pub fn alloc_ptr(&self) -> usize {
        self.arena.cursor.alloc_ptr()
    }

    #[inline]
    pub fn committed_end(&self) -> usize {
        self.arena.cursor.committed_end()
    }

    pub fn wasted_bytes(&self) -> usize {
        self.arena.wasted_bytes()
    }

    pub fn stats(&self) -> HeapStats {
        let region = &self.arena.region;
        HeapStats {
            committed_bytes: region.total_committed(),
            reserved_bytes: region.blocks().total_reserved(),
            blocks: region.blocks().len(),
            wasted_bytes: self.arena.wasted_bytes(),
            free_list_blocks: self.free_list.len(),
            free_list_bytes: self.free_list.bytes(),
        }
    }

    /// Report each reservation's base and size, most recent first, until
    /// `callback` returns false.
    pub fn enum_page_regions(&self, callback: impl FnMut(usize, usize) -> bool) {
        self.arena.region.enum_page_regions(callback);
    }

    pub fn committed_regions(&self) -> Vec<(usize, usize)> {
        self.arena.region.committed_regions()
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    /// Log the free list at debug level.
    pub fn dump_free_list(&self) {
        self.free_list.dump();
    }
}

#[inline(always)]
fn to_non_null(addr: usize, requested: usize) -> Result<NonNull<u8>> {
    NonNull::new(addr as *mut u8).ok_or(HeapError::OutOfMemory { requested })
}
