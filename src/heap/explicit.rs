//! Explicit-control heap - code allocation in caller-chosen address space
//!
//! The caller decides where memory comes from (`set_reserved_region`,
//! `reserve_pages`) and the heap only ever bumps. There is no backout and no
//! free list. Like the other unlocked engines it takes `&mut self`.

use super::arena::{out_of_memory, BumpArena};
use super::{commit_protection, HeapOptions, HeapStats};
use crate::config::{HeapConfig, HeapKind};
use crate::diagnostics::HeapId;
use crate::error::Result;
use crate::vm::{align_up, checked_align_up, ReservedRegion};
use core::ptr::NonNull;
use tracing::trace;

pub struct ExplicitControlHeap {
    arena: BumpArena,
}

// SAFETY: the heap owns its reservations outright.
unsafe impl Send for ExplicitControlHeap {}

impl ExplicitControlHeap {
    /// Heap over the process-wide OS provider with default sizing.
    pub fn new(executable: bool) -> Result<Self> {
        let kind = if executable { HeapKind::Executable } else { HeapKind::Data };
        Self::with_options(HeapOptions::new(HeapConfig::new(kind)))
    }

    pub fn with_options(options: HeapOptions) -> Result<Self> {
        let config = options.heap_config().clone();
        config.validate()?;
        let kind = if config.kind.is_executable() {
            HeapKind::Executable
        } else {
            HeapKind::Data
        };

        let protection = commit_protection(kind, config.wx_enabled);
        let region = options.into_region(kind, config.reserve_block_size);
        Ok(Self {
            arena: BumpArena::new(region, config.commit_block_size, protection),
        })
    }

    #[inline]
    pub fn id(&self) -> HeapId {
        self.arena.region.id()
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.arena.region.kind().is_executable()
    }

    /// Use `region` for the next reservation instead of asking the provider.
    /// Nothing is committed in it until it is needed.
    pub fn set_reserved_region(&mut self, region: ReservedRegion) {
        self.arena.region.set_pending(region);
    }

    /// Switch to a fresh block with at least `min` bytes committed.
    pub fn reserve_pages(&mut self, min: usize) -> Result<()> {
        self.arena
            .reserve_pages(min)
            .map(|_| ())
            .map_err(|err| out_of_memory(self.arena.region.id(), min, err))
    }

    /// Allocate `code` bytes aligned to `code_alignment`, with `header` bytes
    /// in front and `reserve_for_jump_stubs` bytes guaranteed to follow.
    ///
    /// Returns the start of the code; the header occupies the `header` bytes
    /// before it. The jump stub reserve is left for the next allocation.
    pub fn alloc_mem_for_code(
        &mut self,
        header: usize,
        code: usize,
        code_alignment: usize,
        reserve_for_jump_stubs: usize,
    ) -> Option<NonNull<u8>> {
        assert!(code_alignment.is_power_of_two(), "alignment {code_alignment} is not a power of two");

        let alloc_size = header
            .checked_add(code)?
            .checked_add(code_alignment - 1)?
            .checked_add(reserve_for_jump_stubs)?;
        let alloc_size = checked_align_up(alloc_size, core::mem::size_of::<usize>())?;

        if alloc_size > self.arena.cursor.committed_remaining() {
            self.arena.get_more_committed_pages(alloc_size).ok()?;
        }

        let result = align_up(self.arena.cursor.alloc_ptr() + header, code_alignment);
        let end = result + code;
        self.arena.cursor.advance_to(end);

        trace!(
            event = "alloc",
            heap = %self.id(),
            address = format_args!("{result:#x}"),
            header,
            size = code,
            alignment = code_alignment,
        );
        NonNull::new(result as *mut u8)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.arena.region.total_committed()
    }

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
            free_list_blocks: 0,
            free_list_bytes: 0,
        }
    }

    pub fn enum_page_regions(&self, callback: impl FnMut(usize, usize) -> bool) {
        self.arena.region.enum_page_regions(callback);
    }

    pub fn committed_regions(&self) -> Vec<(usize, usize)> {
        self.arena.region.committed_regions()
    }
}
