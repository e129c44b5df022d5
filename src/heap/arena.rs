//! Bump arena - cursor plus on-demand commit and re-reservation
//!
//! Design: Two-step slow path behind a single compare on the fast path:
//! 1. Commit more of the current reservation (page granular, at least one
//!    commit block at a time)
//! 2. Reserve a fresh block when the current one cannot hold the request;
//!    the committed tail of the abandoned block is counted as waste

use super::cursor::Cursor;
use super::region::Region;
use crate::diagnostics::HeapId;
use crate::error::{HeapError, VmError};
use crate::vm::{checked_align_up, ExecutableView, ExecutableWriter, PageProvider, Protection};
use core::ptr::NonNull;
use tracing::warn;

pub(crate) struct BumpArena {
    pub(crate) region: Region,
    pub(crate) cursor: Cursor,
    commit_block_size: usize,
    protection: Protection,
}

impl BumpArena {
    pub fn new(region: Region, commit_block_size: usize, protection: Protection) -> Self {
        Self {
            region,
            cursor: Cursor::new(),
            commit_block_size,
            protection,
        }
    }

    /// Bump `total` bytes, committing or reserving as needed.
    #[inline]
    pub fn bump(&mut self, total: usize) -> Result<usize, HeapError> {
        if let Some(addr) = self.cursor.try_bump(total) {
            return Ok(addr);
        }
        self.bump_slow(total)
    }

    #[cold]
    fn bump_slow(&mut self, total: usize) -> Result<usize, HeapError> {
        self.get_more_committed_pages(total)?;
        self.cursor
            .try_bump(total)
            .ok_or(HeapError::OutOfMemory { requested: total })
    }

    /// Make at least `min` bytes available between the cursor and
    /// end-of-committed.
    pub fn get_more_committed_pages(&mut self, min: usize) -> Result<(), HeapError> {
        let result = if !self.cursor.is_empty() && min <= self.cursor.reserved_remaining() {
            self.commit_in_place(min)
        } else {
            self.reserve_pages(min).map(|_| ())
        };
        result.map_err(|err| out_of_memory(self.region.id(), min, err))
    }

    fn commit_in_place(&mut self, min: usize) -> Result<(), VmError> {
        let needed = min.saturating_sub(self.cursor.committed_remaining());
        let len = checked_align_up(needed.max(self.commit_block_size), self.region.page_size())
            .unwrap_or(usize::MAX)
            .min(self.cursor.uncommitted());

        let addr = self.cursor.committed_end();
        let protection = self.protection;
        self.region.commit(addr, len, |provider, base, len| unsafe {
            provider.commit(base, len, protection)
        })?;
        self.cursor.extend_committed(addr + len);
        Ok(())
    }

    /// Switch to a fresh block with at least `min` bytes committed.
    pub fn reserve_pages(&mut self, min: usize) -> Result<usize, VmError> {
        let page_size = self.region.page_size();
        let len = checked_align_up(min.max(self.commit_block_size), page_size).ok_or(
            VmError::Exhausted {
                requested: min,
                remaining: 0,
            },
        )?;

        let protection = self.protection;
        let block = self.region.grow(len, len, |provider, base, len| unsafe {
            provider.commit(base, len, protection)
        })?;

        self.region.record_waste(self.cursor.committed_remaining());
        self.cursor.reset(block.start, block.start + len, block.end);
        Ok(block.start)
    }

    /// Fill `len` bytes at `addr` with `byte`, through a writable alias when
    /// the pages are not writable.
    pub fn fill(&self, addr: usize, len: usize, byte: u8) -> Result<(), VmError> {
        let Some(ptr) = NonNull::new(addr as *mut u8) else {
            return Ok(());
        };
        if len == 0 {
            return Ok(());
        }
        if self.protection.is_writable() {
            // SAFETY: the range was just bumped out of committed, writable pages.
            unsafe { core::ptr::write_bytes(ptr.as_ptr(), byte, len) };
            return Ok(());
        }
        let provider: &dyn PageProvider = self.region.provider();
        // SAFETY: the range is committed executable memory owned by this heap,
        // and the heap is the only writer while it holds `&self`.
        let mut writer = unsafe { ExecutableWriter::new(provider, ExecutableView::from_raw_parts(ptr, len))? };
        writer.as_mut_slice().fill(byte);
        Ok(())
    }

    /// Committed bytes not reachable by the cursor, plus what is left in the
    /// current block.
    pub fn wasted_bytes(&self) -> usize {
        self.region.wasted() + self.cursor.committed_remaining()
    }
}

/// Log and convert a provider failure into the heap's out-of-memory error.
pub(crate) fn out_of_memory(heap: HeapId, requested: usize, err: VmError) -> HeapError {
    warn!(event = "out_of_memory", %heap, requested, error = %err);
    HeapError::OutOfMemory { requested }
}
