//! In-process page provider for tests and diagnostics
//!
//! Reservations are ordinary zeroed heap allocations aligned to the mock page
//! size, so allocations handed out by a heap are really readable and
//! writable. Protections are only recorded, not enforced by hardware; every
//! transition is kept in a history that tests can inspect.
//!
//! A commit budget makes exhaustion reproducible: once `fail_after(k)` bytes
//! are committed, further commits fail with [`VmError::Exhausted`].

use super::{align_up, AliasCounts, ExecutableView, PageProvider, Protection, WritableView};
use crate::error::VmError;
use core::ptr::NonNull;
use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{BTreeMap, HashMap};
use std::io;

const DEFAULT_PAGE_SIZE: usize = 4096;

/// One recorded protection change of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionChange {
    pub page: usize,
    pub from: Option<Protection>,
    pub to: Protection,
}

struct Reservation {
    size: usize,
    layout: Layout,
}

#[derive(Default)]
struct MockState {
    reservations: BTreeMap<usize, Reservation>,
    pages: HashMap<usize, Protection>,
    history: Vec<ProtectionChange>,
    committed: usize,
    reserved: usize,
    reserve_calls: usize,
}

/// Heap-backed [`PageProvider`] with a commit budget and protection history.
pub struct MockPages {
    page_size: usize,
    reserve_granularity: usize,
    commit_limit: Option<usize>,
    reserve_limit: Option<usize>,
    enforce_wx: bool,
    state: Mutex<MockState>,
    aliases: AliasCounts,
}

impl MockPages {
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            reserve_granularity: super::RESERVE_GRANULARITY,
            commit_limit: None,
            reserve_limit: None,
            enforce_wx: true,
            state: Mutex::new(MockState::default()),
            aliases: AliasCounts::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        self.page_size = page_size;
        self.reserve_granularity = self.reserve_granularity.max(page_size);
        self
    }

    pub fn with_reserve_granularity(mut self, granularity: usize) -> Self {
        assert!(granularity % self.page_size == 0);
        self.reserve_granularity = granularity;
        self
    }

    /// Fail every commit that would take the committed total past `bytes`.
    pub fn fail_after(mut self, bytes: usize) -> Self {
        self.commit_limit = Some(bytes);
        self
    }

    /// Fail every reservation that would take the reserved total past `bytes`.
    pub fn fail_reserve_after(mut self, bytes: usize) -> Self {
        self.reserve_limit = Some(bytes);
        self
    }

    /// Accept read-write-execute requests instead of panicking on them.
    pub fn allow_wx(mut self) -> Self {
        self.enforce_wx = false;
        self
    }

    pub fn committed_bytes(&self) -> usize {
        self.state.lock().committed
    }

    pub fn reserved_bytes(&self) -> usize {
        self.state.lock().reserved
    }

    /// Number of successful `reserve` calls so far.
    pub fn reservation_count(&self) -> usize {
        self.state.lock().reserve_calls
    }

    /// Current protection of the page containing `addr`, if committed.
    pub fn protection_at(&self, addr: usize) -> Option<Protection> {
        let page = addr & !(self.page_size - 1);
        self.state.lock().pages.get(&page).copied()
    }

    /// Every protection change recorded so far, oldest first.
    pub fn history(&self) -> Vec<ProtectionChange> {
        self.state.lock().history.clone()
    }

    /// Changes recorded for the page containing `addr`, oldest first.
    pub fn history_of(&self, addr: usize) -> Vec<Protection> {
        let page = addr & !(self.page_size - 1);
        self.state
            .lock()
            .history
            .iter()
            .filter(|change| change.page == page)
            .map(|change| change.to)
            .collect()
    }

    /// Whether `addr` lies inside a live reservation.
    pub fn is_reserved(&self, addr: usize) -> bool {
        let state = self.state.lock();
        state
            .reservations
            .range(..=addr)
            .next_back()
            .map_or(false, |(base, r)| addr < base + r.size)
    }

    fn set_protection(&self, state: &mut MockState, addr: usize, size: usize, to: Protection) {
        if self.enforce_wx && to == Protection::ReadWriteExecute {
            panic!("W^X violation: {size} bytes at {addr:#x} requested writable and executable");
        }
        let mut page = addr;
        while page < addr + size {
            let from = state.pages.insert(page, to);
            state.history.push(ProtectionChange { page, from, to });
            page += self.page_size;
        }
    }

    fn flip(&self, page: usize, to: Protection) -> Result<(), VmError> {
        // SAFETY: aliased pages lie inside a live executable view.
        unsafe { self.protect(NonNull::new_unchecked(page as *mut u8), self.page_size, to) }
    }

    /// Pages currently held writable by at least one alias.
    pub fn aliased_pages(&self) -> usize {
        self.aliases.aliased_pages()
    }

    fn check_range(&self, state: &MockState, addr: usize, size: usize) {
        assert_eq!(addr % self.page_size, 0, "unaligned page range at {addr:#x}");
        assert_eq!(size % self.page_size, 0, "unaligned page size {size:#x}");
        let inside = state
            .reservations
            .range(..=addr)
            .next_back()
            .map_or(false, |(base, r)| addr + size <= base + r.size);
        assert!(inside, "range {addr:#x}+{size:#x} is outside every reservation");
    }
}

impl Default for MockPages {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MockPages {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (base, reservation) in std::mem::take(&mut state.reservations) {
            unsafe { dealloc(base as *mut u8, reservation.layout) };
        }
    }
}

impl PageProvider for MockPages {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve_granularity(&self) -> usize {
        self.reserve_granularity
    }

    fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        let size = align_up(size.max(1), self.page_size);
        let mut state = self.state.lock();

        if let Some(limit) = self.reserve_limit {
            if state.reserved + size > limit {
                return Err(VmError::Reserve {
                    size,
                    source: io::Error::new(io::ErrorKind::OutOfMemory, "mock reserve limit"),
                });
            }
        }

        let layout = Layout::from_size_align(size, self.page_size).map_err(|_| VmError::Reserve {
            size,
            source: io::Error::new(io::ErrorKind::InvalidInput, "bad layout"),
        })?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| VmError::Reserve {
            size,
            source: io::Error::new(io::ErrorKind::OutOfMemory, "host allocation failed"),
        })?;

        state.reservations.insert(ptr.as_ptr() as usize, Reservation { size, layout });
        state.reserved += size;
        state.reserve_calls += 1;
        Ok(ptr)
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) {
        let mut state = self.state.lock();
        let base = base.as_ptr() as usize;
        let reservation = state
            .reservations
            .remove(&base)
            .unwrap_or_else(|| panic!("release of unknown reservation {base:#x}"));
        assert!(size <= reservation.size);

        let page_size = self.page_size;
        let mut released = 0;
        state.pages.retain(|&page, _| {
            let inside = page >= base && page < base + reservation.size;
            if inside {
                released += page_size;
            }
            !inside
        });
        state.committed -= released;
        state.reserved -= reservation.size;
        dealloc(base as *mut u8, reservation.layout);
    }

    unsafe fn commit(
        &self,
        addr: NonNull<u8>,
        size: usize,
        protection: Protection,
    ) -> Result<(), VmError> {
        let addr = addr.as_ptr() as usize;
        let mut state = self.state.lock();
        self.check_range(&state, addr, size);

        let fresh = (0..size / self.page_size)
            .filter(|i| !state.pages.contains_key(&(addr + i * self.page_size)))
            .count()
            * self.page_size;

        if let Some(limit) = self.commit_limit {
            if state.committed + fresh > limit {
                return Err(VmError::Exhausted {
                    requested: size,
                    remaining: limit.saturating_sub(state.committed),
                });
            }
        }

        self.set_protection(&mut state, addr, size, protection);
        state.committed += fresh;
        Ok(())
    }

    unsafe fn protect(
        &self,
        addr: NonNull<u8>,
        size: usize,
        protection: Protection,
    ) -> Result<(), VmError> {
        let addr = addr.as_ptr() as usize;
        let mut state = self.state.lock();
        self.check_range(&state, addr, size);
        for page in (addr..addr + size).step_by(self.page_size) {
            assert!(state.pages.contains_key(&page), "protect of uncommitted page {page:#x}");
        }
        self.set_protection(&mut state, addr, size, protection);
        Ok(())
    }

    unsafe fn map_writable(&self, exec: ExecutableView) -> Result<WritableView, VmError> {
        let start = exec.addr() & !(self.page_size - 1);
        let end = align_up(exec.addr() + exec.len(), self.page_size);
        self.aliases.acquire(
            start,
            end - start,
            self.page_size,
            |page| self.flip(page, Protection::ReadWrite),
            |page| {
                let _ = self.flip(page, Protection::ReadExecute);
            },
        )?;
        Ok(WritableView::from_raw_parts(
            NonNull::new_unchecked(exec.as_ptr() as *mut u8),
            exec.len(),
        ))
    }

    unsafe fn unmap_writable(&self, exec: ExecutableView, _rw: WritableView) {
        let start = exec.addr() & !(self.page_size - 1);
        let end = align_up(exec.addr() + exec.len(), self.page_size);
        self.aliases.release(start, end - start, self.page_size, |page| {
            let _ = self.flip(page, Protection::ReadExecute);
        });
    }
}
