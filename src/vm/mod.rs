//! Virtual memory - the page provider interface consumed by every heap
//!
//! Design: heaps never call the OS directly. They reserve address space,
//! commit pages and flip protections through a [`PageProvider`], which makes
//! the OS layer swappable:
//! 1. [`OsPages`] - mmap/mprotect (unix) or VirtualAlloc/VirtualProtect (windows)
//! 2. [`MockPages`] - heap-backed pages with a commit budget and a recorded
//!    protection history, used to test exhaustion and W^X behaviour
//!
//! Writable and executable access to the same bytes are two distinct types,
//! [`WritableView`] and [`ExecutableView`]. Nothing in this crate hands out a
//! single pointer typed as both.

mod os;
pub mod mock;

#[cfg(test)]
mod tests;

pub use mock::{MockPages, ProtectionChange};
pub use os::OsPages;

use crate::error::VmError;
use core::ptr::NonNull;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Address space is reserved in multiples of this many bytes.
pub const RESERVE_GRANULARITY: usize = 64 * 1024;

/// Page protection requested from a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    ReadExecute,
    /// Only requested when W^X enforcement is switched off.
    ReadWriteExecute,
}

impl Protection {
    #[inline]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite | Self::ReadWriteExecute)
    }

    #[inline]
    pub const fn is_executable(self) -> bool {
        matches!(self, Self::ReadExecute | Self::ReadWriteExecute)
    }
}

/// Source of reserved and committed pages.
///
/// Implementations must be usable from any thread. All addresses handed to
/// the unsafe methods must lie inside a reservation previously returned by
/// [`PageProvider::reserve`] on the same provider.
pub trait PageProvider: Send + Sync {
    /// Commit granularity in bytes (a power of two).
    fn page_size(&self) -> usize;

    /// Reservation granularity in bytes (a multiple of the page size).
    fn reserve_granularity(&self) -> usize {
        RESERVE_GRANULARITY.max(self.page_size())
    }

    /// Reserve `size` bytes of address space without backing pages.
    fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError>;

    /// Release a whole reservation.
    ///
    /// # Safety
    /// `base`/`size` must describe exactly one live reservation, and no
    /// pointer into it may be used afterwards.
    unsafe fn release(&self, base: NonNull<u8>, size: usize);

    /// Commit pages inside a reservation. Freshly committed pages read as zero.
    ///
    /// # Safety
    /// The range must be page aligned and inside a live reservation.
    unsafe fn commit(
        &self,
        addr: NonNull<u8>,
        size: usize,
        protection: Protection,
    ) -> Result<(), VmError>;

    /// Change the protection of committed pages.
    ///
    /// # Safety
    /// The range must be page aligned and fully committed.
    unsafe fn protect(
        &self,
        addr: NonNull<u8>,
        size: usize,
        protection: Protection,
    ) -> Result<(), VmError>;

    /// Obtain a writable alias of executable memory.
    ///
    /// The returned view stays valid until [`PageProvider::unmap_writable`].
    /// Providers without dual mapping flip the pages to read-write while any
    /// alias covering them is alive, so the pages must not execute meanwhile.
    /// Overlapping aliases are counted per page; the last one to go reseals.
    ///
    /// # Safety
    /// `exec` must cover committed executable memory of this provider.
    unsafe fn map_writable(&self, exec: ExecutableView) -> Result<WritableView, VmError>;

    /// Drop an alias obtained from [`PageProvider::map_writable`].
    ///
    /// # Safety
    /// `rw` must have come from `map_writable(exec)` and must not be used
    /// afterwards.
    unsafe fn unmap_writable(&self, exec: ExecutableView, rw: WritableView);
}

/// Read/execute access to generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutableView {
    ptr: NonNull<u8>,
    len: usize,
}

impl ExecutableView {
    /// # Safety
    /// `ptr..ptr + len` must be committed memory that is (or will be made)
    /// executable.
    #[inline]
    pub const unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline]
    pub const fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr() as *const u8
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Read/write, never executable, access to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritableView {
    ptr: NonNull<u8>,
    len: usize,
}

impl WritableView {
    /// # Safety
    /// `ptr..ptr + len` must be committed, writable memory.
    #[inline]
    pub const unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline]
    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// No other reference to these bytes may be live for `'a`.
    #[inline]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

/// Scoped writable alias of executable memory, unmapped on drop.
pub struct ExecutableWriter<'p> {
    provider: &'p dyn PageProvider,
    exec: ExecutableView,
    rw: WritableView,
}

impl<'p> ExecutableWriter<'p> {
    /// # Safety
    /// See [`PageProvider::map_writable`]. The caller must be the only writer
    /// of `exec` while the guard lives.
    pub unsafe fn new(
        provider: &'p dyn PageProvider,
        exec: ExecutableView,
    ) -> Result<Self, VmError> {
        let rw = provider.map_writable(exec)?;
        Ok(Self { provider, exec, rw })
    }

    #[inline]
    pub fn view(&self) -> WritableView {
        self.rw
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the alias is exclusively owned by this guard.
        unsafe { self.rw.as_mut_slice() }
    }
}

impl Drop for ExecutableWriter<'_> {
    fn drop(&mut self) {
        unsafe { self.provider.unmap_writable(self.exec, self.rw) }
    }
}

/// Address space reserved by the caller and handed to a heap at construction.
#[derive(Debug)]
pub struct ReservedRegion {
    base: NonNull<u8>,
    size: usize,
    release_on_drop: bool,
}

impl ReservedRegion {
    /// # Safety
    /// `base..base + size` must be a page-aligned reservation made through the
    /// same provider the heap is built with, not used by anything else. When
    /// `release_on_drop` is set it must be exactly one whole reservation.
    pub unsafe fn new(base: NonNull<u8>, size: usize, release_on_drop: bool) -> Self {
        Self { base, size, release_on_drop }
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn release_on_drop(&self) -> bool {
        self.release_on_drop
    }
}

// SAFETY: a reservation is plain address space; ownership moves with the value.
unsafe impl Send for ReservedRegion {}

/// Live writable aliases per page, for providers that alias by flipping
/// protections. A page is flipped on its first alias and resealed when its
/// last alias goes away.
#[derive(Debug, Default)]
pub(crate) struct AliasCounts {
    pages: Mutex<HashMap<usize, usize>>,
}

impl AliasCounts {
    /// Count one more alias on every page of `start..start + len`, calling
    /// `open` for each page that had none. On failure the pages opened by
    /// this call are handed to `seal` and nothing is counted.
    pub fn acquire(
        &self,
        start: usize,
        len: usize,
        page_size: usize,
        mut open: impl FnMut(usize) -> Result<(), VmError>,
        mut seal: impl FnMut(usize),
    ) -> Result<(), VmError> {
        let mut pages = self.pages.lock();
        let mut opened = Vec::new();
        for page in (start..start + len).step_by(page_size) {
            if pages.contains_key(&page) {
                continue;
            }
            if let Err(err) = open(page) {
                opened.into_iter().for_each(&mut seal);
                return Err(err);
            }
            opened.push(page);
        }
        for page in (start..start + len).step_by(page_size) {
            *pages.entry(page).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Drop one alias from every page of `start..start + len`, calling `seal`
    /// for each page left without any.
    pub fn release(&self, start: usize, len: usize, page_size: usize, mut seal: impl FnMut(usize)) {
        let mut pages = self.pages.lock();
        for page in (start..start + len).step_by(page_size) {
            let Some(count) = pages.get_mut(&page) else {
                debug_assert!(false, "release of unaliased page {page:#x}");
                continue;
            };
            *count -= 1;
            if *count == 0 {
                pages.remove(&page);
                seal(page);
            }
        }
    }

    /// Pages with at least one live alias.
    pub fn aliased_pages(&self) -> usize {
        self.pages.lock().len()
    }
}

/// Round `value` up to a power-of-two `align`, or `None` on overflow.
#[inline]
pub(crate) const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `value` up to a power-of-two `align`.
#[inline(always)]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value.wrapping_add(align).wrapping_sub(1)) & !align.wrapping_sub(1)
}
