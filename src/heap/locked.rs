//! Thread-safe heaps - one mutex per engine
//!
//! Every entry point holds the lock for the whole call, slow paths included,
//! and returns results tagged with the heap for [`AllocHolder`] /
//! [`AllocTracker`] use.
//!
//! [`AllocHolder`]: crate::holder::AllocHolder
//! [`AllocTracker`]: crate::holder::AllocTracker

use super::interleaved::{InterleavedConfig, StubSlot, UnlockedInterleavedLoaderHeap};
use super::loader::UnlockedLoaderHeap;
use super::{HeapOptions, HeapStats};
use crate::diagnostics::HeapId;
use crate::error::Result;
use crate::holder::{Backout, TaggedAlloc};
use core::cell::RefCell;
use core::ptr::NonNull;
use parking_lot::Mutex;

/// [`UnlockedLoaderHeap`] behind a mutex.
pub struct LoaderHeap {
    inner: Mutex<UnlockedLoaderHeap>,
}

impl LoaderHeap {
    pub fn new(options: HeapOptions) -> Result<Self> {
        Ok(Self::from_unlocked(UnlockedLoaderHeap::new(options)?))
    }

    pub fn from_unlocked(heap: UnlockedLoaderHeap) -> Self {
        Self { inner: Mutex::new(heap) }
    }

    pub fn into_unlocked(self) -> UnlockedLoaderHeap {
        self.inner.into_inner()
    }

    pub fn alloc_mem(&self, size: usize) -> Result<TaggedAlloc<'_>> {
        let ptr = self.inner.lock().alloc_mem(size)?;
        Ok(TaggedAlloc::new(ptr, size, 0, self))
    }

    /// Null result instead of an error on exhaustion.
    pub fn alloc_mem_no_throw(&self, size: usize) -> TaggedAlloc<'_> {
        match self.inner.lock().alloc_mem_no_throw(size) {
            Some(ptr) => TaggedAlloc::new(ptr, size, 0, self),
            None => TaggedAlloc::null(size, self),
        }
    }

    pub fn alloc_aligned_mem(&self, size: usize, alignment: usize) -> Result<TaggedAlloc<'_>> {
        let (ptr, extra) = self.inner.lock().alloc_aligned_mem(size, alignment)?;
        Ok(TaggedAlloc::new(ptr, size, extra, self))
    }

    pub fn alloc_aligned_mem_no_throw(&self, size: usize, alignment: usize) -> TaggedAlloc<'_> {
        match self.inner.lock().alloc_aligned_mem_no_throw(size, alignment) {
            Some((ptr, extra)) => TaggedAlloc::new(ptr, size, extra, self),
            None => TaggedAlloc::null(size, self),
        }
    }

    pub fn backout_mem(&self, ptr: Option<NonNull<u8>>, size: usize) {
        self.inner.lock().backout_mem(ptr, size);
    }

    /// Run `f` with the lock held.
    pub fn with_unlocked<R>(&self, f: impl FnOnce(&mut UnlockedLoaderHeap) -> R) -> R {
        f(&mut *self.inner.lock())
    }

    pub fn id(&self) -> HeapId {
        self.inner.lock().id()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }

    pub fn enum_page_regions(&self, callback: impl FnMut(usize, usize) -> bool) {
        self.inner.lock().enum_page_regions(callback);
    }

    pub fn committed_regions(&self) -> Vec<(usize, usize)> {
        self.inner.lock().committed_regions()
    }
}

impl Backout for LoaderHeap {
    fn backout(&self, ptr: NonNull<u8>, size: usize) {
        self.backout_mem(Some(ptr), size);
    }
}

/// Single-threaded backout straight into an unlocked heap. `RefCell` is not
/// `Sync`, so results tagged this way cannot reach another thread.
impl Backout for RefCell<UnlockedLoaderHeap> {
    fn backout(&self, ptr: NonNull<u8>, size: usize) {
        self.borrow_mut().backout_mem(Some(ptr), size);
    }
}

/// [`UnlockedInterleavedLoaderHeap`] behind a mutex.
pub struct InterleavedLoaderHeap {
    inner: Mutex<UnlockedInterleavedLoaderHeap>,
}

impl InterleavedLoaderHeap {
    pub fn new(config: InterleavedConfig, options: HeapOptions) -> Result<Self> {
        Ok(Self::from_unlocked(UnlockedInterleavedLoaderHeap::new(config, options)?))
    }

    pub fn from_unlocked(heap: UnlockedInterleavedLoaderHeap) -> Self {
        Self { inner: Mutex::new(heap) }
    }

    pub fn into_unlocked(self) -> UnlockedInterleavedLoaderHeap {
        self.inner.into_inner()
    }

    /// Allocate a stub. The tagged pointer is the stub's code half.
    pub fn alloc_stub(&self) -> Result<(StubSlot, TaggedAlloc<'_>)> {
        let mut heap = self.inner.lock();
        let slot = heap.alloc_stub()?;
        let tagged = TaggedAlloc::new(slot.as_ptr(), heap.stub_size(), 0, self);
        Ok((slot, tagged))
    }

    pub fn alloc_stub_no_throw(&self) -> Option<(StubSlot, TaggedAlloc<'_>)> {
        self.alloc_stub().ok()
    }

    pub fn backout_stub(&self, code: Option<NonNull<u8>>) {
        self.inner.lock().backout_stub(code);
    }

    pub fn with_unlocked<R>(&self, f: impl FnOnce(&mut UnlockedInterleavedLoaderHeap) -> R) -> R {
        f(&mut *self.inner.lock())
    }

    pub fn id(&self) -> HeapId {
        self.inner.lock().id()
    }

    pub fn stride(&self) -> usize {
        self.inner.lock().stride()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }

    pub fn enum_page_regions(&self, callback: impl FnMut(usize, usize) -> bool) {
        self.inner.lock().enum_page_regions(callback);
    }
}

impl Backout for InterleavedLoaderHeap {
    fn backout(&self, ptr: NonNull<u8>, _size: usize) {
        self.backout_stub(Some(ptr));
    }
}

impl Backout for RefCell<UnlockedInterleavedLoaderHeap> {
    fn backout(&self, ptr: NonNull<u8>, _size: usize) {
        self.borrow_mut().backout_stub(Some(ptr));
    }
}
