//! Allocation ownership - back out on failure, keep on success
//!
//! Design: Allocation calls return a plain [`TaggedAlloc`] value that knows
//! which heap produced it. Ownership lives in two wrappers:
//! 1. [`AllocHolder`] - one allocation, backed out on drop unless released
//! 2. [`AllocTracker`] - many allocations from any heaps, backed out together
//!
//! A multi-step construction tracks every chunk, and only calls
//! `release_all` once the last step succeeded. An early `?` return drops the
//! tracker and unwinds everything allocated so far.


use crate::error::{HeapError, Result};
use core::fmt;
use core::ptr::NonNull;
use smallvec::SmallVec;
use tracing::trace;

/// Allocations tracked without touching the global allocator.
const INLINE_RECORDS: usize = 20;

/// Something allocations can be handed back to.
pub trait Backout {
    /// Give back exactly `size` bytes at `ptr`, as originally allocated.
    fn backout(&self, ptr: NonNull<u8>, size: usize);
}

/// Result of one allocation: the pointer handed to the caller, the requested
/// size, the alignment padding in front of the pointer, and the heap that
/// produced it. A null result (failed no-throw allocation) has no pointer.
///
/// Copying this value does not copy ownership.
#[derive(Clone, Copy)]
pub struct TaggedAlloc<'h> {
    ptr: Option<NonNull<u8>>,
    size: usize,
    extra: usize,
    heap: &'h dyn Backout,
}

impl<'h> TaggedAlloc<'h> {
    pub fn new(ptr: NonNull<u8>, size: usize, extra: usize, heap: &'h dyn Backout) -> Self {
        Self { ptr: Some(ptr), size, extra, heap }
    }

    /// Failed allocation of `size` bytes from `heap`.
    pub fn null(size: usize, heap: &'h dyn Backout) -> Self {
        Self { ptr: None, size, extra: 0, heap }
    }

    #[inline]
    pub fn ptr(&self) -> Option<NonNull<u8>> {
        self.ptr
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// Size the caller asked for.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment padding in front of [`ptr`](Self::ptr).
    #[inline]
    pub fn extra(&self) -> usize {
        self.extra
    }

    #[inline]
    pub fn heap(&self) -> &'h dyn Backout {
        self.heap
    }

    /// Hand the whole underlying block, padding included, back to its heap.
    pub(crate) fn backout(&self) {
        if let Some(ptr) = self.ptr {
            let raw = ptr.as_ptr().wrapping_sub(self.extra);
            if let Some(raw) = NonNull::new(raw) {
                self.heap.backout(raw, self.size + self.extra);
            }
        }
    }
}

impl fmt::Debug for TaggedAlloc<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedAlloc")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("extra", &self.extra)
            .finish_non_exhaustive()
    }
}

/// Owns one allocation and backs it out on drop unless released.
pub struct AllocHolder<'h> {
    alloc: Option<TaggedAlloc<'h>>,
}

impl<'h> AllocHolder<'h> {
    pub fn new(alloc: TaggedAlloc<'h>) -> Self {
        Self { alloc: Some(alloc) }
    }

    /// Holder to be filled by one later [`assign`](Self::assign).
    pub fn empty() -> Self {
        Self { alloc: None }
    }

    /// Take ownership of `alloc`.
    ///
    /// # Panics
    /// If the holder already owns an allocation.
    pub fn assign(&mut self, alloc: TaggedAlloc<'h>) {
        assert!(self.alloc.is_none(), "allocation holder assigned twice");
        self.alloc = Some(alloc);
    }

    pub fn ptr(&self) -> Option<NonNull<u8>> {
        self.alloc.and_then(|alloc| alloc.ptr())
    }

    pub fn get(&self) -> Option<&TaggedAlloc<'h>> {
        self.alloc.as_ref()
    }

    /// Keep the allocation for good.
    pub fn release(mut self) -> Option<NonNull<u8>> {
        self.alloc.take().and_then(|alloc| alloc.ptr())
    }
}

impl Drop for AllocHolder<'_> {
    fn drop(&mut self) {
        if let Some(alloc) = self.alloc.take() {
            alloc.backout();
        }
    }
}

impl fmt::Debug for AllocHolder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocHolder").field("alloc", &self.alloc).finish()
    }
}

/// Batch of allocations from any number of heaps, backed out together on
/// drop unless [`release_all`](Self::release_all) was called.
pub struct AllocTracker<'h> {
    records: SmallVec<[TaggedAlloc<'h>; INLINE_RECORDS]>,
    limit: Option<usize>,
    released: bool,
}

impl<'h> AllocTracker<'h> {
    pub fn new() -> Self {
        Self {
            records: SmallVec::new(),
            limit: None,
            released: false,
        }
    }

    /// Tracker that refuses to grow beyond `limit` records.
    pub fn with_limit(limit: usize) -> Self {
        let mut tracker = Self::new();
        tracker.limit = Some(limit);
        tracker
    }

    /// Track `alloc` and return its pointer.
    ///
    /// A null `alloc` is an out-of-memory error. If the tracker cannot record
    /// `alloc`, it is backed out immediately and `OutOfTrackerSpace` returned.
    pub fn track(&mut self, alloc: TaggedAlloc<'h>) -> Result<NonNull<u8>> {
        let Some(ptr) = alloc.ptr() else {
            return Err(HeapError::OutOfMemory { requested: alloc.size() });
        };
        if !self.try_record(alloc) {
            alloc.backout();
            return Err(HeapError::OutOfTrackerSpace);
        }
        Ok(ptr)
    }

    /// [`track`](Self::track) reporting failure as `None`.
    pub fn track_no_throw(&mut self, alloc: TaggedAlloc<'h>) -> Option<NonNull<u8>> {
        self.track(alloc).ok()
    }

    fn try_record(&mut self, alloc: TaggedAlloc<'h>) -> bool {
        debug_assert!(!self.released, "tracking into a released tracker");
        if self.limit.map_or(false, |limit| self.records.len() >= limit) {
            return false;
        }
        if self.records.try_reserve(1).is_err() {
            return false;
        }
        self.records.push(alloc);
        true
    }

    /// Keep every tracked allocation.
    pub fn release_all(&mut self) {
        self.released = true;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the records still fit in the inline block.
    #[inline]
    pub fn is_inline(&self) -> bool {
        !self.records.spilled()
    }
}

impl Default for AllocTracker<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AllocTracker<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if !self.records.is_empty() {
            trace!(count = self.records.len(), "backing out tracked allocations");
        }
        for alloc in self.records.drain(..).rev() {
            alloc.backout();
        }
    }
}

impl fmt::Debug for AllocTracker<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocTracker")
            .field("records", &self.records.len())
            .field("released", &self.released)
            .finish()
    }
}
