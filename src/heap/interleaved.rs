//! Interleaved stub heap - code pages paired with data pages
//!
//! Design: Address space is carved into page pairs of `stride` bytes each:
//!
//! ```text
//! | code page (RX) | data page (RW) | code page (RX) | data page (RW) | ...
//!   ^ stub k                ^ stub k + stride
//! ```
//!
//! A stub's data lives exactly `stride` bytes after its code, so generated
//! code reaches its data with a fixed pc-relative offset. A new pair is
//! committed read-write, filled by the page generators, and only then is the
//! code page flipped to read-execute. Recycled stubs keep their free-list
//! link in the data half, which is never executable.

use super::cursor::Cursor;
use super::region::Region;
use super::{HeapOptions, HeapStats};
use crate::config::{HeapKind, StubPageConfig};
use crate::diagnostics::HeapId;
use crate::error::{HeapError, Result, VmError};
use crate::vm::{ExecutableView, PageProvider, Protection, WritableView};
use core::fmt;
use core::ptr::NonNull;
use tracing::{debug, trace};

/// Writes the initial contents of a code page: `(writable page, executable
/// view of the same page, template)`.
pub type CodePageGenerator = Box<dyn Fn(&mut [u8], ExecutableView, &[u8]) + Send + Sync>;

/// Writes the initial contents of a data page.
pub type DataPageGenerator = Box<dyn Fn(&mut [u8]) + Send + Sync>;

/// Stub shape and page initialization of an interleaved heap.
pub struct InterleavedConfig {
    stub_size: usize,
    template: Vec<u8>,
    code_page_generator: CodePageGenerator,
    data_page_generator: DataPageGenerator,
}

impl InterleavedConfig {
    /// Stubs of `stub_size` bytes. By default every stub slot of a code page
    /// starts with a copy of `template`, and data pages stay zero-filled.
    pub fn new(stub_size: usize, template: impl Into<Vec<u8>>) -> Self {
        let template = template.into();
        Self {
            stub_size,
            template,
            code_page_generator: Box::new(move |page, _exec, template| tile_template(page, template, stub_size)),
            data_page_generator: Box::new(|_page| {}),
        }
    }

    pub fn code_page_generator(
        mut self,
        generator: impl Fn(&mut [u8], ExecutableView, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.code_page_generator = Box::new(generator);
        self
    }

    pub fn data_page_generator(mut self, generator: impl Fn(&mut [u8]) + Send + Sync + 'static) -> Self {
        self.data_page_generator = Box::new(generator);
        self
    }

    #[inline]
    pub fn stub_size(&self) -> usize {
        self.stub_size
    }

    pub fn template(&self) -> &[u8] {
        &self.template
    }
}

impl fmt::Debug for InterleavedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterleavedConfig")
            .field("stub_size", &self.stub_size)
            .field("template_len", &self.template.len())
            .finish_non_exhaustive()
    }
}

/// Copy `template` to the start of every `stub_size` slot of `page`.
fn tile_template(page: &mut [u8], template: &[u8], stub_size: usize) {
    let len = template.len().min(stub_size);
    if len == 0 {
        return;
    }
    for slot in page.chunks_exact_mut(stub_size) {
        slot[..len].copy_from_slice(&template[..len]);
    }
}

/// One stub: code half on a code page, data half `stride` bytes later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubSlot {
    code: NonNull<u8>,
    stride: usize,
    size: usize,
}

impl StubSlot {
    #[inline]
    pub fn code_addr(&self) -> usize {
        self.code.as_ptr() as usize
    }

    #[inline]
    pub fn data_addr(&self) -> usize {
        self.code_addr() + self.stride
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The executable half.
    pub fn code(&self) -> ExecutableView {
        // SAFETY: the slot lies on a committed code page of its heap.
        unsafe { ExecutableView::from_raw_parts(self.code, self.size) }
    }

    /// The writable, never executable, half.
    pub fn data(&self) -> WritableView {
        // SAFETY: the data page of a committed pair is read-write and the
        // address is inside the same reservation as the code half.
        unsafe { WritableView::from_raw_parts(NonNull::new_unchecked(self.data_addr() as *mut u8), self.size) }
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.code
    }
}

/// Single-threaded stub heap. Wrap in
/// [`InterleavedLoaderHeap`](super::InterleavedLoaderHeap) for shared use.
pub struct UnlockedInterleavedLoaderHeap {
    region: Region,
    cursor: Cursor,
    config: InterleavedConfig,
    stride: usize,
    wx_enabled: bool,
    free_head: Option<NonNull<u8>>,
    free_count: usize,
}

// SAFETY: the heap owns its reservations; the free-list head points into them.
unsafe impl Send for UnlockedInterleavedLoaderHeap {}

impl UnlockedInterleavedLoaderHeap {
    pub fn new(config: InterleavedConfig, options: HeapOptions) -> Result<Self> {
        let stubs: StubPageConfig = options.stub_config().clone();
        stubs.validate()?;

        let region = options.into_region(HeapKind::Interleaved, stubs.reserve_block_size);
        let stride = stubs.code_page_size.max(region.page_size());
        if config.stub_size == 0 || config.stub_size > stride {
            return Err(HeapError::InvalidArgument("stub size must be non-zero and fit in a code page"));
        }
        if config.stub_size % core::mem::align_of::<usize>() != 0 {
            return Err(HeapError::InvalidArgument("stub size must be a multiple of pointer size"));
        }

        debug!(heap = %region.id(), stride, stub_size = config.stub_size, wx = stubs.wx_enabled, "interleaved heap");
        Ok(Self {
            region,
            cursor: Cursor::new(),
            config,
            stride,
            wx_enabled: stubs.wx_enabled,
            free_head: None,
            free_count: 0,
        })
    }

    #[inline]
    pub fn id(&self) -> HeapId {
        self.region.id()
    }

    /// Distance from a stub's code half to its data half.
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn stub_size(&self) -> usize {
        self.config.stub_size
    }

    pub fn provider(&self) -> &dyn PageProvider {
        self.region.provider()
    }

    /// Allocate one stub, recycling a backed-out one first.
    pub fn alloc_stub(&mut self) -> Result<StubSlot> {
        if let Some(code) = self.free_head {
            let slot = self.slot(code);
            // SAFETY: the data half of a recycled stub holds the next link.
            let next = unsafe { (slot.data_addr() as *const usize).read() };
            self.free_head = NonNull::new(next as *mut u8);
            self.free_count -= 1;
            trace!(event = "free_list_hit", heap = %self.id(), address = format_args!("{:#x}", slot.code_addr()));
            return Ok(slot);
        }

        let stub_size = self.config.stub_size;
        let addr = match self.cursor.try_bump(stub_size) {
            Some(addr) => addr,
            None => {
                self.commit_page_pair()
                    .map_err(|err| super::arena::out_of_memory(self.region.id(), stub_size, err))?;
                self.cursor
                    .try_bump(stub_size)
                    .ok_or(HeapError::OutOfMemory { requested: stub_size })?
            }
        };

        let code = NonNull::new(addr as *mut u8).ok_or(HeapError::OutOfMemory { requested: stub_size })?;
        trace!(event = "alloc", heap = %self.id(), address = format_args!("{addr:#x}"), size = stub_size);
        Ok(self.slot(code))
    }

    /// [`alloc_stub`](Self::alloc_stub) reporting failure as `None`.
    pub fn alloc_stub_no_throw(&mut self) -> Option<StubSlot> {
        self.alloc_stub().ok()
    }

    /// Recycle a stub. Its data half is overwritten; callers reinitialize
    /// it after the next allocation. `None` is ignored.
    pub fn backout_stub(&mut self, code: Option<NonNull<u8>>) {
        let Some(code) = code else {
            return;
        };
        self.validate_stub(code.as_ptr() as usize);

        let slot = self.slot(code);
        let next = self.free_head.map_or(0, |head| head.as_ptr() as usize);
        // SAFETY: the data half is committed read-write memory of this heap.
        unsafe { (slot.data_addr() as *mut usize).write(next) };
        self.free_head = Some(code);
        self.free_count += 1;
        trace!(event = "backout", heap = %self.id(), address = format_args!("{:#x}", slot.code_addr()));
    }

    fn validate_stub(&self, addr: usize) {
        let block = self.region.blocks().block_containing(addr);
        let Some(block) = block else {
            panic!("stub {addr:#x} does not belong to {}", self.id());
        };
        let offset = addr - block.start();
        assert!(offset < block.committed(), "stub {addr:#x} is on an uncommitted page");
        assert!((offset / self.stride) % 2 == 0, "stub {addr:#x} is on a data page");
        assert!(
            (offset % self.stride) % self.config.stub_size == 0,
            "stub {addr:#x} is not at a stub boundary"
        );
    }

    #[inline]
    fn slot(&self, code: NonNull<u8>) -> StubSlot {
        StubSlot {
            code,
            stride: self.stride,
            size: self.config.stub_size,
        }
    }

    /// Commit and initialize the next code/data pair and point the cursor at
    /// its code page.
    fn commit_page_pair(&mut self) -> core::result::Result<(), VmError> {
        let pair = 2 * self.stride;
        let stride = self.stride;
        let wx_enabled = self.wx_enabled;
        let config = &self.config;
        let init = |provider: &dyn PageProvider, base: NonNull<u8>, _len: usize| {
            init_page_pair(provider, base, stride, wx_enabled, config)
        };

        let next = self.cursor.committed_end() + stride;
        let fits = !self.cursor.is_empty()
            && next.checked_add(pair).map_or(false, |end| end <= self.cursor.reserved_end());

        let (start, reserved_end) = if fits {
            self.region.commit(next, pair, init)?;
            (next, self.cursor.reserved_end())
        } else {
            let block = self.region.grow(pair, pair, init)?;
            (block.start, block.end)
        };

        self.region.record_waste(self.cursor.committed_remaining());
        self.cursor.reset(start, start + stride, reserved_end);
        debug!(event = "page_pair", heap = %self.region.id(), code = format_args!("{start:#x}"), stride);
        Ok(())
    }

    /// Total committed bytes, code and data pages alike.
    #[inline]
    pub fn size(&self) -> usize {
        self.region.total_committed()
    }

    #[inline]
    pub fn reserved_bytes_free(&self) -> usize {
        self.cursor.reserved_remaining()
    }

    #[inline]
    pub fn alloc_ptr(&self) -> usize {
        self.cursor.alloc_ptr()
    }

    /// End of the current code page.
    #[inline]
    pub fn committed_end(&self) -> usize {
        self.cursor.committed_end()
    }

    /// Stubs waiting on the free list.
    #[inline]
    pub fn free_stubs(&self) -> usize {
        self.free_count
    }

    pub fn wasted_bytes(&self) -> usize {
        self.region.wasted() + self.cursor.committed_remaining()
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            committed_bytes: self.region.total_committed(),
            reserved_bytes: self.region.blocks().total_reserved(),
            blocks: self.region.blocks().len(),
            wasted_bytes: self.wasted_bytes(),
            free_list_blocks: self.free_count,
            free_list_bytes: self.free_count * self.config.stub_size,
        }
    }

    pub fn enum_page_regions(&self, callback: impl FnMut(usize, usize) -> bool) {
        self.region.enum_page_regions(callback);
    }

    pub fn committed_regions(&self) -> Vec<(usize, usize)> {
        self.region.committed_regions()
    }
}

/// Commit one pair at `base`, run the generators, then seal the code page.
fn init_page_pair(
    provider: &dyn PageProvider,
    base: NonNull<u8>,
    stride: usize,
    wx_enabled: bool,
    config: &InterleavedConfig,
) -> core::result::Result<(), VmError> {
    let code_protection = if wx_enabled {
        Protection::ReadWrite
    } else {
        Protection::ReadWriteExecute
    };
    // SAFETY: the data page follows the code page inside the same reservation.
    let data = unsafe { NonNull::new_unchecked(base.as_ptr().add(stride)) };

    // SAFETY: `base..base + 2 * stride` is reserved, page aligned and unused.
    unsafe {
        provider.commit(base, stride, code_protection)?;
        provider.commit(data, stride, Protection::ReadWrite)?;
    }

    {
        // SAFETY: both pages were just committed read-write and nothing else
        // refers to them yet.
        let code_page = unsafe { WritableView::from_raw_parts(base, stride).as_mut_slice() };
        let exec = unsafe { ExecutableView::from_raw_parts(base, stride) };
        (config.code_page_generator)(code_page, exec, &config.template);

        let data_page = unsafe { WritableView::from_raw_parts(data, stride).as_mut_slice() };
        (config.data_page_generator)(data_page);
    }

    if wx_enabled {
        // SAFETY: the code page is committed; no writable reference survives.
        unsafe { provider.protect(base, stride, Protection::ReadExecute)? };
    }
    Ok(())
}
