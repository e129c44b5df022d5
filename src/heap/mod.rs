//! Loader heaps - reserve/commit arenas whose memory lives as long as the heap
//!
//! Design: Three engines over one region layer:
//! 1. [`UnlockedLoaderHeap`] - bump allocation, aligned allocation, backout
//! 2. [`UnlockedInterleavedLoaderHeap`] - fixed-size stubs on code pages
//!    paired with data pages one stride away
//! 3. [`ExplicitControlHeap`] - caller-steered code allocation, no backout
//!
//! The unlocked engines take `&mut self` for every mutation, so a single
//! writer is enforced by the borrow checker. [`LoaderHeap`] and
//! [`InterleavedLoaderHeap`] put one mutex around an engine for shared use.

mod arena;
mod block;
mod cursor;
mod explicit;
mod free_list;
mod interleaved;
mod loader;
mod locked;
mod region;


pub use block::ReservedBlock;
pub use cursor::Cursor;
pub use explicit::ExplicitControlHeap;
pub use free_list::{FreeBlock, FreeList};
pub use interleaved::{
    CodePageGenerator, DataPageGenerator, InterleavedConfig, StubSlot, UnlockedInterleavedLoaderHeap,
};
pub use loader::{alloc_total_size, UnlockedLoaderHeap, GUARD_BYTE, GUARD_SIZE};
pub use locked::{InterleavedLoaderHeap, LoaderHeap};

use crate::config::{HeapConfig, HeapKind, Settings, StubPageConfig};
use crate::diagnostics::HeapDiagnostics;
use crate::range::RangeList;
use crate::vm::{OsPages, PageProvider, Protection, ReservedRegion};
use std::sync::Arc;

/// Everything needed to build a heap. Sizes come from the serializable
/// configs; the rest are runtime collaborators.
pub struct HeapOptions {
    config: HeapConfig,
    stubs: StubPageConfig,
    provider: Option<Arc<dyn PageProvider>>,
    reserved_region: Option<ReservedRegion>,
    range_list: Option<Arc<RangeList>>,
    diagnostics: Option<Arc<dyn HeapDiagnostics>>,
}

impl HeapOptions {
    pub fn new(config: HeapConfig) -> Self {
        Self {
            config,
            stubs: StubPageConfig::default(),
            provider: None,
            reserved_region: None,
            range_list: None,
            diagnostics: None,
        }
    }

    pub fn data() -> Self {
        Self::new(HeapConfig::new(HeapKind::Data))
    }

    pub fn executable() -> Self {
        Self::new(HeapConfig::new(HeapKind::Executable))
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.heap.clone()).stub_pages(settings.stubs.clone())
    }

    pub fn stub_pages(mut self, stubs: StubPageConfig) -> Self {
        self.stubs = stubs;
        self
    }

    /// Page provider; the process-wide [`OsPages`] when not set.
    pub fn provider(mut self, provider: Arc<dyn PageProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Address space for the first block. Nothing is committed in it until
    /// the first allocation.
    pub fn reserved_region(mut self, region: ReservedRegion) -> Self {
        self.reserved_region = Some(region);
        self
    }

    pub fn range_list(mut self, ranges: Arc<RangeList>) -> Self {
        self.range_list = Some(ranges);
        self
    }

    /// Per-heap diagnostics sink, instead of the process-wide one.
    pub fn diagnostics(mut self, sink: Arc<dyn HeapDiagnostics>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn heap_config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn stub_config(&self) -> &StubPageConfig {
        &self.stubs
    }

    fn into_region(self, kind: HeapKind, reserve_block_size: usize) -> region::Region {
        let provider = self
            .provider
            .unwrap_or_else(|| OsPages::shared() as Arc<dyn PageProvider>);
        region::Region::new(
            kind,
            provider,
            reserve_block_size,
            self.reserved_region,
            self.range_list,
            self.diagnostics,
        )
    }
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self::data()
    }
}

/// Point-in-time accounting of one heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Total committed bytes across all blocks.
    pub committed_bytes: usize,
    pub reserved_bytes: usize,
    pub blocks: usize,
    /// Committed bytes that can no longer be handed out by the cursor.
    pub wasted_bytes: usize,
    pub free_list_blocks: usize,
    pub free_list_bytes: usize,
}

/// Protection of freshly committed pages of a non-interleaved heap.
pub(crate) fn commit_protection(kind: HeapKind, wx_enabled: bool) -> Protection {
    match (kind.is_executable(), wx_enabled) {
        (false, _) => Protection::ReadWrite,
        (true, true) => Protection::ReadExecute,
        (true, false) => Protection::ReadWriteExecute,
    }
}
