//! Loader heaps - arena allocation for memory that lives as long as its owner
//!
//! Memory handed out by these heaps is never freed one allocation at a time.
//! It is released together with the heap. The one exception is *backout*:
//! unwinding allocations made by a multi-step operation that failed part
//! way through.
//!
//! ```no_run
//! use loader_heap::{AllocTracker, HeapOptions, LoaderHeap};
//!
//! # fn main() -> loader_heap::Result<()> {
//! let heap = LoaderHeap::new(HeapOptions::data())?;
//!
//! let mut tracker = AllocTracker::new();
//! let header = tracker.track(heap.alloc_mem(64)?)?;
//! let table = tracker.track(heap.alloc_aligned_mem(256, 64)?)?;
//! // ... fill in header and table; an early return backs both out
//! tracker.release_all();
//! # let _ = (header, table);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod heap;
pub mod holder;
pub mod logging;
pub mod range;
pub mod vm;

// Re-export core types
pub use config::{HeapConfig, HeapKind, Settings, StubPageConfig};
pub use diagnostics::{AtomicCounters, HeapDiagnostics, HeapId};
pub use error::{ConfigError, HeapError, Result, VmError};
pub use heap::{
    alloc_total_size, ExplicitControlHeap, HeapOptions, HeapStats, InterleavedConfig,
    InterleavedLoaderHeap, LoaderHeap, StubSlot, UnlockedInterleavedLoaderHeap, UnlockedLoaderHeap,
};
pub use holder::{AllocHolder, AllocTracker, Backout, TaggedAlloc};
pub use range::RangeList;
pub use vm::{
    ExecutableView, ExecutableWriter, MockPages, OsPages, PageProvider, Protection, ReservedRegion,
    WritableView,
};
