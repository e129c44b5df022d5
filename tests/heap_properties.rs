//! Property-based tests for the loader heaps.
//!
//! Random allocate/backout sequences run against the mock page provider,
//! which also checks every protection change for W^X violations.

use loader_heap::{
    AllocTracker, HeapError, HeapOptions, InterleavedConfig, LoaderHeap, MockPages, Protection,
    StubPageConfig, UnlockedInterleavedLoaderHeap, UnlockedLoaderHeap,
};
use proptest::prelude::*;
use proptest::sample::Index;
use std::ptr::NonNull;
use std::sync::Arc;

const PAGE: usize = 4096;

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Aligned(usize, u32),
    Backout(Index),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1usize..512).prop_map(Op::Alloc),
        1 => (1usize..20_000).prop_map(Op::Alloc),
        2 => (1usize..256, 0u32..10).prop_map(|(size, shift)| Op::Aligned(size, shift)),
        3 => any::<Index>().prop_map(Op::Backout),
    ]
}

/// A live allocation as the caller sees it plus what backout needs.
#[derive(Debug, Clone, Copy)]
struct Live {
    ptr: usize,
    size: usize,
    extra: usize,
    tag: u8,
}

fn heap_on(pages: &Arc<MockPages>) -> UnlockedLoaderHeap {
    UnlockedLoaderHeap::new(HeapOptions::data().provider(pages.clone())).unwrap()
}

fn stub_heap(pages: &Arc<MockPages>, stub_size: usize) -> UnlockedInterleavedLoaderHeap {
    let options = HeapOptions::data()
        .provider(pages.clone())
        .stub_pages(StubPageConfig::default().code_page_size(16 * 1024));
    UnlockedInterleavedLoaderHeap::new(InterleavedConfig::new(stub_size, vec![0xCC; 4]), options).unwrap()
}

fn fill(ptr: usize, len: usize, byte: u8) {
    unsafe { std::ptr::write_bytes(ptr as *mut u8, byte, len) };
}

fn holds(ptr: usize, len: usize, byte: u8) -> bool {
    unsafe { std::slice::from_raw_parts(ptr as *const u8, len) }
        .iter()
        .all(|&b| b == byte)
}

fn overlaps(a: &Live, b: &Live) -> bool {
    let (a_start, a_end) = (a.ptr - a.extra, a.ptr + a.size);
    let (b_start, b_end) = (b.ptr - b.extra, b.ptr + b.size);
    a_start < b_end && b_start < a_end
}

proptest! {
    /// Outstanding allocations never overlap and keep their contents
    #[test]
    fn live_allocations_never_overlap(ops in prop::collection::vec(op(), 1..200)) {
        let pages = Arc::new(MockPages::new());
        let mut heap = heap_on(&pages);
        let mut live: Vec<Live> = Vec::new();
        let mut next_tag = 1u8;

        for op in ops {
            let new = match op {
                Op::Alloc(size) => {
                    let ptr = heap.alloc_mem(size).unwrap();
                    Live { ptr: ptr.as_ptr() as usize, size, extra: 0, tag: next_tag }
                }
                Op::Aligned(size, shift) => {
                    let (ptr, extra) = heap.alloc_aligned_mem(size, 1 << shift).unwrap();
                    Live { ptr: ptr.as_ptr() as usize, size, extra, tag: next_tag }
                }
                Op::Backout(index) => {
                    if live.is_empty() {
                        continue;
                    }
                    let gone = live.swap_remove(index.index(live.len()));
                    let raw = NonNull::new((gone.ptr - gone.extra) as *mut u8);
                    heap.backout_mem(raw, gone.size + gone.extra);
                    continue;
                }
            };

            for other in &live {
                prop_assert!(!overlaps(&new, other), "{:?} overlaps {:?}", new, other);
            }
            fill(new.ptr, new.size, new.tag);
            live.push(new);
            next_tag = next_tag.wrapping_add(1).max(1);
        }

        for alloc in &live {
            prop_assert!(holds(alloc.ptr, alloc.size, alloc.tag), "{:?} was overwritten", alloc);
        }
    }

    /// Allocate, back out, allocate again lands on the same address
    #[test]
    fn immediate_backout_is_idempotent(
        prefix in prop::collection::vec(1usize..2048, 0..20),
        size in 1usize..100_000,
    ) {
        let pages = Arc::new(MockPages::new());
        let mut heap = heap_on(&pages);
        for n in prefix {
            heap.alloc_mem(n).unwrap();
        }

        let first = heap.alloc_mem(size).unwrap();
        heap.backout_mem(Some(first), size);
        let second = heap.alloc_mem(size).unwrap();
        prop_assert_eq!(first, second);
    }

    /// Aligned pointers are aligned and backing them out spares the neighbours
    #[test]
    fn aligned_backout_spares_neighbours(
        before in 1usize..300,
        size in 1usize..1024,
        shift in 0u32..13,
        after in 1usize..300,
    ) {
        let alignment = 1usize << shift;
        let pages = Arc::new(MockPages::new());
        let mut heap = heap_on(&pages);

        let left = heap.alloc_mem(before).unwrap().as_ptr() as usize;
        fill(left, before, 0x11);
        let (ptr, extra) = heap.alloc_aligned_mem(size, alignment).unwrap();
        let ptr = ptr.as_ptr() as usize;
        prop_assert_eq!(ptr % alignment, 0);
        prop_assert!(extra < alignment);
        fill(ptr, size, 0x22);
        let right = heap.alloc_mem(after).unwrap().as_ptr() as usize;
        fill(right, after, 0x33);

        heap.backout_mem(NonNull::new((ptr - extra) as *mut u8), size + extra);

        prop_assert!(holds(left, before, 0x11));
        prop_assert!(holds(right, after, 0x33));
    }

    /// Committed memory only ever grows
    #[test]
    fn commit_is_monotonic(ops in prop::collection::vec(op(), 1..150)) {
        let pages = Arc::new(MockPages::new());
        let mut heap = heap_on(&pages);
        let mut live: Vec<Live> = Vec::new();
        let (mut size, mut blocks, mut end) = (0, 0, 0);

        for op in ops {
            match op {
                Op::Alloc(n) => {
                    let ptr = heap.alloc_mem(n).unwrap().as_ptr() as usize;
                    live.push(Live { ptr, size: n, extra: 0, tag: 0 });
                }
                Op::Aligned(n, shift) => {
                    let (ptr, extra) = heap.alloc_aligned_mem(n, 1 << shift).unwrap();
                    live.push(Live { ptr: ptr.as_ptr() as usize, size: n, extra, tag: 0 });
                }
                Op::Backout(index) if !live.is_empty() => {
                    let gone = live.swap_remove(index.index(live.len()));
                    heap.backout_mem(NonNull::new((gone.ptr - gone.extra) as *mut u8), gone.size + gone.extra);
                }
                Op::Backout(_) => {}
            }

            let stats = heap.stats();
            prop_assert!(heap.size() >= size);
            prop_assert_eq!(heap.size(), pages.committed_bytes());
            if stats.blocks == blocks {
                prop_assert!(heap.committed_end() >= end);
            }
            prop_assert!(heap.alloc_ptr() <= heap.committed_end());
            size = heap.size();
            blocks = stats.blocks;
            end = heap.committed_end();
        }
    }

    /// Every stub, fresh or recycled, has its data exactly one stride away
    #[test]
    fn stub_stride_holds(
        stub_shift in 3u32..12,
        ops in prop::collection::vec(prop_oneof![3 => Just(None), 1 => any::<Index>().prop_map(Some)], 1..600),
    ) {
        let stub_size = 1usize << stub_shift;
        let pages = Arc::new(MockPages::new());
        let mut heap = stub_heap(&pages, stub_size);
        let mut live = Vec::new();

        for op in ops {
            match op {
                None => {
                    let slot = heap.alloc_stub().unwrap();
                    prop_assert_eq!(slot.data_addr() - slot.code_addr(), heap.stride());
                    prop_assert!(!live.iter().any(|s: &loader_heap::StubSlot| s.code_addr() == slot.code_addr()));
                    live.push(slot);
                }
                Some(index) if !live.is_empty() => {
                    let slot = live.swap_remove(index.index(live.len()));
                    heap.backout_stub(Some(slot.as_ptr()));
                }
                Some(_) => {}
            }
        }
    }

    /// No page of a stub heap is ever writable and executable at once
    #[test]
    fn stub_pages_respect_wx(stubs in 1usize..3000) {
        let pages = Arc::new(MockPages::new());
        let mut heap = stub_heap(&pages, 64);

        for _ in 0..stubs {
            heap.alloc_stub().unwrap();
        }
        for change in pages.history() {
            prop_assert_ne!(change.to, Protection::ReadWriteExecute);
        }
        let mut code_pages = 0;
        heap.enum_page_regions(|base, size| {
            let mut page = base;
            while page < base + size {
                match pages.protection_at(page) {
                    Some(Protection::ReadExecute) => code_pages += 1,
                    Some(Protection::ReadWrite) | None => {}
                    Some(other) => panic!("page {page:#x} is {other:?}"),
                }
                page += PAGE;
            }
            true
        });
        prop_assert!(code_pages > 0);
    }

    /// The allocation that crosses the commit budget fails; earlier ones stay usable
    #[test]
    fn exhaustion_fails_cleanly(budget_pages in 1usize..8, sizes in prop::collection::vec(1usize..3000, 1..100)) {
        let budget = budget_pages * PAGE;
        let throwing = Arc::new(MockPages::new().fail_after(budget));
        let quiet = Arc::new(MockPages::new().fail_after(budget));
        let mut heap = heap_on(&throwing);
        let mut no_throw = heap_on(&quiet);
        let mut live = Vec::new();

        for (i, &size) in sizes.iter().enumerate() {
            let tag = (i % 251) as u8 + 1;
            match heap.alloc_mem(size) {
                Ok(ptr) => {
                    let other = no_throw.alloc_mem_no_throw(size);
                    prop_assert!(other.is_some());
                    fill(ptr.as_ptr() as usize, size, tag);
                    live.push((ptr.as_ptr() as usize, size, tag));
                }
                Err(err) => {
                    prop_assert!(
                        matches!(err, HeapError::OutOfMemory { .. }),
                        "expected out of memory, got {:?}",
                        err
                    );
                    prop_assert!(no_throw.alloc_mem_no_throw(size).is_none());
                    break;
                }
            }
            prop_assert!(heap.size() <= budget);
        }

        for (ptr, size, tag) in live {
            prop_assert!(holds(ptr, size, tag));
        }
    }
}

/// Three tracked allocations where the third fails.
fn build_three(heap: &LoaderHeap, sizes: [usize; 3]) -> Result<(), HeapError> {
    let mut tracker = AllocTracker::new();
    for size in sizes {
        tracker.track(heap.alloc_mem(size)?)?;
    }
    tracker.release_all();
    Ok(())
}

#[test]
fn tracker_unwinds_exactly_the_landed_allocations() {
    let pages = Arc::new(MockPages::new().fail_after(PAGE));
    let heap = LoaderHeap::new(HeapOptions::data().provider(pages)).unwrap();

    let err = build_three(&heap, [64, 128, 2 * PAGE]).unwrap_err();
    assert!(matches!(err, HeapError::OutOfMemory { .. }));

    let start = heap.committed_regions()[0].0;
    assert_eq!(heap.with_unlocked(|h| h.alloc_ptr()), start);
    assert!(heap.with_unlocked(|h| h.free_list().is_empty()));
}

#[test]
fn tracker_no_throw_failure_unwinds_too() {
    let pages = Arc::new(MockPages::new().fail_after(PAGE));
    let heap = LoaderHeap::new(HeapOptions::data().provider(pages)).unwrap();
    {
        let mut tracker = AllocTracker::new();
        assert!(tracker.track_no_throw(heap.alloc_mem_no_throw(64)).is_some());
        assert!(tracker.track_no_throw(heap.alloc_mem_no_throw(128)).is_some());
        assert!(tracker.track_no_throw(heap.alloc_mem_no_throw(2 * PAGE)).is_none());
        assert_eq!(tracker.len(), 2);
    }
    let start = heap.committed_regions()[0].0;
    assert_eq!(heap.with_unlocked(|h| h.alloc_ptr()), start);
}

#[test]
fn released_tracker_backs_out_nothing() {
    let pages = Arc::new(MockPages::new());
    let heap = LoaderHeap::new(HeapOptions::data().provider(pages)).unwrap();

    build_three(&heap, [64, 128, 256]).unwrap();
    let cursor = heap.with_unlocked(|h| h.alloc_ptr());
    let start = heap.committed_regions()[0].0;
    assert!(cursor > start);
    assert!(heap.with_unlocked(|h| h.free_list().is_empty()));
}
