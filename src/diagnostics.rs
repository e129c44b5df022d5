//! Diagnostic counters - heap identities, instance counts, wasted bytes
//!
//! Nothing here is load-bearing for allocation. Heaps report lifecycle and
//! waste events to a [`HeapDiagnostics`] sink: the one passed at construction
//! if any, otherwise the process-wide sink. The process-wide sink is chosen
//! once (by [`install`] or, failing that, on first use) and never torn down.

use crate::config::HeapKind;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

static DEFAULT_COUNTERS: AtomicCounters = AtomicCounters::new();

static INSTALLED: OnceCell<&'static dyn HeapDiagnostics> = OnceCell::new();

/// Process-unique identity of a heap instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(u64);

impl HeapId {
    pub fn next() -> Self {
        Self(NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap#{}", self.0)
    }
}

/// Receiver of heap diagnostic events. Every method defaults to a no-op.
pub trait HeapDiagnostics: Send + Sync {
    fn heap_created(&self, _id: HeapId, _kind: HeapKind) {}

    fn heap_destroyed(&self, _id: HeapId) {}

    /// `bytes` more pages were committed.
    fn bytes_committed(&self, _id: HeapId, _bytes: usize) {}

    /// `bytes` of committed memory became unreachable for allocation, e.g.
    /// the tail of a block abandoned for a fresh reservation.
    fn bytes_wasted(&self, _id: HeapId, _bytes: usize) {}
}

/// Lock-free counters, the default sink.
#[derive(Debug)]
pub struct AtomicCounters {
    heaps_created: AtomicUsize,
    live_heaps: AtomicUsize,
    committed_bytes: AtomicUsize,
    wasted_bytes: AtomicUsize,
}

/// Point-in-time copy of [`AtomicCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub heaps_created: usize,
    pub live_heaps: usize,
    pub committed_bytes: usize,
    pub wasted_bytes: usize,
}

impl AtomicCounters {
    pub const fn new() -> Self {
        Self {
            heaps_created: AtomicUsize::new(0),
            live_heaps: AtomicUsize::new(0),
            committed_bytes: AtomicUsize::new(0),
            wasted_bytes: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            heaps_created: self.heaps_created.load(Ordering::Relaxed),
            live_heaps: self.live_heaps.load(Ordering::Relaxed),
            committed_bytes: self.committed_bytes.load(Ordering::Relaxed),
            wasted_bytes: self.wasted_bytes.load(Ordering::Relaxed),
        }
    }
}

impl Default for AtomicCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapDiagnostics for AtomicCounters {
    fn heap_created(&self, _id: HeapId, _kind: HeapKind) {
        self.heaps_created.fetch_add(1, Ordering::Relaxed);
        self.live_heaps.fetch_add(1, Ordering::Relaxed);
    }

    fn heap_destroyed(&self, _id: HeapId) {
        self.live_heaps.fetch_sub(1, Ordering::Relaxed);
    }

    fn bytes_committed(&self, _id: HeapId, bytes: usize) {
        self.committed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn bytes_wasted(&self, _id: HeapId, bytes: usize) {
        self.wasted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Install the process-wide sink. Returns false if one is already in place
/// (including the default, once any heap has been created).
pub fn install(sink: &'static dyn HeapDiagnostics) -> bool {
    INSTALLED.set(sink).is_ok()
}

/// The process-wide sink.
pub fn global() -> &'static dyn HeapDiagnostics {
    *INSTALLED.get_or_init(|| &DEFAULT_COUNTERS as &'static dyn HeapDiagnostics)
}

/// The built-in counters, whether or not they are the installed sink.
pub fn default_counters() -> &'static AtomicCounters {
    &DEFAULT_COUNTERS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_ids_are_unique() {
        let a = HeapId::next();
        let b = HeapId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn counters_track_events() {
        let counters = AtomicCounters::new();
        let id = HeapId::next();

        counters.heap_created(id, HeapKind::Data);
        counters.bytes_committed(id, 4096);
        counters.bytes_wasted(id, 24);

        let snap = counters.snapshot();
        assert_eq!(snap.heaps_created, 1);
        assert_eq!(snap.live_heaps, 1);
        assert_eq!(snap.committed_bytes, 4096);
        assert_eq!(snap.wasted_bytes, 24);

        counters.heap_destroyed(id);
        assert_eq!(counters.snapshot().live_heaps, 0);
    }
}
