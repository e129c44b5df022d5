//! Bump cursor - O(1) fast path
//!
//! Design: three addresses describe the current block. Allocation only
//! compares against end-of-committed; the slow path moves the boundaries.
//!
//! Invariant: `alloc_ptr <= committed_end <= reserved_end`.

/// Cursor state of the current block. All zero before the first reservation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    alloc_ptr: usize,
    committed_end: usize,
    reserved_end: usize,
}

impl Cursor {
    /// Empty cursor (requires a block before the first allocation)
    #[inline]
    pub const fn new() -> Self {
        Self {
            alloc_ptr: 0,
            committed_end: 0,
            reserved_end: 0,
        }
    }

    /// Fast path: bump pointer allocation of an already rounded size
    ///
    /// Returns None if the committed region is too small (caller handles
    /// the slow path).
    #[inline(always)]
    pub fn try_bump(&mut self, size: usize) -> Option<usize> {
        let ptr = self.alloc_ptr;
        let new_ptr = ptr.checked_add(size)?;

        if new_ptr <= self.committed_end && ptr != 0 {
            self.alloc_ptr = new_ptr;
            Some(ptr)
        } else {
            None
        }
    }

    /// Move the cursor back to `ptr`, which must lie below the cursor.
    #[inline]
    pub fn rewind(&mut self, ptr: usize) {
        debug_assert!(ptr <= self.alloc_ptr, "rewind past the cursor");
        self.alloc_ptr = ptr;
    }

    /// Move the cursor forward to `ptr`, which must lie within committed memory.
    #[inline]
    pub fn advance_to(&mut self, ptr: usize) {
        debug_assert!(ptr >= self.alloc_ptr, "advance behind the cursor");
        debug_assert!(ptr <= self.committed_end, "advance past committed memory");
        self.alloc_ptr = ptr;
    }

    /// Point the cursor at a new block.
    #[inline]
    pub fn reset(&mut self, start: usize, committed_end: usize, reserved_end: usize) {
        debug_assert!(start <= committed_end && committed_end <= reserved_end, "invalid block bounds");
        self.alloc_ptr = start;
        self.committed_end = committed_end;
        self.reserved_end = reserved_end;
    }

    /// Move end-of-committed forward within the reservation.
    #[inline]
    pub fn extend_committed(&mut self, committed_end: usize) {
        debug_assert!(committed_end >= self.committed_end, "commit never shrinks");
        debug_assert!(committed_end <= self.reserved_end, "commit past reservation");
        self.committed_end = committed_end;
    }

    #[inline]
    pub fn alloc_ptr(&self) -> usize {
        self.alloc_ptr
    }

    #[inline]
    pub fn committed_end(&self) -> usize {
        self.committed_end
    }

    #[inline]
    pub fn reserved_end(&self) -> usize {
        self.reserved_end
    }

    /// Bytes left before end-of-committed.
    #[inline]
    pub fn committed_remaining(&self) -> usize {
        self.committed_end - self.alloc_ptr
    }

    /// Bytes left before end-of-reserved.
    #[inline]
    pub fn reserved_remaining(&self) -> usize {
        self.reserved_end - self.alloc_ptr
    }

    /// Reserved but not yet committed bytes of the current block.
    #[inline]
    pub fn uncommitted(&self) -> usize {
        self.reserved_end - self.committed_end
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.reserved_end == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cursor_never_bumps() {
        let mut cursor = Cursor::new();
        assert!(cursor.is_empty());
        assert_eq!(cursor.try_bump(0), None);
        assert_eq!(cursor.try_bump(8), None);
    }

    #[test]
    fn bump_until_committed_end() {
        let mut cursor = Cursor::new();
        cursor.reset(0x1000, 0x1040, 0x2000);

        assert_eq!(cursor.try_bump(0x20), Some(0x1000));
        assert_eq!(cursor.try_bump(0x20), Some(0x1020));
        assert_eq!(cursor.try_bump(0x8), None);
        assert_eq!(cursor.committed_remaining(), 0);
        assert_eq!(cursor.reserved_remaining(), 0x2000 - 0x1040);

        cursor.extend_committed(0x2000);
        assert_eq!(cursor.try_bump(0x8), Some(0x1040));
        assert_eq!(cursor.uncommitted(), 0);
    }

    #[test]
    fn rewind_restores_cursor() {
        let mut cursor = Cursor::new();
        cursor.reset(0x1000, 0x2000, 0x2000);
        let a = cursor.try_bump(0x40).unwrap();
        cursor.rewind(a);
        assert_eq!(cursor.try_bump(0x40), Some(a));
    }

    #[test]
    fn bump_overflow_is_refused() {
        let mut cursor = Cursor::new();
        cursor.reset(0x1000, 0x2000, 0x2000);
        assert_eq!(cursor.try_bump(usize::MAX), None);
        assert_eq!(cursor.alloc_ptr(), 0x1000);
    }
}
