//! Page provider tests - OS provider smoke tests and mock bookkeeping

use super::*;

// ===== Alignment Helpers =====

#[test]
fn align_helpers() {
    assert_eq!(align_up(0, 8), 0);
    assert_eq!(align_up(1, 8), 8);
    assert_eq!(align_up(4096, 4096), 4096);
    assert_eq!(checked_align_up(4097, 4096), Some(8192));
    assert_eq!(checked_align_up(usize::MAX - 2, 8), None);
}

#[test]
fn protection_flags() {
    assert!(Protection::ReadWrite.is_writable());
    assert!(!Protection::ReadWrite.is_executable());
    assert!(Protection::ReadExecute.is_executable());
    assert!(!Protection::ReadExecute.is_writable());
    assert!(Protection::ReadWriteExecute.is_writable() && Protection::ReadWriteExecute.is_executable());
}

// ===== OS Provider =====

#[test]
fn os_pages_reserve_commit_release() {
    let pages = OsPages::new();
    let page = pages.page_size();
    assert!(page.is_power_of_two());

    let base = pages.reserve(4 * page).expect("reserve");
    unsafe {
        pages.commit(base, page, Protection::ReadWrite).expect("commit");
        let bytes = core::slice::from_raw_parts_mut(base.as_ptr(), page);
        assert!(bytes.iter().all(|&b| b == 0), "fresh pages must be zero-filled");
        bytes[0] = 0x5A;
        assert_eq!(*base.as_ptr(), 0x5A);
        pages.protect(base, page, Protection::ReadOnly).expect("protect");
        pages.release(base, 4 * page);
    }
}

#[test]
fn os_pages_writable_alias_round_trip() {
    let pages = OsPages::new();
    let page = pages.page_size();
    let base = pages.reserve(page).expect("reserve");
    unsafe {
        pages.commit(base, page, Protection::ReadExecute).expect("commit");
        let exec = ExecutableView::from_raw_parts(base, 16);
        {
            let mut writer = ExecutableWriter::new(&pages, exec).expect("alias");
            writer.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        }
        assert_eq!(core::slice::from_raw_parts(exec.as_ptr(), 4), &[1, 2, 3, 4]);
        pages.release(base, page);
    }
}

#[test]
fn os_pages_nested_writers_share_a_page() {
    let pages = OsPages::new();
    let page = pages.page_size();
    let base = pages.reserve(page).expect("reserve");
    unsafe {
        pages.commit(base, page, Protection::ReadExecute).expect("commit");
        let outer_view = ExecutableView::from_raw_parts(base, 16);
        let inner_view = ExecutableView::from_raw_parts(NonNull::new_unchecked(base.as_ptr().add(64)), 16);

        let mut outer = ExecutableWriter::new(&pages, outer_view).expect("outer alias");
        outer.as_mut_slice()[0] = 1;
        {
            let mut inner = ExecutableWriter::new(&pages, inner_view).expect("inner alias");
            inner.as_mut_slice()[0] = 2;
        }
        // The page must still be writable through the outer alias
        outer.as_mut_slice()[1] = 3;
        drop(outer);

        assert_eq!(core::slice::from_raw_parts(base.as_ptr(), 2), &[1, 3]);
        assert_eq!(*base.as_ptr().add(64), 2);
        pages.release(base, page);
    }
}

// ===== Mock Provider =====

#[test]
fn mock_commit_budget_is_enforced() {
    let pages = MockPages::new().fail_after(8192);
    let base = pages.reserve(64 * 1024).expect("reserve");
    unsafe {
        pages.commit(base, 8192, Protection::ReadWrite).expect("within budget");
        // Recommitting already committed pages costs nothing
        pages.commit(base, 4096, Protection::ReadWrite).expect("recommit");

        let next = NonNull::new_unchecked(base.as_ptr().add(8192));
        let err = pages.commit(next, 4096, Protection::ReadWrite).unwrap_err();
        assert!(matches!(err, VmError::Exhausted { remaining: 0, .. }));
    }
    assert_eq!(pages.committed_bytes(), 8192);
}

#[test]
fn mock_records_transitions() {
    let pages = MockPages::new();
    let base = pages.reserve(4096).expect("reserve");
    let addr = base.as_ptr() as usize;
    unsafe {
        pages.commit(base, 4096, Protection::ReadWrite).unwrap();
        pages.protect(base, 4096, Protection::ReadExecute).unwrap();
    }
    assert_eq!(pages.protection_at(addr + 100), Some(Protection::ReadExecute));
    assert_eq!(pages.history_of(addr), vec![Protection::ReadWrite, Protection::ReadExecute]);
    assert_eq!(pages.history()[0].from, None);
    assert_eq!(pages.history()[1].from, Some(Protection::ReadWrite));
}

#[test]
#[should_panic(expected = "W^X violation")]
fn mock_rejects_writable_executable_pages() {
    let pages = MockPages::new();
    let base = pages.reserve(4096).expect("reserve");
    unsafe {
        let _ = pages.commit(base, 4096, Protection::ReadWriteExecute);
    }
}

#[test]
fn mock_release_returns_committed_bytes() {
    let pages = MockPages::new();
    let base = pages.reserve(16384).expect("reserve");
    unsafe {
        pages.commit(base, 8192, Protection::ReadWrite).unwrap();
        assert_eq!(pages.committed_bytes(), 8192);
        assert!(pages.is_reserved(base.as_ptr() as usize + 12000));
        pages.release(base, 16384);
    }
    assert_eq!(pages.committed_bytes(), 0);
    assert_eq!(pages.reserved_bytes(), 0);
}

#[test]
fn mock_reserve_limit() {
    let pages = MockPages::new().fail_reserve_after(64 * 1024);
    let _first = pages.reserve(64 * 1024).expect("first");
    assert!(pages.reserve(4096).is_err());
    assert_eq!(pages.reservation_count(), 1);
}

#[test]
fn mock_reseals_after_last_writer() {
    let pages = MockPages::new();
    let base = pages.reserve(8192).expect("reserve");
    let addr = base.as_ptr() as usize;
    unsafe {
        pages.commit(base, 8192, Protection::ReadExecute).unwrap();
        let first = ExecutableView::from_raw_parts(base, 32);
        // Spans both pages
        let second = ExecutableView::from_raw_parts(NonNull::new_unchecked(base.as_ptr().add(4000)), 200);

        let outer = ExecutableWriter::new(&pages, first).unwrap();
        let inner = ExecutableWriter::new(&pages, second).unwrap();
        assert_eq!(pages.aliased_pages(), 2);
        drop(inner);

        assert_eq!(pages.protection_at(addr), Some(Protection::ReadWrite));
        assert_eq!(pages.protection_at(addr + 4096), Some(Protection::ReadExecute));
        assert_eq!(pages.aliased_pages(), 1);

        drop(outer);
        assert_eq!(pages.protection_at(addr), Some(Protection::ReadExecute));
        assert_eq!(pages.aliased_pages(), 0);
    }
    // First page flipped once and resealed once despite two writers
    assert_eq!(
        pages.history_of(addr),
        vec![Protection::ReadExecute, Protection::ReadWrite, Protection::ReadExecute]
    );
}
