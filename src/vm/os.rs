//! OS page provider - mmap/mprotect on unix, VirtualAlloc on windows
//!
//! Executable memory has a single mapping here. A writable alias is made by
//! flipping the covering pages to read-write and back to read-execute when
//! the last alias on a page is dropped, so a page is never writable and
//! executable at once. Code on an aliased page cannot run until then.

use super::{align_up, AliasCounts, ExecutableView, PageProvider, Protection, WritableView};
use crate::error::VmError;
use core::ptr::NonNull;
use once_cell::sync::Lazy;
use std::io;
use std::sync::Arc;

static SHARED: Lazy<Arc<OsPages>> = Lazy::new(|| Arc::new(OsPages::new()));

/// Page provider backed by the operating system.
#[derive(Debug)]
pub struct OsPages {
    page_size: usize,
    aliases: AliasCounts,
}

impl OsPages {
    pub fn new() -> Self {
        Self {
            page_size: sys::page_size(),
            aliases: AliasCounts::default(),
        }
    }

    /// Process-wide instance.
    pub fn shared() -> Arc<OsPages> {
        Arc::clone(&SHARED)
    }

    fn page_span(&self, addr: usize, len: usize) -> (usize, usize) {
        let start = addr & !(self.page_size - 1);
        let end = align_up(addr + len, self.page_size);
        (start, end - start)
    }
}

impl Default for OsPages {
    fn default() -> Self {
        Self::new()
    }
}

impl PageProvider for OsPages {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        unsafe { sys::reserve(size) }
            .ok_or_else(|| VmError::Reserve { size, source: io::Error::last_os_error() })
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) {
        sys::release(base, size);
    }

    unsafe fn commit(
        &self,
        addr: NonNull<u8>,
        size: usize,
        protection: Protection,
    ) -> Result<(), VmError> {
        if sys::commit(addr, size, protection) {
            Ok(())
        } else {
            Err(VmError::Commit {
                addr: addr.as_ptr() as usize,
                size,
                source: io::Error::last_os_error(),
            })
        }
    }

    unsafe fn protect(
        &self,
        addr: NonNull<u8>,
        size: usize,
        protection: Protection,
    ) -> Result<(), VmError> {
        if sys::protect(addr, size, protection) {
            Ok(())
        } else {
            Err(VmError::Protect {
                addr: addr.as_ptr() as usize,
                size,
                source: io::Error::last_os_error(),
            })
        }
    }

    unsafe fn map_writable(&self, exec: ExecutableView) -> Result<WritableView, VmError> {
        let (start, len) = self.page_span(exec.addr(), exec.len());
        self.aliases.acquire(
            start,
            len,
            self.page_size,
            |page| self.protect(page_ptr(page), self.page_size, Protection::ReadWrite),
            |page| self.seal(page),
        )?;
        Ok(WritableView::from_raw_parts(
            NonNull::new_unchecked(exec.as_ptr() as *mut u8),
            exec.len(),
        ))
    }

    unsafe fn unmap_writable(&self, exec: ExecutableView, _rw: WritableView) {
        let (start, len) = self.page_span(exec.addr(), exec.len());
        self.aliases.release(start, len, self.page_size, |page| self.seal(page));
    }
}

impl OsPages {
    fn seal(&self, page: usize) {
        // SAFETY: only pages of a live alias are sealed; they are committed.
        if let Err(err) = unsafe { self.protect(page_ptr(page), self.page_size, Protection::ReadExecute) } {
            // Leaving the page writable would break W^X for good.
            panic!("failed to restore execute protection: {err}");
        }
    }
}

#[inline]
fn page_ptr(page: usize) -> NonNull<u8> {
    // SAFETY: pages come from the span of a non-null executable view.
    unsafe { NonNull::new_unchecked(page as *mut u8) }
}

#[cfg(unix)]
mod sys {
    use super::Protection;
    use core::ptr::NonNull;

    fn prot_flags(protection: Protection) -> libc::c_int {
        match protection {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }

    pub(super) fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    }

    pub(super) unsafe fn reserve(size: usize) -> Option<NonNull<u8>> {
        let ptr = libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            None
        } else {
            NonNull::new(ptr as *mut u8)
        }
    }

    pub(super) unsafe fn release(base: NonNull<u8>, size: usize) {
        libc::munmap(base.as_ptr() as *mut libc::c_void, size);
    }

    pub(super) unsafe fn commit(addr: NonNull<u8>, size: usize, protection: Protection) -> bool {
        // Anonymous private pages are zero-filled on first touch.
        protect(addr, size, protection)
    }

    pub(super) unsafe fn protect(addr: NonNull<u8>, size: usize, protection: Protection) -> bool {
        libc::mprotect(addr.as_ptr() as *mut libc::c_void, size, prot_flags(protection)) == 0
    }
}

#[cfg(windows)]
mod sys {
    use super::Protection;
    use core::ptr::NonNull;
    use winapi::shared::minwindef::DWORD;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    use winapi::um::winnt::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
        PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
    };

    fn prot_flags(protection: Protection) -> DWORD {
        match protection {
            Protection::NoAccess => PAGE_NOACCESS,
            Protection::ReadOnly => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::ReadExecute => PAGE_EXECUTE_READ,
            Protection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
        }
    }

    pub(super) fn page_size() -> usize {
        unsafe {
            let mut info: SYSTEM_INFO = core::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }

    pub(super) unsafe fn reserve(size: usize) -> Option<NonNull<u8>> {
        let ptr = VirtualAlloc(core::ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS);
        NonNull::new(ptr as *mut u8)
    }

    pub(super) unsafe fn release(base: NonNull<u8>, _size: usize) {
        VirtualFree(base.as_ptr() as *mut _, 0, MEM_RELEASE);
    }

    pub(super) unsafe fn commit(addr: NonNull<u8>, size: usize, protection: Protection) -> bool {
        !VirtualAlloc(addr.as_ptr() as *mut _, size, MEM_COMMIT, prot_flags(protection)).is_null()
    }

    pub(super) unsafe fn protect(addr: NonNull<u8>, size: usize, protection: Protection) -> bool {
        let mut old: DWORD = 0;
        VirtualProtect(addr.as_ptr() as *mut _, size, prot_flags(protection), &mut old) != 0
    }
}
