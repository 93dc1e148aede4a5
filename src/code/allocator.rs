use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::{Mutex, OnceLock};

use crate::code::fatal;

/// Pages are handed out in fixed 4 KiB units; allocations never span two.
pub const PAGE_SIZE: usize = 4096;

/// mprotect-style protection bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Protection(i32);

impl Protection {
    pub const NONE: Protection = Protection(libc::PROT_NONE);
    pub const READ: Protection = Protection(libc::PROT_READ);
    pub const WRITE: Protection = Protection(libc::PROT_WRITE);
    pub const EXECUTE: Protection = Protection(libc::PROT_EXEC);

    pub fn as_raw(self) -> i32 {
        self.0
    }

    pub fn contains(self, other: Protection) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Protection {
    type Output = Protection;
    fn bitor(self, rhs: Protection) -> Protection {
        Protection(self.0 | rhs.0)
    }
}

impl BitOrAssign for Protection {
    fn bitor_assign(&mut self, rhs: Protection) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Protection {
    type Output = Protection;
    fn bitand(self, rhs: Protection) -> Protection {
        Protection(self.0 & rhs.0)
    }
}

/// A span of instruction words together with its baseline page protection.
///
/// The span always lies within a single page mapping; `protect()` reapplies
/// the recorded protection to the page range backing it.
#[derive(Debug, Clone, Copy)]
pub struct CodeSpan {
    ptr: *mut u32,
    len: usize,
    pub protection: Protection,
}

unsafe impl Send for CodeSpan {}

impl CodeSpan {
    /// # Safety
    /// `ptr` must be valid for `len` aligned instruction words for the
    /// lifetime of the span, and the protection must describe the actual
    /// baseline mapping.
    pub unsafe fn new(ptr: *mut u32, len: usize, protection: Protection) -> Self {
        Self {
            ptr,
            len,
            protection,
        }
    }

    pub fn as_ptr(&self) -> *mut u32 {
        self.ptr
    }

    /// Number of instruction words.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    /// Address of the word at `index` (may be one past the end).
    pub fn addr_of(&self, index: usize) -> usize {
        debug_assert!(index <= self.len);
        self.ptr as usize + index * 4
    }

    /// The first `len` words of this span.
    pub fn subspan(&self, len: usize) -> CodeSpan {
        debug_assert!(len <= self.len);
        CodeSpan {
            ptr: self.ptr,
            len,
            protection: self.protection,
        }
    }

    /// Reapply the recorded protection to the page range backing the span.
    /// Failure is fatal: a span left in the wrong state is unusable either
    /// for writing or for execution.
    pub fn protect(&self) {
        if self.is_empty() {
            return;
        }
        let page_mask = !(PAGE_SIZE - 1);
        let aligned = self.addr() & page_mask;
        let page_offset = self.addr() - aligned;
        let len_bytes = self.len * 4 + page_offset;
        let rc = unsafe { libc::mprotect(aligned as *mut libc::c_void, len_bytes, self.protection.as_raw()) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            fatal!(
                "failed to protect {:#x} (page {:#x}, {} bytes) as {:#x}: {err}",
                self.addr(),
                aligned,
                len_bytes,
                self.protection.as_raw()
            );
        }
    }
}

struct Page {
    ptr: usize,
    used_size: usize,
    protection: Protection,
}

fn pages() -> &'static Mutex<Vec<Page>> {
    static PAGES: OnceLock<Mutex<Vec<Page>>> = OnceLock::new();
    PAGES.get_or_init(|| Mutex::new(Vec::new()))
}

fn align_up(offset: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

/// Allocate `size` bytes of code memory aligned to `alignment`, with the
/// given protection applied for the lifetime of the process.
///
/// Allocations are bump-carved out of shared pages bucketed by protection,
/// so spans with equal protection may share a page. Pages are never freed.
/// `size` must be at most one page and `alignment` a power of two below the
/// page size; failure to obtain or protect memory is fatal.
pub fn allocate(alignment: usize, size: usize, protection: Protection) -> CodeSpan {
    assert!(size <= PAGE_SIZE);
    assert!(alignment.is_power_of_two() && alignment < PAGE_SIZE);

    let mut pages = pages().lock().unwrap_or_else(|e| e.into_inner());

    // First fit: any page with the same protection and enough room after
    // aligning the bump pointer.
    for page in pages.iter_mut() {
        if page.protection != protection {
            continue;
        }
        let start_offset = align_up(page.used_size, alignment);
        if PAGE_SIZE - start_offset >= size {
            page.used_size = start_offset + size;
            log::debug!(
                "code alloc: {size}B at {:#x}+{start_offset:#x} (shared page)",
                page.ptr
            );
            return unsafe {
                CodeSpan::new((page.ptr + start_offset) as *mut u32, size / 4, protection)
            };
        }
    }

    // No page matches; map a fresh one with the requested protection set
    // exactly once. Page-aligned anonymous memory straight from the kernel.
    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            PAGE_SIZE,
            protection.as_raw(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        let err = std::io::Error::last_os_error();
        fatal!("failed to map a code page ({size}B requested, prot {:#x}): {err}", protection.as_raw());
    }

    log::debug!("code alloc: {size}B at {:p} (new page, prot {:#x})", ptr, protection.as_raw());
    pages.push(Page {
        ptr: ptr as usize,
        used_size: size,
        protection,
    });
    unsafe { CodeSpan::new(ptr as *mut u32, size / 4, protection) }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW: Protection = Protection(libc::PROT_READ | libc::PROT_WRITE);

    #[test]
    fn allocations_share_pages_with_matching_protection() {
        // Read-only protection: no other test allocates from this bucket,
        // so the two spans must be carved from one page.
        let a = allocate(16, 64, Protection::READ);
        let b = allocate(16, 64, Protection::READ);
        let page_mask = !(PAGE_SIZE - 1);
        assert_eq!(a.addr() & page_mask, b.addr() & page_mask);
        assert!(b.addr() >= a.addr() + 64 || a.addr() >= b.addr() + 64);
    }

    #[test]
    fn allocations_honor_alignment() {
        // Force misaligned bump state, then request a large alignment.
        let _ = allocate(4, 20, RW);
        let aligned = allocate(256, 64, RW);
        assert_eq!(aligned.addr() % 256, 0);
    }

    #[test]
    fn differing_protection_gets_a_different_page() {
        let rw = allocate(16, 32, RW);
        let rx = allocate(16, 32, Protection::READ | Protection::EXECUTE);
        let page_mask = !(PAGE_SIZE - 1);
        assert_ne!(rw.addr() & page_mask, rx.addr() & page_mask);
    }

    #[test]
    fn span_is_writable_with_rw_protection() {
        let span = allocate(16, 32, RW);
        unsafe {
            span.as_ptr().write(0xD503201F); // nop
            assert_eq!(span.as_ptr().read(), 0xD503201F);
        }
        assert_eq!(span.len(), 8);
    }

    #[test]
    fn subspan_shares_the_base_address() {
        let span = allocate(16, 64, RW);
        let sub = span.subspan(4);
        assert_eq!(sub.addr(), span.addr());
        assert_eq!(sub.len(), 4);
        assert_eq!(sub.addr_of(4), span.addr() + 16);
    }
}
