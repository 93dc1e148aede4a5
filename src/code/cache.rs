/// Flush data cache and invalidate instruction cache for a code range.
///
/// On ARM64 the data and instruction caches are not coherent: after writing
/// new instructions through the data cache the stale icache lines must be
/// discarded before the CPU may fetch from the range again.
///
/// # Safety
/// `addr` must point to at least `size` bytes of memory.
#[inline]
pub unsafe fn invalidate_icache(addr: *mut u8, size: usize) {
    #[cfg(all(
        target_arch = "aarch64",
        any(target_os = "linux", target_os = "android")
    ))]
    {
        extern "C" {
            fn __clear_cache(beg: *mut libc::c_void, end: *mut libc::c_void);
        }
        __clear_cache(addr as *mut libc::c_void, addr.add(size) as *mut libc::c_void);
    }

    // Other architectures (notably x86_64 hosts running the test-suite)
    // have coherent instruction fetch; a compiler fence is enough.
    #[cfg(not(all(
        target_arch = "aarch64",
        any(target_os = "linux", target_os = "android")
    )))]
    {
        let _ = (addr, size);
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}
