//! divert: in-place function hooking for AArch64 on POSIX/Android.
//!
//! Given the address of an already-loaded function, `divert` rewrites its
//! prologue to branch into a user hook and (optionally) builds a trampoline
//! that replays the overwritten instructions with PC-relative forms fixed
//! up, so the hook can still call the original behavior. Multiple hooks can
//! be stacked on one target with name/namespace priority ordering, and
//! individual hooks can be uninstalled.
//!
//! All installation APIs must be externally serialized against each other
//! and against threads that may be executing a hooked function: writes to
//! executable pages are not atomic with respect to remote execution.

pub mod arch;
pub mod capi;
pub mod code;
pub mod errors;
pub mod hook;
pub mod types;

// Re-exports for convenience (flattened imports)
pub use errors::{InstallError, TargetMismatch};
pub use hook::{
    fixup_pointer_for, hook_count, install, metadata_for, no_orig_abort, original_insts_for,
    reinstall, uninstall, TargetMetadata,
};
pub use types::{
    CallingConvention, HookHandle, HookInfo, InstallMetadata, NameFilter, NameInfo, Priority,
    TypeInfo,
};

/// Process-global lock for tests that patch executable code.
///
/// All tests that install hooks or patch live pages must hold this lock to
/// prevent SIGSEGV from concurrent patching of the same page. Also wires
/// up logging so `RUST_LOG=debug` exposes the per-fixup trace.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    let _ = env_logger::builder().is_test(true).try_init();
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
