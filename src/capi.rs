//! Stable C ABI, opaque-handle style.
//!
//! Construction helpers allocate on the heap and transfer ownership to the
//! next call that consumes them; exactly one ABI call consumes any given
//! handle. Install results carry either a hook handle (consumed by
//! `divert_uninstall_hook`) or error data (consumed by
//! `divert_format_error`).

use core::ffi::{c_char, c_void};
use std::ffi::{CStr, CString};

use crate::errors::{InstallError, TargetMismatch};
use crate::hook;
use crate::types::{
    CallingConvention, HookHandle, HookInfo, InstallMetadata, NameFilter, NameInfo, Priority,
    TypeInfo,
};

/// Installation result codes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivertInstallStatus {
    Ok = 0,
    TargetNull,
    BadPriorities,
    MismatchCallingConvention,
    MismatchMidpoint,
    TooSmall,
    MismatchReturn,
    MismatchParam,
    MismatchParamCount,
}

/// Calling conventions at the C surface.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivertCallingConvention {
    Cdecl = 0,
    Fastcall,
    Thiscall,
}

impl From<DivertCallingConvention> for CallingConvention {
    fn from(value: DivertCallingConvention) -> Self {
        match value {
            DivertCallingConvention::Cdecl => CallingConvention::Cdecl,
            DivertCallingConvention::Fastcall => CallingConvention::Fastcall,
            DivertCallingConvention::Thiscall => CallingConvention::Thiscall,
        }
    }
}

/// Opaque wrapper around a hook name.
pub struct DivertNameInfo {
    inner: NameInfo,
}

/// Opaque wrapper around priority constraints.
pub struct DivertPriority {
    inner: Priority,
}

/// Opaque wrapper around installation metadata.
pub struct DivertInstallMetadata {
    inner: InstallMetadata,
}

/// Opaque wrapper around a type descriptor.
pub struct DivertTypeInfo {
    inner: TypeInfo,
}

/// Opaque wrapper around an installed-hook handle.
pub struct DivertHookHandle {
    inner: HookHandle,
}

/// Opaque wrapper around install error data.
pub struct DivertErrorData {
    inner: InstallError,
}

#[repr(C)]
pub union DivertInstallValue {
    /// Valid when the status is `Ok`; consumed by `divert_uninstall_hook`.
    pub handle: *mut DivertHookHandle,
    /// Valid otherwise; consumed by `divert_format_error`.
    pub error: *mut DivertErrorData,
}

#[repr(C)]
pub struct DivertInstallResult {
    pub result: DivertInstallStatus,
    pub value: DivertInstallValue,
}

#[repr(C)]
pub union DivertReinstallValue {
    pub any_hooks_reinstalled: bool,
    pub error: *mut DivertErrorData,
}

#[repr(C)]
pub struct DivertReinstallResult {
    pub success: bool,
    pub value: DivertReinstallValue,
}

#[repr(C)]
pub union DivertUninstallValue {
    pub any_hooks_remain: bool,
    pub remap_failure: bool,
}

#[repr(C)]
pub struct DivertUninstallResult {
    pub success: bool,
    pub value: DivertUninstallValue,
}

/// One hook entry returned by the enumeration API. The `name` and
/// `namespace` strings are allocated by the library; free them with
/// `divert_free_hooks_array`. Empty fields are returned as null.
#[repr(C)]
pub struct DivertHookInfo {
    pub hook_ptr: *mut c_void,
    pub orig_ptr: *mut c_void,
    pub name: *mut c_char,
    pub namespace: *mut c_char,
}

/// Result of `divert_orig_for`. When `addr` is not the start of a hooked
/// region, `hook_size` is 0 and `original_instructions` equals `addr`.
#[repr(C)]
pub struct DivertOriginalInstructionsResult {
    /// Size of the hook at this address, in instructions.
    pub hook_size: usize,
    /// Borrowed pointer, readable for `hook_size` words while at least one
    /// hook remains installed there and no reinstall takes place.
    pub original_instructions: *const u32,
}

unsafe fn name_from_c(name: *const c_char) -> String {
    if name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(name).to_string_lossy().into_owned()
    }
}

fn install_result(result: Result<HookHandle, InstallError>) -> DivertInstallResult {
    match result {
        Ok(handle) => DivertInstallResult {
            result: DivertInstallStatus::Ok,
            value: DivertInstallValue {
                handle: Box::into_raw(Box::new(DivertHookHandle { inner: handle })),
            },
        },
        Err(error) => {
            let status = match &error {
                InstallError::TargetIsNull { .. } => DivertInstallStatus::TargetNull,
                InstallError::TargetTooSmall { .. } => DivertInstallStatus::TooSmall,
                InstallError::TargetBadPriorities { .. } => DivertInstallStatus::BadPriorities,
                InstallError::TargetMismatch(mismatch) => match mismatch {
                    TargetMismatch::CallingConvention { .. } => {
                        DivertInstallStatus::MismatchCallingConvention
                    }
                    TargetMismatch::Midpoint { .. } => DivertInstallStatus::MismatchMidpoint,
                    TargetMismatch::Return { .. } => DivertInstallStatus::MismatchReturn,
                    TargetMismatch::Param { .. } => DivertInstallStatus::MismatchParam,
                    TargetMismatch::ParamCount { .. } => DivertInstallStatus::MismatchParamCount,
                },
            };
            DivertInstallResult {
                result: status,
                value: DivertInstallValue {
                    error: Box::into_raw(Box::new(DivertErrorData { inner: error })),
                },
            }
        }
    }
}

/// Create a name handle from a UTF-8 C string (null allowed, means empty).
#[no_mangle]
pub unsafe extern "C" fn divert_make_name(name: *const c_char) -> *mut DivertNameInfo {
    Box::into_raw(Box::new(DivertNameInfo {
        inner: NameInfo::new(name_from_c(name)),
    }))
}

/// Create a namespaced name handle.
#[no_mangle]
pub unsafe extern "C" fn divert_make_name_namespaced(
    name: *const c_char,
    namespace: *const c_char,
) -> *mut DivertNameInfo {
    Box::into_raw(Box::new(DivertNameInfo {
        inner: NameInfo::namespaced(name_from_c(name), name_from_c(namespace)),
    }))
}

/// Create priority constraints. The name arrays are CONSUMED: every
/// `DivertNameInfo` they point at is freed by this call.
///
/// `is_final` pins the hook to the chain tail and takes precedence over
/// the other constraints.
#[no_mangle]
pub unsafe extern "C" fn divert_make_priority(
    before_names: *mut *mut DivertNameInfo,
    num_befores: usize,
    after_names: *mut *mut DivertNameInfo,
    num_afters: usize,
    is_final: bool,
) -> *mut DivertPriority {
    let consume = |names: *mut *mut DivertNameInfo, count: usize| -> Vec<NameFilter> {
        if names.is_null() {
            return Vec::new();
        }
        (0..count)
            .filter_map(|i| {
                let raw = names.add(i).read();
                if raw.is_null() {
                    return None;
                }
                let info = Box::from_raw(raw);
                Some(NameFilter {
                    name: info.inner.name,
                    namespace: info.inner.namespace,
                })
            })
            .collect()
    };
    Box::into_raw(Box::new(DivertPriority {
        inner: Priority {
            befores: consume(before_names, num_befores),
            afters: consume(after_names, num_afters),
            is_final,
        },
    }))
}

/// Create installation metadata.
///
/// `make_fixups` controls whether a trampoline is built; without it, orig
/// cannot be called safely. `is_midpoint` marks a mid-function hook and
/// must agree across all hooks on a target. `write_prot` additionally
/// leaves the target page writable.
#[no_mangle]
pub extern "C" fn divert_make_install_metadata(
    make_fixups: bool,
    is_midpoint: bool,
    write_prot: bool,
) -> *mut DivertInstallMetadata {
    Box::into_raw(Box::new(DivertInstallMetadata {
        inner: InstallMetadata {
            need_orig: make_fixups,
            is_midpoint,
            write_prot,
        },
    }))
}

/// Create a type descriptor for checked installs. Pass size 0 for void.
/// The name is informational only; agreement is checked on sizes.
#[no_mangle]
pub unsafe extern "C" fn divert_make_type_info(
    name: *const c_char,
    size: usize,
) -> *mut DivertTypeInfo {
    let _ = name;
    Box::into_raw(Box::new(DivertTypeInfo {
        inner: TypeInfo::new(size),
    }))
}

unsafe fn build_hook(
    hook_function: *mut c_void,
    target: *mut u32,
    orig_pointer: *mut *const c_void,
    num_insts: u16,
    convention: CallingConvention,
    name_info: *mut DivertNameInfo,
    priority: *mut DivertPriority,
    install_metadata: *mut DivertInstallMetadata,
) -> HookInfo {
    let name = if name_info.is_null() {
        NameInfo::default()
    } else {
        Box::from_raw(name_info).inner
    };
    let priority = if priority.is_null() {
        Priority::default()
    } else {
        Box::from_raw(priority).inner
    };
    let metadata = if install_metadata.is_null() {
        InstallMetadata {
            need_orig: !orig_pointer.is_null(),
            ..Default::default()
        }
    } else {
        Box::from_raw(install_metadata).inner
    };

    let mut hook = HookInfo::new(hook_function as *const c_void, target, orig_pointer, name, priority);
    hook.metadata = metadata;
    hook.convention = convention;
    hook.num_insts = num_insts;
    hook
}

/// Install with full control over instruction count, calling convention,
/// name, priority, and installation metadata. Consumes `name_info`,
/// `priority`, and `install_metadata`.
#[no_mangle]
pub unsafe extern "C" fn divert_install_hook_full(
    hook_function: *mut c_void,
    target: *mut u32,
    orig_pointer: *mut *const c_void,
    num_insts: u16,
    convention: DivertCallingConvention,
    name_info: *mut DivertNameInfo,
    priority: *mut DivertPriority,
    install_metadata: *mut DivertInstallMetadata,
) -> DivertInstallResult {
    let hook = build_hook(
        hook_function,
        target,
        orig_pointer,
        num_insts,
        convention.into(),
        name_info,
        priority,
        install_metadata,
    );
    install_result(hook::install(hook))
}

/// Install with defaults: 10 instructions, Cdecl, fixups generated iff
/// `orig_pointer` is non-null. Consumes `name_info`.
#[no_mangle]
pub unsafe extern "C" fn divert_install_hook(
    hook_function: *mut c_void,
    target: *mut u32,
    orig_pointer: *mut *const c_void,
    name_info: *mut DivertNameInfo,
) -> DivertInstallResult {
    let hook = build_hook(
        hook_function,
        target,
        orig_pointer,
        10,
        CallingConvention::Cdecl,
        name_info,
        core::ptr::null_mut(),
        core::ptr::null_mut(),
    );
    install_result(hook::install(hook))
}

/// `divert_install_hook` with the empty name.
#[no_mangle]
pub unsafe extern "C" fn divert_install_hook_no_name(
    hook_function: *mut c_void,
    target: *mut u32,
    orig_pointer: *mut *const c_void,
) -> DivertInstallResult {
    divert_install_hook(hook_function, target, orig_pointer, core::ptr::null_mut())
}

unsafe fn consume_type_infos(
    return_info: *mut DivertTypeInfo,
    parameter_info: *mut *mut DivertTypeInfo,
    num_params: usize,
) -> (Option<TypeInfo>, Option<Vec<TypeInfo>>) {
    let ret = if return_info.is_null() {
        None
    } else {
        Some(Box::from_raw(return_info).inner)
    };
    let params = if parameter_info.is_null() {
        None
    } else {
        Some(
            (0..num_params)
                .filter_map(|i| {
                    let raw = parameter_info.add(i).read();
                    if raw.is_null() {
                        None
                    } else {
                        Some(Box::from_raw(raw).inner)
                    }
                })
                .collect(),
        )
    };
    (ret, params)
}

/// `divert_install_hook_full` plus return/parameter registration checks.
/// Consumes the type-info handles as well.
#[no_mangle]
pub unsafe extern "C" fn divert_install_hook_full_checked(
    hook_function: *mut c_void,
    target: *mut u32,
    orig_pointer: *mut *const c_void,
    num_insts: u16,
    convention: DivertCallingConvention,
    name_info: *mut DivertNameInfo,
    priority: *mut DivertPriority,
    install_metadata: *mut DivertInstallMetadata,
    return_info: *mut DivertTypeInfo,
    parameter_info: *mut *mut DivertTypeInfo,
    num_params: usize,
) -> DivertInstallResult {
    let mut hook = build_hook(
        hook_function,
        target,
        orig_pointer,
        num_insts,
        convention.into(),
        name_info,
        priority,
        install_metadata,
    );
    let (ret, params) = consume_type_infos(return_info, parameter_info, num_params);
    hook.return_info = ret;
    hook.parameter_info = params;
    install_result(hook::install(hook))
}

/// `divert_install_hook` plus return/parameter registration checks.
#[no_mangle]
pub unsafe extern "C" fn divert_install_hook_checked(
    hook_function: *mut c_void,
    target: *mut u32,
    orig_pointer: *mut *const c_void,
    name_info: *mut DivertNameInfo,
    return_info: *mut DivertTypeInfo,
    parameter_info: *mut *mut DivertTypeInfo,
    num_params: usize,
) -> DivertInstallResult {
    divert_install_hook_full_checked(
        hook_function,
        target,
        orig_pointer,
        10,
        DivertCallingConvention::Cdecl,
        name_info,
        core::ptr::null_mut(),
        core::ptr::null_mut(),
        return_info,
        parameter_info,
        num_params,
    )
}

/// Query the preserved prologue of a hooked address. Commonly used to see
/// through installed hooks during instruction tracing.
#[no_mangle]
pub unsafe extern "C" fn divert_orig_for(addr: *const u32) -> DivertOriginalInstructionsResult {
    match hook::original_insts_raw(addr as usize) {
        Some((ptr, len)) => DivertOriginalInstructionsResult {
            hook_size: len,
            original_instructions: ptr,
        },
        None => DivertOriginalInstructionsResult {
            hook_size: 0,
            original_instructions: addr,
        },
    }
}

/// Reinstall the entry jump (and trampoline) after the target was
/// overwritten externally, e.g. by a JIT.
#[no_mangle]
pub unsafe extern "C" fn divert_reinstall_hook(target: *mut u32) -> DivertReinstallResult {
    match hook::reinstall(target) {
        Ok(reinstalled) => DivertReinstallResult {
            success: true,
            value: DivertReinstallValue {
                any_hooks_reinstalled: reinstalled,
            },
        },
        Err(error) => DivertReinstallResult {
            success: false,
            value: DivertReinstallValue {
                error: Box::into_raw(Box::new(DivertErrorData { inner: error })),
            },
        },
    }
}

/// Uninstall the hook behind `handle`. The handle is consumed, valid or
/// not.
#[no_mangle]
pub unsafe extern "C" fn divert_uninstall_hook(
    handle: *mut DivertHookHandle,
) -> DivertUninstallResult {
    if handle.is_null() {
        return DivertUninstallResult {
            success: false,
            value: DivertUninstallValue {
                remap_failure: false,
            },
        };
    }
    let handle = Box::from_raw(handle);
    match hook::uninstall(handle.inner) {
        Ok(remaining) => DivertUninstallResult {
            success: true,
            value: DivertUninstallValue {
                any_hooks_remain: remaining,
            },
        },
        Err(remap_failure) => DivertUninstallResult {
            success: false,
            value: DivertUninstallValue { remap_failure },
        },
    }
}

/// Format an install error into `buffer` (truncated, always
/// NUL-terminated) and free the error data.
#[no_mangle]
pub unsafe extern "C" fn divert_format_error(
    error: *mut DivertErrorData,
    buffer: *mut c_char,
    buffer_size: usize,
) {
    if error.is_null() {
        return;
    }
    let error = Box::from_raw(error);
    if buffer.is_null() || buffer_size == 0 {
        return;
    }
    let message = error.inner.to_string();
    let bytes = message.as_bytes();
    let copy_len = bytes.len().min(buffer_size - 1);
    core::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer as *mut u8, copy_len);
    buffer.add(copy_len).write(0);
}

/// Number of hooks installed at `target` (0 when not hooked).
#[no_mangle]
pub unsafe extern "C" fn divert_get_hook_count(target: *mut u32) -> usize {
    hook::hook_count(target)
}

/// Fill `hooks` with up to `capacity` entries for `target`, returning the
/// number of hooks installed (which may exceed `capacity`). Strings in
/// the written entries must be released with `divert_free_hooks_array`.
#[no_mangle]
pub unsafe extern "C" fn divert_get_hooks(
    target: *mut u32,
    hooks: *mut DivertHookInfo,
    capacity: usize,
) -> usize {
    let Some(snapshot) = hook::hooks_snapshot(target as usize) else {
        return 0;
    };
    if hooks.is_null() {
        return snapshot.len();
    }
    let into_c_string = |s: &str| -> *mut c_char {
        if s.is_empty() {
            core::ptr::null_mut()
        } else {
            CString::new(s).map_or(core::ptr::null_mut(), CString::into_raw)
        }
    };
    for (i, record) in snapshot.iter().take(capacity).enumerate() {
        hooks.add(i).write(DivertHookInfo {
            hook_ptr: record.hook_ptr as *mut c_void,
            orig_ptr: record.orig as *mut c_void,
            name: into_c_string(&record.name.name),
            namespace: into_c_string(&record.name.namespace),
        });
    }
    snapshot.len()
}

/// Free the strings inside an array previously filled by
/// `divert_get_hooks`. The array itself belongs to the caller.
#[no_mangle]
pub unsafe extern "C" fn divert_free_hooks_array(hooks: *mut DivertHookInfo, length: usize) {
    if hooks.is_null() {
        return;
    }
    for i in 0..length {
        let entry = &mut *hooks.add(i);
        if !entry.name.is_null() {
            drop(CString::from_raw(entry.name));
            entry.name = core::ptr::null_mut();
        }
        if !entry.namespace.is_null() {
            drop(CString::from_raw(entry.namespace));
            entry.namespace = core::ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::PAGE_SIZE;
    use crate::lock_hook_tests;

    fn fresh_target() -> *mut u32 {
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        let words = ptr as *mut u32;
        unsafe {
            for i in 0..16 {
                words.add(i).write(0xD503_201F); // nop
            }
        }
        words
    }

    #[test]
    fn install_and_uninstall_through_the_c_surface() {
        let _g = lock_hook_tests();
        let target = fresh_target();
        let mut orig: *const c_void = core::ptr::null();

        let result = unsafe {
            let name = divert_make_name(c"capi".as_ptr());
            let metadata = divert_make_install_metadata(true, false, true);
            divert_install_hook_full(
                0x1212_0001usize as *mut c_void,
                target,
                &mut orig as *mut _,
                10,
                DivertCallingConvention::Cdecl,
                name,
                core::ptr::null_mut(),
                metadata,
            )
        };
        assert_eq!(result.result, DivertInstallStatus::Ok);
        assert!(!orig.is_null());

        unsafe {
            assert_eq!(divert_get_hook_count(target), 1);
            let orig_result = divert_orig_for(target);
            assert_eq!(orig_result.hook_size, 4);
            assert_ne!(orig_result.original_instructions, target as *const u32);

            let uninstall = divert_uninstall_hook(result.value.handle);
            assert!(uninstall.success);
            assert!(!uninstall.value.any_hooks_remain);
            assert_eq!(divert_get_hook_count(target), 0);
        }
    }

    #[test]
    fn errors_format_into_a_bounded_buffer() {
        let _g = lock_hook_tests();
        let mut orig: *const c_void = core::ptr::null();
        let result = unsafe {
            let name = divert_make_name(c"nulltarget".as_ptr());
            divert_install_hook(
                0x1313_0001usize as *mut c_void,
                core::ptr::null_mut(),
                &mut orig as *mut _,
                name,
            )
        };
        assert_eq!(result.result, DivertInstallStatus::TargetNull);

        let mut buffer = [0 as c_char; 64];
        unsafe {
            divert_format_error(result.value.error, buffer.as_mut_ptr(), buffer.len());
            let text = CStr::from_ptr(buffer.as_ptr()).to_string_lossy();
            assert!(text.contains("nulltarget"), "got: {text}");
        }
    }

    #[test]
    fn orig_for_unhooked_address_mirrors_the_input() {
        let _g = lock_hook_tests();
        let target = fresh_target();
        let result = unsafe { divert_orig_for(target) };
        assert_eq!(result.hook_size, 0);
        assert_eq!(result.original_instructions, target as *const u32);
    }

    #[test]
    fn hook_enumeration_round_trips_names() {
        let _g = lock_hook_tests();
        let target = fresh_target();
        let mut orig: *const c_void = core::ptr::null();

        let result = unsafe {
            let name = divert_make_name_namespaced(c"entry".as_ptr(), c"mods".as_ptr());
            let metadata = divert_make_install_metadata(true, false, true);
            divert_install_hook_full(
                0x1414_0001usize as *mut c_void,
                target,
                &mut orig as *mut _,
                10,
                DivertCallingConvention::Cdecl,
                name,
                core::ptr::null_mut(),
                metadata,
            )
        };
        assert_eq!(result.result, DivertInstallStatus::Ok);

        unsafe {
            let count = divert_get_hooks(target, core::ptr::null_mut(), 0);
            assert_eq!(count, 1);

            let mut entries = [DivertHookInfo {
                hook_ptr: core::ptr::null_mut(),
                orig_ptr: core::ptr::null_mut(),
                name: core::ptr::null_mut(),
                namespace: core::ptr::null_mut(),
            }];
            let written = divert_get_hooks(target, entries.as_mut_ptr(), entries.len());
            assert_eq!(written, 1);
            assert_eq!(entries[0].hook_ptr as usize, 0x1414_0001);
            assert_eq!(entries[0].orig_ptr, orig as *mut c_void);
            assert_eq!(CStr::from_ptr(entries[0].name).to_str(), Ok("entry"));
            assert_eq!(CStr::from_ptr(entries[0].namespace).to_str(), Ok("mods"));
            divert_free_hooks_array(entries.as_mut_ptr(), entries.len());
            assert!(entries[0].name.is_null());

            let uninstall = divert_uninstall_hook(result.value.handle);
            assert!(uninstall.success);
        }
    }

    #[test]
    fn priority_constructor_consumes_its_names() {
        // Purely a lifecycle test: build a priority from two names and
        // feed it through an install that fails fast on a null target.
        let result = unsafe {
            let before = divert_make_name(c"later".as_ptr());
            let mut befores = [before];
            let priority = divert_make_priority(
                befores.as_mut_ptr(),
                befores.len(),
                core::ptr::null_mut(),
                0,
                false,
            );
            let name = divert_make_name(c"prio".as_ptr());
            divert_install_hook_full(
                0x1515_0001usize as *mut c_void,
                core::ptr::null_mut(),
                core::ptr::null_mut(),
                10,
                DivertCallingConvention::Cdecl,
                name,
                priority,
                core::ptr::null_mut(),
            )
        };
        assert_eq!(result.result, DivertInstallStatus::TargetNull);
        let mut buffer = [0 as c_char; 128];
        unsafe { divert_format_error(result.value.error, buffer.as_mut_ptr(), buffer.len()) };
    }
}
