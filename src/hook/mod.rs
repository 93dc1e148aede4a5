//! Install / reinstall / uninstall and the chain-linkage bookkeeping.

pub mod chain;
pub mod registry;

use core::ffi::c_void;

use crate::arch::arm64::fixups::{
    Fixups, HOOK_ALIGNMENT, NORMAL_FIXUP_INST_COUNT, NUM_FIXUPS_PER_INST,
};
use crate::code::{allocate, fatal, CodeSpan, Protection, PAGE_SIZE};
use crate::errors::{InstallError, TargetMismatch};
use crate::types::{HookHandle, HookInfo};

pub use registry::TargetMetadata;

use registry::{registry, TargetState};

/// Assigned as orig for hooks installed without a trampoline. Calling it
/// means a hook invoked orig although none was requested; aborting beats
/// the jump-to-null it would otherwise be.
pub extern "C" fn no_orig_abort() {
    fatal!("orig was called on a hook installed without a trampoline");
}

fn sentinel() -> *const c_void {
    no_orig_abort as extern "C" fn() as usize as *const c_void
}

/// What the tail hook's orig should point at for this target.
fn tail_orig(state: &TargetState) -> *const c_void {
    if state.metadata.metadata.need_orig {
        state.fixups.region.addr() as *const c_void
    } else {
        sentinel()
    }
}

/// Check an incoming hook against the facts recorded by earlier installs.
/// The agreed prologue length shrinks to the minimum of both sides before
/// any rejection can happen.
fn validate_metadata(
    existing: &mut TargetMetadata,
    hook: &HookInfo,
) -> Result<(), TargetMismatch> {
    existing.method_num_insts = existing.method_num_insts.min(hook.num_insts);

    if existing.convention != hook.convention {
        return Err(TargetMismatch::CallingConvention {
            name: hook.name.clone(),
            existing: existing.convention,
            incoming: hook.convention,
        });
    }
    if existing.metadata.is_midpoint != hook.metadata.is_midpoint {
        return Err(TargetMismatch::Midpoint {
            name: hook.name.clone(),
            existing: existing.metadata.is_midpoint,
            incoming: hook.metadata.is_midpoint,
        });
    }
    // Type registration is compared only when both sides supplied it.
    if let (Some(existing_ret), Some(incoming_ret)) = (existing.return_info, hook.return_info) {
        if existing_ret != incoming_ret {
            return Err(TargetMismatch::Return {
                name: hook.name.clone(),
                existing: existing_ret.size,
                incoming: incoming_ret.size,
            });
        }
    }
    if let (Some(existing_params), Some(incoming_params)) =
        (&existing.parameter_info, &hook.parameter_info)
    {
        if existing_params.len() != incoming_params.len() {
            return Err(TargetMismatch::ParamCount {
                name: hook.name.clone(),
                existing: existing_params.len(),
                incoming: incoming_params.len(),
            });
        }
        for (index, (have, want)) in existing_params.iter().zip(incoming_params).enumerate() {
            if have != want {
                return Err(TargetMismatch::Param {
                    name: hook.name.clone(),
                    index,
                    existing: have.size,
                    incoming: want.size,
                });
            }
        }
    }
    Ok(())
}

/// Rewrite every link in the chain: entry jump, inter-hook origs, tail.
fn relink_full(state: &TargetState) {
    let len = state.chain.len();
    debug_assert!(len > 0);
    state
        .fixups
        .write_jump(state.chain.hook_at(0).hook_ptr as usize);
    for pos in 0..len - 1 {
        state
            .chain
            .hook_at(pos)
            .assign_orig(state.chain.hook_at(pos + 1).hook_ptr);
    }
    state.chain.hook_at(len - 1).assign_orig(tail_orig(state));
}

/// Repair only the links around a freshly inserted hook.
fn relink_inserted(state: &TargetState, pos: usize) {
    if pos == 0 {
        state
            .fixups
            .write_jump(state.chain.hook_at(0).hook_ptr as usize);
    } else {
        state
            .chain
            .hook_at(pos - 1)
            .assign_orig(state.chain.hook_at(pos).hook_ptr);
    }
    if pos == state.chain.len() - 1 {
        state.chain.hook_at(pos).assign_orig(tail_orig(state));
    } else {
        state
            .chain
            .hook_at(pos)
            .assign_orig(state.chain.hook_at(pos + 1).hook_ptr);
    }
}

/// Install a hook. For a new target this snapshots the prologue, builds
/// the trampoline (when requested) and plants the entry jump; for an
/// already-hooked target it validates compatibility and splices the hook
/// into a priority-legal position.
pub fn install(mut hook: HookInfo) -> Result<HookHandle, InstallError> {
    if hook.target.is_null() {
        return Err(InstallError::TargetIsNull {
            name: hook.name.clone(),
        });
    }
    let target_addr = hook.target as usize;
    let mut targets = registry();

    let state = match targets.entry(target_addr) {
        std::collections::btree_map::Entry::Vacant(entry) => {
            // First hook here. The overwrite window is the normal fixup
            // count; an extra instruction is needed when a trampoline
            // will branch back past the window.
            let needed = (NORMAL_FIXUP_INST_COUNT + hook.metadata.need_orig as usize) as u16;
            if hook.num_insts < needed {
                return Err(InstallError::TargetTooSmall {
                    name: hook.name.clone(),
                    actual: hook.num_insts,
                    needed,
                });
            }

            let mut protection = Protection::READ | Protection::EXECUTE;
            if hook.metadata.write_prot {
                protection |= Protection::WRITE;
            }
            let target_span =
                unsafe { CodeSpan::new(hook.target, hook.num_insts as usize, protection) };
            let region = allocate(
                HOOK_ALIGNMENT,
                PAGE_SIZE.min(hook.num_insts as usize * 4 * NUM_FIXUPS_PER_INST),
                Protection::READ | Protection::EXECUTE,
            );

            let mut fixups = Fixups::new(target_span.subspan(NORMAL_FIXUP_INST_COUNT), region);
            fixups.copy_original_insts();

            hook.assign_orig(sentinel());
            if hook.metadata.need_orig {
                fixups.perform_fixups_and_callback();
                hook.assign_orig(region.addr() as *const c_void);
            }

            let metadata = TargetMetadata {
                convention: hook.convention,
                metadata: hook.metadata,
                method_num_insts: hook.num_insts,
                parameter_info: hook.parameter_info.clone(),
                return_info: hook.return_info,
            };
            log::debug!(
                "installing first hook {} at target {target_addr:#x} -> {:p}",
                hook.name,
                hook.hook_ptr
            );

            let hook_ptr = hook.hook_ptr;
            let mut chain = chain::HookChain::new();
            let slot = chain.append(hook);
            let generation = chain.generation(slot);
            fixups.write_jump(hook_ptr as usize);

            entry.insert(TargetState {
                metadata,
                fixups,
                chain,
            });
            return Ok(HookHandle {
                target: target_addr,
                slot,
                generation,
            });
        }
        std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
    };

    validate_metadata(&mut state.metadata, &hook)?;
    log::debug!(
        "installing hook {} at already-hooked target {target_addr:#x}",
        hook.name
    );
    let (slot, sorted) = state.chain.place(hook)?;
    let generation = state.chain.generation(slot);
    if sorted {
        relink_full(state);
    } else {
        let pos = state
            .chain
            .position_of(slot, generation)
            .expect("freshly placed hook is in the chain");
        relink_inserted(state, pos);
    }
    Ok(HookHandle {
        target: target_addr,
        slot,
        generation,
    })
}

/// Redo the installation at `target` after its code was replaced
/// externally (re-JIT, another patching tool): re-snapshot the prologue,
/// rebuild the trampoline when one exists, and rewrite the entry jump.
///
/// Inter-hook orig pointers are NOT rewritten; only the entry jump and
/// the trampoline are refreshed. Returns `Ok(false)` when the target has
/// no hooks.
pub fn reinstall(target: *mut u32) -> Result<bool, InstallError> {
    let mut targets = registry();
    let Some(state) = targets.get_mut(&(target as usize)) else {
        return Ok(false);
    };
    state.fixups.copy_original_insts();
    if state.metadata.metadata.need_orig {
        state.fixups.perform_fixups_and_callback();
    }
    state
        .fixups
        .write_jump(state.chain.hook_at(0).hook_ptr as usize);
    Ok(true)
}

/// Remove one hook. `Ok(true)` means other hooks remain on the target;
/// `Ok(false)` means the target was fully restored and forgotten.
/// `Err(false)` means the handle names no live hook. (`Err(true)` is
/// reserved for future remap failures.)
pub fn uninstall(handle: HookHandle) -> Result<bool, bool> {
    let mut targets = registry();
    let Some(state) = targets.get_mut(&handle.target) else {
        return Err(false);
    };
    let Some(pos) = state.chain.position_of(handle.slot, handle.generation) else {
        return Err(false);
    };

    if state.chain.len() == 1 {
        // Last hook: restore the prologue and forget the target. The
        // fixup region is leaked; another thread may still be executing
        // out of it.
        state.fixups.uninstall();
        targets.remove(&handle.target);
        return Ok(false);
    }

    if pos == 0 {
        state
            .fixups
            .write_jump(state.chain.hook_at(1).hook_ptr as usize);
    } else if pos == state.chain.len() - 1 {
        state.chain.hook_at(pos - 1).assign_orig(tail_orig(state));
    } else {
        state
            .chain
            .hook_at(pos - 1)
            .assign_orig(state.chain.hook_at(pos + 1).hook_ptr);
    }
    state.chain.remove_at(pos);
    Ok(true)
}

/// The words that were at `target` before the first install, or `None`
/// when the target is not hooked.
pub fn original_insts_for(target: *mut u32) -> Option<Vec<u32>> {
    registry()
        .get(&(target as usize))
        .map(|state| state.fixups.original_instructions.clone())
}

/// Install-time facts for a hooked target.
pub fn metadata_for(target: *mut u32) -> Option<TargetMetadata> {
    registry()
        .get(&(target as usize))
        .map(|state| state.metadata.clone())
}

/// Start of the trampoline region for a hooked target.
pub fn fixup_pointer_for(target: *mut u32) -> Option<*const u32> {
    registry()
        .get(&(target as usize))
        .map(|state| state.fixups.region.as_ptr() as *const u32)
}

/// Number of hooks currently installed at `target`.
pub fn hook_count(target: *mut u32) -> usize {
    registry()
        .get(&(target as usize))
        .map_or(0, |state| state.chain.len())
}

/// One chain entry as observed right now (for enumeration).
pub(crate) struct HookRecord {
    pub hook_ptr: *const c_void,
    pub orig: *const c_void,
    pub name: crate::types::NameInfo,
}

pub(crate) fn hooks_snapshot(target: usize) -> Option<Vec<HookRecord>> {
    let targets = registry();
    let state = targets.get(&target)?;
    Some(
        state
            .chain
            .iter()
            .map(|hook| HookRecord {
                hook_ptr: hook.hook_ptr,
                orig: if hook.orig_ptr.is_null() {
                    core::ptr::null()
                } else {
                    unsafe { hook.orig_ptr.read() }
                },
                name: hook.name.clone(),
            })
            .collect(),
    )
}

/// Raw view of a target's preserved prologue for the C surface. The
/// pointer stays valid while at least one hook remains and no reinstall
/// runs.
pub(crate) fn original_insts_raw(target: usize) -> Option<(*const u32, usize)> {
    let targets = registry();
    let state = targets.get(&target)?;
    Some((
        state.fixups.original_instructions.as_ptr(),
        state.fixups.original_instructions.len(),
    ))
}
