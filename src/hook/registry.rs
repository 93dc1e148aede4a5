//! The process-global target registry.
//!
//! An ordered map from target address to per-target state, so future
//! range queries ("any hook overlapping [lo, hi)?") stay cheap. The mutex
//! only guards the map structure; the single-threaded usage contract for
//! the actual code patching still applies.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::arch::arm64::fixups::Fixups;
use crate::hook::chain::HookChain;
use crate::types::{CallingConvention, InstallMetadata, TypeInfo};

/// Install-time facts shared by every hook on one target.
#[derive(Debug, Clone)]
pub struct TargetMetadata {
    pub convention: CallingConvention,
    pub metadata: InstallMetadata,
    /// Minimum agreed prologue length across all hooks on this target;
    /// monotonically non-increasing as hooks are added.
    pub method_num_insts: u16,
    pub parameter_info: Option<Vec<TypeInfo>>,
    pub return_info: Option<TypeInfo>,
}

pub(crate) struct TargetState {
    pub metadata: TargetMetadata,
    pub fixups: Fixups,
    pub chain: HookChain,
}

pub(crate) type Registry = BTreeMap<usize, TargetState>;

pub(crate) fn registry() -> MutexGuard<'static, Registry> {
    static TARGETS: OnceLock<Mutex<Registry>> = OnceLock::new();
    TARGETS
        .get_or_init(|| Mutex::new(BTreeMap::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
