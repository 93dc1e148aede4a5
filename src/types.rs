use core::ffi::c_void;
use std::fmt;

/// Calling convention of a hooked target, used for install-time validation.
/// The hook function is assumed to share the target's convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    Cdecl,
    Fastcall,
    Thiscall,
}

/// Size-only type descriptor used when registration checks are enabled.
///
/// References collapse to pointer width and `void` is size 0; nothing more
/// is compared today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeInfo {
    pub size: usize,
}

impl TypeInfo {
    pub const VOID: TypeInfo = TypeInfo { size: 0 };

    pub fn new(size: usize) -> Self {
        Self { size }
    }

    pub fn of<T>() -> Self {
        Self {
            size: core::mem::size_of::<T>(),
        }
    }
}

/// Name identity of a hook: a name plus an optional namespace.
///
/// Both fields participate in priority filter matching and in the identity
/// used by the topological sort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NameInfo {
    pub name: String,
    pub namespace: String,
}

impl NameInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: String::new(),
        }
    }

    pub fn namespaced(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for NameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}::{}", self.namespace, self.name)
        }
    }
}

/// A priority constraint filter.
///
/// Matches a hook when the filter name equals the hook name OR the filter
/// namespace equals the hook namespace. An empty filter field matches
/// nothing: it is neither a wildcard nor equal to an empty hook field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameFilter {
    pub name: String,
    pub namespace: String,
}

impl NameFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: String::new(),
        }
    }

    pub fn by_namespace(namespace: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            namespace: namespace.into(),
        }
    }

    pub fn matches(&self, other: &NameInfo) -> bool {
        (!self.name.is_empty() && self.name == other.name)
            || (!self.namespace.is_empty() && self.namespace == other.namespace)
    }
}

/// Ordering constraints for one hook within a target's chain.
#[derive(Debug, Clone, Default)]
pub struct Priority {
    /// Hooks this one must be called earlier than.
    pub befores: Vec<NameFilter>,
    /// Hooks this one must be called later than.
    pub afters: Vec<NameFilter>,
    /// A final hook is pinned to the chain tail; at most one per target.
    pub is_final: bool,
}

/// Install-time hints carried by every hook on a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallMetadata {
    /// Whether a trampoline for the overwritten prologue should be built.
    /// Without it, calling orig aborts via the sentinel.
    pub need_orig: bool,
    /// Whether the hook targets the middle of a function rather than its
    /// entry. Must agree across all hooks on one target.
    pub is_midpoint: bool,
    /// Leave the target page writable after installation (debug aid).
    pub write_prot: bool,
}

/// Everything needed to install one hook.
///
/// Null hook functions are allowed (and will crash gloriously when called);
/// null targets are rejected at install time.
pub struct HookInfo {
    /// Address of the function to divert.
    pub target: *mut u32,
    /// Address of the user's replacement function.
    pub hook_ptr: *const c_void,
    /// Optional out-slot: after install, `*orig_ptr` names the next callee
    /// in the chain (or the trampoline / abort sentinel for the tail).
    pub orig_ptr: *mut *const c_void,
    pub name: NameInfo,
    pub priority: Priority,
    pub metadata: InstallMetadata,
    pub convention: CallingConvention,
    /// Number of instructions at the target that are safe to overwrite.
    pub num_insts: u16,
    /// Present only when registration checks are requested.
    pub return_info: Option<TypeInfo>,
    pub parameter_info: Option<Vec<TypeInfo>>,
}

// The registry owns HookInfo values behind a mutex; the raw pointers are
// plain addresses the installer writes through under the caller's external
// serialization contract.
unsafe impl Send for HookInfo {}

impl HookInfo {
    pub fn new(
        hook_ptr: *const c_void,
        target: *mut u32,
        orig_ptr: *mut *const c_void,
        name: NameInfo,
        priority: Priority,
    ) -> Self {
        Self {
            target,
            hook_ptr,
            orig_ptr,
            name,
            priority,
            metadata: InstallMetadata {
                need_orig: !orig_ptr.is_null(),
                ..Default::default()
            },
            convention: CallingConvention::Cdecl,
            num_insts: 10,
            return_info: None,
            parameter_info: None,
        }
    }

    /// Store `value` into the caller's orig slot, when one was provided.
    pub(crate) fn assign_orig(&self, value: *const c_void) {
        if !self.orig_ptr.is_null() {
            unsafe { self.orig_ptr.write(value) };
        }
    }
}

impl fmt::Debug for HookInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookInfo")
            .field("target", &self.target)
            .field("hook_ptr", &self.hook_ptr)
            .field("name", &self.name)
            .field("num_insts", &self.num_insts)
            .finish_non_exhaustive()
    }
}

/// Names exactly one installed hook in one target's chain.
///
/// Handles stay valid across unrelated installs and uninstalls on the same
/// target (slot identity is generation-checked); erasing the target
/// invalidates all of its handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHandle {
    pub(crate) target: usize,
    pub(crate) slot: usize,
    pub(crate) generation: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_by_name_or_namespace() {
        let hook = NameInfo::namespaced("one", "common");
        assert!(NameFilter::by_name("one").matches(&hook));
        assert!(NameFilter::by_namespace("common").matches(&hook));
        assert!(!NameFilter::by_name("two").matches(&hook));
        // An empty filter namespace does not match a non-empty hook namespace.
        assert!(!NameFilter::by_name("two").matches(&NameInfo::namespaced("three", "common")));
    }

    #[test]
    fn empty_filter_fields_match_nothing() {
        let plain = NameInfo::new("plain");
        // A name-only filter must not match unrelated namespace-less hooks
        // through the shared empty namespace.
        assert!(!NameFilter::by_name("other").matches(&plain));
        // A fully empty filter matches nothing at all.
        assert!(!NameFilter::default().matches(&plain));
        assert!(!NameFilter::default().matches(&NameInfo::default()));
    }

    #[test]
    fn type_info_sizes() {
        assert_eq!(TypeInfo::VOID.size, 0);
        assert_eq!(TypeInfo::of::<u64>().size, 8);
        assert_eq!(TypeInfo::of::<&u8>().size, core::mem::size_of::<usize>());
    }

    #[test]
    fn name_display_includes_namespace() {
        assert_eq!(NameInfo::new("a").to_string(), "a");
        assert_eq!(NameInfo::namespaced("a", "ns").to_string(), "ns::a");
    }
}
