use thiserror::Error;

use crate::types::{CallingConvention, NameInfo};

/// Install-time metadata disagreement between an incoming hook and the
/// hooks already present on its target.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetMismatch {
    #[error("target has calling convention: {existing:?} but specified: {incoming:?} for hook: {name}")]
    CallingConvention {
        name: NameInfo,
        existing: CallingConvention,
        incoming: CallingConvention,
    },

    #[error("target has midpoint specified as: {existing} but specified: {incoming} for hook: {name}")]
    Midpoint {
        name: NameInfo,
        existing: bool,
        incoming: bool,
    },

    #[error("target has return type of size: {existing} but specified size: {incoming} for hook: {name}")]
    Return {
        name: NameInfo,
        existing: usize,
        incoming: usize,
    },

    #[error("target has parameter {index} of size: {existing} but specified size: {incoming} for hook: {name}")]
    Param {
        name: NameInfo,
        index: usize,
        existing: usize,
        incoming: usize,
    },

    #[error("target has {existing} parameters but specified: {incoming} for hook: {name}")]
    ParamCount {
        name: NameInfo,
        existing: usize,
        incoming: usize,
    },
}

/// Every recoverable way an installation can fail. The target and all
/// previously installed hooks are left exactly as they were.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InstallError {
    #[error("null target, for hook: {name}")]
    TargetIsNull { name: NameInfo },

    #[error("target too small, needed: {needed} instructions, but have: {actual} instructions for hook: {name}")]
    TargetTooSmall {
        name: NameInfo,
        actual: u16,
        needed: u16,
    },

    #[error("bad priorities, for hook: {name}: {message}")]
    TargetBadPriorities { name: NameInfo, message: String },

    #[error("target mismatch: {0}")]
    TargetMismatch(#[from] TargetMismatch),
}

impl InstallError {
    /// Name of the hook whose installation failed.
    pub fn hook_name(&self) -> &NameInfo {
        match self {
            InstallError::TargetIsNull { name } => name,
            InstallError::TargetTooSmall { name, .. } => name,
            InstallError::TargetBadPriorities { name, .. } => name,
            InstallError::TargetMismatch(mismatch) => match mismatch {
                TargetMismatch::CallingConvention { name, .. } => name,
                TargetMismatch::Midpoint { name, .. } => name,
                TargetMismatch::Return { name, .. } => name,
                TargetMismatch::Param { name, .. } => name,
                TargetMismatch::ParamCount { name, .. } => name,
            },
        }
    }
}
