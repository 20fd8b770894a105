//! Error taxonomy
//!
//! `ContextError` is internal: it never reaches the operation being checked.
//! Callers of hook entry points only ever see `Denied`.

use lsm_audit::TransitionId;
use thiserror::Error;

/// Errors raised inside the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ContextError {
    /// A record or transition could not be allocated
    #[error("allocation failure")]
    AllocationFailure,
    /// A context that must exist was not found
    #[error("missing security context")]
    MissingContext,
    /// A transition was requested while one is already pending
    #[error("transition already pending")]
    DoubleTransition,
    /// A transition record outlived its expected bound
    #[error("transition {id} leaked ({age_ns} ns old)")]
    LeakDetected { id: TransitionId, age_ns: u64 },
    /// A record for this key is already in the table
    #[error("duplicate security context")]
    Duplicate,
    /// The record was removed from its table
    #[error("security context retired")]
    Retired,
    /// The policy refused the transition
    #[error("transition refused: {0}")]
    PolicyDenied(DenyReason),
}

/// Why an operation was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DenyReason {
    /// The policy refused the operation
    #[error("permission denied")]
    PermissionDenied,
    /// The engine could not allocate the state needed to decide
    #[error("out of memory")]
    OutOfMemory,
}

/// The only failure visible to the operation being checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("operation denied: {reason}")]
pub struct Denied {
    pub reason: DenyReason,
}

impl Denied {
    pub const PERMISSION: Denied = Denied {
        reason: DenyReason::PermissionDenied,
    };
    pub const OUT_OF_MEMORY: Denied = Denied {
        reason: DenyReason::OutOfMemory,
    };
}

impl From<DenyReason> for Denied {
    fn from(reason: DenyReason) -> Self {
        Denied { reason }
    }
}

/// Invalid `EngineConfig` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("hash_bits must be between 1 and 16, got {0}")]
    HashBits(u32),
    #[error("gc_interval must be non-zero")]
    GcInterval,
    #[error("audit_capacity must be non-zero")]
    AuditCapacity,
    #[error("{0} must be non-zero when set")]
    RecordBudget(&'static str),
}
