//! Host kernel abstraction for the MAC security-context engine
//!
//! This crate defines the identity handles the engine tracks and the `Host`
//! trait through which the engine queries the kernel it is attached to.
//! The engine never owns tasks or credential sets; it borrows their handles
//! and asks the host whether they are still alive.
//!
//! # Platform Implementations
//!
//! - **Kernel module**: task/cred pointers as handles, `pid_task()` for liveness
//! - **Tests**: `lsm-host-mock` with a per-thread current task

#![no_std]

use core::fmt;
use serde::{Deserialize, Serialize};

// ============================================================================
// Identity handles
// ============================================================================

/// Handle of a task (process/thread), stable for the life of the thread.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskKey(pub u64);

/// Handle of a credential set, stable for the life of the credential set.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CredKey(pub u64);

/// Handle of a socket endpoint (its inode).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SocketKey(pub u64);

impl TaskKey {
    /// Raw handle value used for hashing
    pub const fn handle(self) -> u64 {
        self.0
    }
}

impl CredKey {
    /// Raw handle value used for hashing
    pub const fn handle(self) -> u64 {
        self.0
    }
}

impl SocketKey {
    /// Raw handle value used for hashing
    pub const fn handle(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{:#x}", self.0)
    }
}

impl fmt::Debug for CredKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cred:{:#x}", self.0)
    }
}

impl fmt::Debug for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock:{:#x}", self.0)
    }
}

// ============================================================================
// Host trait
// ============================================================================

/// Host kernel interface
///
/// Implementations answer questions the engine cannot answer from its own
/// tables:
/// - Which task and credential set are executing right now
/// - Whether a task still exists (no task-free callback is guaranteed)
/// - Whether the host itself believes a task is mid program-image replacement
/// - How many references a credential set has left
///
/// Every method may be called concurrently from any thread and must not
/// block.
pub trait Host: Send + Sync + 'static {
    // === Identity ===

    /// The task executing the current hook
    fn current_task(&self) -> TaskKey;

    /// The effective credential set of the current task
    fn current_cred(&self) -> CredKey;

    /// The effective credential set of another task
    ///
    /// # Returns
    /// * `Some(cred)` - The task exists and acts with `cred`
    /// * `None` - The task does not exist
    fn task_cred(&self, task: TaskKey) -> Option<CredKey>;

    // === Liveness ===

    /// Check if a task still resolves to a live thread
    fn task_alive(&self, task: TaskKey) -> bool;

    /// Number of references the host holds on a credential set
    ///
    /// A value of 1 or less means the caller holds the last reference.
    fn cred_usage(&self, cred: CredKey) -> usize;

    // === Transition bookkeeping ===

    /// Check if the host's own bookkeeping shows `task` inside a program
    /// image replacement (the kernel's `in_execve` indicator)
    fn in_transition(&self, task: TaskKey) -> bool;

    // === Enforcement ===

    /// Forcibly terminate the current task
    ///
    /// # Returns
    /// * `Ok(())` - Termination was requested
    /// * `Err(HostError::Unkillable)` - The task cannot be killed (e.g. init)
    fn kill_current(&self) -> Result<(), HostError>;

    // === Time ===

    /// Get current time in nanoseconds (monotonic)
    fn now_nanos(&self) -> u64;
}

/// Host errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// Task not found or already terminated
    #[error("task not found")]
    TaskNotFound,
    /// Task ignores termination requests
    #[error("task cannot be terminated")]
    Unkillable,
    /// Operation not supported on this host
    #[error("operation not supported")]
    NotSupported,
}
