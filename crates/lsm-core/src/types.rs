//! Core engine types

use alloc::string::String;
use bitflags::bitflags;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Opaque policy domain identifier. Compared by identity, never interpreted.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainId(pub u64);

impl DomainId {
    /// Domain of the sentinels and of blank credentials
    pub const KERNEL: DomainId = DomainId(0);
}

impl fmt::Debug for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain:{}", self.0)
    }
}

bitflags! {
    /// Status flags carried by a context record.
    ///
    /// Only `IN_TRANSITION` is interpreted here; the remaining bits belong to
    /// the policy engine and are copied forward untouched.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ContextFlags: u32 {
        /// A transition record is attached
        const IN_TRANSITION = 1 << 0;
        /// The program was started through an execute handler
        const EXECUTE_HANDLER = 1 << 1;
        /// The task may manage policy
        const POLICY_MANAGER = 1 << 2;
        /// Do not sleep on policy violations
        const NO_SLEEP_ON_ERROR = 1 << 3;
    }
}

impl ContextFlags {
    /// Flags as they may be copied to another record.
    pub fn inheritable(self) -> Self {
        self - ContextFlags::IN_TRANSITION
    }
}

/// Which static sentinel a record is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SentinelKind {
    /// Returned when a record for the current task could not be allocated
    OutOfMemory,
    /// Returned for identities with no record of their own
    Default,
}

/// The program image a transition evaluates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramImage {
    /// Path of the program being executed
    pub path: String,
    /// Interpreter or execute-handler path, if any
    pub handler: Option<String>,
}

impl ProgramImage {
    /// An image with no handler
    pub fn new(path: &str) -> Self {
        Self {
            path: String::from(path),
            handler: None,
        }
    }

    /// An image run through an interpreter or execute handler
    pub fn with_handler(path: &str, handler: &str) -> Self {
        Self {
            path: String::from(path),
            handler: Some(String::from(handler)),
        }
    }
}
