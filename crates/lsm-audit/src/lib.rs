//! Transition audit trail for the MAC engine
//!
//! The audit layer provides:
//! - **AuditLog**: append-only record of transition start/finish events
//! - **Live transition accounting**: every started transition is tracked
//!   until it is reconciled, so a transition record that outlives its
//!   expected bounds can be reported (leak detection)
//!
//! Rendering of policy decisions is not part of this crate; it only records
//! the lifecycle of transition records.

#![no_std]
extern crate alloc;

pub mod log;

pub use log::{
    AuditEvent, AuditEventKind, AuditLog, EventId, LeakReport, TransitionId, TransitionOutcome,
    DEFAULT_AUDIT_CAPACITY,
};
