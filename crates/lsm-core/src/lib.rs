//! MAC Engine Core - Security-Context Association and Lifecycle
//!
//! This crate binds mutable MAC state (current domain, status flags, the
//! in-flight program-image transition) to every task and credential set the
//! host runs, keeps that binding correct while contexts are created, cloned,
//! transitioned and destroyed, and reclaims records without ever blocking a
//! reader.
//!
//! # Design Principles
//!
//! 1. **No unsafe code**: all raw-pointer work lives in `lsm-sync`
//! 2. **Never null**: lookups return a record or a static sentinel
//! 3. **Remove then retire**: records are unlinked first and freed only after
//!    every reader that could hold them has unpinned
//! 4. **Exactly once**: a transition record is taken under its owner's lock,
//!    so commit and abort reconciliation can never both run
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ContextRegistry                         │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                    │
//! │   │  task table   │    │  cred table   │   in-flight count  │
//! │   │ ContextTable  │    │ ContextTable  │   gc cadence       │
//! │   └───────┬───────┘    └───────┬───────┘   AuditLog         │
//! │           └─────────┬──────────┘                            │
//! │                     ▼                                       │
//! │             lsm_sync::Collector                             │
//! └─────────────────────────────────────────────────────────────┘
//!          │ Host (liveness)          │ Policy (decisions)
//!          ▼                          ▼
//! ```
//!
//! # Module Organization
//!
//! - `types` - Domain IDs, context flags, program images
//! - `record` - `ContextRecord` and the static sentinels
//! - `table` - Hashed bucket table keyed by task or credential handle
//! - `registry` - Both tables, lazy creation, lifecycle and exports
//! - `transition` - Transition records and commit/abort reconciliation
//! - `gc` - Rate-limited sweep of records whose task vanished
//! - `socket` - Deferred post-accept permission cache
//! - `policy` - Interface to the external policy engine
//! - `config` - `EngineConfig`
//! - `error` - Error taxonomy
//! - `invariants` - Runtime-checkable invariants

#![no_std]
#![deny(unsafe_code)]
extern crate alloc;

pub mod config;
pub mod error;
pub mod gc;
pub mod invariants;
pub mod policy;
pub mod record;
pub mod registry;
pub mod socket;
pub mod table;
pub mod transition;
pub mod types;

// Re-export all public types for convenient access
pub use config::EngineConfig;
pub use error::{ConfigError, ContextError, Denied, DenyReason};
pub use gc::SweepStats;
pub use invariants::{check_all_invariants, InvariantViolation};
pub use policy::{Decision, Operation, Policy, SocketOp};
pub use record::{ContextRecord, Owner, DEFAULT_CONTEXT, OUT_OF_MEMORY_CONTEXT};
pub use registry::ContextRegistry;
pub use socket::{SocketCache, SocketStatus};
pub use table::{ContextKey, ContextTable};
pub use transition::TransitionRecord;
pub use types::{ContextFlags, DomainId, ProgramImage, SentinelKind};

pub use lsm_audit::{AuditEvent, AuditEventKind, TransitionId, TransitionOutcome};
pub use lsm_host::{CredKey, Host, SocketKey, TaskKey};
pub use lsm_sync::Guard;
