//! MAC Engine - Hook Surface
//!
//! This crate connects the security-context registry to the host's hook
//! points:
//! - An ordered interceptor chain per hook point (`HookTable`)
//! - Lifecycle entry points that keep the context tables current
//! - Access checks that hand the caller's domain to the policy
//! - The post-accept socket check
//!
//! # Architecture
//!
//! ```text
//!   host hook point
//!         │
//!         ▼
//!   HookTable::dispatch ──► Engine ──► next interceptor ──► ... ──► allow
//!                             │
//!                ┌────────────┼──────────────┐
//!                ▼            ▼              ▼
//!        ContextRegistry   Policy       SocketCache
//! ```

#![no_std]
#![deny(unsafe_code)]
extern crate alloc;

pub mod engine;
pub mod hooks;

pub use engine::{Engine, ENGINE_NAME};
pub use hooks::{HookCall, HookId, HookTable, Interceptor, Next};

// Re-export the core types callers need alongside the engine
pub use lsm_core::{
    check_all_invariants, ConfigError, Decision, Denied, DenyReason, DomainId, EngineConfig,
    Operation, Policy, ProgramImage, SocketOp, SweepStats,
};
pub use lsm_host::{CredKey, Host, SocketKey, TaskKey};
