//! MAC engine synchronization primitives - Consolidated Unsafe Code TCB
//!
//! This crate contains ALL unsafe code used by the security-context engine,
//! consolidated into a single auditable location. The other engine crates use
//! `#![deny(unsafe_code)]`.
//!
//! # Design Principles
//!
//! 1. **Minimal unsafe surface**: raw pointers only where lock-free readers need them
//! 2. **Safe wrappers**: readers get `&T` bounded by a [`Guard`] lifetime
//! 3. **Auditable**: small, focused modules for security review
//!
//! # Module Organization
//!
//! - `epoch` - Epoch-based deferred reclamation (`Collector`, `Guard`)
//! - `list` - RCU-style singly linked list with lock-free readers
//! - `heap` - Fallible allocation (`try_box`)
//! - `loom_tests` - Concurrency tests using loom (with `loom` feature)
//!
//! # Verification
//!
//! 1. **Loom tests** (`cargo test --features loom`): epoch protocol interleavings
//! 2. **Unit tests**: traditional and multi-threaded stress tests

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod epoch;
pub mod heap;
pub mod list;


// Re-export commonly used items
pub use epoch::{Collector, Guard};
pub use heap::{try_box, AllocError};
pub use list::{InsertError, Iter, RcuList};
