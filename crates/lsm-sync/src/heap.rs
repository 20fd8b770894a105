//! Fallible heap allocation
//!
//! `Box::new` aborts when the global allocator fails. Security contexts must
//! survive memory pressure with a defined outcome, so record allocation goes
//! through [`try_box`], which reports a null allocation as [`AllocError`].
//!
//! # Safety Invariants
//!
//! 1. **Layout match**: memory is allocated with `Layout::new::<T>()`, the
//!    same layout `Box<T>` deallocates with
//! 2. **Initialized before use**: the value is written before the box exists

use alloc::alloc::{alloc, Layout};
use alloc::boxed::Box;
use core::fmt;

/// The global allocator returned null.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

/// Move `value` into a new heap allocation, reporting allocator failure.
pub fn try_box<T>(value: T) -> Result<Box<T>, AllocError> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Ok(Box::new(value));
    }

    // SAFETY: layout has non-zero size (checked above).
    let ptr = unsafe { alloc(layout) } as *mut T;
    if ptr.is_null() {
        return Err(AllocError);
    }

    // SAFETY: ptr is non-null, properly aligned for T, and sized for T.
    // It was allocated by the global allocator with Layout::new::<T>(),
    // which is exactly what Box<T> expects to free.
    unsafe {
        ptr.write(value);
        Ok(Box::from_raw(ptr))
    }
}
