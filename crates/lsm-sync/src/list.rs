//! RCU-style singly linked list
//!
//! Readers traverse without locks under a pinned [`Guard`]. Writers serialize
//! on a narrow per-list spin lock that is held only for the pointer splice.
//! Removed nodes keep their `next` link so a reader standing on a removed
//! node can still walk to the rest of the list; the node itself is released
//! through the list's [`Collector`] once the grace period has elapsed.
//!
//! # Safety Invariants
//!
//! 1. **Publish after init**: a node is fully initialized before the release
//!    store that links it
//! 2. **Single owner of frees**: nodes are freed only by the collector (after
//!    unlink) or by `Drop` (with exclusive access)
//! 3. **Guard identity**: readers must pin the collector this list was built
//!    with; checked on every traversal

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use spin::Mutex;

use crate::epoch::{Collector, Guard};
use crate::heap::try_box;

struct Node<T> {
    value: T,
    next: AtomicPtr<Node<T>>,
}

/// Why an insertion did not link a new node.
pub enum InsertError<'g, T> {
    /// The node could not be allocated
    OutOfMemory,
    /// A conflicting entry is already linked
    Occupied(&'g T),
}

impl<T> fmt::Debug for InsertError<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertError::OutOfMemory => f.write_str("OutOfMemory"),
            InsertError::Occupied(_) => f.write_str("Occupied"),
        }
    }
}

/// Concurrent list with lock-free readers and deferred node release.
pub struct RcuList<T> {
    head: AtomicPtr<Node<T>>,
    writer: Mutex<()>,
    len: AtomicUsize,
    collector: Arc<Collector>,
    _owns: PhantomData<*mut Node<T>>,
}

// SAFETY: nodes are reached through atomics only. Shared readers hand out
// &T across threads (needs T: Sync) and removal drops T on whichever thread
// collects (needs T: Send).
unsafe impl<T: Send + Sync> Sync for RcuList<T> {}
unsafe impl<T: Send> Send for RcuList<T> {}

impl<T> RcuList<T> {
    /// Create an empty list reclaimed by `collector`.
    pub fn new(collector: Arc<Collector>) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            writer: Mutex::new(()),
            len: AtomicUsize::new(0),
            collector,
            _owns: PhantomData,
        }
    }

    /// The collector that reclaims this list's nodes.
    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Number of linked nodes.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Check if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    fn check_guard(&self, guard: &Guard<'_>) {
        assert!(
            ptr::eq(guard.collector(), Arc::as_ptr(&self.collector)),
            "guard pins a different collector than this list"
        );
    }

    /// Traverse the list.
    pub fn iter<'g>(&'g self, guard: &'g Guard<'_>) -> Iter<'g, T> {
        self.check_guard(guard);
        Iter {
            next: self.head.load(Ordering::Acquire),
            _guard: PhantomData,
        }
    }

    /// First entry matching `pred`.
    pub fn find<'g, F>(&'g self, guard: &'g Guard<'_>, mut pred: F) -> Option<&'g T>
    where
        F: FnMut(&T) -> bool,
    {
        self.iter(guard).find(|value| pred(value))
    }

    /// Link `value` at the head unless an entry for which `conflicts`
    /// returns true is already linked.
    ///
    /// The conflict scan and the link happen under the writer lock, so two
    /// racing inserts of conflicting values cannot both succeed.
    pub fn insert_unique<'g, F>(
        &'g self,
        value: T,
        mut conflicts: F,
        guard: &'g Guard<'_>,
    ) -> Result<&'g T, InsertError<'g, T>>
    where
        F: FnMut(&T) -> bool,
    {
        self.check_guard(guard);
        let node = try_box(Node {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        })
        .map_err(|_| InsertError::OutOfMemory)?;

        let _writer = self.writer.lock();
        if let Some(existing) = self.iter(guard).find(|v| conflicts(v)) {
            return Err(InsertError::Occupied(existing));
        }

        let head = self.head.load(Ordering::Acquire);
        node.next.store(head, Ordering::Relaxed);
        let raw = Box::into_raw(node);
        self.head.store(raw, Ordering::Release);
        self.len.fetch_add(1, Ordering::AcqRel);

        // SAFETY: raw was just linked; it can only be freed after unlink plus
        // a grace period, and the caller's guard is still pinned.
        Ok(unsafe { &(*raw).value })
    }

    /// Unlink the node holding `target` and retire it.
    ///
    /// Returns false if `target` is not linked (already removed), so every
    /// node is retired at most once.
    pub fn remove(&self, target: &T) -> bool
    where
        T: Send,
    {
        let unlinked = {
            let _writer = self.writer.lock();
            let mut link = &self.head;
            loop {
                let cur = link.load(Ordering::Acquire);
                if cur.is_null() {
                    break None;
                }
                // SAFETY: cur is linked and we hold the writer lock, so it
                // cannot be unlinked or freed underneath us.
                let node = unsafe { &*cur };
                if ptr::eq(&node.value, target) {
                    link.store(node.next.load(Ordering::Acquire), Ordering::Release);
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    break Some(cur);
                }
                link = &node.next;
            }
        };

        match unlinked {
            Some(node) => {
                // SAFETY: node came from Box::into_raw in insert_unique, is
                // now unreachable from the head, and was unlinked exactly once
                // under the writer lock.
                unsafe { self.collector.retire(node) };
                true
            }
            None => false,
        }
    }
}

impl<T> Drop for RcuList<T> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: &mut self means no reader or writer is active; linked
            // nodes are owned by the list.
            let mut node = unsafe { Box::from_raw(cur) };
            cur = *node.next.get_mut();
        }
    }
}

impl<T> fmt::Debug for RcuList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcuList").field("len", &self.len()).finish()
    }
}

/// Iterator over a list under a pinned guard.
pub struct Iter<'g, T> {
    next: *const Node<T>,
    _guard: PhantomData<&'g T>,
}

impl<'g, T> Iterator for Iter<'g, T> {
    type Item = &'g T;

    fn next(&mut self) -> Option<&'g T> {
        if self.next.is_null() {
            return None;
        }
        // SAFETY: the node was reachable after the guard was pinned, so it
        // is not freed before the guard drops ('g).
        let node = unsafe { &*self.next };
        self.next = node.next.load(Ordering::Acquire);
        Some(&node.value)
    }
}

// ============================================================================
// Tests
// ============================================================================
