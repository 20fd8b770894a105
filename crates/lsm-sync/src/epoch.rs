//! Epoch-based deferred reclamation
//!
//! Readers pin the collector for the duration of a traversal. Writers unlink
//! a node first and then hand it to [`Collector::retire`]; the node is
//! released only after every reader that could still hold a pointer to it has
//! unpinned.
//!
//! # Scheme
//!
//! The global epoch advances monotonically. A pinned reader is counted in one
//! of three reader counters, indexed by `epoch % 3`. The epoch may advance
//! from `e` to `e + 1` only when no reader is counted under `e - 1`, so a
//! reader pinned at `e` holds the global epoch at or below `e + 1`.
//! Garbage retired at epoch `g` is unreachable once the global epoch reaches
//! `g + 2`, and is freed then.
//!
//! # Safety Invariants
//!
//! 1. **Unlink before retire**: a retired pointer is no longer reachable by
//!    readers that pin after the call to `retire`
//! 2. **Retire once**: every pointer is retired at most once
//! 3. **Bounded waits**: `pin` and `collect` never wait on other
//!    threads. `retire` never waits on a pinned reader; it may spin briefly
//!    on the garbage list lock while another thread pushes or collects

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{fence, AtomicUsize, Ordering};
use spin::Mutex;

/// Number of reader counters. Three is the minimum that lets readers of the
/// current epoch coexist with an advance.
const EPOCH_SLOTS: usize = 3;

/// A pointer waiting for its grace period to elapse.
struct Retired {
    ptr: *mut u8,
    drop_fn: unsafe fn(*mut u8),
    epoch: usize,
}

// SAFETY: retired pointers are owned exclusively by the collector once
// retired; `retire` requires the pointee to be Send.
unsafe impl Send for Retired {}

/// Drop a `Box<T>` that was leaked with `Box::into_raw`.
///
/// # Safety
///
/// `ptr` must come from `Box::<T>::into_raw` and must not be used afterwards.
unsafe fn drop_box<T>(ptr: *mut u8) {
    drop(Box::from_raw(ptr as *mut T));
}

/// Epoch-based reclamation domain.
///
/// One collector is shared by every list whose nodes it reclaims. Readers of
/// any of those lists pin the same collector.
pub struct Collector {
    /// Global epoch (monotonic)
    epoch: AtomicUsize,
    /// Pinned readers, indexed by `epoch % EPOCH_SLOTS`
    readers: [AtomicUsize; EPOCH_SLOTS],
    /// Retired pointers not yet released
    garbage: Mutex<Vec<Retired>>,
    /// Total pointers ever retired
    retired_total: AtomicUsize,
    /// Total pointers released
    reclaimed_total: AtomicUsize,
}

impl Collector {
    /// Create a collector at epoch 0 with no readers.
    pub const fn new() -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
            garbage: Mutex::new(Vec::new()),
            retired_total: AtomicUsize::new(0),
            reclaimed_total: AtomicUsize::new(0),
        }
    }

    /// Enter a read-side critical section.
    ///
    /// Pointers loaded from lists reclaimed by this collector stay valid
    /// until the returned guard is dropped. Retries only while the epoch
    /// advances underneath the caller.
    pub fn pin(&self) -> Guard<'_> {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let slot = epoch % EPOCH_SLOTS;
            self.readers[slot].fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return Guard {
                    collector: self,
                    slot,
                };
            }
            // Registered under a stale epoch; back out and retry.
            self.readers[slot].fetch_sub(1, Ordering::SeqCst);
            core::hint::spin_loop();
        }
    }

    /// Schedule `ptr` for release after the current grace period.
    ///
    /// Spins on the garbage list lock if another thread holds it. That lock
    /// is held only for a push or a single pass by `collect`, never across
    /// a reader's critical section.
    ///
    /// # Safety
    ///
    /// - `ptr` must come from `Box::<T>::into_raw`
    /// - `ptr` must already be unreachable for readers that pin from now on
    /// - `ptr` must not be retired twice or freed by anyone else
    pub unsafe fn retire<T: Send>(&self, ptr: *mut T) {
        // Order the caller's unlink before sampling the epoch.
        fence(Ordering::SeqCst);
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.garbage.lock().push(Retired {
            ptr: ptr as *mut u8,
            drop_fn: drop_box::<T>,
            epoch,
        });
        self.retired_total.fetch_add(1, Ordering::Relaxed);
        self.collect();
    }

    /// Advance the global epoch if no reader is pinned in the previous one.
    ///
    /// Returns true if this call advanced the epoch.
    pub fn try_advance(&self) -> bool {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let previous = (epoch + EPOCH_SLOTS - 1) % EPOCH_SLOTS;
        if self.readers[previous].load(Ordering::SeqCst) != 0 {
            return false;
        }
        self.epoch
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Try to advance the epoch and release every pointer whose grace
    /// period has elapsed.
    ///
    /// Returns the number of pointers released. A contended garbage list is
    /// skipped, not waited on.
    pub fn collect(&self) -> usize {
        self.try_advance();
        let epoch = self.epoch.load(Ordering::SeqCst);

        let ready = {
            let mut garbage = match self.garbage.try_lock() {
                Some(garbage) => garbage,
                None => return 0,
            };
            let mut ready = Vec::new();
            let mut i = 0;
            while i < garbage.len() {
                if garbage[i].epoch + 2 <= epoch {
                    ready.push(garbage.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            ready
        };

        let released = ready.len();
        for retired in ready {
            // SAFETY: the grace period for this pointer has elapsed, so no
            // reader holds it, and it was retired exactly once.
            unsafe { (retired.drop_fn)(retired.ptr) };
        }
        self.reclaimed_total.fetch_add(released, Ordering::Relaxed);
        released
    }

    /// Run `rounds` collection passes. With no pinned readers two rounds
    /// release everything retired before the call.
    pub fn flush(&self, rounds: usize) -> usize {
        (0..rounds).map(|_| self.collect()).sum()
    }

    /// Current global epoch (for debugging/verification)
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Number of retired pointers waiting for their grace period
    pub fn pending(&self) -> usize {
        self.garbage.lock().len()
    }

    /// Number of readers currently pinned
    pub fn active_readers(&self) -> usize {
        self.readers.iter().map(|r| r.load(Ordering::SeqCst)).sum()
    }

    /// Total pointers ever retired
    pub fn retired_total(&self) -> usize {
        self.retired_total.load(Ordering::Relaxed)
    }

    /// Total pointers released
    pub fn reclaimed_total(&self) -> usize {
        self.reclaimed_total.load(Ordering::Relaxed)
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        // &mut self: no guard can be alive, every grace period has elapsed.
        for retired in self.garbage.get_mut().drain(..) {
            // SAFETY: see above; each pointer was retired exactly once.
            unsafe { (retired.drop_fn)(retired.ptr) };
        }
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("epoch", &self.epoch())
            .field("active_readers", &self.active_readers())
            .field("retired_total", &self.retired_total())
            .field("reclaimed_total", &self.reclaimed_total())
            .finish()
    }
}

/// A pinned read-side critical section.
///
/// References handed out by lists while this guard is alive are bounded by
/// its lifetime.
pub struct Guard<'c> {
    collector: &'c Collector,
    slot: usize,
}

impl<'c> Guard<'c> {
    /// The collector this guard pins.
    pub fn collector(&self) -> &'c Collector {
        self.collector
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.collector.readers[self.slot].fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for Guard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("slot", &self.slot).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
