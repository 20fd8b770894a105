//! Garbage collection of task records
//!
//! The host does not guarantee a task-free notification, so records of tasks
//! that exited silently are found by asking the host whether each task is
//! still alive.
//!
//! # Cadence
//!
//! - Every opportunity while any transition is in flight, so the records of
//!   tasks that died mid-transition do not pile up
//! - Otherwise every `gc_interval`-th opportunity
//!
//! At most one sweep runs at a time; a sweep that finds the lock taken skips
//! the round instead of waiting.

use core::sync::atomic::Ordering;
use lsm_host::Host;

use crate::policy::Policy;
use crate::registry::ContextRegistry;

/// What one sweep did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Task records examined
    pub scanned: usize,
    /// Task records unlinked and retired
    pub retired: usize,
    /// Transitions released because their task died
    pub released_transitions: usize,
    /// Records whose memory was released by this sweep's collection pass
    pub reclaimed: usize,
}

impl<P: Policy> ContextRegistry<P> {
    /// Rate-limited sweep. Returns `None` when this call skipped.
    pub fn sweep<H: Host>(&self, host: &H) -> Option<SweepStats> {
        if self.in_flight() == 0
            && self.gc_counter.fetch_add(1, Ordering::AcqRel) + 1 < self.config().gc_interval
        {
            return None;
        }
        self.sweep_now(host)
    }

    /// Sweep regardless of cadence. Returns `None` if another sweep is
    /// running.
    pub fn sweep_now<H: Host>(&self, host: &H) -> Option<SweepStats> {
        let _lock = self.gc_lock.try_lock()?;
        self.gc_counter.store(0, Ordering::Release);

        let mut stats = SweepStats::default();
        {
            let guard = self.pin();
            for record in self.tasks().iter(&guard) {
                stats.scanned += 1;
                let Some(task) = record.task() else {
                    continue;
                };
                if host.task_alive(task) {
                    continue;
                }
                if self.release_by_kernel(host, record) {
                    stats.released_transitions += 1;
                }
                if self.tasks().remove(record) {
                    stats.retired += 1;
                }
            }
        }
        stats.reclaimed = self.collector().collect();

        if stats.retired > 0 {
            tracing::debug!(
                scanned = stats.scanned,
                retired = stats.retired,
                released = stats.released_transitions,
                reclaimed = stats.reclaimed,
                "task context sweep"
            );
        }
        Some(stats)
    }
}
