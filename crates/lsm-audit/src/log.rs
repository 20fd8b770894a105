//! Audit Event Log
//!
//! Records the lifecycle of every transition record (start and finish) and
//! any leak reports. Events are append-only with monotonic IDs; the oldest
//! events are trimmed once the log exceeds its capacity. Live-transition
//! accounting is never trimmed.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;
use lsm_host::TaskKey;
use serde::{Deserialize, Serialize};

/// Audit event ID (monotonic)
pub type EventId = u64;

/// Transition record ID (monotonic, assigned by the engine)
pub type TransitionId = u64;

/// Default number of events kept in memory
pub const DEFAULT_AUDIT_CAPACITY: usize = 10000;

/// How a transition ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionOutcome {
    /// The host accepted the new program image
    Committed,
    /// The transition failed (inferred) or its owner died
    Aborted,
}

/// An audit event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Task that owned the transition
    pub task: TaskKey,
    /// Timestamp (nanos since boot)
    pub timestamp: u64,
    /// Event type
    pub kind: AuditEventKind,
}

/// Type of audit event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuditEventKind {
    /// A transition record was allocated
    TransitionStarted {
        /// Transition record ID
        transition: TransitionId,
        /// Program image being evaluated
        image: String,
    },
    /// A transition record was released
    TransitionFinished {
        /// Transition record ID
        transition: TransitionId,
        /// How the transition ended
        outcome: TransitionOutcome,
        /// Released because the owning task disappeared
        released_by_kernel: bool,
    },
    /// A transition record outlived the configured bound
    LeakDetected {
        /// Transition record ID
        transition: TransitionId,
        /// Age at detection time
        age_ns: u64,
    },
}

/// A transition still alive past the leak bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeakReport {
    pub transition: TransitionId,
    pub task: TaskKey,
    pub age_ns: u64,
}

#[derive(Clone, Copy, Debug)]
struct LiveTransition {
    task: TaskKey,
    started_ns: u64,
}

/// Audit log for transition records.
pub struct AuditLog {
    /// Event entries (append-only)
    events: Vec<AuditEvent>,
    /// Next event ID to assign
    next_id: EventId,
    /// Maximum number of events kept
    capacity: usize,
    /// Transitions started but not yet finished
    live: BTreeMap<TransitionId, LiveTransition>,
    /// Live transitions already reported as leaked
    reported: BTreeSet<TransitionId>,
    /// Total transition records allocated
    started_total: u64,
    /// Total transition records released
    finished_total: u64,
}

impl AuditLog {
    /// Create a new empty log with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    /// Create a new empty log keeping at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            next_id: 0,
            capacity,
            live: BTreeMap::new(),
            reported: BTreeSet::new(),
            started_total: 0,
            finished_total: 0,
        }
    }

    fn push(&mut self, task: TaskKey, timestamp: u64, kind: AuditEventKind) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        self.events.push(AuditEvent {
            id,
            task,
            timestamp,
            kind,
        });
        self.trim_if_needed();
        id
    }

    /// Log the allocation of a transition record.
    pub fn transition_started(
        &mut self,
        transition: TransitionId,
        task: TaskKey,
        image: &str,
        timestamp: u64,
    ) -> EventId {
        self.started_total += 1;
        self.live.insert(
            transition,
            LiveTransition {
                task,
                started_ns: timestamp,
            },
        );
        self.push(
            task,
            timestamp,
            AuditEventKind::TransitionStarted {
                transition,
                image: String::from(image),
            },
        )
    }

    /// Log the release of a transition record.
    ///
    /// A second finish for the same transition is ignored and returns `None`.
    pub fn transition_finished(
        &mut self,
        transition: TransitionId,
        task: TaskKey,
        outcome: TransitionOutcome,
        released_by_kernel: bool,
        timestamp: u64,
    ) -> Option<EventId> {
        if self.live.remove(&transition).is_none() {
            tracing::warn!(transition, "audit: finish for unknown transition");
            return None;
        }
        self.reported.remove(&transition);
        self.finished_total += 1;
        Some(self.push(
            task,
            timestamp,
            AuditEventKind::TransitionFinished {
                transition,
                outcome,
                released_by_kernel,
            },
        ))
    }

    /// Report every live transition older than `max_age_ns`.
    ///
    /// Each leaked transition is logged once; the returned list always
    /// contains every transition currently past the bound.
    pub fn check_leaks(&mut self, now: u64, max_age_ns: u64) -> Vec<LeakReport> {
        let leaks: Vec<LeakReport> = self
            .live
            .iter()
            .filter_map(|(&transition, live)| {
                let age_ns = now.saturating_sub(live.started_ns);
                (age_ns > max_age_ns).then_some(LeakReport {
                    transition,
                    task: live.task,
                    age_ns,
                })
            })
            .collect();

        for leak in &leaks {
            if self.reported.insert(leak.transition) {
                tracing::warn!(
                    transition = leak.transition,
                    task = ?leak.task,
                    age_ns = leak.age_ns,
                    "audit: transition record leaked"
                );
                self.push(
                    leak.task,
                    now,
                    AuditEventKind::LeakDetected {
                        transition: leak.transition,
                        age_ns: leak.age_ns,
                    },
                );
            }
        }
        leaks
    }

    /// Number of transitions started but not finished.
    pub fn live_transitions(&self) -> usize {
        self.live.len()
    }

    /// Total transition records allocated.
    pub fn started_total(&self) -> u64 {
        self.started_total
    }

    /// Total transition records released.
    pub fn finished_total(&self) -> u64 {
        self.finished_total
    }

    /// Get all events.
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// Get the most recent N events.
    pub fn get_recent(&self, count: usize) -> Vec<&AuditEvent> {
        self.events.iter().rev().take(count).collect()
    }

    /// Get the number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Trim old events if exceeding capacity.
    fn trim_if_needed(&mut self) {
        if self.events.len() > self.capacity {
            let drain_count = self.events.len() - self.capacity;
            self.events.drain(0..drain_count);
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
