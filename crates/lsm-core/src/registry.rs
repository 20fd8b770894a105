//! Context registry
//!
//! Owns the two context tables (task-keyed and credential-keyed), the shared
//! reclamation collector, the process-wide in-flight transition counter and
//! the GC cadence counter. Every lifecycle notification from the host lands
//! here, and the exports used by the policy engine (`current_context`,
//! `context_for`, `is_domain_referenced`) are answered from here.
//!
//! # Lookup rules
//!
//! - A task record exists: return it. If the task is the current one, run
//!   abort inference first.
//! - No record, current task: create one seeded from the current credential
//!   set's record. If that fails, terminate the current task and return the
//!   out-of-memory sentinel.
//! - No record, another task: return that task's credential record as a
//!   read-only snapshot, or the default sentinel.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use lsm_audit::{AuditLog, TransitionOutcome};
use lsm_host::{CredKey, Host, TaskKey};
use lsm_sync::{Collector, Guard};
use spin::Mutex;

use crate::config::EngineConfig;
use crate::error::{ConfigError, ContextError};
use crate::policy::Policy;
use crate::record::{ContextRecord, Owner, DEFAULT_CONTEXT, OUT_OF_MEMORY_CONTEXT};
use crate::table::ContextTable;
use crate::transition::Reconcile;
use crate::types::{ContextFlags, DomainId, SentinelKind};

/// Both context tables plus the process-wide engine counters.
pub struct ContextRegistry<P: Policy> {
    collector: Arc<Collector>,
    tasks: ContextTable<TaskKey>,
    creds: ContextTable<CredKey>,
    policy: P,
    config: EngineConfig,
    /// Transition records currently attached to a record
    pub(crate) in_flight: AtomicUsize,
    /// Calls since the last sweep
    pub(crate) gc_counter: AtomicUsize,
    /// Held by the one sweep that may run at a time
    pub(crate) gc_lock: Mutex<()>,
    pub(crate) next_transition: AtomicU64,
    pub(crate) audit: Mutex<AuditLog>,
}

impl<P: Policy> ContextRegistry<P> {
    /// Create a registry with empty tables.
    pub fn new(policy: P, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let collector = Arc::new(Collector::new());
        let tasks = ContextTable::new(config.hash_bits, &collector);
        let creds = ContextTable::new(config.hash_bits, &collector);
        let audit = Mutex::new(AuditLog::with_capacity(config.audit_capacity));

        tracing::info!(
            buckets = config.bucket_count(),
            gc_interval = config.gc_interval,
            "context registry initialized"
        );

        Ok(Self {
            collector,
            tasks,
            creds,
            policy,
            config,
            in_flight: AtomicUsize::new(0),
            gc_counter: AtomicUsize::new(0),
            gc_lock: Mutex::new(()),
            next_transition: AtomicU64::new(1),
            audit,
        })
    }

    /// Enter a read-side critical section covering both tables.
    pub fn pin(&self) -> Guard<'_> {
        self.collector.pin()
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn tasks(&self) -> &ContextTable<TaskKey> {
        &self.tasks
    }

    pub fn creds(&self) -> &ContextTable<CredKey> {
        &self.creds
    }

    /// Number of transitions currently pending
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Inspect the audit log.
    pub fn with_audit<R>(&self, f: impl FnOnce(&AuditLog) -> R) -> R {
        f(&self.audit.lock())
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// The record bound to `task`, without creating one.
    pub fn find_task<'g>(&'g self, task: TaskKey, guard: &'g Guard<'_>) -> Option<&'g ContextRecord> {
        self.tasks.find(task, guard)
    }

    /// The record bound to `cred`, or the default sentinel.
    pub fn find_cred<'g>(&'g self, cred: CredKey, guard: &'g Guard<'_>) -> &'g ContextRecord {
        self.creds.find(cred, guard).unwrap_or(&DEFAULT_CONTEXT)
    }

    /// Find the record for `task`, creating it if `task` is the current task.
    ///
    /// Never fails: the worst case is a sentinel.
    pub fn lookup_or_create<'g, H: Host>(
        &'g self,
        host: &H,
        task: TaskKey,
        guard: &'g Guard<'_>,
    ) -> &'g ContextRecord {
        let is_current = task == host.current_task();

        if let Some(record) = self.tasks.find(task, guard) {
            if is_current {
                self.infer_abort(host, task, record);
            }
            return record;
        }

        if !is_current {
            return match host.task_cred(task) {
                Some(cred) => self.find_cred(cred, guard),
                None => &DEFAULT_CONTEXT,
            };
        }

        let (domain, flags) = self.find_cred(host.current_cred(), guard).inheritable();
        match self.insert_task(task, domain, flags, guard) {
            Ok(record) => record,
            // Another path created it first.
            Err(ContextError::Duplicate) => self
                .tasks
                .find(task, guard)
                .unwrap_or(&OUT_OF_MEMORY_CONTEXT),
            Err(err) => {
                tracing::warn!(?task, error = %err, "unable to allocate security context");
                if let Err(kill) = host.kill_current() {
                    tracing::warn!(?task, error = %kill, "unable to terminate task without context");
                }
                &OUT_OF_MEMORY_CONTEXT
            }
        }
    }

    /// Record of the current task.
    pub fn current_context<'g, H: Host>(&'g self, host: &H, guard: &'g Guard<'_>) -> &'g ContextRecord {
        self.lookup_or_create(host, host.current_task(), guard)
    }

    /// Record governing `task` (its own, its credential's, or a sentinel).
    pub fn context_for<'g, H: Host>(
        &'g self,
        host: &H,
        task: TaskKey,
        guard: &'g Guard<'_>,
    ) -> &'g ContextRecord {
        self.lookup_or_create(host, task, guard)
    }

    /// Check whether any record, or any pending transition's saved domain,
    /// still refers to `domain`.
    pub fn is_domain_referenced(&self, domain: DomainId) -> bool {
        let guard = self.pin();
        let refers = |record: &ContextRecord| {
            record.domain() == domain
                || record.with_transition(|t| t.is_some_and(|t| t.previous_domain == domain))
        };
        self.creds.iter(&guard).any(refers) || self.tasks.iter(&guard).any(refers)
    }

    // ========================================================================
    // Record creation
    // ========================================================================

    pub(crate) fn insert_task<'g>(
        &'g self,
        task: TaskKey,
        domain: DomainId,
        flags: ContextFlags,
        guard: &'g Guard<'_>,
    ) -> Result<&'g ContextRecord, ContextError> {
        self.tasks.insert_bounded(
            ContextRecord::new(Owner::Task(task), domain, flags),
            self.config.max_task_records,
            guard,
        )
    }

    /// Set the state of `cred`'s record, creating the record if needed.
    pub(crate) fn set_cred<'g>(
        &'g self,
        cred: CredKey,
        domain: DomainId,
        flags: ContextFlags,
        guard: &'g Guard<'_>,
    ) -> Result<&'g ContextRecord, ContextError> {
        if let Some(record) = self.creds.find(cred, guard) {
            record.assign(domain, flags)?;
            return Ok(record);
        }
        match self.creds.insert_bounded(
            ContextRecord::new(Owner::Cred(cred), domain, flags),
            self.config.max_cred_records,
            guard,
        ) {
            Err(ContextError::Duplicate) => {
                let record = self
                    .creds
                    .find(cred, guard)
                    .ok_or(ContextError::MissingContext)?;
                record.assign(domain, flags)?;
                Ok(record)
            }
            other => other,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// A task was created by the current task: give it a copy of the
    /// parent's state.
    pub fn task_alloc<H: Host>(&self, host: &H, child: TaskKey) -> Result<(), ContextError> {
        let guard = self.pin();
        let parent = self.current_context(host, &guard);
        if parent.sentinel_kind() == Some(SentinelKind::OutOfMemory) {
            return Err(ContextError::AllocationFailure);
        }
        let (domain, flags) = parent.inheritable();

        match self.insert_task(child, domain, flags, &guard) {
            Ok(_) => Ok(()),
            Err(ContextError::Duplicate) => {
                // Handle reused before the GC saw the previous owner die.
                if let Some(stale) = self.tasks.find(child, &guard) {
                    self.release_by_kernel(host, stale);
                    self.tasks.remove(stale);
                }
                self.insert_task(child, domain, flags, &guard).map(|_| ())
            }
            Err(err) => Err(err),
        }
    }

    /// A task is being destroyed.
    ///
    /// Returns true if a record was retired.
    pub fn task_free<H: Host>(&self, host: &H, task: TaskKey) -> bool {
        let guard = self.pin();
        match self.tasks.find(task, &guard) {
            Some(record) => {
                self.release_by_kernel(host, record);
                self.tasks.remove(record)
            }
            None => false,
        }
    }

    /// A credential set `new` is being prepared as a copy of `old`.
    pub fn prepare_cred<H: Host>(&self, host: &H, new: CredKey, old: CredKey) -> Result<(), ContextError> {
        {
            let guard = self.pin();
            // Lookup of the current task doubles as the abort check.
            self.current_context(host, &guard);
            let (domain, flags) = self.find_cred(old, &guard).inheritable();
            self.set_cred(new, domain, flags, &guard)?;
        }
        self.sweep(host);
        Ok(())
    }

    /// A blank credential set `new` was allocated.
    pub fn alloc_blank_cred(&self, new: CredKey) -> Result<(), ContextError> {
        let guard = self.pin();
        self.set_cred(new, DomainId::KERNEL, ContextFlags::empty(), &guard)
            .map(|_| ())
    }

    /// The state of `old` is transferred onto the existing set `new`.
    pub fn transfer_cred(&self, new: CredKey, old: CredKey) -> Result<(), ContextError> {
        let guard = self.pin();
        let (domain, flags) = self.find_cred(old, &guard).inheritable();
        self.set_cred(new, domain, flags, &guard).map(|_| ())
    }

    /// A credential set is being destroyed.
    ///
    /// If it was created for a pending transition and nothing else refers to
    /// it, the transition failed and is reverted before the record goes.
    /// Returns true if a record was retired.
    pub fn free_cred<H: Host>(&self, host: &H, cred: CredKey) -> bool {
        let guard = self.pin();
        if self.in_flight() > 0 && host.cred_usage(cred) <= 1 {
            for record in self.tasks.iter(&guard) {
                let taken = record.take_transition_if(Reconcile::Revert, |t| {
                    t.pending_cred == Some(cred)
                });
                if let Some(transition) = taken {
                    tracing::debug!(
                        ?cred,
                        transition = transition.id,
                        "pending credential freed, reverting transition"
                    );
                    self.finish(host, transition, TransitionOutcome::Aborted, false);
                }
            }
        }
        match self.creds.find(cred, &guard) {
            Some(record) => self.creds.remove(record),
            None => false,
        }
    }
}
