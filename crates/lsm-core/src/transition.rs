//! Transition protocol
//!
//! A transition covers the window in which a task replaces its program
//! image. The task switches to the new domain as soon as the transition
//! starts, so the new image's interpreter and environment are checked
//! against the new domain, and must switch back if the replacement fails.
//!
//! ```text
//! NONE ──begin──▶ PENDING ──commit──▶ COMMITTED ──▶ NONE
//!                    │
//!                    └──inferred abort / owner died──▶ ABORTED ──▶ NONE
//! ```
//!
//! The host never reports a failed replacement. Abort is inferred when:
//! 1. the task is looked up while `IN_TRANSITION` is set but the host no
//!    longer shows the task inside a replacement
//! 2. the credential set prepared for the new image is freed with no other
//!    referrer
//!
//! Every path detaches the transition record with a take under the owning
//! record's lock; only the path that gets it performs the reconciliation.
//!
//! # Residual race
//!
//! Inference (1) compares our flag with the host's own indicator, which the
//! host clears when a replacement ends and sets again only after the next
//! one has prepared its credentials (and so looked the task up). A host that
//! sets the indicator before that first lookup hides the failed transition:
//! the next `begin` finds it still pending and becomes a no-op, the new image
//! is evaluated in the stale domain, and the stale record is released when
//! the new replacement commits or aborts.

use alloc::boxed::Box;
use core::sync::atomic::Ordering;
use lsm_audit::{TransitionId, TransitionOutcome};
use lsm_host::{CredKey, Host, TaskKey};
use lsm_sync::{try_box, Guard};

use crate::error::ContextError;
use crate::policy::Policy;
use crate::record::ContextRecord;
use crate::registry::ContextRegistry;
use crate::types::{ContextFlags, DomainId, ProgramImage};

/// State of one in-flight transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionRecord {
    pub id: TransitionId,
    /// Task replacing its image
    pub task: TaskKey,
    /// Domain to restore on abort
    pub previous_domain: DomainId,
    /// Flags to restore on abort
    pub previous_flags: ContextFlags,
    /// Image being evaluated, with its handler
    pub image: ProgramImage,
    /// Credential set prepared for the new image
    pub pending_cred: Option<CredKey>,
    pub started_ns: u64,
}

/// What detaching a transition does to its owner record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reconcile {
    /// Keep the new domain, clear `IN_TRANSITION`
    Commit,
    /// Restore the saved domain and flags
    Revert,
}

impl<P: Policy> ContextRegistry<P> {
    /// Start a transition for the current task.
    ///
    /// # Returns
    /// * `Ok(id)` - The task now runs in the policy's next domain
    /// * `Err(DoubleTransition)` - One is already pending; nothing changed
    /// * `Err(AllocationFailure)` - The current task only has a sentinel, or
    ///   the transition record could not be allocated
    /// * `Err(PolicyDenied)` - The policy refused the image
    pub fn begin_transition<H: Host>(
        &self,
        host: &H,
        image: ProgramImage,
        pending_cred: Option<CredKey>,
    ) -> Result<TransitionId, ContextError> {
        let guard = self.pin();
        let task = host.current_task();
        let record = self.lookup_or_create(host, task, &guard);
        if record.is_sentinel() {
            return Err(ContextError::AllocationFailure);
        }
        if record.has_transition() {
            return Err(ContextError::DoubleTransition);
        }

        let (previous_domain, flags) = (record.domain(), record.flags());
        let next = self
            .policy()
            .begin_transition(previous_domain, &image)
            .map_err(ContextError::PolicyDenied)?;

        let id = self.next_transition.fetch_add(1, Ordering::Relaxed);
        let started_ns = host.now_nanos();
        let transition = try_box(TransitionRecord {
            id,
            task,
            previous_domain,
            previous_flags: flags.inheritable(),
            image,
            pending_cred,
            started_ns,
        })
        .map_err(|_| ContextError::AllocationFailure)?;

        record.install_transition(transition, next, |t| {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            self.audit
                .lock()
                .transition_started(t.id, t.task, &t.image.path, t.started_ns);
        })?;

        tracing::debug!(?task, transition = id, from = ?previous_domain, to = ?next, "transition started");
        Ok(id)
    }

    /// The host accepted the new image of the current task.
    ///
    /// Releases the pending transition, if any, then copies the task's
    /// domain and flags onto `new_cred` so children forked from the new image
    /// inherit them.
    pub fn commit_transition<H: Host>(&self, host: &H, new_cred: CredKey) -> Result<(), ContextError> {
        let guard = self.pin();
        let record = self.current_context(host, &guard);
        if record.is_sentinel() {
            return Err(ContextError::MissingContext);
        }
        if let Some(transition) = record.take_transition(Reconcile::Commit) {
            tracing::debug!(task = ?transition.task, transition = transition.id, "transition committed");
            self.finish(host, transition, TransitionOutcome::Committed, false);
        }

        let (domain, flags) = record.inheritable();
        self.set_cred(new_cred, domain, flags, &guard)?;
        Ok(())
    }

    /// Abort inference on lookup of the current task.
    pub(crate) fn infer_abort<H: Host>(&self, host: &H, task: TaskKey, record: &ContextRecord) {
        if !record.in_transition() || host.in_transition(task) {
            return;
        }
        if let Some(transition) = record.take_transition(Reconcile::Revert) {
            tracing::debug!(?task, transition = transition.id, "inferred aborted transition");
            self.finish(host, transition, TransitionOutcome::Aborted, false);
        }
    }

    /// Reconcile a transition whose owner is gone.
    pub(crate) fn release_by_kernel<H: Host>(&self, host: &H, record: &ContextRecord) -> bool {
        match record.take_transition(Reconcile::Revert) {
            Some(transition) => {
                tracing::debug!(
                    task = ?transition.task,
                    transition = transition.id,
                    "transition released with its task"
                );
                self.finish(host, transition, TransitionOutcome::Aborted, true);
                true
            }
            None => false,
        }
    }

    /// Account for a detached transition record and drop it.
    pub(crate) fn finish<H: Host>(
        &self,
        host: &H,
        transition: Box<TransitionRecord>,
        outcome: TransitionOutcome,
        released_by_kernel: bool,
    ) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.audit.lock().transition_finished(
            transition.id,
            transition.task,
            outcome,
            released_by_kernel,
            host.now_nanos(),
        );
        self.policy().finish_transition(&transition, outcome);
    }

    /// Report transition records older than `transition_leak_ns`.
    ///
    /// Leaks are audit-only. Returns the oldest leak as an error.
    pub fn check_leaks<H: Host>(&self, host: &H) -> Result<(), ContextError> {
        let leaks = self
            .audit
            .lock()
            .check_leaks(host.now_nanos(), self.config().transition_leak_ns);
        match leaks.iter().max_by_key(|leak| leak.age_ns) {
            Some(oldest) => Err(ContextError::LeakDetected {
                id: oldest.transition,
                age_ns: oldest.age_ns,
            }),
            None => Ok(()),
        }
    }

    /// Transition ID attached to the record of `task`, if any.
    pub fn pending_transition(&self, task: TaskKey, guard: &Guard<'_>) -> Option<TransitionId> {
        self.find_task(task, guard)
            .and_then(|record| record.with_transition(|t| t.map(|t| t.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::DenyReason;
    use crate::policy::{Decision, Operation};
    use crate::record::DEFAULT_CONTEXT;
    use alloc::vec::Vec;
    use lsm_audit::AuditEventKind;
    use lsm_host_mock::{MockHost, INIT_CRED, INIT_TASK};
    use spin::Mutex;

    /// Moves every task to `domain + 100`; refuses "/bin/forbidden".
    #[derive(Default)]
    struct Shift {
        finished: Mutex<Vec<(TransitionId, TransitionOutcome)>>,
    }

    impl Policy for Shift {
        fn evaluate(&self, _domain: DomainId, _op: &Operation<'_>) -> Decision {
            Decision::Allow
        }

        fn begin_transition(&self, domain: DomainId, image: &ProgramImage) -> Result<DomainId, DenyReason> {
            if image.path == "/bin/forbidden" {
                return Err(DenyReason::PermissionDenied);
            }
            Ok(DomainId(domain.0 + 100))
        }

        fn finish_transition(&self, transition: &TransitionRecord, outcome: TransitionOutcome) {
            self.finished.lock().push((transition.id, outcome));
        }
    }

    fn setup() -> (MockHost, ContextRegistry<Shift>) {
        let host = MockHost::new();
        let reg = ContextRegistry::new(Shift::default(), EngineConfig::default()).unwrap();
        {
            let guard = reg.pin();
            reg.set_cred(INIT_CRED, DomainId(1), ContextFlags::POLICY_MANAGER, &guard)
                .unwrap();
        }
        (host, reg)
    }

    fn task_state(reg: &ContextRegistry<Shift>) -> (DomainId, ContextFlags, bool) {
        let guard = reg.pin();
        let record = reg.find_task(INIT_TASK, &guard).unwrap();
        (record.domain(), record.flags(), record.has_transition())
    }

    #[test]
    fn test_begin_switches_domain() {
        let (host, reg) = setup();
        host.set_in_execve(INIT_TASK, true);
        let id = reg
            .begin_transition(&host, ProgramImage::new("/bin/ls"), None)
            .unwrap();

        let (domain, flags, attached) = task_state(&reg);
        assert_eq!(domain, DomainId(101));
        assert!(flags.contains(ContextFlags::IN_TRANSITION | ContextFlags::POLICY_MANAGER));
        assert!(attached);
        assert_eq!(reg.in_flight(), 1);
        let guard = reg.pin();
        assert_eq!(reg.pending_transition(INIT_TASK, &guard), Some(id));
    }

    #[test]
    fn test_double_begin_is_noop() {
        let (host, reg) = setup();
        host.set_in_execve(INIT_TASK, true);
        reg.begin_transition(&host, ProgramImage::new("/bin/ls"), None)
            .unwrap();
        assert_eq!(
            reg.begin_transition(&host, ProgramImage::new("/bin/ls"), None),
            Err(ContextError::DoubleTransition)
        );
        assert_eq!(reg.in_flight(), 1);
        assert_eq!(task_state(&reg).0, DomainId(101));
    }

    #[test]
    fn test_policy_refusal_leaves_none() {
        let (host, reg) = setup();
        host.set_in_execve(INIT_TASK, true);
        assert_eq!(
            reg.begin_transition(&host, ProgramImage::new("/bin/forbidden"), None),
            Err(ContextError::PolicyDenied(DenyReason::PermissionDenied))
        );
        let (domain, flags, attached) = task_state(&reg);
        assert_eq!(domain, DomainId(1));
        assert!(!flags.contains(ContextFlags::IN_TRANSITION));
        assert!(!attached);
        assert_eq!(reg.in_flight(), 0);
    }

    #[test]
    fn test_commit_propagates_to_new_cred() {
        let (host, reg) = setup();
        let new_cred = host.new_cred();
        reg.prepare_cred(&host, new_cred, INIT_CRED).unwrap();
        host.set_in_execve(INIT_TASK, true);
        reg.begin_transition(&host, ProgramImage::new("/bin/ls"), Some(new_cred))
            .unwrap();

        reg.commit_transition(&host, new_cred).unwrap();
        host.set_in_execve(INIT_TASK, false);

        let (domain, flags, attached) = task_state(&reg);
        assert_eq!(domain, DomainId(101));
        assert!(!flags.contains(ContextFlags::IN_TRANSITION));
        assert!(!attached);
        assert_eq!(reg.in_flight(), 0);

        let guard = reg.pin();
        let cred = reg.find_cred(new_cred, &guard);
        assert_eq!(cred.domain(), DomainId(101));
        assert!(!cred.in_transition());
        assert_eq!(reg.policy().finished.lock()[0].1, TransitionOutcome::Committed);
    }

    #[test]
    fn test_abort_inferred_on_lookup_once() {
        let (host, reg) = setup();
        host.set_in_execve(INIT_TASK, true);
        reg.begin_transition(&host, ProgramImage::new("/bin/ls"), None)
            .unwrap();
        host.set_in_execve(INIT_TASK, false);

        for _ in 0..2 {
            let guard = reg.pin();
            let record = reg.current_context(&host, &guard);
            assert_eq!(record.domain(), DomainId(1));
            assert_eq!(record.flags(), ContextFlags::POLICY_MANAGER);
        }
        assert_eq!(reg.in_flight(), 0);
        assert_eq!(reg.policy().finished.lock().len(), 1);
        reg.with_audit(|log| {
            assert_eq!(log.finished_total(), 1);
            assert!(matches!(
                log.events().last().unwrap().kind,
                AuditEventKind::TransitionFinished {
                    outcome: TransitionOutcome::Aborted,
                    released_by_kernel: false,
                    ..
                }
            ));
        });
    }

    #[test]
    fn test_lookup_during_transition_keeps_it() {
        let (host, reg) = setup();
        host.set_in_execve(INIT_TASK, true);
        reg.begin_transition(&host, ProgramImage::new("/bin/ls"), None)
            .unwrap();
        let guard = reg.pin();
        assert_eq!(reg.current_context(&host, &guard).domain(), DomainId(101));
        assert_eq!(reg.in_flight(), 1);
    }

    #[test]
    fn test_abort_inferred_on_pending_cred_free() {
        let (host, reg) = setup();
        let new_cred = host.new_cred();
        reg.prepare_cred(&host, new_cred, INIT_CRED).unwrap();
        host.set_in_execve(INIT_TASK, true);
        reg.begin_transition(&host, ProgramImage::new("/bin/ls"), Some(new_cred))
            .unwrap();

        // Still flagged in the host; only the credential release reveals the failure.
        assert!(reg.free_cred(&host, new_cred));
        assert_eq!(reg.in_flight(), 0);
        assert_eq!(task_state(&reg).0, DomainId(1));
    }

    #[test]
    fn test_shared_pending_cred_not_reverted() {
        let (host, reg) = setup();
        let new_cred = host.new_cred();
        host.get_cred(new_cred);
        reg.prepare_cred(&host, new_cred, INIT_CRED).unwrap();
        host.set_in_execve(INIT_TASK, true);
        reg.begin_transition(&host, ProgramImage::new("/bin/ls"), Some(new_cred))
            .unwrap();

        reg.free_cred(&host, new_cred);
        assert_eq!(reg.in_flight(), 1);
    }

    #[test]
    fn test_sentinel_rejects_transition() {
        let host = MockHost::new();
        let reg = ContextRegistry::new(
            Shift::default(),
            EngineConfig {
                max_task_records: Some(1),
                ..EngineConfig::default()
            },
        )
        .unwrap();
        let other = host.spawn_task(INIT_CRED);
        {
            let guard = reg.pin();
            reg.current_context(&host, &guard);
        }
        host.run_as(other, || {
            assert_eq!(
                reg.begin_transition(&host, ProgramImage::new("/bin/ls"), None),
                Err(ContextError::AllocationFailure)
            );
        });
        assert_eq!(reg.in_flight(), 0);
    }

    #[test]
    fn test_task_free_releases_by_kernel() {
        let (host, reg) = setup();
        host.set_in_execve(INIT_TASK, true);
        reg.begin_transition(&host, ProgramImage::new("/bin/ls"), None)
            .unwrap();
        assert!(reg.task_free(&host, INIT_TASK));
        assert_eq!(reg.in_flight(), 0);
        reg.with_audit(|log| {
            assert!(matches!(
                log.events().last().unwrap().kind,
                AuditEventKind::TransitionFinished {
                    released_by_kernel: true,
                    ..
                }
            ));
        });
    }

    #[test]
    fn test_leak_detection() {
        let (host, reg) = setup();
        host.set_in_execve(INIT_TASK, true);
        let id = reg
            .begin_transition(&host, ProgramImage::new("/bin/hang"), None)
            .unwrap();
        assert_eq!(reg.check_leaks(&host), Ok(()));

        host.advance_time(reg.config().transition_leak_ns + 1);
        assert_eq!(
            reg.check_leaks(&host),
            Err(ContextError::LeakDetected {
                id,
                age_ns: reg.config().transition_leak_ns + 1
            })
        );
    }

    #[test]
    fn test_commit_from_sentinel() {
        let host = MockHost::new();
        let reg = ContextRegistry::new(
            Shift::default(),
            EngineConfig {
                max_task_records: Some(1),
                ..EngineConfig::default()
            },
        )
        .unwrap();
        let other = host.spawn_task(INIT_CRED);
        {
            let guard = reg.pin();
            reg.current_context(&host, &guard);
        }
        let new_cred = host.new_cred();
        host.run_as(other, || {
            assert_eq!(
                reg.commit_transition(&host, new_cred),
                Err(ContextError::MissingContext)
            );
        });
        let guard = reg.pin();
        assert!(core::ptr::eq(reg.find_cred(new_cred, &guard), &DEFAULT_CONTEXT));
    }
}
