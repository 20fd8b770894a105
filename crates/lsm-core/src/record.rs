//! Context records
//!
//! A `ContextRecord` is the MAC state bound to one task or one credential
//! set. Readers load `domain` and `flags` lock-free. The transition slot sits
//! behind a narrow spin lock, and every change to the `IN_TRANSITION` bit
//! happens under that same lock, so the bit and the slot always agree.
//!
//! Two static sentinels stand in when no real record can be returned. They
//! are never inserted into a table, never retired and never mutated.

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use lsm_host::{CredKey, TaskKey};
use spin::Mutex;

use crate::error::ContextError;
use crate::transition::{Reconcile, TransitionRecord};
use crate::types::{ContextFlags, DomainId, SentinelKind};

/// Returned for the current task when its record could not be allocated.
pub static OUT_OF_MEMORY_CONTEXT: ContextRecord = ContextRecord::sentinel(SentinelKind::OutOfMemory);

/// Returned for identities that have no record of their own.
pub static DEFAULT_CONTEXT: ContextRecord = ContextRecord::sentinel(SentinelKind::Default);

/// The identity a record is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    Task(TaskKey),
    Cred(CredKey),
    Sentinel(SentinelKind),
}

/// Mutable MAC state bound to one identity.
pub struct ContextRecord {
    owner: Owner,
    domain: AtomicU64,
    flags: AtomicU32,
    transition: Mutex<Option<Box<TransitionRecord>>>,
    retired: AtomicBool,
}

impl ContextRecord {
    const fn sentinel(kind: SentinelKind) -> Self {
        Self {
            owner: Owner::Sentinel(kind),
            domain: AtomicU64::new(DomainId::KERNEL.0),
            flags: AtomicU32::new(0),
            transition: Mutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    /// A fresh record. `IN_TRANSITION` is never inherited.
    pub(crate) fn new(owner: Owner, domain: DomainId, flags: ContextFlags) -> Self {
        Self {
            owner,
            domain: AtomicU64::new(domain.0),
            flags: AtomicU32::new(flags.inheritable().bits()),
            transition: Mutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// The task this record belongs to, if task-keyed
    pub fn task(&self) -> Option<TaskKey> {
        match self.owner {
            Owner::Task(task) => Some(task),
            _ => None,
        }
    }

    /// The credential set this record belongs to, if credential-keyed
    pub fn cred(&self) -> Option<CredKey> {
        match self.owner {
            Owner::Cred(cred) => Some(cred),
            _ => None,
        }
    }

    pub fn sentinel_kind(&self) -> Option<SentinelKind> {
        match self.owner {
            Owner::Sentinel(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self.owner, Owner::Sentinel(_))
    }

    /// Current policy domain
    pub fn domain(&self) -> DomainId {
        DomainId(self.domain.load(Ordering::Acquire))
    }

    /// Current status flags
    pub fn flags(&self) -> ContextFlags {
        ContextFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Domain and the flags a copy of this record would start with
    pub fn inheritable(&self) -> (DomainId, ContextFlags) {
        (self.domain(), self.flags().inheritable())
    }

    /// Check the transition-in-progress flag
    pub fn in_transition(&self) -> bool {
        self.flags().contains(ContextFlags::IN_TRANSITION)
    }

    /// Check if a transition record is attached
    pub fn has_transition(&self) -> bool {
        self.transition.lock().is_some()
    }

    /// Inspect the attached transition record under the record lock.
    pub fn with_transition<R>(&self, f: impl FnOnce(Option<&TransitionRecord>) -> R) -> R {
        f(self.transition.lock().as_deref())
    }

    /// Flags and slot read together under the record lock
    pub(crate) fn transition_state(&self) -> (ContextFlags, bool) {
        let slot = self.transition.lock();
        (self.flags(), slot.is_some())
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn mark_retired(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Overwrite domain and flags, keeping `IN_TRANSITION` consistent with
    /// the transition slot.
    pub(crate) fn assign(&self, domain: DomainId, flags: ContextFlags) -> Result<(), ContextError> {
        if self.is_sentinel() {
            return Err(ContextError::MissingContext);
        }
        if self.is_retired() {
            return Err(ContextError::Retired);
        }
        let slot = self.transition.lock();
        let mut flags = flags.inheritable();
        if slot.is_some() {
            flags |= ContextFlags::IN_TRANSITION;
        }
        self.domain.store(domain.0, Ordering::Release);
        self.flags.store(flags.bits(), Ordering::Release);
        Ok(())
    }

    /// Attach a transition record and switch to `next`.
    ///
    /// `on_install` runs under the record lock before the record becomes
    /// visible, so accounting for the transition can never trail its
    /// reconciliation.
    pub(crate) fn install_transition(
        &self,
        transition: Box<TransitionRecord>,
        next: DomainId,
        on_install: impl FnOnce(&TransitionRecord),
    ) -> Result<(), ContextError> {
        if self.is_sentinel() {
            return Err(ContextError::MissingContext);
        }
        let mut slot = self.transition.lock();
        if slot.is_some() {
            return Err(ContextError::DoubleTransition);
        }
        on_install(&transition);
        self.domain.store(next.0, Ordering::Release);
        self.flags
            .fetch_or(ContextFlags::IN_TRANSITION.bits(), Ordering::AcqRel);
        *slot = Some(transition);
        Ok(())
    }

    /// Detach the transition record, if any.
    ///
    /// Only the caller that gets `Some` may act on the transition's end.
    pub(crate) fn take_transition(&self, mode: Reconcile) -> Option<Box<TransitionRecord>> {
        self.take_transition_if(mode, |_| true)
    }

    /// Detach the transition record only if `pred` accepts it.
    pub(crate) fn take_transition_if(
        &self,
        mode: Reconcile,
        pred: impl FnOnce(&TransitionRecord) -> bool,
    ) -> Option<Box<TransitionRecord>> {
        let mut slot = self.transition.lock();
        if !slot.as_deref().is_some_and(pred) {
            return None;
        }
        let transition = slot.take()?;
        match mode {
            Reconcile::Commit => {
                self.flags
                    .fetch_and(!ContextFlags::IN_TRANSITION.bits(), Ordering::AcqRel);
            }
            Reconcile::Revert => {
                self.domain
                    .store(transition.previous_domain.0, Ordering::Release);
                self.flags.store(
                    transition.previous_flags.inheritable().bits(),
                    Ordering::Release,
                );
            }
        }
        Some(transition)
    }
}

impl fmt::Debug for ContextRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRecord")
            .field("owner", &self.owner)
            .field("domain", &self.domain())
            .field("flags", &self.flags())
            .field("retired", &self.is_retired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProgramImage;

    fn transition(previous: DomainId) -> Box<TransitionRecord> {
        Box::new(TransitionRecord {
            id: 1,
            task: TaskKey(1),
            previous_domain: previous,
            previous_flags: ContextFlags::POLICY_MANAGER,
            image: ProgramImage::new("/bin/true"),
            pending_cred: None,
            started_ns: 0,
        })
    }

    #[test]
    fn test_new_masks_in_transition() {
        let record = ContextRecord::new(
            Owner::Task(TaskKey(1)),
            DomainId(3),
            ContextFlags::IN_TRANSITION | ContextFlags::EXECUTE_HANDLER,
        );
        assert_eq!(record.flags(), ContextFlags::EXECUTE_HANDLER);
        assert_eq!(record.domain(), DomainId(3));
    }

    #[test]
    fn test_install_then_commit() {
        let record = ContextRecord::new(
            Owner::Task(TaskKey(1)),
            DomainId(1),
            ContextFlags::POLICY_MANAGER,
        );
        record
            .install_transition(transition(DomainId(1)), DomainId(2), |_| {})
            .unwrap();
        assert_eq!(record.domain(), DomainId(2));
        assert!(record.in_transition());
        assert!(record.has_transition());

        assert!(record.take_transition(Reconcile::Commit).is_some());
        assert_eq!(record.domain(), DomainId(2));
        assert!(!record.in_transition());
        assert!(record.take_transition(Reconcile::Commit).is_none());
    }

    #[test]
    fn test_install_then_revert() {
        let record = ContextRecord::new(Owner::Task(TaskKey(1)), DomainId(1), ContextFlags::empty());
        record
            .install_transition(transition(DomainId(1)), DomainId(9), |_| {})
            .unwrap();
        assert!(record.take_transition(Reconcile::Revert).is_some());
        assert_eq!(record.domain(), DomainId(1));
        assert_eq!(record.flags(), ContextFlags::POLICY_MANAGER);
    }

    #[test]
    fn test_double_install_rejected() {
        let record = ContextRecord::new(Owner::Task(TaskKey(1)), DomainId(1), ContextFlags::empty());
        record
            .install_transition(transition(DomainId(1)), DomainId(2), |_| {})
            .unwrap();
        let mut ran = false;
        let err = record
            .install_transition(transition(DomainId(2)), DomainId(3), |_| ran = true)
            .unwrap_err();
        assert_eq!(err, ContextError::DoubleTransition);
        assert!(!ran);
        assert_eq!(record.domain(), DomainId(2));
    }

    #[test]
    fn test_assign_preserves_transition_bit() {
        let record = ContextRecord::new(Owner::Task(TaskKey(1)), DomainId(1), ContextFlags::empty());
        record
            .install_transition(transition(DomainId(1)), DomainId(2), |_| {})
            .unwrap();
        record.assign(DomainId(5), ContextFlags::empty()).unwrap();
        let (flags, attached) = record.transition_state();
        assert!(flags.contains(ContextFlags::IN_TRANSITION));
        assert!(attached);
    }

    #[test]
    fn test_sentinels_reject_mutation() {
        assert!(OUT_OF_MEMORY_CONTEXT.is_sentinel());
        assert_eq!(DEFAULT_CONTEXT.domain(), DomainId::KERNEL);
        assert_eq!(
            DEFAULT_CONTEXT.assign(DomainId(1), ContextFlags::empty()),
            Err(ContextError::MissingContext)
        );
        assert_eq!(DEFAULT_CONTEXT.domain(), DomainId::KERNEL);
    }

    #[test]
    fn test_assign_retired_rejected() {
        let record = ContextRecord::new(Owner::Cred(CredKey(1)), DomainId(1), ContextFlags::empty());
        record.mark_retired();
        assert_eq!(
            record.assign(DomainId(2), ContextFlags::empty()),
            Err(ContextError::Retired)
        );
    }
}
