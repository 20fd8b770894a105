//! Runtime-checkable invariants
//!
//! These hold at every observation point except the in-flight count, which
//! is only exact when no lifecycle call is running. Used for:
//! 1. Assertion checking in tests and stress runs
//! 2. Diagnosing a corrupted table in a debug build
//!
//! # Invariants
//!
//! 1. **Table partition**: the task table holds only task-keyed records and
//!    the credential table only credential-keyed ones
//! 2. **Uniqueness**: at most one record per key per table
//! 3. **Transition consistency**: a record has a transition attached iff its
//!    `IN_TRANSITION` flag is set
//! 4. **In-flight accounting**: the in-flight counter equals the number of
//!    attached transitions (quiescent only)
//! 5. **No retired records linked**: a record reachable from a table is not
//!    marked retired

use alloc::collections::BTreeSet;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::policy::Policy;
use crate::record::ContextRecord;
use crate::registry::ContextRegistry;
use crate::table::{ContextKey, ContextTable};
use crate::types::ContextFlags;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all registry invariants.
///
/// Returns a list of violations (empty if all invariants hold). Call only
/// when no lifecycle operation is running, or ignore `in_flight_accounting`.
pub fn check_all_invariants<P: Policy>(registry: &ContextRegistry<P>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_table(registry.tasks()));
    violations.extend(check_table(registry.creds()));
    violations.extend(check_in_flight_accounting(registry));

    violations
}

/// Invariants 1, 2, 3 and 5 for one table
fn check_table<K: ContextKey + Ord>(table: &ContextTable<K>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let guard = table.collector().pin();
    let mut seen = BTreeSet::new();

    for record in table.iter(&guard) {
        match K::of(record) {
            Some(key) => {
                if !seen.insert(key) {
                    violations.push(InvariantViolation {
                        invariant: "uniqueness",
                        description: format!("{} table holds {:?} twice", K::TABLE, key),
                    });
                }
            }
            None => violations.push(InvariantViolation {
                invariant: "table_partition",
                description: format!("{} table holds {:?}", K::TABLE, record.owner()),
            }),
        }

        violations.extend(check_transition_consistency(record));

        if record.is_retired() {
            violations.push(InvariantViolation {
                invariant: "no_retired_linked",
                description: format!("retired {:?} still linked", record.owner()),
            });
        }
    }

    violations
}

/// Invariant 3: transition slot and flag agree
fn check_transition_consistency(record: &ContextRecord) -> Option<InvariantViolation> {
    let (flags, attached) = record.transition_state();
    let flagged = flags.contains(ContextFlags::IN_TRANSITION);
    (flagged != attached).then(|| InvariantViolation {
        invariant: "transition_consistency",
        description: format!(
            "{:?}: IN_TRANSITION={} but transition attached={}",
            record.owner(),
            flagged,
            attached
        ),
    })
}

/// Invariant 4: in-flight counter matches attached transitions
fn check_in_flight_accounting<P: Policy>(registry: &ContextRegistry<P>) -> Option<InvariantViolation> {
    let guard = registry.pin();
    let attached = registry
        .tasks()
        .iter(&guard)
        .chain(registry.creds().iter(&guard))
        .filter(|record| record.has_transition())
        .count();
    let counted = registry.in_flight();
    (attached != counted).then(|| InvariantViolation {
        invariant: "in_flight_accounting",
        description: format!("in-flight counter is {} but {} transitions are attached", counted, attached),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::DenyReason;
    use crate::policy::{Decision, Operation};
    use crate::types::{DomainId, ProgramImage};
    use lsm_host::{CredKey, Host};
    use lsm_host_mock::{MockHost, INIT_CRED};

    struct Same;

    impl Policy for Same {
        fn evaluate(&self, _domain: DomainId, _op: &Operation<'_>) -> Decision {
            Decision::Allow
        }

        fn begin_transition(&self, domain: DomainId, _image: &ProgramImage) -> Result<DomainId, DenyReason> {
            Ok(DomainId(domain.0 + 1))
        }
    }

    #[test]
    fn test_fresh_registry_is_consistent() {
        let reg = ContextRegistry::new(Same, EngineConfig::default()).unwrap();
        assert!(check_all_invariants(&reg).is_empty());
    }

    #[test]
    fn test_lifecycle_keeps_invariants() {
        let host = MockHost::new();
        let reg = ContextRegistry::new(Same, EngineConfig::default()).unwrap();
        let cred = host.new_cred();
        reg.prepare_cred(&host, cred, INIT_CRED).unwrap();
        host.set_in_execve(host.current_task(), true);
        reg.begin_transition(&host, ProgramImage::new("/bin/ls"), Some(cred))
            .unwrap();
        assert!(check_all_invariants(&reg).is_empty());

        reg.commit_transition(&host, cred).unwrap();
        reg.alloc_blank_cred(CredKey(77)).unwrap();
        let violations = check_all_invariants(&reg);
        assert!(violations.is_empty(), "{:?}", violations);
    }

    #[test]
    fn test_detects_accounting_drift() {
        let reg = ContextRegistry::new(Same, EngineConfig::default()).unwrap();
        reg.in_flight
            .fetch_add(1, core::sync::atomic::Ordering::SeqCst);
        let violations = check_all_invariants(&reg);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "in_flight_accounting");
    }
}
