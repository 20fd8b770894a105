//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use lsm_core::{TransitionId, TransitionOutcome, TransitionRecord};
use lsm_engine::{Decision, DenyReason, DomainId, Engine, EngineConfig, Operation, Policy, ProgramImage};
use lsm_host_mock::MockHost;

/// Image the policy refuses to run
pub const FORBIDDEN: &str = "/bin/forbidden";

/// Domain offset applied by every transition
pub const SHIFT: u64 = 100;

/// Test policy
///
/// - The kernel domain may do anything
/// - Other domains may not open files for writing
/// - Running an image moves a task from `d` to `d + SHIFT`
/// - Deferred socket checks are counted and can be made to deny
#[derive(Default)]
pub struct TestPolicy {
    pub accepted_checks: AtomicUsize,
    pub deny_accepted: AtomicBool,
    /// Hold deferred socket checks open long enough for callers to overlap
    pub slow_accepted: AtomicBool,
    pub finished: Mutex<Vec<(TransitionId, TransitionOutcome)>>,
}

impl TestPolicy {
    pub fn finished(&self) -> Vec<(TransitionId, TransitionOutcome)> {
        self.finished.lock().unwrap().clone()
    }
}

impl Policy for TestPolicy {
    fn evaluate(&self, domain: DomainId, op: &Operation<'_>) -> Decision {
        if let Operation::AcceptedSocket { .. } = op {
            self.accepted_checks.fetch_add(1, Ordering::SeqCst);
            if self.slow_accepted.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(20));
            }
            if self.deny_accepted.load(Ordering::SeqCst) {
                return Decision::Deny;
            }
            return Decision::Allow;
        }
        match (domain, op) {
            (DomainId::KERNEL, _) => Decision::Allow,
            (_, Operation::FileOpen { write: true, .. }) => Decision::Deny,
            _ => Decision::Allow,
        }
    }

    fn begin_transition(&self, domain: DomainId, image: &ProgramImage) -> Result<DomainId, DenyReason> {
        if image.path == FORBIDDEN {
            return Err(DenyReason::PermissionDenied);
        }
        Ok(DomainId(domain.0 + SHIFT))
    }

    fn finish_transition(&self, transition: &TransitionRecord, outcome: TransitionOutcome) {
        self.finished.lock().unwrap().push((transition.id, outcome));
    }
}

pub type TestEngine = Engine<MockHost, TestPolicy>;

pub fn engine() -> TestEngine {
    engine_with(EngineConfig::default())
}

pub fn engine_with(config: EngineConfig) -> TestEngine {
    init_tracing();
    Engine::new(MockHost::new(), TestPolicy::default(), config).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
