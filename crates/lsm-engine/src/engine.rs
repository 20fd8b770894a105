//! Engine - hook entry points over the context registry
//!
//! Every entry point returns `Result<(), Denied>`. Internal `ContextError`s
//! are turned into a denial here and never travel further.

use alloc::sync::Arc;

use lsm_core::{
    ConfigError, ContextError, ContextRegistry, CredKey, Decision, Denied, DomainId, EngineConfig,
    Host, Operation, Policy, ProgramImage, SentinelKind, SocketCache, SocketKey, SocketOp,
    SweepStats, TaskKey, TransitionId,
};

use crate::hooks::{HookCall, HookId, HookTable, Interceptor, Next};

/// Name under which the engine sits in hook chains
pub const ENGINE_NAME: &str = "mac-engine";

/// The security-context engine bound to one host and one policy.
pub struct Engine<H: Host, P: Policy> {
    host: H,
    registry: ContextRegistry<P>,
    sockets: SocketCache,
}

/// Denial for an internal failure on a lifecycle path.
fn deny(err: ContextError) -> Denied {
    match err {
        ContextError::PolicyDenied(reason) => reason.into(),
        ContextError::AllocationFailure
        | ContextError::MissingContext
        | ContextError::Duplicate
        | ContextError::Retired => Denied::OUT_OF_MEMORY,
        ContextError::DoubleTransition | ContextError::LeakDetected { .. } => Denied::PERMISSION,
    }
}

impl<H: Host, P: Policy> Engine<H, P> {
    /// Create an engine. Nothing is hooked until `attach`.
    pub fn new(host: H, policy: P, config: EngineConfig) -> Result<Self, ConfigError> {
        let registry = ContextRegistry::new(policy, config)?;
        let sockets = SocketCache::new(registry.collector().clone());
        Ok(Self {
            host,
            registry,
            sockets,
        })
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn registry(&self) -> &ContextRegistry<P> {
        &self.registry
    }

    pub fn sockets(&self) -> &SocketCache {
        &self.sockets
    }

    /// Install the engine at the front of every hook chain and open the
    /// table for dispatch.
    pub fn attach(self: &Arc<Self>, hooks: &HookTable) {
        for id in HookId::ALL {
            hooks.install_front(id, self.clone());
        }
        hooks.publish();
        tracing::info!(hooks = HookId::ALL.len(), "security-context engine attached");
    }

    // ========================================================================
    // Task and credential lifecycle
    // ========================================================================

    pub fn task_alloc(&self, child: TaskKey) -> Result<(), Denied> {
        self.registry.task_alloc(&self.host, child).map_err(deny)
    }

    pub fn task_free(&self, task: TaskKey) {
        self.registry.task_free(&self.host, task);
    }

    pub fn cred_prepare(&self, new: CredKey, old: CredKey) -> Result<(), Denied> {
        self.registry
            .prepare_cred(&self.host, new, old)
            .map_err(deny)
    }

    pub fn cred_alloc_blank(&self, new: CredKey) -> Result<(), Denied> {
        self.registry.alloc_blank_cred(new).map_err(deny)
    }

    pub fn cred_transfer(&self, new: CredKey, old: CredKey) {
        if let Err(err) = self.registry.transfer_cred(new, old) {
            tracing::warn!(?new, ?old, error = %err, "credential transfer lost its context");
        }
    }

    pub fn cred_free(&self, cred: CredKey) {
        self.registry.free_cred(&self.host, cred);
    }

    // ========================================================================
    // Program image transitions
    // ========================================================================

    /// The current task is about to run `image`.
    ///
    /// # Returns
    /// * `Ok` - Transition started, or one is already pending (the host is
    ///   re-checking the same execution, e.g. through an interpreter)
    /// * `Err` - The policy refused the image or no context could be
    ///   allocated
    pub fn bprm_check(&self, image: &ProgramImage, cred: Option<CredKey>) -> Result<(), Denied> {
        match self
            .registry
            .begin_transition(&self.host, image.clone(), cred)
        {
            Ok(_) | Err(ContextError::DoubleTransition) => Ok(()),
            Err(err) => Err(deny(err)),
        }
    }

    /// The host accepted the new image and installs `cred`.
    pub fn bprm_committing_creds(&self, cred: CredKey) -> Result<(), Denied> {
        self.registry
            .commit_transition(&self.host, cred)
            .map_err(deny)
    }

    // ========================================================================
    // Access checks
    // ========================================================================

    /// Ask the policy whether the current task may perform `op`.
    pub fn check(&self, op: &Operation<'_>) -> Result<(), Denied> {
        let guard = self.registry.pin();
        let record = self.registry.current_context(&self.host, &guard);
        if record.sentinel_kind() == Some(SentinelKind::OutOfMemory) {
            return Err(Denied::OUT_OF_MEMORY);
        }
        match self.registry.policy().evaluate(record.domain(), op) {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(Denied::PERMISSION),
        }
    }

    /// Run the deferred post-accept check for `socket`, if still pending.
    fn validate_accepted(&self, socket: SocketKey) -> Result<(), Denied> {
        self.sockets.validate(socket, || {
            self.check(&Operation::AcceptedSocket { socket })
                .map_err(|denied| denied.reason)
        })
    }

    /// `accepted` was accepted on `listener`.
    pub fn socket_accept(&self, listener: SocketKey, accepted: SocketKey) -> Result<(), Denied> {
        self.validate_accepted(listener)?;
        self.sockets.on_accept(accepted)
    }

    /// An operation on an existing socket.
    pub fn socket_op(&self, op: SocketOp, socket: SocketKey) -> Result<(), Denied> {
        self.validate_accepted(socket)?;
        if op.needs_permission() {
            self.check(&Operation::Socket { op, socket })
        } else {
            Ok(())
        }
    }

    /// An inode is being freed.
    pub fn inode_free(&self, socket: Option<SocketKey>) {
        if let Some(socket) = socket {
            self.sockets.forget(socket);
        }
    }

    // ========================================================================
    // Exports
    // ========================================================================

    /// Domain of the current task (creates its record on first use).
    pub fn current_domain(&self) -> DomainId {
        let guard = self.registry.pin();
        self.registry.current_context(&self.host, &guard).domain()
    }

    /// Domain governing `task`.
    pub fn domain_of(&self, task: TaskKey) -> DomainId {
        let guard = self.registry.pin();
        self.registry.context_for(&self.host, task, &guard).domain()
    }

    /// Check whether any context or pending transition refers to `domain`.
    pub fn is_domain_referenced(&self, domain: DomainId) -> bool {
        self.registry.is_domain_referenced(domain)
    }

    /// Transition pending for `task`, if any
    pub fn pending_transition(&self, task: TaskKey) -> Option<TransitionId> {
        let guard = self.registry.pin();
        self.registry.pending_transition(task, &guard)
    }

    /// Periodic housekeeping: sweep dead tasks and audit for leaked
    /// transitions.
    ///
    /// Returns `None` if another sweep was running.
    pub fn maintain(&self) -> Option<SweepStats> {
        let stats = self.registry.sweep_now(&self.host);
        if let Err(err) = self.registry.check_leaks(&self.host) {
            tracing::warn!(error = %err, "transition leak");
        }
        stats
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Route one hook call to its entry point.
    pub fn handle(&self, call: &HookCall<'_>) -> Result<(), Denied> {
        match *call {
            HookCall::TaskAlloc { child } => self.task_alloc(child),
            HookCall::TaskFree { task } => {
                self.task_free(task);
                Ok(())
            }
            HookCall::CredPrepare { new, old } => self.cred_prepare(new, old),
            HookCall::CredAllocBlank { new } => self.cred_alloc_blank(new),
            HookCall::CredTransfer { new, old } => {
                self.cred_transfer(new, old);
                Ok(())
            }
            HookCall::CredFree { cred } => {
                self.cred_free(cred);
                Ok(())
            }
            HookCall::BprmCheck { image, cred } => self.bprm_check(image, cred),
            HookCall::BprmCommittingCreds { cred } => self.bprm_committing_creds(cred),
            HookCall::FileOpen { path, write } => self.check(&Operation::FileOpen { path, write }),
            HookCall::FileChmod { path, mode } => self.check(&Operation::FileChmod { path, mode }),
            HookCall::SbMount { source, target } => {
                self.check(&Operation::Mount { source, target })
            }
            HookCall::Capable { cap } => self.check(&Operation::Capability { cap }),
            HookCall::SocketAccept { listener, accepted } => self.socket_accept(listener, accepted),
            HookCall::Socket { op, socket } => self.socket_op(op, socket),
            HookCall::InodeFree { socket } => {
                self.inode_free(socket);
                Ok(())
            }
        }
    }
}

impl<H: Host, P: Policy> Interceptor for Engine<H, P> {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    /// Runs this engine's half of the hook, then the rest of the chain.
    ///
    /// If a later interceptor refuses an allocation hook, the host never
    /// sees the object, so the record created for it is released here.
    fn call(&self, call: &HookCall<'_>, next: Next<'_>) -> Result<(), Denied> {
        self.handle(call)?;
        let result = next.call(call);
        if result.is_err() {
            self.roll_back(call);
        }
        result
    }
}

impl<H: Host, P: Policy> Engine<H, P> {
    /// Undo the record an allocation hook created.
    fn roll_back(&self, call: &HookCall<'_>) {
        match *call {
            HookCall::TaskAlloc { child } => {
                self.registry.task_free(&self.host, child);
            }
            HookCall::CredPrepare { new, .. } | HookCall::CredAllocBlank { new } => {
                self.registry.free_cred(&self.host, new);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsm_core::{DenyReason, TransitionRecord, TransitionOutcome};
    use lsm_host_mock::{MockHost, INIT_CRED};

    /// Domain 0 may do anything; every other domain is refused writes and
    /// capabilities. Images move the task to domain 7.
    struct Gate;

    impl Policy for Gate {
        fn evaluate(&self, domain: DomainId, op: &Operation<'_>) -> Decision {
            match (domain, op) {
                (DomainId::KERNEL, _) => Decision::Allow,
                (_, Operation::FileOpen { write: true, .. }) => Decision::Deny,
                (_, Operation::Capability { .. }) => Decision::Deny,
                _ => Decision::Allow,
            }
        }

        fn begin_transition(&self, _domain: DomainId, image: &ProgramImage) -> Result<DomainId, DenyReason> {
            if image.path == "/sbin/denied" {
                return Err(DenyReason::PermissionDenied);
            }
            Ok(DomainId(7))
        }

        fn finish_transition(&self, _transition: &TransitionRecord, _outcome: TransitionOutcome) {}
    }

    fn engine() -> Engine<MockHost, Gate> {
        Engine::new(MockHost::new(), Gate, EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            hash_bits: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::new(MockHost::new(), Gate, config),
            Err(ConfigError::HashBits(0))
        ));
    }

    #[test]
    fn test_check_uses_current_domain() {
        let engine = engine();
        let write = Operation::FileOpen {
            path: "/etc/shadow",
            write: true,
        };
        assert_eq!(engine.check(&write), Ok(()));

        let host = engine.host();
        let task = host.spawn_task(INIT_CRED);
        engine.task_alloc(task).unwrap();
        host.set_in_execve(task, true);
        host.run_as(task, || {
            engine
                .bprm_check(&ProgramImage::new("/usr/bin/app"), None)
                .unwrap();
            assert_eq!(engine.current_domain(), DomainId(7));
            assert_eq!(engine.check(&write), Err(Denied::PERMISSION));
        });
        assert_eq!(engine.check(&write), Ok(()));
    }

    #[test]
    fn test_refused_image_maps_reason() {
        let engine = engine();
        engine.host().set_in_execve(engine.host().current_task(), true);
        assert_eq!(
            engine.bprm_check(&ProgramImage::new("/sbin/denied"), None),
            Err(Denied::PERMISSION)
        );
        assert_eq!(engine.registry().in_flight(), 0);
    }

    #[test]
    fn test_repeated_check_forwards() {
        let engine = engine();
        engine.host().set_in_execve(engine.host().current_task(), true);
        let image = ProgramImage::new("/usr/bin/script");
        assert_eq!(engine.bprm_check(&image, None), Ok(()));
        assert_eq!(engine.bprm_check(&image, None), Ok(()));
        assert_eq!(engine.registry().in_flight(), 1);
    }

    #[test]
    fn test_out_of_memory_context_denies() {
        let config = EngineConfig {
            max_task_records: Some(1),
            ..EngineConfig::default()
        };
        let engine = Engine::new(MockHost::new(), Gate, config).unwrap();
        let host = engine.host();
        // Fill the task table with the initial task's record.
        engine.current_domain();

        let task = host.spawn_task(INIT_CRED);
        host.set_unkillable(task);
        let result = host.run_as(task, || engine.check(&Operation::Capability { cap: 0 }));
        assert_eq!(result, Err(Denied::OUT_OF_MEMORY));
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(deny(ContextError::AllocationFailure), Denied::OUT_OF_MEMORY);
        assert_eq!(
            deny(ContextError::PolicyDenied(DenyReason::OutOfMemory)),
            Denied::OUT_OF_MEMORY
        );
        assert_eq!(
            deny(ContextError::PolicyDenied(DenyReason::PermissionDenied)),
            Denied::PERMISSION
        );
    }
}
