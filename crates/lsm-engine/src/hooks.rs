//! Hook registration surface
//!
//! Each hook point owns an ordered chain of named interceptors. An
//! interceptor sees the call and a `Next` handle; it either refuses the call
//! or forwards it down the chain. The end of every chain is the host's
//! default behavior, which allows.
//!
//! # Invariants
//!
//! 1. **No dispatch before bring-up**: `dispatch` waits until `publish` has
//!    made the installed chains visible
//! 2. **Snapshot dispatch**: a call runs against the chain that was current
//!    when it started; installs and uninstalls never disturb a running call
//! 3. **First refusal wins**: once an interceptor refuses, later ones are
//!    not called

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use lsm_core::{CredKey, Denied, ProgramImage, SocketKey, SocketOp, TaskKey};
use spin::RwLock;

/// A hook point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookId {
    TaskAlloc,
    TaskFree,
    CredPrepare,
    CredAllocBlank,
    CredTransfer,
    CredFree,
    BprmCheck,
    BprmCommittingCreds,
    FileOpen,
    FileChmod,
    SbMount,
    Capable,
    SocketAccept,
    Socket(SocketOp),
    InodeFree,
}

impl HookId {
    /// Every hook point, socket operations included
    pub const ALL: [HookId; 24] = [
        HookId::TaskAlloc,
        HookId::TaskFree,
        HookId::CredPrepare,
        HookId::CredAllocBlank,
        HookId::CredTransfer,
        HookId::CredFree,
        HookId::BprmCheck,
        HookId::BprmCommittingCreds,
        HookId::FileOpen,
        HookId::FileChmod,
        HookId::SbMount,
        HookId::Capable,
        HookId::SocketAccept,
        HookId::Socket(SocketOp::Listen),
        HookId::Socket(SocketOp::Connect),
        HookId::Socket(SocketOp::Bind),
        HookId::Socket(SocketOp::SendMsg),
        HookId::Socket(SocketOp::RecvMsg),
        HookId::Socket(SocketOp::GetSockName),
        HookId::Socket(SocketOp::GetPeerName),
        HookId::Socket(SocketOp::GetSockOpt),
        HookId::Socket(SocketOp::SetSockOpt),
        HookId::Socket(SocketOp::Shutdown),
        HookId::InodeFree,
    ];
}

/// Arguments of one hook invocation.
#[derive(Clone, Copy, Debug)]
pub enum HookCall<'a> {
    /// The current task created `child`
    TaskAlloc { child: TaskKey },
    TaskFree { task: TaskKey },
    /// `new` is being prepared as a copy of `old`
    CredPrepare { new: CredKey, old: CredKey },
    CredAllocBlank { new: CredKey },
    CredTransfer { new: CredKey, old: CredKey },
    CredFree { cred: CredKey },
    /// The current task is about to run `image`; `cred` is the credential
    /// set prepared for the new image, if the host made one
    BprmCheck {
        image: &'a ProgramImage,
        cred: Option<CredKey>,
    },
    /// The host accepted the new image and installs `cred`
    BprmCommittingCreds { cred: CredKey },
    FileOpen { path: &'a str, write: bool },
    FileChmod { path: &'a str, mode: u32 },
    SbMount { source: &'a str, target: &'a str },
    Capable { cap: u32 },
    /// `accepted` was accepted on `listener`
    SocketAccept {
        listener: SocketKey,
        accepted: SocketKey,
    },
    Socket { op: SocketOp, socket: SocketKey },
    /// An inode is being freed; `socket` is set when it backs a socket
    InodeFree { socket: Option<SocketKey> },
}

impl HookCall<'_> {
    /// The hook point this call belongs to
    pub fn id(&self) -> HookId {
        match self {
            HookCall::TaskAlloc { .. } => HookId::TaskAlloc,
            HookCall::TaskFree { .. } => HookId::TaskFree,
            HookCall::CredPrepare { .. } => HookId::CredPrepare,
            HookCall::CredAllocBlank { .. } => HookId::CredAllocBlank,
            HookCall::CredTransfer { .. } => HookId::CredTransfer,
            HookCall::CredFree { .. } => HookId::CredFree,
            HookCall::BprmCheck { .. } => HookId::BprmCheck,
            HookCall::BprmCommittingCreds { .. } => HookId::BprmCommittingCreds,
            HookCall::FileOpen { .. } => HookId::FileOpen,
            HookCall::FileChmod { .. } => HookId::FileChmod,
            HookCall::SbMount { .. } => HookId::SbMount,
            HookCall::Capable { .. } => HookId::Capable,
            HookCall::SocketAccept { .. } => HookId::SocketAccept,
            HookCall::Socket { op, .. } => HookId::Socket(*op),
            HookCall::InodeFree { .. } => HookId::InodeFree,
        }
    }
}

/// A link in a hook chain.
pub trait Interceptor: Send + Sync {
    /// Name used by `HookTable::uninstall`
    fn name(&self) -> &str;

    /// Handle `call`, forwarding through `next` to continue the chain.
    fn call(&self, call: &HookCall<'_>, next: Next<'_>) -> Result<(), Denied>;
}

/// The rest of a chain after the running interceptor.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
}

impl Next<'_> {
    /// Forward `call` to the next interceptor, or allow at the end.
    pub fn call(self, call: &HookCall<'_>) -> Result<(), Denied> {
        match self.rest.split_first() {
            Some((head, rest)) => head.call(call, Next { rest }),
            None => Ok(()),
        }
    }

    /// Interceptors left in the chain
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }
}

type Chain = Arc<[Arc<dyn Interceptor>]>;

/// Interceptor chains for every hook point.
pub struct HookTable {
    chains: RwLock<BTreeMap<HookId, Chain>>,
    ready: AtomicBool,
}

impl HookTable {
    pub fn new() -> Self {
        Self {
            chains: RwLock::new(BTreeMap::new()),
            ready: AtomicBool::new(false),
        }
    }

    /// Append `interceptor` to the end of `id`'s chain.
    pub fn install(&self, id: HookId, interceptor: Arc<dyn Interceptor>) {
        self.edit(id, |chain| chain.push(interceptor));
    }

    /// Put `interceptor` at the front of `id`'s chain, ahead of everything
    /// already installed.
    pub fn install_front(&self, id: HookId, interceptor: Arc<dyn Interceptor>) {
        self.edit(id, |chain| chain.insert(0, interceptor));
    }

    /// Remove every interceptor named `name` from every chain.
    ///
    /// Returns the number of links removed.
    pub fn uninstall(&self, name: &str) -> usize {
        let mut chains = self.chains.write();
        let mut removed = 0;
        for chain in chains.values_mut() {
            let kept: Vec<_> = chain
                .iter()
                .filter(|link| link.name() != name)
                .cloned()
                .collect();
            removed += chain.len() - kept.len();
            *chain = kept.into();
        }
        chains.retain(|_, chain| !chain.is_empty());
        removed
    }

    fn edit(&self, id: HookId, f: impl FnOnce(&mut Vec<Arc<dyn Interceptor>>)) {
        let mut chains = self.chains.write();
        let mut chain: Vec<_> = chains
            .get(&id)
            .map(|chain| chain.to_vec())
            .unwrap_or_default();
        f(&mut chain);
        chains.insert(id, chain.into());
    }

    /// Open the table for dispatch.
    pub fn publish(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Names along `id`'s chain, front first
    pub fn chain_names(&self, id: HookId) -> Vec<alloc::string::String> {
        self.chains
            .read()
            .get(&id)
            .map(|chain| chain.iter().map(|link| link.name().into()).collect())
            .unwrap_or_default()
    }

    /// Run `call` through its chain.
    ///
    /// Spins until the table is published.
    pub fn dispatch(&self, call: &HookCall<'_>) -> Result<(), Denied> {
        while !self.ready.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        let chain = self.chains.read().get(&call.id()).cloned();
        let rest: &[Arc<dyn Interceptor>] = chain.as_deref().unwrap_or(&[]);
        Next { rest }.call(call)
    }
}

impl Default for HookTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HookTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookTable")
            .field("hooks", &self.chains.read().len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use alloc::vec;
    use spin::Mutex;

    /// Records its name into a shared trace and optionally refuses.
    struct Tracer {
        name: &'static str,
        refuse: bool,
        trace: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Interceptor for Tracer {
        fn name(&self) -> &str {
            self.name
        }

        fn call(&self, call: &HookCall<'_>, next: Next<'_>) -> Result<(), Denied> {
            self.trace.lock().push(self.name);
            if self.refuse {
                return Err(Denied::PERMISSION);
            }
            next.call(call)
        }
    }

    fn tracer(
        name: &'static str,
        refuse: bool,
        trace: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn Interceptor> {
        Arc::new(Tracer {
            name,
            refuse,
            trace: trace.clone(),
        })
    }

    const OPEN: HookCall<'static> = HookCall::FileOpen {
        path: "/etc/passwd",
        write: false,
    };

    #[test]
    fn test_empty_chain_allows() {
        let hooks = HookTable::new();
        hooks.publish();
        assert_eq!(hooks.dispatch(&OPEN), Ok(()));
    }

    #[test]
    fn test_chain_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let hooks = HookTable::new();
        hooks.install(HookId::FileOpen, tracer("b", false, &trace));
        hooks.install(HookId::FileOpen, tracer("c", false, &trace));
        hooks.install_front(HookId::FileOpen, tracer("a", false, &trace));
        hooks.publish();

        assert_eq!(hooks.dispatch(&OPEN), Ok(()));
        assert_eq!(*trace.lock(), vec!["a", "b", "c"]);
        assert_eq!(
            hooks.chain_names(HookId::FileOpen),
            vec![String::from("a"), String::from("b"), String::from("c")]
        );
    }

    #[test]
    fn test_refusal_stops_chain() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let hooks = HookTable::new();
        hooks.install(HookId::FileOpen, tracer("gate", true, &trace));
        hooks.install(HookId::FileOpen, tracer("after", false, &trace));
        hooks.publish();

        assert_eq!(hooks.dispatch(&OPEN), Err(Denied::PERMISSION));
        assert_eq!(*trace.lock(), vec!["gate"]);
    }

    #[test]
    fn test_chains_are_per_hook() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let hooks = HookTable::new();
        hooks.install(HookId::Capable, tracer("cap", true, &trace));
        hooks.publish();

        assert_eq!(hooks.dispatch(&OPEN), Ok(()));
        assert_eq!(
            hooks.dispatch(&HookCall::Capable { cap: 21 }),
            Err(Denied::PERMISSION)
        );
    }

    #[test]
    fn test_uninstall_by_name() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let hooks = HookTable::new();
        hooks.install(HookId::FileOpen, tracer("gate", true, &trace));
        hooks.install(HookId::Capable, tracer("gate", true, &trace));
        hooks.install(HookId::Capable, tracer("other", false, &trace));
        hooks.publish();

        assert_eq!(hooks.uninstall("gate"), 2);
        assert_eq!(hooks.uninstall("gate"), 0);
        assert_eq!(hooks.dispatch(&OPEN), Ok(()));
        assert_eq!(hooks.dispatch(&HookCall::Capable { cap: 1 }), Ok(()));
        assert_eq!(*trace.lock(), vec!["other"]);
    }

    #[test]
    fn test_socket_ops_have_distinct_hooks() {
        let call = HookCall::Socket {
            op: SocketOp::Bind,
            socket: SocketKey(3),
        };
        assert_eq!(call.id(), HookId::Socket(SocketOp::Bind));
        let sockets = HookId::ALL
            .iter()
            .filter(|id| matches!(id, HookId::Socket(_)))
            .count();
        assert_eq!(sockets, SocketOp::ALL.len());
    }
}
