//! Interface to the external policy engine
//!
//! The engine never interprets a domain. It hands the current record's domain
//! to a `Policy` together with the operation being attempted and acts on the
//! decision.

use lsm_audit::TransitionOutcome;
use lsm_host::SocketKey;

use crate::error::DenyReason;
use crate::transition::TransitionRecord;
use crate::types::{DomainId, ProgramImage};

/// Allow or deny.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Socket operations that reach the socket hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SocketOp {
    Listen,
    Connect,
    Bind,
    SendMsg,
    RecvMsg,
    GetSockName,
    GetPeerName,
    GetSockOpt,
    SetSockOpt,
    Shutdown,
}

impl SocketOp {
    pub const ALL: [SocketOp; 10] = [
        SocketOp::Listen,
        SocketOp::Connect,
        SocketOp::Bind,
        SocketOp::SendMsg,
        SocketOp::RecvMsg,
        SocketOp::GetSockName,
        SocketOp::GetPeerName,
        SocketOp::GetSockOpt,
        SocketOp::SetSockOpt,
        SocketOp::Shutdown,
    ];

    /// Operations that consult the policy after the post-accept check.
    /// The rest only run the post-accept check.
    pub fn needs_permission(self) -> bool {
        matches!(
            self,
            SocketOp::Listen | SocketOp::Connect | SocketOp::Bind | SocketOp::SendMsg
        )
    }
}

/// An operation submitted to the policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation<'a> {
    FileOpen { path: &'a str, write: bool },
    FileChmod { path: &'a str, mode: u32 },
    Mount { source: &'a str, target: &'a str },
    Capability { cap: u32 },
    Socket { op: SocketOp, socket: SocketKey },
    /// Deferred check of a connection accepted earlier
    AcceptedSocket { socket: SocketKey },
}

/// External policy engine.
pub trait Policy: Send + Sync + 'static {
    /// Decide whether `domain` may perform `op`.
    fn evaluate(&self, domain: DomainId, op: &Operation<'_>) -> Decision;

    /// Domain a task in `domain` moves to when it runs `image`.
    ///
    /// # Returns
    /// * `Ok(next)` - Transition allowed
    /// * `Err(reason)` - Execution refused; no transition is started
    fn begin_transition(&self, domain: DomainId, image: &ProgramImage)
        -> Result<DomainId, DenyReason>;

    /// Told once per transition when it commits or aborts.
    fn finish_transition(&self, _transition: &TransitionRecord, _outcome: TransitionOutcome) {}
}
