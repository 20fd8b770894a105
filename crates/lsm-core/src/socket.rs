//! Socket permission cache
//!
//! A connection accepted before its permission could be evaluated carries a
//! tag until the first operation on it runs the deferred check. The tag's
//! status sits behind a narrow lock, so concurrent operations on the same
//! endpoint evaluate at most once: the first caller evaluates and the rest
//! see its verdict.
//!
//! - Allow: the tag is unlinked and retired; later operations find no tag
//! - Deny: the tag stays and denies every later operation without
//!   re-evaluation, until the endpoint is destroyed

use alloc::sync::Arc;
use lsm_host::SocketKey;
use lsm_sync::{Collector, Guard, InsertError, RcuList};
use spin::Mutex;

use crate::error::{Denied, DenyReason};

/// Deferred-check state of an accepted endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketStatus {
    /// Not yet evaluated
    Pending,
    /// Evaluated and allowed; the tag is being removed
    Allowed,
    /// Evaluated and denied
    Denied(DenyReason),
}

/// Cache entry for one accepted endpoint.
#[derive(Debug)]
pub struct SocketTag {
    socket: SocketKey,
    status: Mutex<SocketStatus>,
}

impl SocketTag {
    pub fn socket(&self) -> SocketKey {
        self.socket
    }

    pub fn status(&self) -> SocketStatus {
        *self.status.lock()
    }
}

/// Tags for accepted endpoints whose permission is not settled.
pub struct SocketCache {
    tags: RcuList<SocketTag>,
}

impl SocketCache {
    /// Create an empty cache reclaimed by `collector`.
    pub fn new(collector: Arc<Collector>) -> Self {
        Self {
            tags: RcuList::new(collector),
        }
    }

    pub fn collector(&self) -> &Arc<Collector> {
        self.tags.collector()
    }

    /// Tag a newly accepted endpoint as pending.
    ///
    /// An existing tag for a reused endpoint handle is handled by status:
    /// - Pending: left as is, the first operation still evaluates it
    /// - Allowed: its removal by `validate` may still be in progress, so it
    ///   is unlinked here and a fresh tag is linked in its place
    /// - Denied: reset to pending in place; only `forget` removes a denied
    ///   tag, and that means the endpoint is gone
    pub fn on_accept(&self, socket: SocketKey) -> Result<(), Denied> {
        let guard = self.tags.collector().pin();
        loop {
            let tag = SocketTag {
                socket,
                status: Mutex::new(SocketStatus::Pending),
            };
            let existing = match self
                .tags
                .insert_unique(tag, |other| other.socket == socket, &guard)
            {
                Ok(_) => return Ok(()),
                Err(InsertError::Occupied(existing)) => existing,
                Err(InsertError::OutOfMemory) => {
                    tracing::warn!(?socket, "unable to allocate socket tag");
                    return Err(Denied::OUT_OF_MEMORY);
                }
            };

            let mut status = existing.status.lock();
            match *status {
                SocketStatus::Pending => return Ok(()),
                SocketStatus::Denied(_) => {
                    *status = SocketStatus::Pending;
                    return Ok(());
                }
                SocketStatus::Allowed => {
                    drop(status);
                    // Whichever of us and `validate` unlinks it first wins.
                    self.tags.remove(existing);
                }
            }
        }
    }

    /// Run the deferred check for `socket` if it is still pending.
    ///
    /// `evaluate` is called at most once per tag, with the tag's lock held.
    pub fn validate<F>(&self, socket: SocketKey, evaluate: F) -> Result<(), Denied>
    where
        F: FnOnce() -> Result<(), DenyReason>,
    {
        let guard = self.tags.collector().pin();
        let Some(tag) = self.find(socket, &guard) else {
            return Ok(());
        };

        let verdict = {
            let mut status = tag.status.lock();
            match *status {
                SocketStatus::Allowed => return Ok(()),
                SocketStatus::Denied(reason) => return Err(reason.into()),
                SocketStatus::Pending => {}
            }
            let verdict = evaluate();
            *status = match verdict {
                Ok(()) => SocketStatus::Allowed,
                Err(reason) => SocketStatus::Denied(reason),
            };
            verdict
        };

        match verdict {
            Ok(()) => {
                self.tags.remove(tag);
                Ok(())
            }
            Err(reason) => {
                tracing::debug!(?socket, %reason, "accepted socket denied");
                Err(reason.into())
            }
        }
    }

    /// The endpoint was destroyed: drop its tag.
    ///
    /// Returns true if a tag was removed.
    pub fn forget(&self, socket: SocketKey) -> bool {
        let guard = self.tags.collector().pin();
        match self.find(socket, &guard) {
            Some(tag) => self.tags.remove(tag),
            None => false,
        }
    }

    /// Current status of `socket`'s tag, if it has one.
    pub fn status(&self, socket: SocketKey) -> Option<SocketStatus> {
        let guard = self.tags.collector().pin();
        self.find(socket, &guard).map(SocketTag::status)
    }

    fn find<'g>(&'g self, socket: SocketKey, guard: &'g Guard<'_>) -> Option<&'g SocketTag> {
        self.tags.find(guard, |tag| tag.socket == socket)
    }

    /// Number of tagged endpoints
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
