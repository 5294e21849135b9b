//! Request/reply correlation for the remote executor transport
//!
//! Replaces an implicit expected-late-replies counter with a typed table:
//! every outbound id maps to either a one-shot result slot or a drop token
//! marking fire-and-forget. Late replies on a drop token are absorbed
//! silently; anything else is diagnosed.

use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Registered interest in a reply.
pub enum Waiter<T> {
    Reply(oneshot::Sender<T>),
    Forget,
}

/// What happened to an incoming reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    /// Fire-and-forget reply absorbed without comment.
    Absorbed,
    /// Reply older than anything still pending.
    Outdated,
    /// Id was never issued or the waiter side hung up.
    Unknown,
}

pub struct CorrelationTable<T> {
    next_id: u64,
    pending: HashMap<u64, Waiter<T>>,
    /// Smallest id still awaiting a reply, for outdated diagnosis.
    oldest_pending: u64,
}

impl<T> CorrelationTable<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            pending: HashMap::new(),
            oldest_pending: 0,
        }
    }

    /// Next request id. Wraps to 1 on overflow, never 0.
    pub fn next_id(&mut self) -> u64 {
        self.next_id = match self.next_id.checked_add(1) {
            Some(id) => id,
            None => 1,
        };
        self.next_id
    }

    /// Register a blocking waiter; the returned receiver resolves when the
    /// reply arrives.
    pub fn expect_reply(&mut self, id: u64) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Waiter::Reply(tx));
        self.refresh_oldest();
        rx
    }

    /// Register a drop token: the framing will still deliver a reply, but
    /// nobody wants it.
    pub fn expect_and_forget(&mut self, id: u64) {
        self.pending.insert(id, Waiter::Forget);
        self.refresh_oldest();
    }

    /// Abandon a waiter (timeout or connection teardown).
    pub fn cancel(&mut self, id: u64) {
        self.pending.remove(&id);
        self.refresh_oldest();
    }

    /// Fail every in-flight waiter; used when the connection drops.
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        self.oldest_pending = 0;
        n
    }

    /// Drop only the blocking waiters (their receivers resolve to error).
    /// Fire-and-forget tokens survive so a reply straggling in over a
    /// reestablished connection is still absorbed, not diagnosed.
    pub fn fail_blocking(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, w| matches!(w, Waiter::Forget));
        self.refresh_oldest();
        before - self.pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn refresh_oldest(&mut self) {
        self.oldest_pending = self.pending.keys().copied().min().unwrap_or(0);
    }

    /// Route an incoming reply to its waiter.
    pub fn complete(&mut self, id: u64, value: T) -> Disposition {
        match self.pending.remove(&id) {
            Some(Waiter::Reply(tx)) => {
                self.refresh_oldest();
                if tx.send(value).is_err() {
                    debug!("Reply {} arrived after its waiter gave up", id);
                    return Disposition::Unknown;
                }
                Disposition::Delivered
            }
            Some(Waiter::Forget) => {
                self.refresh_oldest();
                Disposition::Absorbed
            }
            None => {
                if self.oldest_pending != 0 && id < self.oldest_pending {
                    warn!("Ignoring outdated reply {}", id);
                    Disposition::Outdated
                } else {
                    warn!("Reply {} matches no pending request", id);
                    Disposition::Unknown
                }
            }
        }
    }
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
