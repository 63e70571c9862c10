//! Pending-waiter correlation table.
//!
//! Request/response flows on the bus have no correlation ids; a reply is
//! matched by (peer, message tag) plus an optional predicate over the
//! decoded message. Waiters queue FIFO per key, and an incoming message
//! resolves at most one of them, removed under the table lock so a reply
//! can never be delivered twice.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::messages::Message;
use crate::node::PeerId;

type Predicate = Box<dyn Fn(&Message) -> bool + Send + Sync>;

struct Waiter {
    predicate: Option<Predicate>,
    tx: oneshot::Sender<Message>,
}

/// FIFO waiter queues keyed by (peer, tag).
#[derive(Default)]
pub struct WaiterTable {
    queues: Mutex<HashMap<(PeerId, u16), VecDeque<Waiter>>>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a waiter; the returned receiver completes with the first
    /// matching message from `peer` with tag `tag`.
    pub fn register(
        &self,
        peer: PeerId,
        tag: u16,
        predicate: Option<Predicate>,
    ) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry((peer, tag))
            .or_default()
            .push_back(Waiter { predicate, tx });
        rx
    }

    /// Offers a message to the table. Returns `true` when a waiter consumed
    /// it; abandoned waiters (receiver dropped on timeout) are pruned on
    /// the way.
    pub fn offer(&self, peer: PeerId, msg: &Message) -> bool {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = queues.get_mut(&(peer, msg.tag())) else {
            return false;
        };

        let mut consumed = false;
        let mut keep = VecDeque::with_capacity(queue.len());
        while let Some(waiter) = queue.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }
            let matches = waiter
                .predicate
                .as_ref()
                .map(|p| p(msg))
                .unwrap_or(true);
            if !consumed && matches {
                // A failed send means the receiver is gone; either way the
                // waiter is spent.
                consumed = waiter.tx.send(msg.clone()).is_ok();
                continue;
            }
            keep.push_back(waiter);
        }
        *queue = keep;
        if queue.is_empty() {
            queues.remove(&(peer, msg.tag()));
        }
        consumed
    }

    /// Number of live waiters, for diagnostics.
    pub fn pending(&self) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.values().map(|q| q.len()).sum()
    }
}
