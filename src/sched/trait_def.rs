//! Queue abstraction shared by the ready queue and wait queues.

use crate::thread::{Priority, QNode, ThreadId, ThreadTable};
use alloc::vec::Vec;

/// Storage for the per-thread queue linkage.
///
/// Queues do not own their nodes; the links live in the thread control
/// blocks, so a queue operation borrows the thread table alongside the queue.
pub(crate) trait NodeStore {
    fn node(&self, id: ThreadId) -> &QNode;
    fn node_mut(&mut self, id: ThreadId) -> &mut QNode;
    /// Priority used for ordering. Must not change while `id` is queued.
    fn prio(&self, id: ThreadId) -> Priority;
}

impl<C> NodeStore for ThreadTable<C> {
    fn node(&self, id: ThreadId) -> &QNode {
        &self[id].node
    }

    fn node_mut(&mut self, id: ThreadId) -> &mut QNode {
        &mut self[id].node
    }

    fn prio(&self, id: ThreadId) -> Priority {
        self[id].prio
    }
}

/// An ordered collection of threads.
///
/// Every implementation serves the most urgent priority first; among equal
/// priorities the thread added first is served first, except for strict
/// FIFO queues which ignore priority entirely.
pub(crate) trait ThreadQueue {
    /// Insert `id` behind every thread of equal or more urgent priority.
    fn add<S: NodeStore>(&mut self, store: &mut S, id: ThreadId);

    /// Unlink `id`, which must be a member.
    fn remove<S: NodeStore>(&mut self, store: &mut S, id: ThreadId);

    /// Thread that would be served next.
    fn best<S: NodeStore>(&self, store: &S) -> Option<ThreadId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Members in service order.
    fn to_vec<S: NodeStore>(&self, store: &S) -> Vec<ThreadId>;
}
