//! Ready/wait queue backends.

use super::trait_def::{NodeStore, ThreadQueue};
use crate::config::{KernelConfig, ReadyQueueKind, WaitQueueKind};
use crate::thread::{Priority, ThreadId};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Doubly linked list threaded through the thread control blocks.
#[derive(Debug, Default, Clone)]
pub(crate) struct DList {
    head: Option<ThreadId>,
    tail: Option<ThreadId>,
    len: usize,
}

impl DList {
    pub(crate) fn front(&self) -> Option<ThreadId> {
        self.head
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn push_back<S: NodeStore>(&mut self, store: &mut S, id: ThreadId) {
        let node = store.node_mut(id);
        node.prev = self.tail;
        node.next = None;
        match self.tail {
            Some(t) => store.node_mut(t).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    pub(crate) fn insert_before<S: NodeStore>(&mut self, store: &mut S, succ: ThreadId, id: ThreadId) {
        let prev = store.node(succ).prev;
        {
            let node = store.node_mut(id);
            node.prev = prev;
            node.next = Some(succ);
        }
        store.node_mut(succ).prev = Some(id);
        match prev {
            Some(p) => store.node_mut(p).next = Some(id),
            None => self.head = Some(id),
        }
        self.len += 1;
    }

    pub(crate) fn remove<S: NodeStore>(&mut self, store: &mut S, id: ThreadId) {
        let (prev, next) = {
            let node = store.node_mut(id);
            let links = (node.prev, node.next);
            node.prev = None;
            node.next = None;
            links
        };
        match prev {
            Some(p) => store.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => store.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    pub(crate) fn to_vec<S: NodeStore>(&self, store: &S) -> Vec<ThreadId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(c) = cursor {
            out.push(c);
            cursor = store.node(c).next;
        }
        out
    }
}

/// Sorted list: walks to the first less urgent thread and inserts before it.
#[derive(Debug, Default)]
pub(crate) struct DumbQueue {
    list: DList,
}

impl ThreadQueue for DumbQueue {
    fn add<S: NodeStore>(&mut self, store: &mut S, id: ThreadId) {
        let prio = store.prio(id);
        let mut cursor = self.list.front();
        while let Some(c) = cursor {
            if prio < store.prio(c) {
                self.list.insert_before(store, c, id);
                return;
            }
            cursor = store.node(c).next;
        }
        self.list.push_back(store, id);
    }

    fn remove<S: NodeStore>(&mut self, store: &mut S, id: ThreadId) {
        self.list.remove(store, id);
    }

    fn best<S: NodeStore>(&self, _store: &S) -> Option<ThreadId> {
        self.list.front()
    }

    fn len(&self) -> usize {
        self.list.len()
    }

    fn to_vec<S: NodeStore>(&self, store: &S) -> Vec<ThreadId> {
        self.list.to_vec(store)
    }
}

/// Arrival order, priority ignored.
#[derive(Debug, Default)]
pub(crate) struct FifoQueue {
    list: DList,
}

impl ThreadQueue for FifoQueue {
    fn add<S: NodeStore>(&mut self, store: &mut S, id: ThreadId) {
        self.list.push_back(store, id);
    }

    fn remove<S: NodeStore>(&mut self, store: &mut S, id: ThreadId) {
        self.list.remove(store, id);
    }

    fn best<S: NodeStore>(&self, _store: &S) -> Option<ThreadId> {
        self.list.front()
    }

    fn len(&self) -> usize {
        self.list.len()
    }

    fn to_vec<S: NodeStore>(&self, store: &S) -> Vec<ThreadId> {
        self.list.to_vec(store)
    }
}

/// Balanced tree keyed by (priority, insertion order).
#[derive(Debug, Default)]
pub(crate) struct ScalableQueue {
    tree: BTreeMap<(Priority, u64), ThreadId>,
    next_order: u64,
}

impl ThreadQueue for ScalableQueue {
    fn add<S: NodeStore>(&mut self, store: &mut S, id: ThreadId) {
        let order = self.next_order;
        self.next_order = self.next_order.wrapping_add(1);
        store.node_mut(id).order = order;
        self.tree.insert((store.prio(id), order), id);
    }

    fn remove<S: NodeStore>(&mut self, store: &mut S, id: ThreadId) {
        let key = (store.prio(id), store.node(id).order);
        if self.tree.remove(&key).is_none() {
            panic!("thread {} not in scalable queue", id);
        }
    }

    fn best<S: NodeStore>(&self, _store: &S) -> Option<ThreadId> {
        self.tree.values().next().copied()
    }

    fn len(&self) -> usize {
        self.tree.len()
    }

    fn to_vec<S: NodeStore>(&self, _store: &S) -> Vec<ThreadId> {
        self.tree.values().copied().collect()
    }
}

/// One FIFO per priority level and a bitmap of the non-empty levels.
#[derive(Debug)]
pub(crate) struct MultiQueue {
    levels: Vec<DList>,
    bitmask: u32,
    base: Priority,
    len: usize,
}

impl MultiQueue {
    pub(crate) fn new(base: Priority, levels: usize) -> Self {
        debug_assert!(levels <= 32);
        Self { levels: alloc::vec![DList::default(); levels], bitmask: 0, base, len: 0 }
    }

    fn level(&self, prio: Priority) -> usize {
        let level = (prio - self.base) as usize;
        assert!(level < self.levels.len(), "priority {} outside multiq range", prio);
        level
    }
}

impl ThreadQueue for MultiQueue {
    fn add<S: NodeStore>(&mut self, store: &mut S, id: ThreadId) {
        let level = self.level(store.prio(id));
        self.levels[level].push_back(store, id);
        self.bitmask |= 1 << level;
        self.len += 1;
    }

    fn remove<S: NodeStore>(&mut self, store: &mut S, id: ThreadId) {
        let level = self.level(store.prio(id));
        self.levels[level].remove(store, id);
        if self.levels[level].len() == 0 {
            self.bitmask &= !(1 << level);
        }
        self.len -= 1;
    }

    fn best<S: NodeStore>(&self, _store: &S) -> Option<ThreadId> {
        if self.bitmask == 0 {
            return None;
        }
        self.levels[self.bitmask.trailing_zeros() as usize].front()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn to_vec<S: NodeStore>(&self, store: &S) -> Vec<ThreadId> {
        self.levels.iter().flat_map(|l| l.to_vec(store)).collect()
    }
}

/// Queue with the backend chosen by configuration.
#[derive(Debug)]
pub(crate) enum PrioQueue {
    Dumb(DumbQueue),
    Fifo(FifoQueue),
    Scalable(ScalableQueue),
    MultiQ(MultiQueue),
}

impl PrioQueue {
    pub(crate) fn for_ready(config: &KernelConfig) -> Self {
        match config.ready_queue {
            ReadyQueueKind::Dumb => PrioQueue::Dumb(DumbQueue::default()),
            ReadyQueueKind::Scalable => PrioQueue::Scalable(ScalableQueue::default()),
            ReadyQueueKind::MultiQ => {
                PrioQueue::MultiQ(MultiQueue::new(config.highest_priority(), config.num_levels()))
            }
        }
    }

    pub(crate) fn for_wait(config: &KernelConfig) -> Self {
        match config.wait_queue {
            WaitQueueKind::Priority => PrioQueue::Dumb(DumbQueue::default()),
            WaitQueueKind::Fifo => PrioQueue::Fifo(FifoQueue::default()),
            WaitQueueKind::Scalable => PrioQueue::Scalable(ScalableQueue::default()),
        }
    }

    /// Most urgent priority among the members. Arrival-ordered queues have
    /// to look at every member.
    pub(crate) fn top_prio<S: NodeStore>(&self, store: &S) -> Option<Priority> {
        match self {
            PrioQueue::Fifo(q) => q.list.to_vec(store).into_iter().map(|id| store.prio(id)).min(),
            _ => self.best(store).map(|id| store.prio(id)),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $q:ident => $e:expr) => {
        match $self {
            PrioQueue::Dumb($q) => $e,
            PrioQueue::Fifo($q) => $e,
            PrioQueue::Scalable($q) => $e,
            PrioQueue::MultiQ($q) => $e,
        }
    };
}

impl ThreadQueue for PrioQueue {
    fn add<S: NodeStore>(&mut self, store: &mut S, id: ThreadId) {
        dispatch!(self, q => q.add(store, id))
    }

    fn remove<S: NodeStore>(&mut self, store: &mut S, id: ThreadId) {
        dispatch!(self, q => q.remove(store, id))
    }

    fn best<S: NodeStore>(&self, store: &S) -> Option<ThreadId> {
        dispatch!(self, q => q.best(store))
    }

    fn len(&self) -> usize {
        dispatch!(self, q => q.len())
    }

    fn to_vec<S: NodeStore>(&self, store: &S) -> Vec<ThreadId> {
        dispatch!(self, q => q.to_vec(store))
    }
}
