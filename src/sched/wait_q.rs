//! Wait queues of blocked threads, kept in an arena owned by the scheduler.

use super::priq::PrioQueue;
use super::trait_def::ThreadQueue;
use crate::config::KernelConfig;
use crate::thread::ThreadId;
use alloc::vec::Vec;
use core::fmt;

/// Handle of a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitQId(pub(crate) u32);

impl fmt::Display for WaitQId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wq{}", self.0)
    }
}

/// Ownership record of a mutex, stored next to its wait queue so priority
/// inheritance can reach it from a waiter's `pended_on`.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MutexRecord {
    pub(crate) owner: Option<ThreadId>,
    pub(crate) lock_count: u32,
}

pub(crate) struct WaitQueue {
    pub(crate) queue: PrioQueue,
    pub(crate) mutex: Option<MutexRecord>,
}

/// Arena of wait queues. Freed slots are recycled.
pub(crate) struct WaitQueues {
    slots: Vec<Option<WaitQueue>>,
    free: Vec<u32>,
}

impl WaitQueues {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    pub(crate) fn alloc(&mut self, config: &KernelConfig, mutex: Option<MutexRecord>) -> WaitQId {
        let wq = WaitQueue { queue: PrioQueue::for_wait(config), mutex };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(wq);
                WaitQId(index)
            }
            None => {
                self.slots.push(Some(wq));
                WaitQId((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Release a wait queue. It must be empty.
    pub(crate) fn free(&mut self, id: WaitQId) {
        match self.slots.get_mut(id.0 as usize).and_then(Option::take) {
            Some(wq) => {
                if wq.queue.len() != 0 {
                    log::error!("freeing {} with {} waiters", id, wq.queue.len());
                    panic!("wait queue freed while threads are pending on it");
                }
                self.free.push(id.0);
            }
            None => panic!("double free of {}", id),
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl core::ops::Index<WaitQId> for WaitQueues {
    type Output = WaitQueue;

    fn index(&self, id: WaitQId) -> &WaitQueue {
        match self.slots.get(id.0 as usize).and_then(Option::as_ref) {
            Some(wq) => wq,
            None => panic!("unknown wait queue {}", id),
        }
    }
}

impl core::ops::IndexMut<WaitQId> for WaitQueues {
    fn index_mut(&mut self, id: WaitQId) -> &mut WaitQueue {
        match self.slots.get_mut(id.0 as usize).and_then(Option::as_mut) {
            Some(wq) => wq,
            None => panic!("unknown wait queue {}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_recycled() {
        let cfg = KernelConfig::default();
        let mut arena = WaitQueues::new();
        let a = arena.alloc(&cfg, None);
        let b = arena.alloc(&cfg, Some(MutexRecord::default()));
        assert_ne!(a, b);
        assert!(arena[b].mutex.is_some());
        arena.free(a);
        assert_eq!(arena.live(), 1);
        let c = arena.alloc(&cfg, None);
        assert_eq!(a, c);
        assert!(arena[c].mutex.is_none());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let cfg = KernelConfig::default();
        let mut arena = WaitQueues::new();
        let a = arena.alloc(&cfg, None);
        arena.free(a);
        arena.free(a);
    }
}
