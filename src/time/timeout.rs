//! Delta-list timeout queue.
//!
//! Each node stores the number of ticks after its predecessor expires, so the
//! absolute expiry of a node is the sum of the deltas from the head up to and
//! including it. Only the head needs adjusting when time passes.
//!
//! Ticks are counted from the last announcement. Time the driver reports as
//! elapsed but not yet announced is folded into new nodes, so a timeout of
//! `n` ticks fires after exactly `n` ticks of real time however the driver
//! batches its announcements.

use crate::time::timer::TimerId;
use crate::thread::ThreadId;
use crate::time::MAX_TIMEOUT_TICKS;
use alloc::vec::Vec;

/// What to do when a timeout expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Wake the thread with a timeout result (or start it, if delayed).
    Thread(ThreadId),
    /// Run a kernel timer's expiry handling.
    Timer(TimerId),
}

/// Handle of a queued timeout node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutKey {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Node {
    prev: Option<u32>,
    next: Option<u32>,
    dticks: i64,
    action: TimeoutAction,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Ordered list of pending timeouts.
#[derive(Debug, Default)]
pub struct TimeoutQueue {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    curr_tick: u64,
    /// Ticks of the announcement in progress not yet consumed; zero outside
    /// an announcement.
    announce_remaining: i64,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ticks announced so far.
    pub fn curr_tick(&self) -> u64 {
        self.curr_tick
    }

    /// Ticks since the last announcement, as seen by a new node. Inside an
    /// announcement the list is already rebased, so nothing is added.
    fn elapsed(&self, driver_elapsed: u32) -> i64 {
        if self.announce_remaining == 0 {
            driver_elapsed as i64
        } else {
            0
        }
    }

    fn node(&self, index: u32) -> &Node {
        match self.slots[index as usize].node.as_ref() {
            Some(node) => node,
            None => panic!("timeout list links a free slot"),
        }
    }

    fn node_mut(&mut self, index: u32) -> &mut Node {
        match self.slots[index as usize].node.as_mut() {
            Some(node) => node,
            None => panic!("timeout list links a free slot"),
        }
    }

    fn resolve(&self, key: TimeoutKey) -> Option<u32> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation == key.generation && slot.node.is_some() {
            Some(key.index)
        } else {
            None
        }
    }

    /// Whether `key` is still queued.
    pub fn is_active(&self, key: TimeoutKey) -> bool {
        self.resolve(key).is_some()
    }

    /// Queue `action` to fire `ticks` ticks from now (at least one tick).
    ///
    /// # Returns
    ///
    /// The node's key, and whether it became the new head (the timer driver
    /// must then be reprogrammed).
    pub fn add(&mut self, action: TimeoutAction, ticks: u32, driver_elapsed: u32) -> (TimeoutKey, bool) {
        let ticks = ticks.clamp(1, MAX_TIMEOUT_TICKS);
        let mut dticks = ticks as i64 + self.elapsed(driver_elapsed);

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot { generation: 0, node: None });
                (self.slots.len() - 1) as u32
            }
        };
        let generation = self.slots[index as usize].generation.wrapping_add(1);
        self.slots[index as usize].generation = generation;

        let mut cursor = self.head;
        let mut insert_before = None;
        while let Some(c) = cursor {
            let cd = self.node(c).dticks;
            if cd > dticks {
                self.node_mut(c).dticks = cd - dticks;
                insert_before = Some(c);
                break;
            }
            dticks -= cd;
            cursor = self.node(c).next;
        }

        let (prev, next) = match insert_before {
            Some(succ) => (self.node(succ).prev, Some(succ)),
            None => (self.tail, None),
        };
        self.slots[index as usize].node = Some(Node { prev, next, dticks, action });
        match prev {
            Some(p) => self.node_mut(p).next = Some(index),
            None => self.head = Some(index),
        }
        match next {
            Some(n) => self.node_mut(n).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.len += 1;

        (TimeoutKey { index, generation }, self.head == Some(index))
    }

    fn unlink(&mut self, index: u32) -> Node {
        let node = match self.slots[index as usize].node.take() {
            Some(node) => node,
            None => panic!("unlinking a free timeout slot"),
        };
        match node.next {
            Some(n) => {
                let succ = self.node_mut(n);
                succ.dticks += node.dticks;
                succ.prev = node.prev;
            }
            None => self.tail = node.prev,
        }
        match node.prev {
            Some(p) => self.node_mut(p).next = node.next,
            None => self.head = node.next,
        }
        self.free.push(index);
        self.len -= 1;
        node
    }

    /// Remove a queued timeout. Returns `false` if it already fired or was
    /// aborted.
    pub fn abort(&mut self, key: TimeoutKey) -> bool {
        match self.resolve(key) {
            Some(index) => {
                self.unlink(index);
                true
            }
            None => false,
        }
    }

    /// Ticks until `key` expires, or `None` if it is not queued.
    pub fn remaining(&self, key: TimeoutKey, driver_elapsed: u32) -> Option<u64> {
        let target = self.resolve(key)?;
        let mut ticks = 0i64;
        let mut cursor = self.head;
        while let Some(c) = cursor {
            ticks += self.node(c).dticks;
            if c == target {
                break;
            }
            cursor = self.node(c).next;
        }
        Some((ticks - self.elapsed(driver_elapsed)).max(0) as u64)
    }

    /// Ticks until the head expires, or `None` if the list is empty.
    pub fn next_timeout(&self, driver_elapsed: u32) -> Option<u32> {
        let head = self.head?;
        let ticks = (self.node(head).dticks - self.elapsed(driver_elapsed)).max(0);
        Some(ticks.min(MAX_TIMEOUT_TICKS as i64) as u32)
    }

    /// Start announcing `ticks` elapsed ticks. Follow with
    /// [`TimeoutQueue::pop_expired`] until it returns `None`, then
    /// [`TimeoutQueue::finish_announce`].
    pub fn begin_announce(&mut self, ticks: u32) {
        self.announce_remaining = ticks as i64;
    }

    /// Pop the next node whose deadline falls inside the announcement.
    pub fn pop_expired(&mut self) -> Option<TimeoutAction> {
        let head = self.head?;
        let dt = self.node(head).dticks;
        if dt > self.announce_remaining {
            return None;
        }
        self.curr_tick = self.curr_tick.wrapping_add(dt.max(0) as u64);
        self.announce_remaining -= dt;
        self.node_mut(head).dticks = 0;
        Some(self.unlink(head).action)
    }

    /// Charge the rest of the announcement to the new head.
    pub fn finish_announce(&mut self) {
        let remaining = self.announce_remaining;
        if let Some(head) = self.head {
            self.node_mut(head).dticks -= remaining;
        }
        self.curr_tick = self.curr_tick.wrapping_add(remaining.max(0) as u64);
        self.announce_remaining = 0;
    }

    /// Announce `ticks` and collect every expired action, in expiry order.
    /// Only for callers that can act on all of them after the fact.
    pub fn announce(&mut self, ticks: u32) -> Vec<TimeoutAction> {
        self.begin_announce(ticks);
        let mut fired = Vec::new();
        while let Some(action) = self.pop_expired() {
            fired.push(action);
        }
        self.finish_announce();
        fired
    }

    /// (action, delta) pairs from head to tail.
    pub fn deltas(&self) -> Vec<(TimeoutAction, i64)> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(c) = cursor {
            let node = self.node(c);
            out.push((node.action, node.dticks));
            cursor = node.next;
        }
        out
    }
}
