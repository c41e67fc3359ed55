//! Thread control blocks and the slot table that owns them.
//!
//! Threads live in an index-based arena owned by the scheduler. Queues and
//! timeouts refer to threads by [`ThreadId`] (slot index plus generation), so
//! there are no pointer cycles and a stale id is detected instead of aliasing
//! a newer thread that reused the slot.

use crate::errors::KResult;
use crate::mem::Stack;
use crate::sched::wait_q::WaitQId;
use crate::time::timeout::TimeoutKey;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::num::NonZeroU64;

pub mod builder;

pub use builder::ThreadBuilder;

/// Body of a kernel thread, called with the three creation arguments.
pub type ThreadEntry = fn(usize, usize, usize);

/// Thread priority. Lower values are more urgent; negative values are
/// cooperative (never preempted), non-negative values are preemptible.
pub type Priority = i32;

/// Unique identifier of a thread: slot index in the low half, slot
/// generation (starting at 1) in the high half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        let raw = ((generation.max(1) as u64) << 32) | index as u64;
        // generation >= 1 keeps the high half non-zero.
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    pub(crate) fn index(self) -> usize {
        (self.0.get() & 0xFFFF_FFFF) as usize
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    /// Raw value, stable for the lifetime of the thread.
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

// Queue links store `Option<ThreadId>`; keep them one word.
static_assertions::assert_eq_size!(ThreadId, Option<ThreadId>);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index(), self.generation())
    }
}

bitflags::bitflags! {
    /// Low-level scheduling state bits. Several may be set at once (a
    /// sleeping thread can also be suspended); [`ThreadState`] is the
    /// single-valued view.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u8 {
        /// Created but not started.
        const PRESTART = 1 << 0;
        /// Parked on a wait queue or sleeping on a timeout.
        const PENDING = 1 << 1;
        const SUSPENDED = 1 << 2;
        const DEAD = 1 << 3;
        /// Linked into the ready queue.
        const QUEUED = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Creation options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadOptions: u8 {
        /// Any fatal error in this thread halts the system.
        const ESSENTIAL = 1 << 0;
        /// Thread uses floating point registers.
        const FP_REGS = 1 << 1;
    }
}

/// Externally visible thread state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Prestart,
    Ready,
    Running,
    Pending,
    Suspended,
    Dead,
}

/// Ready/wait queue linkage embedded in every control block.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct QNode {
    pub(crate) prev: Option<ThreadId>,
    pub(crate) next: Option<ThreadId>,
    /// Insertion order key, used by tree-backed queues.
    pub(crate) order: u64,
}

/// Thread control block.
pub(crate) struct Tcb<C> {
    pub(crate) id: ThreadId,
    pub(crate) flags: StateFlags,
    /// Effective priority, including inherited boosts.
    pub(crate) prio: Priority,
    /// Priority requested by the application.
    pub(crate) base_prio: Priority,
    pub(crate) options: ThreadOptions,
    /// `sched_lock` nesting depth; non-zero makes the thread non-preemptible.
    pub(crate) sched_locked: u32,
    pub(crate) node: QNode,
    /// Weak back-reference to the wait queue the thread is parked on.
    pub(crate) pended_on: Option<WaitQId>,
    pub(crate) timeout: Option<TimeoutKey>,
    /// Result delivered to a blocking call when the thread resumes.
    pub(crate) swap_retval: KResult<()>,
    /// Word handed over together with the result (block index, stack word).
    pub(crate) swap_data: usize,
    /// Wait queues of mutexes currently owned by this thread.
    pub(crate) owned_mutexes: Vec<WaitQId>,
    /// Threads blocked in `thread_join` on this one.
    pub(crate) join_q: WaitQId,
    /// `None` for the adopted boot context, which runs on a stack the
    /// kernel does not own.
    pub(crate) stack: Option<Stack>,
    pub(crate) ctx: Box<C>,
    pub(crate) name: Option<String>,
    pub(crate) custom_data: usize,
    pub(crate) abort_hook: Option<fn(ThreadId)>,
    pub(crate) entry: usize,
    /// CPU the thread last ran on.
    pub(crate) cpu: usize,
    pub(crate) is_idle: bool,
}

impl<C> Tcb<C> {
    pub(crate) fn new(
        id: ThreadId,
        prio: Priority,
        options: ThreadOptions,
        stack: Option<Stack>,
        ctx: C,
        join_q: WaitQId,
    ) -> Self {
        Self {
            id,
            flags: StateFlags::PRESTART,
            prio,
            base_prio: prio,
            options,
            sched_locked: 0,
            node: QNode::default(),
            pended_on: None,
            timeout: None,
            swap_retval: Ok(()),
            swap_data: 0,
            owned_mutexes: Vec::new(),
            join_q,
            stack,
            ctx: Box::new(ctx),
            name: None,
            custom_data: 0,
            abort_hook: None,
            entry: 0,
            cpu: 0,
            is_idle: false,
        }
    }

    /// Not blocked by any state bit: eligible for the ready queue.
    pub(crate) fn is_ready(&self) -> bool {
        !self
            .flags
            .intersects(StateFlags::PRESTART | StateFlags::PENDING | StateFlags::SUSPENDED | StateFlags::DEAD)
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.flags.contains(StateFlags::QUEUED)
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.flags.contains(StateFlags::PENDING)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.flags.contains(StateFlags::DEAD)
    }

    pub(crate) fn is_essential(&self) -> bool {
        self.options.contains(ThreadOptions::ESSENTIAL)
    }

    /// Preemptible priority and scheduler not locked.
    pub(crate) fn is_preempt(&self) -> bool {
        self.prio >= 0 && self.sched_locked == 0
    }

    pub(crate) fn ctx_ptr(&mut self) -> *mut C {
        &mut *self.ctx as *mut C
    }
}

struct Slot<C> {
    generation: u32,
    tcb: Option<Tcb<C>>,
}

/// Arena of thread control blocks.
pub(crate) struct ThreadTable<C> {
    slots: Vec<Slot<C>>,
    free: Vec<u32>,
}

impl<C> ThreadTable<C> {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    /// Id the next insertion will receive.
    pub(crate) fn next_id(&self) -> ThreadId {
        match self.free.last() {
            Some(&index) => ThreadId::new(index, self.slots[index as usize].generation),
            None => ThreadId::new(self.slots.len() as u32, 1),
        }
    }

    pub(crate) fn insert(&mut self, tcb: Tcb<C>) -> ThreadId {
        let id = tcb.id;
        debug_assert_eq!(id, self.next_id());
        match self.free.pop() {
            Some(index) => self.slots[index as usize].tcb = Some(tcb),
            None => self.slots.push(Slot { generation: 1, tcb: Some(tcb) }),
        }
        id
    }

    /// Free the slot of `id` and return its control block.
    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<Tcb<C>> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() || slot.tcb.is_none() {
            return None;
        }
        let tcb = slot.tcb.take();
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(id.index() as u32);
        tcb
    }

    pub(crate) fn get(&self, id: ThreadId) -> Option<&Tcb<C>> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.tcb.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: ThreadId) -> Option<&mut Tcb<C>> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.tcb.as_mut()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Tcb<C>> {
        self.slots.iter().filter_map(|slot| slot.tcb.as_ref())
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl<C> core::ops::Index<ThreadId> for ThreadTable<C> {
    type Output = Tcb<C>;

    fn index(&self, id: ThreadId) -> &Tcb<C> {
        match self.get(id) {
            Some(tcb) => tcb,
            None => stale_thread(id),
        }
    }
}

impl<C> core::ops::IndexMut<ThreadId> for ThreadTable<C> {
    fn index_mut(&mut self, id: ThreadId) -> &mut Tcb<C> {
        match self.get_mut(id) {
            Some(tcb) => tcb,
            None => stale_thread(id),
        }
    }
}

#[cold]
fn stale_thread(id: ThreadId) -> ! {
    log::error!("reference to stale or unknown thread {}", id);
    panic!("stale thread id {}", id)
}

/// Snapshot of a thread, as reported by `Kernel::thread_foreach`.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: Option<String>,
    pub state: ThreadState,
    pub priority: Priority,
    pub base_priority: Priority,
    pub options: ThreadOptions,
    pub stack_base: usize,
    pub stack_size: usize,
    pub entry: usize,
    pub is_idle: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcb(table: &ThreadTable<()>, prio: Priority) -> Tcb<()> {
        Tcb::new(table.next_id(), prio, ThreadOptions::empty(), None, (), WaitQId(0))
    }

    #[test]
    fn test_thread_id_packing() {
        let id = ThreadId::new(7, 3);
        assert_eq!(id.index(), 7);
        assert_eq!(id.generation(), 3);
        assert_eq!(alloc::format!("{}", id), "7.3");
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut table = ThreadTable::<()>::new();
        let t = tcb(&table, 1);
        let a = table.insert(t);
        assert!(table.remove(a).is_some());
        let t = tcb(&table, 1);
        let b = table.insert(t);
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    #[should_panic(expected = "stale thread id")]
    fn test_stale_index_panics() {
        let mut table = ThreadTable::<()>::new();
        let t = tcb(&table, 1);
        let a = table.insert(t);
        table.remove(a);
        let _ = &table[a];
    }

    #[test]
    fn test_readiness_flags() {
        let table = ThreadTable::<()>::new();
        let mut t = tcb(&table, 3);
        assert!(!t.is_ready());
        t.flags.remove(StateFlags::PRESTART);
        assert!(t.is_ready());
        t.flags.insert(StateFlags::SUSPENDED);
        assert!(!t.is_ready());
        assert!(t.is_preempt());
        t.prio = -1;
        assert!(!t.is_preempt());
    }
}
