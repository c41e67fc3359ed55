//! Unbounded queue of items, with FIFO and LIFO front-ends.

use crate::arch::Arch;
use crate::errors::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::sched::wait_q::WaitQId;
use crate::spinlock::SpinLock;
use crate::thread::ThreadId;
use crate::time::Timeout;
use alloc::collections::{BTreeMap, VecDeque};

struct QueueState<T> {
    items: VecDeque<T>,
    /// Items delivered to woken getters that have not collected them yet.
    handoff: BTreeMap<ThreadId, T>,
}

/// Queue of `T` that getters can block on.
///
/// An item put while a thread waits goes straight to that thread and is
/// never visible to [`Queue::peek_head`] or to other getters.
pub struct Queue<'k, A: Arch, T> {
    kernel: &'k Kernel<A>,
    wait_q: WaitQId,
    state: SpinLock<QueueState<T>>,
}

impl<'k, A: Arch, T: Send> Queue<'k, A, T> {
    pub fn new(kernel: &'k Kernel<A>) -> Self {
        let wait_q = kernel.lock_sched().wait_qs.alloc(kernel.config(), None);
        Self {
            kernel,
            wait_q,
            state: SpinLock::new(QueueState { items: VecDeque::new(), handoff: BTreeMap::new() }),
        }
    }

    fn insert(&self, item: T, at_tail: bool) {
        let mut state = self.state.lock(self.kernel.arch());
        let mut st = self.kernel.lock_sched();
        match st.unpend_first_thread(self.wait_q) {
            Some(waiter) => {
                state.handoff.insert(waiter, item);
                st.wake(waiter, Ok(()), 0);
                drop(st);
                self.kernel.reschedule_locked(state);
            }
            None => {
                drop(st);
                if at_tail {
                    state.items.push_back(item);
                } else {
                    state.items.push_front(item);
                }
            }
        }
    }

    /// Add `item` at the tail.
    pub fn append(&self, item: T) {
        self.insert(item, true);
    }

    /// Add `item` at the head.
    pub fn prepend(&self, item: T) {
        self.insert(item, false);
    }

    /// Remove the head item, waiting up to `timeout` for one.
    ///
    /// # Returns
    ///
    /// `WouldBlock` when empty and `timeout` is `NoWait`, `TimedOut` when the
    /// wait expired, `Cancelled` after [`Queue::cancel_wait`].
    pub fn get(&self, timeout: Timeout) -> KResult<T> {
        let mut state = self.state.lock(self.kernel.arch());
        if let Some(item) = state.items.pop_front() {
            return Ok(item);
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.kernel.pend_curr(state, Some(self.wait_q), timeout).0?;
        let me = self.kernel.current();
        self.state.lock(self.kernel.arch()).handoff.remove(&me).ok_or_else(|| {
            log::error!("thread {} woken from queue {} without an item", me, self.wait_q);
            KernelError::Cancelled
        })
    }

    /// Release the first waiting getter empty-handed with `Cancelled`.
    pub fn cancel_wait(&self) {
        let mut st = self.kernel.lock_sched();
        if let Some(waiter) = st.unpend_first_thread(self.wait_q) {
            st.wake(waiter, Err(KernelError::Cancelled), 0);
            self.kernel.reschedule_locked(st);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock(self.kernel.arch()).items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock(self.kernel.arch()).items.len()
    }
}

impl<A: Arch, T: Clone + Send> Queue<'_, A, T> {
    pub fn peek_head(&self) -> Option<T> {
        self.state.lock(self.kernel.arch()).items.front().cloned()
    }

    pub fn peek_tail(&self) -> Option<T> {
        self.state.lock(self.kernel.arch()).items.back().cloned()
    }
}

impl<A: Arch, T> Drop for Queue<'_, A, T> {
    fn drop(&mut self) {
        let mut st = self.kernel.lock_sched();
        st.unpend_all(self.wait_q, Err(KernelError::Cancelled));
        st.wait_qs.free(self.wait_q);
    }
}

/// First in, first out.
pub struct Fifo<'k, A: Arch, T>(Queue<'k, A, T>);

impl<'k, A: Arch, T: Send> Fifo<'k, A, T> {
    pub fn new(kernel: &'k Kernel<A>) -> Self {
        Self(Queue::new(kernel))
    }

    pub fn put(&self, item: T) {
        self.0.append(item);
    }

    pub fn get(&self, timeout: Timeout) -> KResult<T> {
        self.0.get(timeout)
    }

    pub fn cancel_wait(&self) {
        self.0.cancel_wait();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Last in, first out.
pub struct Lifo<'k, A: Arch, T>(Queue<'k, A, T>);

impl<'k, A: Arch, T: Send> Lifo<'k, A, T> {
    pub fn new(kernel: &'k Kernel<A>) -> Self {
        Self(Queue::new(kernel))
    }

    pub fn put(&self, item: T) {
        self.0.prepend(item);
    }

    pub fn get(&self, timeout: Timeout) -> KResult<T> {
        self.0.get(timeout)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
