//! Recursive mutex with priority inheritance.
//!
//! Owner, lock count and waiters all live in the scheduler state (see
//! `sched::inherit`); this type only holds the wait queue handle. An owner
//! inherits the priority of its most urgent waiter, capped at the configured
//! ceiling, and the boost follows chains of owners blocked on other mutexes.

use crate::arch::Arch;
use crate::errors::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::sched::wait_q::{MutexRecord, WaitQId};
use crate::thread::ThreadId;
use crate::time::Timeout;

pub struct Mutex<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    wait_q: WaitQId,
}

impl<'k, A: Arch> Mutex<'k, A> {
    pub fn new(kernel: &'k Kernel<A>) -> Self {
        let wait_q = kernel.lock_sched().wait_qs.alloc(kernel.config(), Some(MutexRecord::default()));
        Self { kernel, wait_q }
    }

    /// Lock the mutex, waiting up to `timeout`. The owner may lock again;
    /// each lock needs a matching [`Mutex::unlock`].
    ///
    /// # Returns
    ///
    /// `WouldBlock` if owned by another thread and `timeout` is `NoWait`,
    /// `TimedOut` if the wait expired, `Invalid` from interrupt context.
    pub fn lock(&self, timeout: Timeout) -> KResult<()> {
        if self.kernel.in_isr() {
            return Err(KernelError::Invalid);
        }
        let mut st = self.kernel.lock_sched();
        let me = st.current(self.kernel.cpu());
        match st.mutex_try_lock(self.wait_q, me) {
            Ok(()) => Ok(()),
            Err(KernelError::WouldBlock) if !timeout.is_no_wait() => {
                log::trace!("thread {} waits for mutex {}", me, self.wait_q);
                self.kernel.pend_curr_locked(st, Some(self.wait_q), timeout).0
            }
            Err(e) => Err(e),
        }
    }

    /// Release one level of ownership. The last unlock hands the mutex to
    /// the most urgent waiter and drops any inherited priority.
    ///
    /// # Returns
    ///
    /// `NotOwner` if the caller does not hold it, `Invalid` if unlocked or
    /// called from interrupt context.
    pub fn unlock(&self) -> KResult<()> {
        if self.kernel.in_isr() {
            return Err(KernelError::Invalid);
        }
        let mut st = self.kernel.lock_sched();
        let me = st.current(self.kernel.cpu());
        st.mutex_unlock(self.wait_q, me)?;
        // The caller may have lost a boost even without a handoff.
        self.kernel.reschedule_locked(st);
        Ok(())
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.kernel.lock_sched().mutex_owner(self.wait_q)
    }

    pub fn lock_count(&self) -> u32 {
        self.kernel.lock_sched().mutex_lock_count(self.wait_q)
    }
}

impl<A: Arch> Drop for Mutex<'_, A> {
    fn drop(&mut self) {
        let mut st = self.kernel.lock_sched();
        if let Some(owner) = st.mutex_owner(self.wait_q) {
            log::warn!("mutex {} dropped while owned by {}", self.wait_q, owner);
        }
        st.unpend_all(self.wait_q, Err(KernelError::Cancelled));
        st.mutex_forget(self.wait_q);
        st.wait_qs.free(self.wait_q);
    }
}
