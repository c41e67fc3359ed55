//! Counting semaphore.

use crate::arch::Arch;
use crate::errors::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::sched::wait_q::WaitQId;
use crate::spinlock::SpinLock;
use crate::time::Timeout;

struct SemState {
    count: u32,
    limit: u32,
}

/// Counting semaphore with an upper bound.
pub struct Semaphore<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    wait_q: WaitQId,
    state: SpinLock<SemState>,
}

impl<'k, A: Arch> Semaphore<'k, A> {
    /// # Returns
    ///
    /// `Invalid` if `limit` is zero or below `initial`.
    pub fn new(kernel: &'k Kernel<A>, initial: u32, limit: u32) -> KResult<Self> {
        if limit == 0 || initial > limit {
            return Err(KernelError::Invalid);
        }
        let wait_q = kernel.lock_sched().wait_qs.alloc(kernel.config(), None);
        Ok(Self { kernel, wait_q, state: SpinLock::new(SemState { count: initial, limit }) })
    }

    /// Take one unit, waiting up to `timeout` for it.
    ///
    /// # Returns
    ///
    /// `WouldBlock` when empty and `timeout` is `NoWait`, `TimedOut` when
    /// the wait expired, `Cancelled` when the semaphore was reset meanwhile.
    pub fn take(&self, timeout: Timeout) -> KResult<()> {
        let mut state = self.state.lock(self.kernel.arch());
        if state.count > 0 {
            state.count -= 1;
            return Ok(());
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        self.kernel.pend_curr(state, Some(self.wait_q), timeout).0
    }

    /// Give one unit. A waiting thread receives it directly; otherwise the
    /// count goes up, saturating at the limit.
    pub fn give(&self) {
        let mut state = self.state.lock(self.kernel.arch());
        let mut st = self.kernel.lock_sched();
        match st.unpend_first_thread(self.wait_q) {
            Some(waiter) => {
                st.wake(waiter, Ok(()), 0);
                drop(st);
                self.kernel.reschedule_locked(state);
            }
            None => {
                drop(st);
                if state.count != state.limit {
                    state.count += 1;
                }
            }
        }
    }

    /// Zero the count and release every waiter with `Cancelled`.
    pub fn reset(&self) {
        let mut state = self.state.lock(self.kernel.arch());
        state.count = 0;
        let woke = self.kernel.lock_sched().unpend_all(self.wait_q, Err(KernelError::Cancelled));
        if woke {
            self.kernel.reschedule_locked(state);
        }
    }

    pub fn count(&self) -> u32 {
        self.state.lock(self.kernel.arch()).count
    }

    pub fn limit(&self) -> u32 {
        self.state.lock(self.kernel.arch()).limit
    }
}

impl<A: Arch> Drop for Semaphore<'_, A> {
    fn drop(&mut self) {
        let mut st = self.kernel.lock_sched();
        st.unpend_all(self.wait_q, Err(KernelError::Cancelled));
        st.wait_qs.free(self.wait_q);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::boot;

    #[test]
    fn test_count_saturates_at_limit() {
        let k = boot();
        let sem = Semaphore::new(k, 1, 2).unwrap();
        sem.give();
        sem.give();
        assert_eq!(sem.count(), 2);
        assert_eq!(sem.take(Timeout::NoWait), Ok(()));
        assert_eq!(sem.take(Timeout::NoWait), Ok(()));
        assert_eq!(sem.take(Timeout::NoWait), Err(KernelError::WouldBlock));
    }

    #[test]
    fn test_give_at_max_limit_keeps_count() {
        let k = boot();
        let sem = Semaphore::new(k, u32::MAX, u32::MAX).unwrap();
        sem.give();
        assert_eq!(sem.count(), u32::MAX);
        assert_eq!(sem.take(Timeout::NoWait), Ok(()));
        assert_eq!(sem.count(), u32::MAX - 1);
    }

    #[test]
    fn test_rejects_bad_limits() {
        let k = boot();
        assert!(Semaphore::new(k, 0, 0).is_err());
        assert!(Semaphore::new(k, 3, 2).is_err());
    }

    #[test]
    fn test_take_times_out_after_exact_ticks() {
        let k = boot();
        let sem = Semaphore::new(k, 0, 1).unwrap();
        let start = k.uptime_ticks();
        assert_eq!(sem.take(Timeout::Ticks(5)), Err(KernelError::TimedOut));
        assert_eq!(k.uptime_ticks() - start, 5);
    }
}
