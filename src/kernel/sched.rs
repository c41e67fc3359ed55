//! Scheduling services for the calling thread: yield, sleep, priorities and
//! scheduler locking.

use super::Kernel;
use crate::arch::Arch;
use crate::errors::{KResult, KernelError};
use crate::thread::{Priority, ThreadBuilder, ThreadId};
use crate::time::{ticks_to_ms, SystemTimer, Timeout};

impl<A: Arch> Kernel<A> {
    /// Id of the thread running on this CPU.
    pub fn current(&self) -> ThreadId {
        self.lock_sched().current(self.cpu())
    }

    /// Whether the caller is a thread that can be preempted right now.
    pub fn is_preempt_thread(&self) -> bool {
        if self.in_isr() {
            return false;
        }
        let st = self.lock_sched();
        st.threads[st.current(self.cpu())].is_preempt()
    }

    /// Let every ready thread of equal or more urgent priority run first.
    pub fn yield_now(&self) {
        let mut st = self.lock_sched();
        let cpu = self.cpu();
        let me = st.current(cpu);
        if !st.threads[me].is_idle {
            st.move_to_end_of_prio_q(me, cpu);
        }
        let key = st.take_key();
        let _ = self.do_swap(st, key);
    }

    /// Sleep for `timeout`.
    ///
    /// # Returns
    ///
    /// Ticks left when woken early by [`Kernel::wakeup`], 0 when the full
    /// time passed, `u32::MAX` for `Forever`.
    pub fn sleep(&self, timeout: Timeout) -> u32 {
        let ticks = match timeout.as_ticks() {
            None => {
                self.thread_suspend(self.current());
                return u32::MAX;
            }
            Some(0) => {
                self.yield_now();
                return 0;
            }
            Some(ticks) => ticks,
        };
        let mut st = self.lock_sched();
        let cpu = self.cpu();
        let me = st.current(cpu);
        let elapsed = self.arch.timer().elapsed();
        let wake_at = st.timeouts.curr_tick() + elapsed as u64 + ticks as u64;
        if st.sleep_thread(me, ticks, elapsed) {
            self.reprogram(&st);
        }
        let key = st.take_key();
        let _ = self.do_swap(st, key);
        wake_at.saturating_sub(self.uptime_ticks()) as u32
    }

    /// Sleep for `ms` milliseconds; returns the milliseconds left.
    pub fn msleep(&self, ms: u64) -> u64 {
        match self.sleep(Timeout::from_millis(ms)) {
            u32::MAX => u64::MAX,
            left => ticks_to_ms(left as u64),
        }
    }

    /// End the sleep of `id` early.
    pub fn wakeup(&self, id: ThreadId) {
        let mut st = self.lock_sched();
        if st.threads.get(id).is_some() && st.wakeup_thread(id) {
            self.reschedule_locked(st);
        }
    }

    /// Effective priority of `id`, including any inherited boost.
    pub fn priority_get(&self, id: ThreadId) -> KResult<Priority> {
        let st = self.lock_sched();
        st.threads.get(id).map(|t| t.prio).ok_or(KernelError::Invalid)
    }

    /// Change the priority of `id`. A mutex owner keeps any inherited boost
    /// above the new value.
    pub fn priority_set(&self, id: ThreadId, prio: Priority) -> KResult<()> {
        if !self.config.is_valid_priority(prio) {
            return Err(KernelError::Invalid);
        }
        let mut st = self.lock_sched();
        match st.threads.get(id) {
            Some(t) if !t.is_dead() && !t.is_idle => {}
            _ => return Err(KernelError::Invalid),
        }
        st.set_base_prio(id, prio);
        self.reschedule_locked(st);
        Ok(())
    }

    /// Make the calling thread non-preemptible until the matching
    /// [`Kernel::sched_unlock`]. Calls nest.
    pub fn sched_lock(&self) {
        let mut st = self.lock_sched();
        let me = st.current(self.cpu());
        st.threads[me].sched_locked += 1;
    }

    /// # Panics
    ///
    /// If the scheduler is not locked by the caller.
    pub fn sched_unlock(&self) {
        let mut st = self.lock_sched();
        let me = st.current(self.cpu());
        let t = &mut st.threads[me];
        if t.sched_locked == 0 {
            log::error!("sched_unlock by {} without sched_lock", me);
            panic!("scheduler not locked");
        }
        t.sched_locked -= 1;
        if t.sched_locked == 0 {
            self.reschedule_locked(st);
        }
    }

    /// Set the time slice length (0 disables slicing) and the most urgent
    /// priority it applies to.
    pub fn time_slice_set(&self, ticks: u32, max_prio: Priority) {
        let mut st = self.lock_sched();
        let cpu = self.cpu();
        st.time_slice_set(cpu, ticks, max_prio, self.arch.timer().elapsed());
        self.reprogram(&st);
    }

    /// Spawn a preemptible thread running `f` at `prio` with default
    /// settings.
    pub fn spawn<F>(&'static self, f: F, prio: Priority) -> KResult<ThreadId>
    where
        F: FnOnce() + Send + 'static,
    {
        ThreadBuilder::new().priority(prio).spawn(self, f)
    }
}
