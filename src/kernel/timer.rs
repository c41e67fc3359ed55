//! Kernel side of [`crate::time::Timer`].

use super::Kernel;
use crate::arch::Arch;
use crate::errors::{KResult, KernelError};
use crate::time::timeout::TimeoutAction;
use crate::time::timer::{TimerRecord, TimerFn, TimerId};
use crate::time::{SystemTimer, Timeout};

impl<A: Arch> Kernel<A> {
    pub(crate) fn timer_create(&self, expiry_fn: Option<TimerFn>, stop_fn: Option<TimerFn>) -> TimerId {
        let mut st = self.lock_sched();
        let wait_q = st.wait_qs.alloc(&self.config, None);
        st.timers.insert(TimerRecord {
            timeout: None,
            period: 0,
            status: 0,
            expiry_fn,
            stop_fn,
            wait_q,
            user_data: 0,
        })
    }

    pub(crate) fn timer_start(&self, id: TimerId, duration: Timeout, period: Timeout) {
        let ticks = match duration.as_ticks() {
            None => return,
            Some(ticks) => ticks.max(1),
        };
        let period = match period {
            Timeout::Ticks(n) => n,
            Timeout::NoWait | Timeout::Forever => 0,
        };
        let mut st = self.lock_sched();
        if let Some(key) = st.timers[id].timeout.take() {
            st.timeouts.abort(key);
        }
        let (key, head) = st.timeouts.add(TimeoutAction::Timer(id), ticks, self.arch.timer().elapsed());
        let record = &mut st.timers[id];
        record.timeout = Some(key);
        record.period = period;
        record.status = 0;
        if head {
            self.reprogram(&st);
        }
    }

    pub(crate) fn timer_stop(&self, id: TimerId) {
        let (stop_fn, wait_q) = {
            let mut st = self.lock_sched();
            let key = match st.timers[id].timeout.take() {
                Some(key) => key,
                None => return,
            };
            if !st.timeouts.abort(key) {
                return;
            }
            let record = &st.timers[id];
            (record.stop_fn.clone(), record.wait_q)
        };
        if let Some(stop_fn) = stop_fn {
            stop_fn();
        }
        let mut st = self.lock_sched();
        match st.unpend_first_thread(wait_q) {
            Some(waiter) => {
                st.wake(waiter, Ok(()), 0);
                self.reschedule_locked(st);
            }
            None => drop(st),
        }
    }

    pub(crate) fn timer_status_get(&self, id: TimerId) -> u32 {
        core::mem::take(&mut self.lock_sched().timers[id].status)
    }

    pub(crate) fn timer_status_sync(&self, id: TimerId) -> KResult<u32> {
        let st = self.lock_sched();
        let record = &st.timers[id];
        if record.status == 0 && record.timeout.is_some() {
            if self.in_isr() {
                return Err(KernelError::WouldBlock);
            }
            let wait_q = record.wait_q;
            self.pend_curr_locked(st, Some(wait_q), Timeout::Forever).0?;
            return Ok(self.timer_status_get(id));
        }
        drop(st);
        Ok(self.timer_status_get(id))
    }

    pub(crate) fn timer_remaining_ticks(&self, id: TimerId) -> u64 {
        let st = self.lock_sched();
        st.timers[id]
            .timeout
            .and_then(|key| st.timeouts.remaining(key, self.arch.timer().elapsed()))
            .unwrap_or(0)
    }

    pub(crate) fn timer_user_data_set(&self, id: TimerId, data: usize) {
        self.lock_sched().timers[id].user_data = data;
    }

    pub(crate) fn timer_user_data(&self, id: TimerId) -> usize {
        self.lock_sched().timers[id].user_data
    }

    /// Stop the timer for good: waiters are released with `Cancelled`.
    pub(crate) fn timer_destroy(&self, id: TimerId) {
        let mut st = self.lock_sched();
        let record = match st.timers.remove(id) {
            Some(record) => record,
            None => return,
        };
        if let Some(key) = record.timeout {
            st.timeouts.abort(key);
        }
        let woke = st.unpend_all(record.wait_q, Err(KernelError::Cancelled));
        st.wait_qs.free(record.wait_q);
        if woke {
            self.reschedule_locked(st);
        }
    }
}
