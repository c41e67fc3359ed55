//! Blocking, waking and thread state transitions.

use super::state::SchedulerState;
use super::trait_def::ThreadQueue;
use super::wait_q::WaitQId;
use crate::errors::{KResult, KernelError};
use crate::thread::{StateFlags, ThreadId};
use crate::time::timeout::TimeoutAction;
use crate::time::timer::TimerFn;
use crate::time::Timeout;

impl<C> SchedulerState<C> {
    /// Queue a timeout for `id`.
    ///
    /// # Returns
    ///
    /// Whether the earliest deadline changed and the timer needs
    /// reprogramming.
    pub(crate) fn add_thread_timeout(&mut self, id: ThreadId, ticks: u32, elapsed: u32) -> bool {
        if self.threads[id].timeout.is_some() {
            log::error!("thread {} already has a timeout", id);
            panic!("timeout added twice for thread {}", id);
        }
        let (key, head) = self.timeouts.add(TimeoutAction::Thread(id), ticks, elapsed);
        self.threads[id].timeout = Some(key);
        head
    }

    /// Cancel the timeout of `id`. Returns `false` if none was queued.
    pub(crate) fn abort_thread_timeout(&mut self, id: ThreadId) -> bool {
        match self.threads[id].timeout.take() {
            Some(key) => self.timeouts.abort(key),
            None => false,
        }
    }

    /// Take `id` off the ready queue and park it on `wq` (if any) with an
    /// optional timeout. The wake result defaults to a timeout.
    ///
    /// # Returns
    ///
    /// Whether the timer needs reprogramming.
    pub(crate) fn pend_thread(&mut self, id: ThreadId, wq: Option<WaitQId>, timeout: Timeout, elapsed: u32) -> bool {
        if self.threads[id].is_pending() {
            log::error!("thread {} pended twice", id);
            panic!("thread {} is already pending", id);
        }
        self.dequeue_thread(id);
        {
            let t = &mut self.threads[id];
            t.flags.insert(StateFlags::PENDING);
            t.swap_retval = Err(KernelError::TimedOut);
            t.swap_data = 0;
        }
        log::trace!("pend {} on {:?} for {:?}", id, wq, timeout);
        if let Some(wq) = wq {
            self.threads[id].pended_on = Some(wq);
            self.wait_qs[wq].queue.add(&mut self.threads, id);
            self.propagate_from_waitq(wq);
        }
        match timeout.as_ticks() {
            Some(ticks) => self.add_thread_timeout(id, ticks, elapsed),
            None => false,
        }
    }

    /// Remove `id` from the wait queue it is parked on, leaving its timeout.
    pub(crate) fn unpend_thread_no_timeout(&mut self, id: ThreadId) {
        let wq = match self.threads[id].pended_on.take() {
            Some(wq) => wq,
            None => {
                log::error!("unpend of {} which is not on a wait queue", id);
                panic!("thread {} is not pended", id);
            }
        };
        self.wait_qs[wq].queue.remove(&mut self.threads, id);
        self.threads[id].flags.remove(StateFlags::PENDING);
        self.propagate_from_waitq(wq);
    }

    pub(crate) fn unpend_thread(&mut self, id: ThreadId) {
        self.unpend_thread_no_timeout(id);
        self.abort_thread_timeout(id);
    }

    pub(crate) fn waitq_head(&self, wq: WaitQId) -> Option<ThreadId> {
        self.wait_qs[wq].queue.best(&self.threads)
    }

    /// Unpend the thread first in line on `wq` and cancel its timeout. The
    /// caller decides the wake result and readies it.
    pub(crate) fn unpend_first_thread(&mut self, wq: WaitQId) -> Option<ThreadId> {
        let id = self.waitq_head(wq)?;
        self.unpend_thread(id);
        Some(id)
    }

    /// Deliver `retval`/`data` to `id` and make it ready.
    pub(crate) fn wake(&mut self, id: ThreadId, retval: KResult<()>, data: usize) {
        let t = &mut self.threads[id];
        t.swap_retval = retval;
        t.swap_data = data;
        self.ready_thread(id);
    }

    /// Wake every waiter on `wq` with `retval`. Returns whether any woke.
    pub(crate) fn unpend_all(&mut self, wq: WaitQId, retval: KResult<()>) -> bool {
        let mut woke = false;
        while let Some(id) = self.unpend_first_thread(wq) {
            self.wake(id, retval, 0);
            woke = true;
        }
        woke
    }

    /// Expiry of a thread's own timeout: the wait (or sleep, or delayed
    /// start) ends and the thread becomes ready, keeping whatever result
    /// was preset when it blocked.
    pub(crate) fn thread_timeout_expired(&mut self, id: ThreadId) {
        if self.threads.get(id).is_none() {
            return;
        }
        self.threads[id].timeout = None;
        if self.threads[id].pended_on.is_some() {
            self.unpend_thread_no_timeout(id);
        }
        self.threads[id].flags.remove(StateFlags::PRESTART | StateFlags::SUSPENDED);
        self.ready_thread(id);
    }

    /// Process one expired timeout. A timer's expiry callback is returned
    /// so it can run without the scheduler lock.
    pub(crate) fn handle_expired(&mut self, action: TimeoutAction) -> Option<TimerFn> {
        match action {
            TimeoutAction::Thread(id) => {
                log::trace!("timeout of {} expired", id);
                self.thread_timeout_expired(id);
                None
            }
            TimeoutAction::Timer(tid) => {
                let (callback, wq) = {
                    let record = self.timers.get_mut(tid)?;
                    record.timeout = None;
                    if record.period > 0 {
                        // Re-armed relative to this expiry, not to now.
                        let (key, _) = self.timeouts.add(action, record.period, 0);
                        record.timeout = Some(key);
                    }
                    record.status = record.status.saturating_add(1);
                    (record.expiry_fn.clone(), record.wait_q)
                };
                if let Some(waiter) = self.unpend_first_thread(wq) {
                    self.wake(waiter, Ok(()), 0);
                }
                callback
            }
        }
    }

    /// Make a PRESTART thread eligible to run, dropping a pending start
    /// delay. Returns `false` if it had already started.
    pub(crate) fn start_thread(&mut self, id: ThreadId) -> bool {
        if !self.threads[id].flags.contains(StateFlags::PRESTART) {
            return false;
        }
        self.abort_thread_timeout(id);
        self.threads[id].flags.remove(StateFlags::PRESTART);
        self.ready_thread(id);
        true
    }

    /// Suspend `id`. Any timeout is cancelled. A thread parked on a wait
    /// queue stays there without a deadline and must be both woken and
    /// resumed to run again.
    pub(crate) fn suspend_thread(&mut self, id: ThreadId, cpu: usize) {
        self.abort_thread_timeout(id);
        self.dequeue_thread(id);
        self.threads[id].flags.insert(StateFlags::SUSPENDED);
        if self.cpus[cpu].current == Some(id) {
            self.cpus[cpu].swap_ok = true;
        }
    }

    /// Clear the suspension of `id`. Returns `false` if it was not suspended
    /// or is sleeping; a sleeper ends its sleep through `wakeup_thread`.
    pub(crate) fn resume_thread(&mut self, id: ThreadId) -> bool {
        let t = &self.threads[id];
        if !t.flags.contains(StateFlags::SUSPENDED) || (t.timeout.is_some() && !t.is_pending()) {
            return false;
        }
        self.threads[id].flags.remove(StateFlags::SUSPENDED);
        self.ready_thread(id);
        true
    }

    /// Put the running thread to sleep for `ticks`.
    pub(crate) fn sleep_thread(&mut self, id: ThreadId, ticks: u32, elapsed: u32) -> bool {
        self.dequeue_thread(id);
        let head = self.add_thread_timeout(id, ticks, elapsed);
        self.threads[id].flags.insert(StateFlags::SUSPENDED);
        head
    }

    /// End a sleep early. Threads pended on an object are left alone, as
    /// are suspended threads with other state bits set.
    pub(crate) fn wakeup_thread(&mut self, id: ThreadId) -> bool {
        if self.threads[id].is_pending() {
            return false;
        }
        if !self.abort_thread_timeout(id)
            && self.threads[id].flags.difference(StateFlags::QUEUED) != StateFlags::SUSPENDED
        {
            return false;
        }
        self.threads[id].flags.remove(StateFlags::SUSPENDED);
        self.ready_thread(id);
        true
    }

    /// Mark `id` dead and detach it from every queue and timeout, waking its
    /// joiners. Returns `false` if it was already dead.
    pub(crate) fn abort_thread(&mut self, id: ThreadId) -> bool {
        if self.threads[id].is_dead() {
            return false;
        }
        self.abort_thread_timeout(id);
        if self.threads[id].pended_on.is_some() {
            self.unpend_thread_no_timeout(id);
        }
        self.dequeue_thread(id);
        {
            let t = &mut self.threads[id];
            t.flags.remove(StateFlags::PENDING);
            t.flags.insert(StateFlags::DEAD);
            if !t.owned_mutexes.is_empty() {
                log::warn!("thread {} aborted while owning {} mutex(es)", id, t.owned_mutexes.len());
            }
        }
        let join_q = self.threads[id].join_q;
        self.unpend_all(join_q, Ok(()));
        true
    }

    /// Change the application priority of `id`. Returns whether the thread
    /// is runnable, so a reschedule may be due.
    pub(crate) fn set_base_prio(&mut self, id: ThreadId, prio: crate::thread::Priority) -> bool {
        self.threads[id].base_prio = prio;
        self.update_inheritance(id);
        self.threads[id].is_ready()
    }
}
