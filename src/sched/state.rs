//! Scheduler state and next-thread selection.
//!
//! All of this runs under the kernel's scheduler lock. Nothing here touches
//! the hardware: the kernel asks [`SchedulerState::next_up`] who should run
//! and performs the switch itself.
//!
//! The running thread is never linked into the ready queue. A thread that
//! yields is queued behind its equals while still running; selection then
//! takes it back out if nothing else wins.

use super::priq::PrioQueue;
use super::trait_def::ThreadQueue;
use super::wait_q::WaitQueues;
use crate::config::KernelConfig;
use crate::thread::{Priority, StateFlags, ThreadId, ThreadState, ThreadTable};
use crate::time::timeout::TimeoutQueue;
use crate::time::timer::TimerTable;
use alloc::vec::Vec;

/// Per-CPU scheduling record.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CpuState {
    pub(crate) current: Option<ThreadId>,
    pub(crate) idle: Option<ThreadId>,
    /// The current thread gave up its claim on the CPU (yield, slice
    /// expiry, suspension). Cleared at the next selection.
    pub(crate) swap_ok: bool,
    /// Ticks left in the current time slice, counted from the last
    /// announcement.
    pub(crate) slice_ticks: u32,
}

/// Everything the scheduler lock protects.
pub(crate) struct SchedulerState<C> {
    pub(crate) config: KernelConfig,
    pub(crate) threads: ThreadTable<C>,
    pub(crate) ready_q: PrioQueue,
    pub(crate) wait_qs: WaitQueues,
    pub(crate) timeouts: TimeoutQueue,
    pub(crate) timers: TimerTable,
    pub(crate) cpus: Vec<CpuState>,
    pub(crate) slice_time: u32,
    pub(crate) slice_max_prio: Priority,
    /// A thread became ready that another CPU may want.
    pub(crate) ipi_pending: bool,
}

impl<C> SchedulerState<C> {
    pub(crate) fn new(config: KernelConfig) -> Self {
        Self {
            ready_q: PrioQueue::for_ready(&config),
            threads: ThreadTable::new(),
            wait_qs: WaitQueues::new(),
            timeouts: TimeoutQueue::new(),
            timers: TimerTable::new(),
            cpus: alloc::vec![CpuState::default(); config.num_cpus],
            slice_time: config.time_slice_ticks,
            slice_max_prio: config.time_slice_max_prio,
            ipi_pending: false,
            config,
        }
    }

    pub(crate) fn current(&self, cpu: usize) -> ThreadId {
        match self.cpus[cpu].current {
            Some(id) => id,
            None => {
                log::error!("cpu {} has no current thread", cpu);
                panic!("scheduler used before a thread was adopted on cpu {}", cpu)
            }
        }
    }

    pub(crate) fn is_current(&self, id: ThreadId) -> bool {
        self.cpus.iter().any(|cpu| cpu.current == Some(id))
    }

    /// Single-valued state; stale ids read as dead.
    pub(crate) fn thread_state(&self, id: ThreadId) -> ThreadState {
        let t = match self.threads.get(id) {
            Some(t) => t,
            None => return ThreadState::Dead,
        };
        if t.flags.contains(StateFlags::DEAD) {
            ThreadState::Dead
        } else if t.flags.contains(StateFlags::PRESTART) {
            ThreadState::Prestart
        } else if t.flags.contains(StateFlags::PENDING) {
            ThreadState::Pending
        } else if t.flags.contains(StateFlags::SUSPENDED) {
            ThreadState::Suspended
        } else if self.is_current(id) {
            ThreadState::Running
        } else {
            ThreadState::Ready
        }
    }

    /// No blocking state and no timeout in flight.
    pub(crate) fn is_thread_ready(&self, id: ThreadId) -> bool {
        let t = &self.threads[id];
        t.is_ready() && t.timeout.is_none()
    }

    fn queue_thread(&mut self, id: ThreadId) {
        self.ready_q.add(&mut self.threads, id);
        self.threads[id].flags.insert(StateFlags::QUEUED);
    }

    pub(crate) fn dequeue_thread(&mut self, id: ThreadId) {
        if self.threads[id].is_queued() {
            self.ready_q.remove(&mut self.threads, id);
            self.threads[id].flags.remove(StateFlags::QUEUED);
        }
    }

    /// Put a thread whose blocking conditions are gone on the ready queue.
    /// Running threads stay off the queue.
    pub(crate) fn ready_thread(&mut self, id: ThreadId) {
        if self.threads[id].is_queued() || !self.is_thread_ready(id) || self.is_current(id) {
            return;
        }
        self.queue_thread(id);
        if self.cpus.len() > 1 {
            self.ipi_pending = true;
        }
    }

    /// Requeue behind every thread of equal priority. For the running thread
    /// this lets the next selection pick an equal-priority peer.
    pub(crate) fn move_to_end_of_prio_q(&mut self, id: ThreadId, cpu: usize) {
        self.dequeue_thread(id);
        self.queue_thread(id);
        if self.cpus[cpu].current == Some(id) {
            self.cpus[cpu].swap_ok = true;
        }
    }

    fn is_higher_prio(&self, a: ThreadId, b: ThreadId) -> bool {
        self.threads[a].prio < self.threads[b].prio
    }

    /// Whether the running thread may be switched out for another one.
    pub(crate) fn should_preempt(&self, cpu: usize) -> bool {
        if self.cpus[cpu].swap_ok {
            return true;
        }
        let cur = &self.threads[self.current(cpu)];
        !cur.is_ready() || cur.is_preempt() || cur.is_idle
    }

    fn idle_thread(&self, cpu: usize) -> ThreadId {
        match self.cpus[cpu].idle {
            Some(id) => id,
            None => panic!("cpu {} has no idle thread", cpu),
        }
    }

    /// Thread that should run on `cpu`, without changing any queue.
    pub(crate) fn peek_next_up(&self, cpu: usize) -> ThreadId {
        let cur = self.current(cpu);
        let mut thread = self.ready_q.best(&self.threads).unwrap_or_else(|| self.idle_thread(cpu));
        let t = &self.threads[cur];
        if t.is_ready() {
            if !t.is_queued() && !self.is_higher_prio(thread, cur) {
                thread = cur;
            }
            if !self.should_preempt(cpu) {
                thread = cur;
            }
        }
        thread
    }

    /// Select the thread to run on `cpu` and fix up the ready queue: a
    /// displaced running thread goes back on it, the winner comes off it.
    pub(crate) fn next_up(&mut self, cpu: usize) -> ThreadId {
        let cur = self.current(cpu);
        let thread = self.peek_next_up(cpu);
        let t = &self.threads[cur];
        if thread != cur && t.is_ready() && !t.is_idle && !t.is_queued() {
            self.queue_thread(cur);
        }
        self.dequeue_thread(thread);
        self.cpus[cpu].swap_ok = false;
        thread
    }

    /// Record `next` as running on `cpu`.
    pub(crate) fn set_current(&mut self, cpu: usize, next: ThreadId, elapsed: u32) {
        self.cpus[cpu].current = Some(next);
        self.cpus[cpu].swap_ok = false;
        self.threads[next].cpu = cpu;
        self.reset_time_slice(cpu, elapsed);
    }

    /// Start a fresh slice for the running thread. Ticks the driver has seen
    /// but not announced are added, as they will be charged by the next
    /// announcement.
    pub(crate) fn reset_time_slice(&mut self, cpu: usize, elapsed: u32) {
        if self.slice_time != 0 {
            self.cpus[cpu].slice_ticks = self.slice_time + elapsed;
        }
    }

    pub(crate) fn time_slice_set(&mut self, cpu: usize, ticks: u32, max_prio: Priority, elapsed: u32) {
        self.cpus[cpu].slice_ticks = 0;
        self.slice_time = ticks;
        self.slice_max_prio = max_prio;
        self.reset_time_slice(cpu, elapsed);
    }

    pub(crate) fn sliceable(&self, id: ThreadId) -> bool {
        let t = &self.threads[id];
        t.is_preempt() && t.prio >= self.slice_max_prio && !t.is_idle && t.timeout.is_none()
    }

    /// Charge `ticks` to the running thread's slice; an exhausted slice
    /// rotates it behind its equals.
    pub(crate) fn time_slice(&mut self, cpu: usize, ticks: u32) {
        let cur = self.current(cpu);
        if self.slice_time != 0 && self.sliceable(cur) {
            if ticks >= self.cpus[cpu].slice_ticks {
                log::trace!("time slice of {} expired", cur);
                self.move_to_end_of_prio_q(cur, cpu);
                self.reset_time_slice(cpu, 0);
            } else {
                self.cpus[cpu].slice_ticks -= ticks;
            }
        } else {
            self.cpus[cpu].slice_ticks = 0;
        }
    }

    /// Ticks from now until the timer must fire: the earliest timeout or the
    /// end of the running thread's slice.
    pub(crate) fn next_expiry(&self, cpu: usize, elapsed: u32) -> Option<u32> {
        let mut ret = self.timeouts.next_timeout(elapsed);
        let slice = self.cpus[cpu].slice_ticks;
        if slice != 0 {
            if let Some(cur) = self.cpus[cpu].current {
                if self.sliceable(cur) {
                    let left = slice.saturating_sub(elapsed);
                    ret = Some(ret.map_or(left, |t| t.min(left)));
                }
            }
        }
        ret
    }

    /// Check that queue membership agrees with the state bits of every
    /// thread.
    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        let ready = self.ready_q.to_vec(&self.threads);
        if ready.len() != self.ready_q.len() {
            return Err("ready queue length disagrees with its links");
        }
        for t in self.threads.iter() {
            let in_ready = ready.iter().filter(|&&id| id == t.id).count();
            if in_ready != usize::from(t.is_queued()) {
                return Err("QUEUED bit disagrees with ready queue membership");
            }
            if t.is_queued() && !t.is_ready() {
                return Err("blocked thread on the ready queue");
            }
            if t.is_queued() && t.is_idle {
                return Err("idle thread on the ready queue");
            }
            match t.pended_on {
                Some(wq) => {
                    if !t.is_pending() {
                        return Err("thread linked to a wait queue without PENDING");
                    }
                    if t.is_queued() {
                        return Err("thread on both a wait queue and the ready queue");
                    }
                    let members = self.wait_qs[wq].queue.to_vec(&self.threads);
                    if !members.contains(&t.id) {
                        return Err("pended_on names a queue the thread is not in");
                    }
                }
                None => {
                    if t.is_dead() && t.timeout.is_some() {
                        return Err("dead thread with a live timeout");
                    }
                }
            }
        }
        for cpu in &self.cpus {
            if let Some(cur) = cpu.current {
                if self.threads[cur].is_queued() && !cpu.swap_ok {
                    return Err("running thread left on the ready queue");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::thread::{Tcb, ThreadOptions};

    /// Scheduler with an idle thread and an adopted current thread of
    /// priority `main_prio` on cpu 0.
    pub(crate) fn state_with_main(config: KernelConfig, main_prio: Priority) -> (SchedulerState<()>, ThreadId) {
        let mut st = SchedulerState::<()>::new(config);
        let idle = spawn(&mut st, config.idle_priority());
        st.threads[idle].is_idle = true;
        st.cpus[0].idle = Some(idle);
        let main = spawn(&mut st, main_prio);
        st.threads[main].flags.remove(StateFlags::PRESTART);
        st.set_current(0, main, 0);
        (st, main)
    }

    pub(crate) fn spawn(st: &mut SchedulerState<()>, prio: Priority) -> ThreadId {
        let join_q = st.wait_qs.alloc(&st.config, None);
        let tcb = Tcb::new(st.threads.next_id(), prio, ThreadOptions::empty(), None, (), join_q);
        st.threads.insert(tcb)
    }

    pub(crate) fn start(st: &mut SchedulerState<()>, prio: Priority) -> ThreadId {
        let id = spawn(st, prio);
        st.threads[id].flags.remove(StateFlags::PRESTART);
        st.ready_thread(id);
        id
    }

    fn switch(st: &mut SchedulerState<()>) -> ThreadId {
        let next = st.next_up(0);
        st.set_current(0, next, 0);
        next
    }

    #[test]
    fn test_higher_priority_preempts() {
        let (mut st, main) = state_with_main(KernelConfig::default(), 10);
        assert_eq!(st.peek_next_up(0), main);
        let hi = start(&mut st, 5);
        assert_eq!(st.peek_next_up(0), hi);
        assert_eq!(switch(&mut st), hi);
        // The displaced thread is back on the ready queue.
        assert!(st.threads[main].is_queued());
        assert_eq!(st.thread_state(main), ThreadState::Ready);
        assert_eq!(st.thread_state(hi), ThreadState::Running);
        st.validate().unwrap();
    }

    #[test]
    fn test_cooperative_thread_is_not_preempted() {
        let (mut st, main) = state_with_main(KernelConfig::default(), -1);
        let hi = start(&mut st, -5);
        assert_eq!(st.peek_next_up(0), main);
        // Until it yields.
        st.move_to_end_of_prio_q(main, 0);
        assert_eq!(switch(&mut st), hi);
    }

    #[test]
    fn test_equal_priority_waits_for_yield() {
        let (mut st, main) = state_with_main(KernelConfig::default(), 3);
        let peer = start(&mut st, 3);
        assert_eq!(st.peek_next_up(0), main);
        st.move_to_end_of_prio_q(main, 0);
        assert_eq!(switch(&mut st), peer);
        assert_eq!(st.ready_q.to_vec(&st.threads), alloc::vec![main]);
        st.validate().unwrap();
    }

    #[test]
    fn test_yield_alone_keeps_running() {
        let (mut st, main) = state_with_main(KernelConfig::default(), 3);
        let _low = start(&mut st, 7);
        st.move_to_end_of_prio_q(main, 0);
        assert_eq!(switch(&mut st), main);
        assert!(!st.threads[main].is_queued());
        st.validate().unwrap();
    }

    #[test]
    fn test_blocked_current_falls_back_to_idle() {
        let (mut st, main) = state_with_main(KernelConfig::default(), 3);
        st.threads[main].flags.insert(StateFlags::SUSPENDED);
        let idle = st.cpus[0].idle.unwrap();
        assert_eq!(switch(&mut st), idle);
        assert!(!st.threads[main].is_queued());
        assert_eq!(st.thread_state(main), ThreadState::Suspended);
    }

    #[test]
    fn test_time_slice_rotates_equal_priorities() {
        let cfg = KernelConfig::default().with_time_slice(3, 0);
        let (mut st, main) = state_with_main(cfg, 4);
        let peer = start(&mut st, 4);
        st.time_slice(0, 2);
        assert_eq!(st.peek_next_up(0), main);
        assert_eq!(st.next_expiry(0, 0), Some(1));
        st.time_slice(0, 1);
        assert_eq!(switch(&mut st), peer);
        assert_eq!(st.cpus[0].slice_ticks, 3);
    }

    #[test]
    fn test_slice_skips_urgent_threads() {
        let cfg = KernelConfig::default().with_time_slice(2, 5);
        let (mut st, main) = state_with_main(cfg, 4);
        let _peer = start(&mut st, 4);
        st.time_slice(0, 10);
        assert_eq!(st.peek_next_up(0), main);
        assert_eq!(st.cpus[0].slice_ticks, 0);
    }

    #[test]
    fn test_stale_id_reads_dead() {
        let (mut st, _main) = state_with_main(KernelConfig::default(), 3);
        let t = spawn(&mut st, 2);
        st.threads.remove(t);
        assert_eq!(st.thread_state(t), ThreadState::Dead);
    }
}
