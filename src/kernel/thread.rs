//! Thread lifecycle: creation, start, suspension, abort and join.

use super::{idle_entry, thread_entry, Kernel};
use crate::arch::{build_initial_frame, Arch, InitialFrame};
use crate::config::MIN_STACK_SIZE;
use crate::errors::{KResult, KernelError, SpawnError};
use crate::fatal::FatalReason;
use crate::mem::Stack;
use crate::sched::SchedulerState;
use crate::thread::{StateFlags, Tcb, ThreadBuilder, ThreadEntry, ThreadId, ThreadInfo, ThreadOptions, ThreadState};
use crate::time::{SystemTimer, Timeout};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

impl<A: Arch> Kernel<A> {
    /// Create a thread from `builder` that runs `entry(args...)`.
    pub(crate) fn thread_create(
        &'static self,
        builder: ThreadBuilder,
        entry: ThreadEntry,
        args: [usize; 3],
    ) -> KResult<ThreadId> {
        if !self.is_initialized() {
            return Err(SpawnError::NotInitialized.into());
        }
        if !self.config.is_valid_priority(builder.priority) {
            return Err(SpawnError::InvalidPriority(builder.priority).into());
        }
        let delay = builder.delay;
        let (id, _) = self.create_thread(builder, entry, args)?;
        log::debug!("created thread {} (start delay {:?})", id, delay);

        match delay.as_ticks() {
            None => {}
            Some(0) => self.thread_start(id),
            Some(ticks) => {
                let mut st = self.lock_sched();
                if st.add_thread_timeout(id, ticks, self.arch.timer().elapsed()) {
                    self.reprogram(&st);
                }
            }
        }
        Ok(id)
    }

    /// Allocate the stack and control block of a PRESTART thread.
    fn create_thread(
        &'static self,
        builder: ThreadBuilder,
        entry: ThreadEntry,
        args: [usize; 3],
    ) -> KResult<(ThreadId, InitialFrame)> {
        let ThreadBuilder { name, priority, stack_size, stack, options, abort_hook, .. } = builder;
        let stack = match stack {
            Some(stack) => stack,
            None => {
                if stack_size < MIN_STACK_SIZE {
                    return Err(SpawnError::StackTooSmall(stack_size).into());
                }
                self.stacks.allocate(stack_size).ok_or(SpawnError::OutOfMemory)?
            }
        };
        if stack.size() < MIN_STACK_SIZE {
            return Err(SpawnError::StackTooSmall(stack.size()).into());
        }
        if self.config.stack_sentinel {
            stack.install_sentinel();
        }

        let frame = build_initial_frame(
            thread_entry::<A>,
            stack.initial_sp(),
            [entry as usize, args[0], args[1], args[2], self as *const Self as usize],
        );
        let mut ctx = A::SavedContext::default();
        self.arch.new_thread(&mut ctx, &frame);

        let (id, reclaimed) = {
            let mut st = self.lock_sched();
            let reclaimed = reap_dead(&mut st);
            let join_q = st.wait_qs.alloc(&self.config, None);
            let mut tcb = Tcb::new(st.threads.next_id(), priority, options, Some(stack), ctx, join_q);
            tcb.name = name;
            tcb.abort_hook = abort_hook;
            tcb.entry = entry as usize;
            (st.threads.insert(tcb), reclaimed)
        };
        for stack in reclaimed {
            self.stacks.deallocate(stack);
        }
        Ok((id, frame))
    }

    pub(super) fn create_idle_thread(&'static self, cpu: usize) -> KResult<(ThreadId, InitialFrame)> {
        let builder = ThreadBuilder::new()
            .name(format!("idle {}", cpu))
            .priority(self.config.idle_priority())
            .stack_size(self.config.idle_stack_size)
            .essential();
        let (id, frame) = self.create_thread(builder, idle_entry::<A>, [self as *const Self as usize, cpu, 0])?;
        let mut st = self.lock_sched();
        let t = &mut st.threads[id];
        t.is_idle = true;
        t.cpu = cpu;
        t.flags.remove(StateFlags::PRESTART);
        Ok((id, frame))
    }

    /// Turn the calling context into the running main thread of this CPU.
    pub(super) fn adopt_main_thread(&self) -> KResult<ThreadId> {
        let prio = self.config.main_priority;
        if !self.config.is_valid_priority(prio) {
            return Err(SpawnError::InvalidPriority(prio).into());
        }
        let mut ctx = A::SavedContext::default();
        self.arch.adopt_current(&mut ctx);
        let mut st = self.lock_sched();
        let join_q = st.wait_qs.alloc(&self.config, None);
        let mut tcb = Tcb::new(st.threads.next_id(), prio, ThreadOptions::empty(), None, ctx, join_q);
        tcb.flags.remove(StateFlags::PRESTART);
        tcb.name = Some(String::from("main"));
        let id = st.threads.insert(tcb);
        st.set_current(self.cpu(), id, self.arch.timer().elapsed());
        Ok(id)
    }

    /// Start a thread created with a `Forever` (or still pending) delay.
    pub fn thread_start(&self, id: ThreadId) {
        let mut st = self.lock_sched();
        if st.threads.get(id).is_some() && st.start_thread(id) {
            self.reschedule_locked(st);
        }
    }

    /// Suspend `id` until [`Kernel::thread_resume`]. Suspending the caller
    /// switches away immediately.
    pub fn thread_suspend(&self, id: ThreadId) {
        let mut st = self.lock_sched();
        match st.threads.get(id) {
            Some(t) if !t.is_dead() => {}
            _ => return,
        }
        let cpu = self.cpu();
        st.suspend_thread(id, cpu);
        if st.current(cpu) == id && !self.in_isr() {
            let key = st.take_key();
            let _ = self.do_swap(st, key);
        } else {
            self.reschedule_locked(st);
        }
    }

    pub fn thread_resume(&self, id: ThreadId) {
        let mut st = self.lock_sched();
        if st.threads.get(id).is_some() && st.resume_thread(id) {
            self.reschedule_locked(st);
        }
    }

    /// Terminate `id`. Its joiners are released; aborting the caller does
    /// not return. Stale or dead ids are ignored.
    pub fn thread_abort(&self, id: ThreadId) {
        let hook = {
            let st = self.lock_sched();
            let (essential, hook) = match st.threads.get(id) {
                None => return,
                Some(t) if t.is_dead() => return,
                Some(t) => (t.is_essential() || t.is_idle, t.abort_hook),
            };
            if essential {
                drop(st);
                log::error!("essential thread {} aborted", id);
                self.fatal_error(FatalReason::KernelPanic);
            }
            hook
        };
        if let Some(hook) = hook {
            hook(id);
        }

        let mut st = self.lock_sched();
        let key = st.take_key();
        if st.threads.get(id).is_none() || !st.abort_thread(id) {
            drop(st);
            self.arch.irq_unlock(key);
            return;
        }
        log::debug!("thread {} aborted", id);
        if st.current(self.cpu()) == id && !self.in_isr() {
            let _ = self.do_swap(st, key);
        } else {
            drop(st);
            self.reschedule_irqlock(key);
        }
    }

    /// Abort the calling thread.
    pub fn thread_exit(&self) -> ! {
        let me = self.current();
        self.thread_abort(me);
        log::error!("thread {} resumed after exit", me);
        self.arch.system_halt(FatalReason::KernelPanic)
    }

    /// Wait for `id` to terminate.
    ///
    /// # Returns
    ///
    /// `Ok` once it is dead (immediately for dead or unknown ids),
    /// `Deadlock` for a self-join or two threads joining each other,
    /// `WouldBlock` for `NoWait`, `TimedOut` if the timeout expires first.
    pub fn thread_join(&self, id: ThreadId, timeout: Timeout) -> KResult<()> {
        let st = self.lock_sched();
        let me = st.current(self.cpu());
        if id == me {
            return Err(KernelError::Deadlock);
        }
        let target = match st.threads.get(id) {
            None => return Ok(()),
            Some(t) if t.is_dead() => return Ok(()),
            Some(t) => t,
        };
        if target.pended_on == Some(st.threads[me].join_q) {
            return Err(KernelError::Deadlock);
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        let join_q = target.join_q;
        self.pend_curr_locked(st, Some(join_q), timeout).0
    }

    pub fn thread_state(&self, id: ThreadId) -> ThreadState {
        self.lock_sched().thread_state(id)
    }

    pub fn thread_name_set(&self, id: ThreadId, name: &str) -> KResult<()> {
        let mut st = self.lock_sched();
        let t = st.threads.get_mut(id).ok_or(KernelError::Invalid)?;
        t.name = Some(String::from(name));
        Ok(())
    }

    pub fn thread_name(&self, id: ThreadId) -> Option<String> {
        self.lock_sched().threads.get(id).and_then(|t| t.name.clone())
    }

    /// Set the calling thread's custom data word.
    pub fn custom_data_set(&self, value: usize) {
        let mut st = self.lock_sched();
        let me = st.current(self.cpu());
        st.threads[me].custom_data = value;
    }

    pub fn custom_data(&self) -> usize {
        let st = self.lock_sched();
        st.threads[st.current(self.cpu())].custom_data
    }

    /// Mark the calling thread essential.
    pub fn essential_set(&self) {
        let mut st = self.lock_sched();
        let me = st.current(self.cpu());
        st.threads[me].options.insert(ThreadOptions::ESSENTIAL);
    }

    pub fn essential_clear(&self) {
        let mut st = self.lock_sched();
        let me = st.current(self.cpu());
        st.threads[me].options.remove(ThreadOptions::ESSENTIAL);
    }

    pub fn is_essential(&self) -> bool {
        let st = self.lock_sched();
        st.threads[st.current(self.cpu())].is_essential()
    }

    pub fn thread_abort_hook_set(&self, id: ThreadId, hook: Option<fn(ThreadId)>) -> KResult<()> {
        let mut st = self.lock_sched();
        st.threads.get_mut(id).ok_or(KernelError::Invalid)?.abort_hook = hook;
        Ok(())
    }

    /// Call `f` with a snapshot of every thread. The snapshot is taken
    /// under the scheduler lock; `f` runs without it.
    pub fn thread_foreach<F: FnMut(&ThreadInfo)>(&self, mut f: F) {
        let infos: Vec<ThreadInfo> = {
            let st = self.lock_sched();
            st.threads
                .iter()
                .map(|t| ThreadInfo {
                    id: t.id,
                    name: t.name.clone(),
                    state: st.thread_state(t.id),
                    priority: t.prio,
                    base_priority: t.base_prio,
                    options: t.options,
                    stack_base: t.stack.as_ref().map_or(0, Stack::base),
                    stack_size: t.stack.as_ref().map_or(0, Stack::size),
                    entry: t.entry,
                    is_idle: t.is_idle,
                })
                .collect()
        };
        for info in &infos {
            f(info);
        }
    }
}

/// Remove dead threads that no CPU is still running on. Their stacks are
/// returned for the caller to release outside the lock.
fn reap_dead<C>(st: &mut SchedulerState<C>) -> Vec<Stack> {
    let dead: Vec<ThreadId> = st
        .threads
        .iter()
        .filter(|t| t.is_dead() && !st.is_current(t.id))
        .map(|t| t.id)
        .collect();
    let mut stacks = Vec::new();
    for id in dead {
        if let Some(tcb) = st.threads.remove(id) {
            st.wait_qs.free(tcb.join_q);
            if let Some(stack) = tcb.stack {
                stacks.push(stack);
            }
        }
    }
    stacks
}
