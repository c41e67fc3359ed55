//! Kernel instance: owns the scheduler state and drives context switches.
//!
//! Every service that can change which thread runs ends in one of two
//! places: [`Kernel::do_swap`], which picks the next thread and switches to
//! it, or [`Kernel::reschedule_irqlock`], which does the same only when the
//! caller is a thread that may be preempted right now. Interrupt handlers
//! never switch directly; the outermost [`Kernel::isr_exit`] does it for
//! them.
//!
//! Lock order is object lock, then scheduler lock, then the stack pool. The
//! scheduler lock is always released before a switch.

mod clock;
mod sched;
mod thread;
mod timer;

use crate::arch::{Arch, IdleWake, IrqKey};
use crate::config::{KernelConfig, MAX_CPUS};
use crate::errors::KResult;
use crate::fatal::{self, FatalAction, FatalContext, FatalHook, FatalReason};
use crate::mem::StackPool;
use crate::sched::wait_q::WaitQId;
use crate::sched::SchedulerState;
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::thread::{ThreadEntry, ThreadId};
use crate::time::{SystemTimer, Timeout};
use core::ptr::null_mut;
use portable_atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

/// Global kernel reference for interrupt handlers.
static GLOBAL_KERNEL: AtomicPtr<()> = AtomicPtr::new(null_mut());

/// Guard of the scheduler lock.
pub(crate) type SchedGuard<'a, A> = SpinLockGuard<'a, SchedulerState<<A as Arch>::SavedContext>, A>;

/// A kernel instance bound to one architecture backend.
///
/// # Type Parameters
///
/// * `A` - Architecture implementation
pub struct Kernel<A: Arch> {
    arch: A,
    config: KernelConfig,
    pub(crate) sched: SpinLock<SchedulerState<A::SavedContext>>,
    stacks: StackPool,
    initialized: AtomicBool,
    /// Interrupt nesting depth per CPU.
    nested: [AtomicU32; MAX_CPUS],
    fatal_hook: spin::Mutex<Option<FatalHook>>,
}

impl<A: Arch> Kernel<A> {
    /// Create a kernel instance.
    ///
    /// # Arguments
    ///
    /// * `arch` - Backend that switches contexts and owns the timer
    /// * `config` - Scheduling policy and limits
    ///
    /// # Returns
    ///
    /// The kernel, not yet running any thread, or the reason `config` was
    /// rejected.
    pub fn new(arch: A, config: KernelConfig) -> KResult<Self> {
        config.validate()?;
        Ok(Self {
            arch,
            config,
            sched: SpinLock::new(SchedulerState::new(config)),
            stacks: StackPool::new(),
            initialized: AtomicBool::new(false),
            nested: [const { AtomicU32::new(0) }; MAX_CPUS],
            fatal_hook: spin::Mutex::new(None),
        })
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Bring the kernel up: create an idle thread per CPU and adopt the
    /// calling context as the main thread of CPU 0.
    ///
    /// # Returns
    ///
    /// Id of the adopted main thread.
    pub fn init(&'static self) -> KResult<ThreadId> {
        if self.initialized.load(Ordering::Acquire) {
            return Err(crate::errors::KernelError::Invalid);
        }
        let mut idles = alloc::vec::Vec::with_capacity(self.config.num_cpus);
        for cpu in 0..self.config.num_cpus {
            let (idle, frame) = self.create_idle_thread(cpu)?;
            self.sched.lock(&self.arch).cpus[cpu].idle = Some(idle);
            idles.push(frame);
        }
        let main = self.adopt_main_thread()?;
        self.initialized.store(true, Ordering::Release);
        log::info!("kernel up: {} cpu(s), main thread {}", self.config.num_cpus, main);

        for (cpu, frame) in idles.iter().enumerate().skip(1) {
            if let Err(e) = self.arch.start_cpu(cpu, frame) {
                log::warn!("cpu {} not started: {}", cpu, e);
            }
        }
        Ok(main)
    }

    /// Make this kernel reachable from interrupt vectors.
    ///
    /// # Safety
    ///
    /// Only one kernel may be registered, and readers must ask for it with
    /// the same `A` it was created with.
    pub unsafe fn register_global(&'static self) {
        GLOBAL_KERNEL.store(self as *const _ as *mut (), Ordering::Release);
    }

    pub(crate) fn lock_sched(&self) -> SchedGuard<'_, A> {
        self.sched.lock(&self.arch)
    }

    pub(crate) fn cpu(&self) -> usize {
        self.arch.cpu_id()
    }

    /// Program the timer for the earliest deadline on this CPU.
    pub(crate) fn reprogram(&self, st: &SchedulerState<A::SavedContext>) {
        let timer = self.arch.timer();
        timer.set_timeout(st.next_expiry(self.cpu(), timer.elapsed()), false);
    }

    /// Switch to whichever thread should run next on this CPU, possibly the
    /// caller itself, then restore `key`.
    ///
    /// The scheduler lock is released before the switch. When the calling
    /// thread is resumed the result and word delivered to it by its waker
    /// are returned.
    pub(crate) fn do_swap<'a>(&'a self, mut st: SchedGuard<'a, A>, key: IrqKey) -> (KResult<()>, usize) {
        st.discard_key();
        let cpu = self.cpu();
        let cur = st.current(cpu);

        if self.config.stack_sentinel && !st.threads[cur].is_dead() {
            let intact = st.threads[cur].stack.as_ref().map_or(true, |s| s.check_sentinel());
            if !intact {
                log::error!("stack sentinel of thread {} overwritten", cur);
                drop(st);
                self.fatal_error(FatalReason::StackCheckFail);
            }
        }

        let next = st.next_up(cpu);
        if next != cur {
            let elapsed = self.arch.timer().elapsed();
            st.set_current(cpu, next, elapsed);
            self.arch.timer().set_timeout(st.next_expiry(cpu, elapsed), false);
            let prev_ctx = st.threads[cur].ctx_ptr();
            let next_ctx = st.threads[next].ctx_ptr();
            let ipi = core::mem::take(&mut st.ipi_pending);
            log::trace!("switch {} -> {} on cpu {}", cur, next, cpu);
            drop(st);
            if ipi {
                self.arch.sched_ipi();
            }
            // SAFETY: both contexts are boxed in live control blocks, the
            // lock is released and interrupts are masked. A dead `cur` is
            // only reaped once it is no longer current anywhere.
            unsafe { self.arch.switch(prev_ctx, next_ctx) };
            st = self.sched.lock(&self.arch);
            st.discard_key();
        }

        let me = st.current(self.cpu());
        let result = (st.threads[me].swap_retval, st.threads[me].swap_data);
        let ipi = core::mem::take(&mut st.ipi_pending);
        drop(st);
        self.arch.irq_unlock(key);
        if ipi {
            self.arch.sched_ipi();
        }
        result
    }

    fn assert_can_block(&self, timeout: Timeout) {
        if self.in_isr() && !timeout.is_no_wait() {
            log::error!("blocking call with {:?} from interrupt context", timeout);
            panic!("cannot block in an interrupt handler");
        }
    }

    /// Park the current thread on `wq` and switch away. The object lock held
    /// by `obj` is released only once the thread is queued, so no wake-up
    /// can be lost in between.
    pub(crate) fn pend_curr<T>(
        &self,
        mut obj: SpinLockGuard<'_, T, A>,
        wq: Option<WaitQId>,
        timeout: Timeout,
    ) -> (KResult<()>, usize) {
        self.assert_can_block(timeout);
        let key = obj.take_key();
        let mut st = self.sched.lock(&self.arch);
        self.pend_locked(&mut st, wq, timeout);
        drop(obj);
        self.do_swap(st, key)
    }

    /// [`Kernel::pend_curr`] for objects whose state lives under the
    /// scheduler lock.
    pub(crate) fn pend_curr_locked(
        &self,
        mut st: SchedGuard<'_, A>,
        wq: Option<WaitQId>,
        timeout: Timeout,
    ) -> (KResult<()>, usize) {
        self.assert_can_block(timeout);
        let key = st.take_key();
        self.pend_locked(&mut st, wq, timeout);
        self.do_swap(st, key)
    }

    fn pend_locked(&self, st: &mut SchedulerState<A::SavedContext>, wq: Option<WaitQId>, timeout: Timeout) {
        let cpu = self.cpu();
        let cur = st.current(cpu);
        if st.pend_thread(cur, wq, timeout, self.arch.timer().elapsed()) {
            self.reprogram(st);
        }
    }

    /// Release `guard` and give the scheduler a chance to run a more urgent
    /// thread.
    pub(crate) fn reschedule_locked<T>(&self, mut guard: SpinLockGuard<'_, T, A>) {
        let key = guard.take_key();
        drop(guard);
        self.reschedule_irqlock(key);
    }

    /// Switch if the caller is a thread with interrupts enabled at `key`;
    /// otherwise just restore `key`. Interrupt handlers switch on exit.
    pub(crate) fn reschedule_irqlock(&self, key: IrqKey) {
        if key.enabled && !self.in_isr() && self.is_initialized() {
            let st = self.sched.lock(&self.arch);
            let _ = self.do_swap(st, key);
        } else {
            self.arch.irq_unlock(key);
        }
    }

    /// Let the scheduler run a more urgent ready thread, if any.
    pub fn reschedule(&self) {
        let key = self.arch.irq_lock();
        self.reschedule_irqlock(key);
    }

    /// Called by interrupt vectors before running a handler.
    pub fn isr_enter(&self) {
        self.nested[self.cpu()].fetch_add(1, Ordering::AcqRel);
    }

    /// Called by interrupt vectors after the handler, interrupts masked.
    /// Leaving the outermost handler switches to the most urgent thread.
    pub fn isr_exit(&self) {
        let cpu = self.cpu();
        let prev = self.nested[cpu].fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            log::error!("unbalanced isr_exit on cpu {}", cpu);
            panic!("isr_exit without isr_enter");
        }
        if prev == 1 && self.is_initialized() {
            let st = self.sched.lock(&self.arch);
            let _ = self.do_swap(st, IrqKey { enabled: false });
        }
    }

    /// Whether the caller runs in interrupt context.
    pub fn in_isr(&self) -> bool {
        self.nested[self.cpu()].load(Ordering::Acquire) > 0
    }

    /// Run `f` as if it were an interrupt handler.
    pub fn irq_offload<F: FnOnce()>(&self, f: F) {
        let key = self.arch.irq_lock();
        self.isr_enter();
        f();
        self.isr_exit();
        self.arch.irq_unlock(key);
    }

    /// Install the hook consulted on fatal errors.
    pub fn set_fatal_hook(&self, hook: Option<FatalHook>) {
        *self.fatal_hook.lock() = hook;
    }

    /// Handle an unrecoverable error: abort the current thread when that is
    /// safe, otherwise halt the system.
    pub fn fatal_error(&self, reason: FatalReason) -> ! {
        let cpu = self.cpu();
        let in_isr = self.in_isr();
        let (thread, essential) = match self.sched.try_lock(&self.arch) {
            Some(st) => {
                let cur = st.cpus.get(cpu).and_then(|c| c.current);
                let essential = cur
                    .and_then(|id| st.threads.get(id))
                    .map_or(false, |t| t.is_essential() || t.is_idle);
                (cur, essential)
            }
            // The lock is held by whoever failed; there is no thread we
            // could safely abort.
            None => (None, false),
        };
        log::error!(">>> FATAL ERROR: {} in thread {:?} (isr: {})", reason, thread, in_isr);
        let ctx = FatalContext { reason, thread, in_isr, essential };
        let hook = *self.fatal_hook.lock();
        match fatal::decide(&ctx, hook) {
            FatalAction::Halt => self.arch.system_halt(reason),
            FatalAction::AbortThread => self.thread_exit(),
        }
    }

    fn idle_loop(&self, cpu: usize) -> ! {
        loop {
            let key = self.arch.irq_lock();
            {
                let st = self.sched.lock(&self.arch);
                let timer = self.arch.timer();
                timer.set_timeout(st.next_expiry(cpu, timer.elapsed()), true);
            }
            match self.arch.cpu_idle() {
                IdleWake::Interrupt => {}
                IdleWake::TimerDue => {
                    self.isr_enter();
                    self.timer_isr();
                    self.isr_exit();
                }
                IdleWake::Stalled => {
                    log::error!("cpu {} idle with no pending wake-up: every thread is blocked forever", cpu);
                    self.arch.system_halt(FatalReason::KernelPanic);
                }
            }
            self.reschedule_irqlock(key);
        }
    }
}

/// The kernel registered with [`Kernel::register_global`], if any.
pub fn get_global_kernel<A: Arch>() -> Option<&'static Kernel<A>> {
    let ptr = GLOBAL_KERNEL.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        // SAFETY: registered from a `&'static Kernel<A>` with the same `A`.
        Some(unsafe { &*(ptr as *const Kernel<A>) })
    }
}

/// First code every kernel thread runs. Unmasks interrupts, runs the body
/// and aborts the thread when the body returns.
extern "C-unwind" fn thread_entry<A: Arch>(entry: usize, p1: usize, p2: usize, p3: usize, kernel: usize) -> ! {
    // SAFETY: threads are only created by a `&'static Kernel<A>`.
    let kernel = unsafe { &*(kernel as *const Kernel<A>) };
    kernel.arch.enable_interrupts();
    // SAFETY: `entry` was stored from a `ThreadEntry` in `thread_create`.
    let body = unsafe { core::mem::transmute::<usize, ThreadEntry>(entry) };
    body(p1, p2, p3);
    kernel.thread_exit()
}

fn idle_entry<A: Arch>(kernel: usize, cpu: usize, _: usize) {
    // SAFETY: see `thread_entry`.
    let kernel = unsafe { &*(kernel as *const Kernel<A>) };
    kernel.idle_loop(cpu)
}
