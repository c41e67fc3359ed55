//! Host backend: kernel threads carried by host threads.
//!
//! Every kernel thread gets a host thread of its own, but only one of them
//! ever executes kernel or application code at a time. Who may run is
//! decided by a baton: a switch hands the baton to the next context and
//! parks the caller until the baton comes back. Scheduling decisions stay
//! entirely with the kernel; the host scheduler only ever has one runnable
//! thread to choose from.
//!
//! Time is virtual. The timer is a [`ManualTimer`]; when the kernel idles,
//! time jumps straight to the programmed deadline. With nothing programmed
//! the kernel can never make progress again, which the idle loop reports
//! as a stall.
//!
//! If any kernel thread panics, the baton is marked halted and every parked
//! context (the test thread included) wakes and panics too, so failures
//! surface instead of hanging.

use super::{Arch, IdleWake, InitialFrame, IrqKey};
use crate::fatal::FatalReason;
use crate::time::tick::ManualTimer;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Default host stack for kernel threads.
pub const HOST_STACK_SIZE: usize = 512 * 1024;

/// Saved context: the baton id of the owning host thread.
#[derive(Debug, Default)]
pub struct PosixContext {
    id: usize,
}

impl PosixContext {
    pub fn id(&self) -> usize {
        self.id
    }
}

#[derive(Debug, Default)]
struct BatonState {
    running: usize,
    halted: Option<String>,
}

#[derive(Debug, Default)]
struct Baton {
    state: Mutex<BatonState>,
    cv: Condvar,
}

impl Baton {
    fn lock(&self) -> MutexGuard<'_, BatonState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park until context `id` holds the baton. Returns the halt reason
    /// instead if the kernel halted meanwhile.
    fn wait_for(&self, id: usize) -> Result<(), String> {
        let mut state = self.lock();
        loop {
            if let Some(reason) = &state.halted {
                return Err(reason.clone());
            }
            if state.running == id {
                return Ok(());
            }
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn halt(&self, reason: String) {
        let mut state = self.lock();
        if state.halted.is_none() {
            log::error!("host kernel halted: {}", reason);
            state.halted = Some(reason);
        }
        self.cv.notify_all();
    }
}

/// Host implementation of [`Arch`].
pub struct PosixArch {
    baton: Arc<Baton>,
    next_ctx: AtomicUsize,
    irq_masked: AtomicBool,
    timer: ManualTimer,
    host_stack_size: usize,
}

impl PosixArch {
    pub fn new() -> Self {
        Self::with_host_stack(HOST_STACK_SIZE)
    }

    /// Backend whose kernel threads get `size` bytes of host stack.
    pub fn with_host_stack(size: usize) -> Self {
        Self {
            baton: Arc::new(Baton::default()),
            next_ctx: AtomicUsize::new(1),
            irq_masked: AtomicBool::new(false),
            timer: ManualTimer::new(),
            host_stack_size: size,
        }
    }

    fn alloc_ctx_id(&self) -> usize {
        self.next_ctx.fetch_add(1, Ordering::Relaxed)
    }

    /// Why the kernel halted, if it did.
    pub fn halt_reason(&self) -> Option<String> {
        self.baton.lock().halted.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halt_reason().is_some()
    }
}

impl Default for PosixArch {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        String::from(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("thread panicked")
    }
}

impl Arch for PosixArch {
    type SavedContext = PosixContext;
    type Timer = ManualTimer;

    fn timer(&self) -> &ManualTimer {
        &self.timer
    }

    fn new_thread(&self, ctx: &mut PosixContext, frame: &InitialFrame) {
        let id = self.alloc_ctx_id();
        ctx.id = id;
        let baton = Arc::clone(&self.baton);
        let frame = *frame;
        let spawned = std::thread::Builder::new()
            .name(format!("kthread-{}", id))
            .stack_size(self.host_stack_size)
            .spawn(move || {
                if baton.wait_for(id).is_err() {
                    return;
                }
                let [a0, a1, a2, a3, a4] = frame.args;
                let result = catch_unwind(AssertUnwindSafe(|| (frame.entry)(a0, a1, a2, a3, a4)));
                if let Err(payload) = result {
                    baton.halt(format!("kernel thread {} panicked: {}", id, panic_message(&*payload)));
                }
            });
        if let Err(e) = spawned {
            log::error!("cannot create host thread for context {}: {}", id, e);
            self.baton.halt(format!("host thread creation failed: {}", e));
        }
    }

    fn adopt_current(&self, ctx: &mut PosixContext) {
        let id = self.alloc_ctx_id();
        ctx.id = id;
        self.baton.lock().running = id;
    }

    unsafe fn switch(&self, prev: *mut PosixContext, next: *mut PosixContext) {
        // SAFETY: the caller guarantees both contexts are valid.
        let (prev_id, next_id) = unsafe { ((*prev).id, (*next).id) };
        if prev_id == next_id {
            return;
        }
        {
            let mut state = self.baton.lock();
            state.running = next_id;
            self.baton.cv.notify_all();
        }
        if let Err(reason) = self.baton.wait_for(prev_id) {
            panic!("kernel halted: {}", reason);
        }
    }

    fn irq_lock(&self) -> IrqKey {
        let was_masked = self.irq_masked.swap(true, Ordering::AcqRel);
        IrqKey { enabled: !was_masked }
    }

    fn irq_unlock(&self, key: IrqKey) {
        if key.enabled {
            self.irq_masked.store(false, Ordering::Release);
        }
    }

    fn enable_interrupts(&self) {
        self.irq_masked.store(false, Ordering::Release);
    }

    fn interrupts_enabled(&self) -> bool {
        !self.irq_masked.load(Ordering::Acquire)
    }

    fn cpu_idle(&self) -> IdleWake {
        match self.timer.until_deadline() {
            Some(ticks) => {
                self.timer.advance(ticks);
                IdleWake::TimerDue
            }
            None => IdleWake::Stalled,
        }
    }

    fn system_halt(&self, reason: FatalReason) -> ! {
        let msg = format!("{:?}", reason);
        self.baton.halt(msg.clone());
        panic!("kernel halted: {}", msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::build_initial_frame;
    use alloc::boxed::Box;
    use portable_atomic::AtomicU32;

    static HITS: AtomicU32 = AtomicU32::new(0);

    extern "C-unwind" fn bounce(arch: usize, back: usize, me: usize, add: usize, _: usize) -> ! {
        // SAFETY: the test keeps the arch and both contexts alive.
        let arch = unsafe { &*(arch as *const PosixArch) };
        HITS.fetch_add(add as u32, Ordering::SeqCst);
        unsafe { arch.switch(me as *mut PosixContext, back as *mut PosixContext) };
        panic!("resumed a finished context")
    }

    #[test]
    fn test_switch_runs_new_context_and_returns() {
        let arch = Box::new(PosixArch::new());
        let mut main = Box::new(PosixContext::default());
        let mut child = Box::new(PosixContext::default());
        arch.adopt_current(&mut main);
        let main_ptr: *mut PosixContext = &mut *main;
        let child_ptr: *mut PosixContext = &mut *child;
        let frame = build_initial_frame(
            bounce,
            0x1000,
            [&*arch as *const PosixArch as usize, main_ptr as usize, child_ptr as usize, 7, 0],
        );
        arch.new_thread(&mut child, &frame);
        assert_ne!(main.id(), child.id());
        unsafe { arch.switch(main_ptr, child_ptr) };
        assert_eq!(HITS.load(Ordering::SeqCst), 7);
        // Leak: the child host thread stays parked on its context.
        core::mem::forget(child);
        core::mem::forget(arch);
    }

    #[test]
    fn test_irq_lock_nests() {
        let arch = PosixArch::new();
        let outer = arch.irq_lock();
        let inner = arch.irq_lock();
        assert!(outer.was_enabled());
        assert!(!inner.was_enabled());
        arch.irq_unlock(inner);
        assert!(!arch.interrupts_enabled());
        arch.irq_unlock(outer);
        assert!(arch.interrupts_enabled());
    }

    #[test]
    fn test_idle_jumps_to_deadline() {
        use crate::time::SystemTimer;
        let arch = PosixArch::new();
        assert_eq!(arch.cpu_idle(), IdleWake::Stalled);
        arch.timer().set_timeout(Some(4), true);
        assert_eq!(arch.cpu_idle(), IdleWake::TimerDue);
        assert_eq!(arch.timer().elapsed(), 4);
    }
}
