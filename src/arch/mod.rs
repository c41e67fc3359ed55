//! Architecture abstraction layer for context switching and interrupt handling.
//!
//! The kernel core never touches registers directly. Everything it needs from
//! the CPU goes through [`Arch`]: building the first frame of a new thread,
//! swapping register contexts, masking interrupts, idling and halting.
//!
//! Two backends exist:
//! - [`aarch64`]: bare-metal AArch64 (Cortex-A53), exception-level 1.
//! - [`posix`]: host backend where each kernel thread is carried by a host
//!   thread and exactly one of them runs at a time. Used by the test-suite
//!   and for simulation (`std-shim` feature).

use crate::errors::{KResult, KernelError};
use crate::fatal::FatalReason;
use crate::time::SystemTimer;

pub mod frame;

pub use frame::{build_initial_frame, InitialFrame, ThreadTrampoline};

/// Interrupt state captured by [`Arch::irq_lock`].
///
/// Locks nest: only the outermost unlock (the one whose key recorded
/// interrupts as enabled) turns interrupts back on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "the key must be handed back to irq_unlock"]
pub struct IrqKey {
    pub(crate) enabled: bool,
}

impl IrqKey {
    /// Key that re-enables interrupts when released.
    pub const ENABLED: IrqKey = IrqKey { enabled: true };

    /// Whether interrupts were enabled when the key was taken.
    pub fn was_enabled(self) -> bool {
        self.enabled
    }
}

/// Why [`Arch::cpu_idle`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleWake {
    /// An interrupt was taken and fully handled by the vector code.
    Interrupt,
    /// The programmed timer deadline passed and nobody ran the timer
    /// interrupt; the kernel must announce the elapsed ticks itself.
    TimerDue,
    /// Nothing is programmed that could ever wake this CPU.
    Stalled,
}

/// Architecture abstraction trait.
///
/// # Safety
///
/// Implementations involve direct hardware manipulation and inline assembly.
/// [`Arch::switch`] is the only entry point with caller obligations; every
/// other method is safe to call at any time from kernel code.
pub trait Arch: Send + Sync + 'static {
    /// Architecture-specific saved context.
    ///
    /// Holds whatever a suspended thread needs to resume: callee-saved
    /// registers and stack pointer on hardware, a host-thread handle on the
    /// posix backend.
    type SavedContext: Send + Default;

    /// System timer driver of this platform.
    type Timer: SystemTimer;

    fn timer(&self) -> &Self::Timer;

    /// Prepare `ctx` so that the first switch to it calls `frame.entry` with
    /// `frame.args` on the stack at `frame.sp`, interrupts still masked.
    fn new_thread(&self, ctx: &mut Self::SavedContext, frame: &InitialFrame);

    /// Bind the calling execution context (boot code, a test thread) to
    /// `ctx` so the kernel can switch away from it and back.
    fn adopt_current(&self, ctx: &mut Self::SavedContext);

    /// Save the running context into `prev` and resume `next`.
    ///
    /// Returns when some later switch resumes `prev`.
    ///
    /// # Safety
    ///
    /// - `prev` must be the context of the caller, `next` a context prepared
    ///   by [`Arch::new_thread`] or saved by an earlier switch
    /// - Both must stay valid and unmoved until `prev` is resumed
    /// - Must be called with interrupts masked and no spin lock held
    unsafe fn switch(&self, prev: *mut Self::SavedContext, next: *mut Self::SavedContext);

    /// Mask interrupts on this CPU and report the previous state.
    fn irq_lock(&self) -> IrqKey;

    /// Restore the interrupt state recorded in `key`.
    fn irq_unlock(&self, key: IrqKey);

    /// Unconditionally unmask interrupts. Called once by every new thread.
    fn enable_interrupts(&self);

    fn interrupts_enabled(&self) -> bool;

    /// Index of the executing CPU.
    fn cpu_id(&self) -> usize {
        0
    }

    /// Wait for an interrupt. Entered with interrupts masked; they are
    /// unmasked while waiting and masked again on return.
    fn cpu_idle(&self) -> IdleWake;

    /// Ask other CPUs to re-run their scheduler.
    fn sched_ipi(&self) {}

    /// Bring up secondary CPU `cpu`, running `frame` on it.
    fn start_cpu(&self, cpu: usize, frame: &InitialFrame) -> KResult<()> {
        let _ = (cpu, frame);
        Err(KernelError::NotSupported)
    }

    /// Stop the system for good.
    fn system_halt(&self, reason: FatalReason) -> !;
}

// Raspberry Pi Zero 2 W / QEMU virt
#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub mod aarch64_gic;
#[cfg(target_arch = "aarch64")]
pub mod aarch64_vectors;

#[cfg(any(test, feature = "std-shim"))]
pub mod posix;

#[cfg(target_arch = "aarch64")]
pub use aarch64::Aarch64Arch as DefaultArch;

#[cfg(all(not(target_arch = "aarch64"), any(test, feature = "std-shim")))]
pub use posix::PosixArch as DefaultArch;

#[cfg(all(not(target_arch = "aarch64"), not(test), not(feature = "std-shim")))]
compile_error!("no kernel backend for this target: build for aarch64-unknown-none or enable the std-shim feature");
