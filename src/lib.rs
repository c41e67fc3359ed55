#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Preemptive real-time kernel core: scheduler, timeouts, wait queues and
//! the kernel objects built on them.
//!
//! A [`Kernel`] owns all scheduling state and is parameterised by an
//! [`Arch`] backend that switches contexts, masks interrupts and drives the
//! tick timer. Two backends ship with the crate:
//!
//! - **AArch64** (`target_arch = "aarch64"`): EL1 exception vectors, GIC-400
//!   interrupt controller, ARM generic timer.
//! - **Host** (`std-shim`, and all tests): every kernel thread is a host
//!   thread, only one runs at a time, and time is virtual.
//!
//! # Features
//!
//! - `full-fpu`: Save NEON/FPU registers on AArch64 (default)
//! - `std-shim`: Host backend for running the kernel in a process
//! - `qemu-virt`: GIC addresses of the QEMU `virt` board
//!
//! # Quick Start
//!
//! ```ignore
//! use rtkernel::{DefaultArch, Kernel, KernelConfig, Semaphore, Timeout};
//!
//! static KERNEL: spin::Once<Kernel<DefaultArch>> = spin::Once::new();
//!
//! fn kernel_main() {
//!     let kernel = KERNEL.call_once(|| {
//!         Kernel::new(DefaultArch::new(), KernelConfig::default()).expect("config")
//!     });
//!     unsafe { kernel.register_global() };
//!     kernel.init().expect("kernel init");
//!
//!     let ready = Semaphore::new(kernel, 0, 1).unwrap();
//!     kernel.spawn(move || ready.give(), 5).unwrap();
//!     ready.take(Timeout::Forever).unwrap();
//! }
//! ```
//!
//! # Priorities
//!
//! Lower numbers are more urgent. Negative priorities are cooperative: a
//! running cooperative thread is only switched out when it blocks, yields
//! or sleeps. Non-negative priorities are preemptible.

pub mod arch;
pub mod config;
pub mod errors;
pub mod fatal;
pub mod kernel;
pub mod mem;
pub mod sched;
pub mod spinlock;
pub mod sync;
pub mod thread;
pub mod time;

#[cfg(test)]
mod tests;

#[cfg(any(test, feature = "std-shim"))]
extern crate std;

extern crate alloc;

#[cfg(all(not(test), not(feature = "std-shim")))]
use core::panic::PanicInfo;

#[cfg(all(not(test), not(feature = "std-shim")))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("panic: {}", info);
    #[cfg(target_arch = "aarch64")]
    // SAFETY: masking interrupts has no memory effects.
    unsafe {
        core::arch::asm!("msr daifset, #0xf", options(nomem, nostack));
    }
    loop {
        #[cfg(target_arch = "aarch64")]
        // SAFETY: waits for an event; no memory effects.
        unsafe {
            core::arch::asm!("wfe", options(nomem, nostack));
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

pub use arch::{Arch, DefaultArch, IrqKey};
pub use config::{KernelConfig, ReadyQueueKind, WaitQueueKind};
pub use errors::{ConfigError, KResult, KernelError, SpawnError};
pub use fatal::{FatalAction, FatalContext, FatalHook, FatalReason};
pub use kernel::{get_global_kernel, Kernel};
pub use mem::{StackPool, StackSizeClass};
pub use spinlock::SpinLock;
pub use sync::{Fifo, Lifo, MemSlab, Mutex, Pipe, Queue, Semaphore};
pub use thread::{Priority, ThreadBuilder, ThreadEntry, ThreadId, ThreadInfo, ThreadOptions, ThreadState};
pub use time::{Duration, Timeout, Timer};
