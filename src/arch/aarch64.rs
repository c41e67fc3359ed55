//! AArch64 (ARM64) backend, exception level 1.
//!
//! Context switches are ordinary function calls: [`Arch::switch`] saves the
//! callee-saved registers, frame pointer, link register and stack pointer of
//! the caller and loads those of the next thread. Everything else the
//! compiler may clobber across a call, so nothing else needs saving.
//!
//! Involuntary switches happen at interrupt exit. The IRQ vector pushes the
//! caller-saved registers plus `ELR_EL1`/`SPSR_EL1` on the interrupted
//! thread's own stack and calls into the kernel; if the kernel picks another
//! thread it switches from inside the handler, and the interrupted thread
//! finishes its exception return whenever it is resumed.
//!
//! A thread that has never run resumes at [`__rtk_thread_entry`], which
//! moves the five frame arguments from `x19..x23` into `x0..x4` and branches
//! to the trampoline held in `x24`.

use super::aarch64_gic::{Gic400, SCHED_IPI, SPURIOUS_IRQ, TIMER_IRQ};
use super::{Arch, IdleWake, InitialFrame, IrqKey};
use crate::fatal::FatalReason;
use crate::kernel::Kernel;
use crate::time::{SystemTimer, SYS_CLOCK_TICKS_PER_SEC};
use core::arch::{asm, global_asm};
use portable_atomic::{AtomicU64, Ordering};

/// IRQ mask bit of `DAIF`.
const DAIF_IRQ: u64 = 1 << 7;

/// `CNTP_CTL_EL0` values.
const CNTP_ENABLE: u64 = 1;
const CNTP_ENABLE_MASKED: u64 = 0b11;

/// Saved callee-saved state of a suspended thread.
///
/// Offsets are fixed by the switch routine.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Aarch64Context {
    /// `x19..=x28`, offsets 0..80.
    pub x19_x28: [u64; 10],
    /// `x29`, offset 80.
    pub fp: u64,
    /// `x30`, offset 88. Where the switch returns to.
    pub lr: u64,
    /// Offset 96.
    pub sp: u64,
    /// Low halves of `v8..=v15`, offsets 104..168.
    pub d8_d15: [u64; 8],
    #[cfg(feature = "full-fpu")]
    pub fpcr: u64,
    #[cfg(feature = "full-fpu")]
    pub fpsr: u64,
}

static_assertions::const_assert_eq!(core::mem::offset_of!(Aarch64Context, sp), 96);
static_assertions::const_assert_eq!(core::mem::offset_of!(Aarch64Context, d8_d15), 104);

global_asm!(
    ".global __rtk_switch",
    ".type __rtk_switch, %function",
    "__rtk_switch:",
    "stp x19, x20, [x0, #0]",
    "stp x21, x22, [x0, #16]",
    "stp x23, x24, [x0, #32]",
    "stp x25, x26, [x0, #48]",
    "stp x27, x28, [x0, #64]",
    "stp x29, x30, [x0, #80]",
    "mov x9, sp",
    "str x9, [x0, #96]",
    "stp d8, d9, [x0, #104]",
    "stp d10, d11, [x0, #120]",
    "stp d12, d13, [x0, #136]",
    "stp d14, d15, [x0, #152]",
    "ldp x19, x20, [x1, #0]",
    "ldp x21, x22, [x1, #16]",
    "ldp x23, x24, [x1, #32]",
    "ldp x25, x26, [x1, #48]",
    "ldp x27, x28, [x1, #64]",
    "ldp x29, x30, [x1, #80]",
    "ldr x9, [x1, #96]",
    "mov sp, x9",
    "ldp d8, d9, [x1, #104]",
    "ldp d10, d11, [x1, #120]",
    "ldp d12, d13, [x1, #136]",
    "ldp d14, d15, [x1, #152]",
    "ret",
    "",
    ".global __rtk_thread_entry",
    ".type __rtk_thread_entry, %function",
    "__rtk_thread_entry:",
    "mov x0, x19",
    "mov x1, x20",
    "mov x2, x21",
    "mov x3, x22",
    "mov x4, x23",
    "mov x29, xzr",
    "mov x30, xzr",
    "br x24",
);

extern "C" {
    fn __rtk_switch(prev: *mut Aarch64Context, next: *mut Aarch64Context);
    fn __rtk_thread_entry();
}

/// CNTP-based tickless system timer.
///
/// Ticks are counted from the counter value of the last announcement, so
/// nothing is lost however late the interrupt is serviced.
pub struct CntpTimer {
    cycles_per_tick: AtomicU64,
    last_announce: AtomicU64,
}

impl CntpTimer {
    pub const fn new() -> Self {
        Self { cycles_per_tick: AtomicU64::new(0), last_announce: AtomicU64::new(0) }
    }

    /// Latch the counter frequency and start counting from now.
    ///
    /// # Safety
    ///
    /// EL1 only, once per boot.
    pub unsafe fn init(&self) {
        let freq = read_cntfrq();
        let cyc = (freq / SYS_CLOCK_TICKS_PER_SEC as u64).max(1);
        self.cycles_per_tick.store(cyc, Ordering::Relaxed);
        self.last_announce.store(read_cntpct(), Ordering::Relaxed);
        // SAFETY: EL1 access to the physical timer.
        unsafe { asm!("msr cntp_ctl_el0, {v}", v = in(reg) CNTP_ENABLE_MASKED, options(nomem, nostack)) };
        log::info!("CNTP timer at {} Hz, {} cycles per tick", freq, cyc);
    }

    fn cyc(&self) -> u64 {
        self.cycles_per_tick.load(Ordering::Relaxed).max(1)
    }
}

impl Default for CntpTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn read_cntpct() -> u64 {
    let v: u64;
    // SAFETY: reading the counter has no side effects.
    unsafe { asm!("isb", "mrs {v}, cntpct_el0", v = out(reg) v, options(nomem, nostack)) };
    v
}

fn read_cntfrq() -> u64 {
    let v: u64;
    // SAFETY: as above.
    unsafe { asm!("mrs {v}, cntfrq_el0", v = out(reg) v, options(nomem, nostack)) };
    v
}

impl SystemTimer for CntpTimer {
    fn set_timeout(&self, ticks: Option<u32>, _idle: bool) {
        match ticks {
            Some(ticks) => {
                let target = self.elapsed() as u64 + ticks.max(1) as u64;
                let cval = self.last_announce.load(Ordering::Relaxed) + target * self.cyc();
                // SAFETY: EL1 access to the physical timer.
                unsafe {
                    asm!(
                        "msr cntp_cval_el0, {cval}",
                        "msr cntp_ctl_el0, {ctl}",
                        "isb",
                        cval = in(reg) cval,
                        ctl = in(reg) CNTP_ENABLE,
                        options(nomem, nostack)
                    )
                };
            }
            None => unsafe {
                // SAFETY: as above.
                asm!("msr cntp_ctl_el0, {v}", v = in(reg) CNTP_ENABLE_MASKED, options(nomem, nostack))
            },
        }
    }

    fn elapsed(&self) -> u32 {
        let since = read_cntpct().wrapping_sub(self.last_announce.load(Ordering::Relaxed));
        (since / self.cyc()).min(u32::MAX as u64) as u32
    }

    fn take_elapsed(&self) -> u32 {
        let ticks = self.elapsed();
        self.last_announce.fetch_add(ticks as u64 * self.cyc(), Ordering::Relaxed);
        // Quiet until the kernel programs the next deadline.
        // SAFETY: EL1 access to the physical timer.
        unsafe { asm!("msr cntp_ctl_el0, {v}", v = in(reg) CNTP_ENABLE_MASKED, options(nomem, nostack)) };
        ticks
    }

    fn cycle_get_32(&self) -> u32 {
        read_cntpct() as u32
    }
}

/// The bare-metal backend.
pub struct Aarch64Arch {
    timer: CntpTimer,
}

impl Aarch64Arch {
    pub const fn new() -> Self {
        Self { timer: CntpTimer::new() }
    }

    /// Install the vector table, bring up the GIC and the timer.
    ///
    /// # Safety
    ///
    /// Once, at EL1, with interrupts masked, before `Kernel::init`.
    pub unsafe fn init(&self) -> bool {
        unsafe {
            super::aarch64_vectors::install();
            let gic = Gic400::init();
            self.timer.init();
            gic
        }
    }
}

impl Default for Aarch64Arch {
    fn default() -> Self {
        Self::new()
    }
}

impl Arch for Aarch64Arch {
    type SavedContext = Aarch64Context;
    type Timer = CntpTimer;

    fn timer(&self) -> &CntpTimer {
        &self.timer
    }

    fn new_thread(&self, ctx: &mut Aarch64Context, frame: &InitialFrame) {
        *ctx = Aarch64Context::default();
        for (reg, arg) in ctx.x19_x28.iter_mut().zip(frame.args) {
            *reg = arg as u64;
        }
        ctx.x19_x28[5] = frame.entry as usize as u64;
        ctx.lr = __rtk_thread_entry as usize as u64;
        ctx.sp = frame.sp as u64;
    }

    fn adopt_current(&self, _ctx: &mut Aarch64Context) {
        // Filled by the first switch away from the boot context.
    }

    unsafe fn switch(&self, prev: *mut Aarch64Context, next: *mut Aarch64Context) {
        #[cfg(feature = "full-fpu")]
        unsafe {
            asm!(
                "mrs {c}, fpcr",
                "mrs {s}, fpsr",
                c = out(reg) (*prev).fpcr,
                s = out(reg) (*prev).fpsr,
                options(nomem, nostack)
            );
        }
        // SAFETY: the caller upholds the contract of Arch::switch.
        unsafe { __rtk_switch(prev, next) };
        // Resumed: `prev` is ours again.
        #[cfg(feature = "full-fpu")]
        unsafe {
            asm!(
                "msr fpcr, {c}",
                "msr fpsr, {s}",
                c = in(reg) (*prev).fpcr,
                s = in(reg) (*prev).fpsr,
                options(nomem, nostack)
            );
        }
    }

    fn irq_lock(&self) -> IrqKey {
        let daif: u64;
        // SAFETY: masking IRQs at EL1.
        unsafe { asm!("mrs {d}, daif", "msr daifset, #2", d = out(reg) daif, options(nomem, nostack)) };
        IrqKey { enabled: daif & DAIF_IRQ == 0 }
    }

    fn irq_unlock(&self, key: IrqKey) {
        if key.enabled {
            self.enable_interrupts();
        }
    }

    fn enable_interrupts(&self) {
        // SAFETY: unmasking IRQs at EL1.
        unsafe { asm!("msr daifclr, #2", options(nomem, nostack)) };
    }

    fn interrupts_enabled(&self) -> bool {
        let daif: u64;
        // SAFETY: reading DAIF has no side effects.
        unsafe { asm!("mrs {d}, daif", d = out(reg) daif, options(nomem, nostack)) };
        daif & DAIF_IRQ == 0
    }

    fn cpu_id(&self) -> usize {
        let mpidr: u64;
        // SAFETY: reading MPIDR has no side effects.
        unsafe { asm!("mrs {m}, mpidr_el1", m = out(reg) mpidr, options(nomem, nostack)) };
        (mpidr & 0xFF) as usize
    }

    fn cpu_idle(&self) -> IdleWake {
        // WFI wakes on a pending interrupt even while masked; the window
        // between daifclr and daifset is where the vector runs.
        // SAFETY: EL1 idle sequence.
        unsafe { asm!("dsb sy", "wfi", "msr daifclr, #2", "isb", "msr daifset, #2", options(nomem, nostack)) };
        IdleWake::Interrupt
    }

    fn sched_ipi(&self) {
        Gic400::send_sched_ipi();
    }

    fn system_halt(&self, reason: FatalReason) -> ! {
        log::error!("system halted: {:?}", reason);
        loop {
            // SAFETY: parking the core for good.
            unsafe { asm!("msr daifset, #0xf", "wfe", options(nomem, nostack)) };
        }
    }
}

/// Called by the IRQ vector with the interrupted thread's registers saved
/// on its stack.
#[no_mangle]
extern "C" fn rtk_irq_dispatch() {
    let kernel = match crate::kernel::get_global_kernel::<Aarch64Arch>() {
        Some(kernel) => kernel,
        None => {
            // Nothing to hand the interrupt to yet; keep it from re-firing.
            // SAFETY: in the IRQ vector.
            unsafe {
                let irq = Gic400::acknowledge();
                if irq != SPURIOUS_IRQ {
                    Gic400::end_of_interrupt(irq);
                }
            }
            return;
        }
    };
    dispatch(kernel);
}

fn dispatch(kernel: &Kernel<Aarch64Arch>) {
    kernel.isr_enter();
    // SAFETY: in the IRQ vector.
    let irq = unsafe { Gic400::acknowledge() };
    match irq {
        SPURIOUS_IRQ => {}
        TIMER_IRQ => kernel.timer_isr(),
        SCHED_IPI => {}
        other => {
            log::error!("unconnected interrupt {}", other);
            kernel.fatal_error(FatalReason::SpuriousIrq);
        }
    }
    if irq != SPURIOUS_IRQ {
        // Before a possible switch, so the line can fire for the next thread.
        // SAFETY: acknowledged above.
        unsafe { Gic400::end_of_interrupt(irq) };
    }
    kernel.isr_exit();
}

/// Called by the synchronous exception vector.
#[no_mangle]
extern "C" fn rtk_sync_exception(esr: u64, elr: u64, far: u64) -> ! {
    log::error!("cpu exception: esr={:#x} elr={:#x} far={:#x}", esr, elr, far);
    match crate::kernel::get_global_kernel::<Aarch64Arch>() {
        Some(kernel) => kernel.fatal_error(FatalReason::CpuException),
        None => Aarch64Arch::new().system_halt(FatalReason::CpuException),
    }
}
