//! GIC-400 (GICv2) interrupt controller.
//!
//! The kernel only needs a handful of operations: route and unmask the
//! timer PPI, acknowledge/end interrupts from the IRQ vector, and raise a
//! software-generated interrupt to poke other CPUs into rescheduling.
//!
//! Addresses differ between the BCM2837 and the QEMU virt board; the
//! `qemu-virt` feature selects the latter.

use core::ptr::{read_volatile, write_volatile};

#[cfg(feature = "qemu-virt")]
const GICD_BASE: usize = 0x0800_0000;
#[cfg(feature = "qemu-virt")]
const GICC_BASE: usize = 0x0801_0000;
#[cfg(not(feature = "qemu-virt"))]
const GICD_BASE: usize = 0xFF84_1000;
#[cfg(not(feature = "qemu-virt"))]
const GICC_BASE: usize = 0xFF84_2000;

const GICD_CTLR: usize = 0x000;
const GICD_TYPER: usize = 0x004;
const GICD_ISENABLER: usize = 0x100;
const GICD_ICENABLER: usize = 0x180;
const GICD_ICPENDR: usize = 0x280;
const GICD_IPRIORITYR: usize = 0x400;
const GICD_ITARGETSR: usize = 0x800;
const GICD_SGIR: usize = 0xF00;

const GICC_CTLR: usize = 0x000;
const GICC_PMR: usize = 0x004;
const GICC_BPR: usize = 0x008;
const GICC_IAR: usize = 0x00C;
const GICC_EOIR: usize = 0x010;

/// EL1 physical timer PPI.
pub const TIMER_IRQ: u32 = 30;
/// Software interrupt used for scheduler IPIs.
pub const SCHED_IPI: u32 = 0;
/// Returned by the acknowledge register when nothing is pending.
pub const SPURIOUS_IRQ: u32 = 1023;

const TIMER_PRIORITY: u8 = 0x80;

unsafe fn gicd_write(offset: usize, value: u32) {
    // SAFETY: caller guarantees the distributor is mapped.
    unsafe { write_volatile((GICD_BASE + offset) as *mut u32, value) }
}

unsafe fn gicd_read(offset: usize) -> u32 {
    // SAFETY: caller guarantees the distributor is mapped.
    unsafe { read_volatile((GICD_BASE + offset) as *const u32) }
}

unsafe fn gicc_write(offset: usize, value: u32) {
    // SAFETY: caller guarantees the CPU interface is mapped.
    unsafe { write_volatile((GICC_BASE + offset) as *mut u32, value) }
}

/// Driver for the GIC-400 of the boot platform.
pub struct Gic400;

impl Gic400 {
    /// Bring the distributor and this CPU's interface up with every line
    /// masked except the timer and the scheduler IPI.
    ///
    /// # Returns
    ///
    /// `false` if no GIC answers at the configured address.
    ///
    /// # Safety
    ///
    /// Once, at boot, with interrupts masked and the GIC regions mapped.
    pub unsafe fn init() -> bool {
        let typer = unsafe { gicd_read(GICD_TYPER) };
        if typer == 0 || typer == 0xFFFF_FFFF {
            log::warn!("no GIC at {:#x}", GICD_BASE);
            return false;
        }
        let lines = ((typer & 0x1F) + 1) * 32;

        unsafe {
            gicd_write(GICD_CTLR, 0);
            for word in 0..lines / 32 {
                gicd_write(GICD_ICENABLER + word as usize * 4, u32::MAX);
                gicd_write(GICD_ICPENDR + word as usize * 4, u32::MAX);
            }
            for irq in (0..lines).step_by(4) {
                gicd_write(GICD_IPRIORITYR + irq as usize, u32::MAX);
            }
            // Shared lines go to CPU 0; private lines are banked per CPU.
            for irq in (32..lines).step_by(4) {
                gicd_write(GICD_ITARGETSR + irq as usize, 0x0101_0101);
            }
            gicd_write(GICD_CTLR, 1);

            Self::init_cpu_interface();
            Self::set_priority(TIMER_IRQ, TIMER_PRIORITY);
            Self::enable_irq(TIMER_IRQ);
            Self::enable_irq(SCHED_IPI);
        }
        log::info!("GIC up, {} interrupt lines", lines);
        true
    }

    /// Enable this CPU's interface. Secondary CPUs call this on entry.
    ///
    /// # Safety
    ///
    /// The CPU interface region must be mapped.
    pub unsafe fn init_cpu_interface() {
        unsafe {
            gicc_write(GICC_PMR, 0xFF);
            gicc_write(GICC_BPR, 0);
            gicc_write(GICC_CTLR, 1);
        }
    }

    /// # Safety
    ///
    /// After [`Gic400::init`]; `irq` below 1020.
    pub unsafe fn enable_irq(irq: u32) {
        unsafe { gicd_write(GICD_ISENABLER + (irq / 32) as usize * 4, 1 << (irq % 32)) }
    }

    /// # Safety
    ///
    /// After [`Gic400::init`]; `irq` below 1020.
    pub unsafe fn disable_irq(irq: u32) {
        unsafe { gicd_write(GICD_ICENABLER + (irq / 32) as usize * 4, 1 << (irq % 32)) }
    }

    /// Set the priority of `irq` (0 most urgent).
    ///
    /// # Safety
    ///
    /// After [`Gic400::init`]; `irq` below 1020.
    pub unsafe fn set_priority(irq: u32, priority: u8) {
        let addr = GICD_IPRIORITYR + (irq as usize & !3);
        let shift = (irq as usize & 3) * 8;
        unsafe {
            let mut word = gicd_read(addr);
            word &= !(0xFF << shift);
            word |= (priority as u32) << shift;
            gicd_write(addr, word);
        }
    }

    /// Acknowledge the most urgent pending interrupt.
    ///
    /// # Returns
    ///
    /// The interrupt id, or [`SPURIOUS_IRQ`].
    ///
    /// # Safety
    ///
    /// Only from the IRQ vector.
    #[inline]
    pub unsafe fn acknowledge() -> u32 {
        unsafe { read_volatile((GICC_BASE + GICC_IAR) as *const u32) & 0x3FF }
    }

    /// # Safety
    ///
    /// Exactly once per id returned by [`Gic400::acknowledge`].
    #[inline]
    pub unsafe fn end_of_interrupt(irq: u32) {
        unsafe { gicc_write(GICC_EOIR, irq) }
    }

    /// Raise [`SCHED_IPI`] on every CPU but this one.
    pub fn send_sched_ipi() {
        // Target list filter 0b01: all CPUs except the requester.
        // SAFETY: write-only register of the initialized distributor.
        unsafe { gicd_write(GICD_SGIR, (1 << 24) | SCHED_IPI) }
    }
}
