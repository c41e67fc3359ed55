//! AArch64 exception vector table.
//!
//! Sixteen 128-byte entries, 2 KiB aligned. The kernel runs at EL1 on
//! `SP_EL1`, so only the "current EL with SPx" group does real work:
//!
//! - IRQ: save the caller-saved state on the interrupted thread's stack,
//!   call `rtk_irq_dispatch`, restore, `eret`. The dispatcher may switch
//!   threads before returning.
//! - Synchronous and SError: collect the syndrome and enter the fatal
//!   error path, which does not return.
//!
//! Exceptions from any other group are unexpected and treated as CPU
//! exceptions as well.

use core::arch::asm;
use core::arch::naked_asm;

macro_rules! vector_entry {
    ($handler:ident) => {
        concat!(".balign 128\n", "b ", stringify!($handler), "\n")
    };
}

/// Size of the IRQ frame: x0-x18, x29, x30, ELR, SPSR, q0-q7, q16-q31,
/// FPCR and FPSR, rounded to 16 bytes.
const IRQ_FRAME_SIZE: usize = 592;

/// The vector table. Installed by [`install`].
#[link_section = ".vectors"]
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn _vectors() {
    naked_asm!(
        ".balign 2048",
        // Current EL with SP0
        vector_entry!(rtk_unexpected_exception),
        vector_entry!(rtk_unexpected_exception),
        vector_entry!(rtk_unexpected_exception),
        vector_entry!(rtk_unexpected_exception),
        // Current EL with SPx
        vector_entry!(rtk_sync_el1h),
        vector_entry!(rtk_irq_el1h),
        vector_entry!(rtk_unexpected_exception),
        vector_entry!(rtk_sync_el1h),
        // Lower EL, AArch64
        vector_entry!(rtk_unexpected_exception),
        vector_entry!(rtk_unexpected_exception),
        vector_entry!(rtk_unexpected_exception),
        vector_entry!(rtk_unexpected_exception),
        // Lower EL, AArch32
        vector_entry!(rtk_unexpected_exception),
        vector_entry!(rtk_unexpected_exception),
        vector_entry!(rtk_unexpected_exception),
        vector_entry!(rtk_unexpected_exception),
    );
}

/// Synchronous exception or SError at EL1: report and never come back.
#[no_mangle]
#[unsafe(naked)]
unsafe extern "C" fn rtk_sync_el1h() {
    naked_asm!(
        "mrs x0, esr_el1",
        "mrs x1, elr_el1",
        "mrs x2, far_el1",
        "bl rtk_sync_exception",
        "b .",
    );
}

#[no_mangle]
#[unsafe(naked)]
unsafe extern "C" fn rtk_unexpected_exception() {
    naked_asm!(
        "mrs x0, esr_el1",
        "mrs x1, elr_el1",
        "mrs x2, far_el1",
        "bl rtk_sync_exception",
        "b .",
    );
}

/// IRQ at EL1. The frame stays on the interrupted thread's stack for as
/// long as that thread is switched out.
#[no_mangle]
#[unsafe(naked)]
unsafe extern "C" fn rtk_irq_el1h() {
    naked_asm!(
        "sub sp, sp, #{size}",
        "stp x0, x1, [sp, #0]",
        "stp x2, x3, [sp, #16]",
        "stp x4, x5, [sp, #32]",
        "stp x6, x7, [sp, #48]",
        "stp x8, x9, [sp, #64]",
        "stp x10, x11, [sp, #80]",
        "stp x12, x13, [sp, #96]",
        "stp x14, x15, [sp, #112]",
        "stp x16, x17, [sp, #128]",
        "stp x18, x29, [sp, #144]",
        "mrs x0, elr_el1",
        "mrs x1, spsr_el1",
        "stp x30, x0, [sp, #160]",
        "str x1, [sp, #176]",
        "stp q0, q1, [sp, #192]",
        "stp q2, q3, [sp, #224]",
        "stp q4, q5, [sp, #256]",
        "stp q6, q7, [sp, #288]",
        "stp q16, q17, [sp, #320]",
        "stp q18, q19, [sp, #352]",
        "stp q20, q21, [sp, #384]",
        "stp q22, q23, [sp, #416]",
        "stp q24, q25, [sp, #448]",
        "stp q26, q27, [sp, #480]",
        "stp q28, q29, [sp, #512]",
        "stp q30, q31, [sp, #544]",
        "mrs x0, fpcr",
        "mrs x1, fpsr",
        "stp x0, x1, [sp, #576]",

        "bl rtk_irq_dispatch",

        "ldp x0, x1, [sp, #576]",
        "msr fpcr, x0",
        "msr fpsr, x1",
        "ldp q0, q1, [sp, #192]",
        "ldp q2, q3, [sp, #224]",
        "ldp q4, q5, [sp, #256]",
        "ldp q6, q7, [sp, #288]",
        "ldp q16, q17, [sp, #320]",
        "ldp q18, q19, [sp, #352]",
        "ldp q20, q21, [sp, #384]",
        "ldp q22, q23, [sp, #416]",
        "ldp q24, q25, [sp, #448]",
        "ldp q26, q27, [sp, #480]",
        "ldp q28, q29, [sp, #512]",
        "ldp q30, q31, [sp, #544]",
        "ldr x1, [sp, #176]",
        "ldp x30, x0, [sp, #160]",
        "msr elr_el1, x0",
        "msr spsr_el1, x1",
        "ldp x0, x1, [sp, #0]",
        "ldp x2, x3, [sp, #16]",
        "ldp x4, x5, [sp, #32]",
        "ldp x6, x7, [sp, #48]",
        "ldp x8, x9, [sp, #64]",
        "ldp x10, x11, [sp, #80]",
        "ldp x12, x13, [sp, #96]",
        "ldp x14, x15, [sp, #112]",
        "ldp x16, x17, [sp, #128]",
        "ldp x18, x29, [sp, #144]",
        "add sp, sp, #{size}",
        "eret",
        size = const IRQ_FRAME_SIZE,
    );
}

/// Point `VBAR_EL1` at the vector table.
///
/// # Safety
///
/// EL1 only.
pub unsafe fn install() {
    let base = _vectors as usize;
    // SAFETY: EL1 system register write.
    unsafe { asm!("msr vbar_el1, {b}", "isb", b = in(reg) base, options(nomem, nostack)) };
}
