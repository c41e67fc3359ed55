//! Initial frame of a freshly created thread.
//!
//! A new thread has never been switched out, so there is no saved context to
//! resume. The kernel describes where it should start instead; each backend
//! turns that description into a synthetic saved context that the ordinary
//! switch path can restore. On hardware the five arguments travel in
//! callee-saved registers and a small entry stub moves them into the
//! argument registers before branching to the trampoline.

use crate::mem::STACK_POINTER_ALIGN;

/// Function every thread starts in. Never returns: when the thread body is
/// done the trampoline aborts the thread.
pub type ThreadTrampoline = extern "C-unwind" fn(usize, usize, usize, usize, usize) -> !;

/// Where and how a new thread begins executing.
#[derive(Debug, Clone, Copy)]
pub struct InitialFrame {
    pub entry: ThreadTrampoline,
    /// Initial stack pointer, aligned to [`STACK_POINTER_ALIGN`].
    pub sp: usize,
    /// Arguments passed to `entry`, in order.
    pub args: [usize; 5],
}

/// Build the frame for a thread whose stack ends at `stack_top`.
///
/// The stack pointer is rounded down to the ABI alignment.
pub fn build_initial_frame(entry: ThreadTrampoline, stack_top: usize, args: [usize; 5]) -> InitialFrame {
    InitialFrame { entry, sp: stack_top & !(STACK_POINTER_ALIGN - 1), args }
}
