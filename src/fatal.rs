//! Fatal error reasons and policy.
//!
//! Unrecoverable conditions (CPU exceptions, corrupted stacks, kernel
//! invariant violations) end up in `Kernel::fatal_error`. An installed hook
//! sees every one first and may pick the outcome; without a hook the kernel
//! aborts the offending thread, or halts the system when that is not safe.

use crate::thread::ThreadId;
use core::fmt;

/// Why the kernel gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// Unhandled CPU exception (illegal instruction, bad memory access).
    CpuException,
    /// Interrupt with no handler connected.
    SpuriousIrq,
    /// Stack sentinel overwritten.
    StackCheckFail,
    /// Kernel-detected error in the current thread.
    KernelOops,
    /// Kernel-detected error that leaves no thread to blame.
    KernelPanic,
}

impl FatalReason {
    /// Numeric code, stable across backends.
    pub fn code(self) -> u32 {
        match self {
            FatalReason::CpuException => 0,
            FatalReason::SpuriousIrq => 1,
            FatalReason::StackCheckFail => 2,
            FatalReason::KernelOops => 3,
            FatalReason::KernelPanic => 4,
        }
    }
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FatalReason::CpuException => "CPU exception",
            FatalReason::SpuriousIrq => "unhandled interrupt",
            FatalReason::StackCheckFail => "stack check failed",
            FatalReason::KernelOops => "kernel oops",
            FatalReason::KernelPanic => "kernel panic",
        };
        write!(f, "{} (reason {})", text, self.code())
    }
}

/// Outcome of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalAction {
    /// Abort the faulting thread and keep the system running.
    AbortThread,
    /// Stop the whole system.
    Halt,
}

/// What the fatal path knows about the failure.
#[derive(Debug, Clone, Copy)]
pub struct FatalContext {
    pub reason: FatalReason,
    /// Thread running when the error was raised.
    pub thread: Option<ThreadId>,
    pub in_isr: bool,
    pub essential: bool,
}

/// Fatal error hook. Its answer is only followed where aborting is safe.
pub type FatalHook = fn(&FatalContext) -> FatalAction;

/// Default decision.
pub fn default_policy(ctx: &FatalContext) -> FatalAction {
    if ctx.reason == FatalReason::KernelPanic || ctx.in_isr || ctx.essential || ctx.thread.is_none() {
        FatalAction::Halt
    } else {
        FatalAction::AbortThread
    }
}

/// Combine the hook's answer with the cases where aborting is never safe.
pub(crate) fn decide(ctx: &FatalContext, hook: Option<FatalHook>) -> FatalAction {
    let policy = default_policy(ctx);
    match hook {
        Some(hook) => match hook(ctx) {
            FatalAction::AbortThread if policy == FatalAction::Halt => {
                log::warn!("fatal hook asked to continue after {}; halting anyway", ctx.reason);
                FatalAction::Halt
            }
            action => action,
        },
        None => policy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(reason: FatalReason, in_isr: bool, essential: bool) -> FatalContext {
        FatalContext { reason, thread: Some(ThreadId::new(1, 1)), in_isr, essential }
    }

    #[test]
    fn test_default_policy() {
        assert_eq!(default_policy(&ctx(FatalReason::KernelOops, false, false)), FatalAction::AbortThread);
        assert_eq!(default_policy(&ctx(FatalReason::StackCheckFail, false, false)), FatalAction::AbortThread);
        assert_eq!(default_policy(&ctx(FatalReason::KernelOops, false, true)), FatalAction::Halt);
        assert_eq!(default_policy(&ctx(FatalReason::CpuException, true, false)), FatalAction::Halt);
        assert_eq!(default_policy(&ctx(FatalReason::KernelPanic, false, false)), FatalAction::Halt);
    }

    #[test]
    fn test_hook_cannot_rescue_essential_thread() {
        fn keep_going(_: &FatalContext) -> FatalAction {
            FatalAction::AbortThread
        }
        fn always_halt(_: &FatalContext) -> FatalAction {
            FatalAction::Halt
        }
        assert_eq!(decide(&ctx(FatalReason::KernelOops, false, true), Some(keep_going)), FatalAction::Halt);
        assert_eq!(decide(&ctx(FatalReason::KernelOops, false, false), Some(always_halt)), FatalAction::Halt);
        assert_eq!(FatalReason::StackCheckFail.code(), 2);
    }
}
