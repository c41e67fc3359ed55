//! Test helper utilities shared by the in-crate test suites.

use crate::arch::posix::PosixArch;
use crate::config::KernelConfig;
use crate::kernel::Kernel;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

pub type TestKernel = Kernel<PosixArch>;

/// Give `value` a `'static` lifetime. Kernel objects borrow their kernel
/// and spawned threads need `'static` captures, so tests leak both.
pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// A running host kernel with the default configuration. The calling test
/// thread becomes the kernel's main thread at priority 0.
pub fn boot() -> &'static TestKernel {
    boot_with(KernelConfig::default())
}

pub fn boot_with(config: KernelConfig) -> &'static TestKernel {
    let kernel = match Kernel::new(PosixArch::new(), config) {
        Ok(kernel) => leak(kernel),
        Err(e) => panic!("test kernel rejected config: {}", e),
    };
    if let Err(e) = kernel.init() {
        panic!("test kernel init failed: {}", e);
    }
    kernel
}

/// Ordered record of events from several kernel threads.
///
/// Only one kernel thread runs at a time on the host backend, so the order
/// of entries is the order in which the kernel scheduled the writers.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<spin::Mutex<Vec<&'static str>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: &'static str) {
        self.events.lock().push(event);
    }

    pub fn take(&self) -> Vec<&'static str> {
        core::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }
}
