//! Interrupt-masking spin lock.
//!
//! Taking the lock first masks interrupts on the local CPU, then spins for
//! the lock word. The guard restores the interrupt state on drop. Code that
//! is about to switch threads keeps interrupts masked past the unlock by
//! taking the key out of the guard with [`SpinLockGuard::take_key`] and
//! handing it to the switch path instead.
//!
//! Locking a spin lock already held by the same CPU would deadlock forever;
//! it is detected and treated as a fatal programming error.

use crate::arch::{Arch, IrqKey};
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use portable_atomic::{AtomicUsize, Ordering};

const NO_OWNER: usize = 0;

pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
    /// Holding CPU plus one, or [`NO_OWNER`].
    owner: AtomicUsize,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: spin::Mutex::new(value), owner: AtomicUsize::new(NO_OWNER) }
    }

    /// Mask interrupts and acquire the lock.
    ///
    /// # Panics
    ///
    /// If the calling CPU already holds this lock.
    pub fn lock<'a, A: Arch>(&'a self, arch: &'a A) -> SpinLockGuard<'a, T, A> {
        let key = arch.irq_lock();
        let cpu = arch.cpu_id();
        if self.owner.load(Ordering::Acquire) == cpu + 1 {
            log::error!("spin lock taken recursively on cpu {}", cpu);
            panic!("recursive spin lock on cpu {}", cpu);
        }
        let guard = self.inner.lock();
        self.owner.store(cpu + 1, Ordering::Release);
        SpinLockGuard { guard: ManuallyDrop::new(guard), owner: &self.owner, arch, key: Some(key) }
    }

    /// Like [`SpinLock::lock`] but gives up instead of spinning.
    pub fn try_lock<'a, A: Arch>(&'a self, arch: &'a A) -> Option<SpinLockGuard<'a, T, A>> {
        let key = arch.irq_lock();
        match self.inner.try_lock() {
            Some(guard) => {
                self.owner.store(arch.cpu_id() + 1, Ordering::Release);
                Some(SpinLockGuard { guard: ManuallyDrop::new(guard), owner: &self.owner, arch, key: Some(key) })
            }
            None => {
                arch.irq_unlock(key);
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Access without locking, through exclusive ownership.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// Held spin lock. Unlocks, then restores interrupts, when dropped.
pub struct SpinLockGuard<'a, T, A: Arch> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    owner: &'a AtomicUsize,
    arch: &'a A,
    key: Option<IrqKey>,
}

impl<T, A: Arch> SpinLockGuard<'_, T, A> {
    /// Take over the interrupt key: dropping the guard then releases the
    /// lock but leaves interrupts masked.
    pub fn take_key(&mut self) -> IrqKey {
        match self.key.take() {
            Some(key) => key,
            None => panic!("spin lock key taken twice"),
        }
    }

    /// Drop the interrupt key if the guard still holds one. Used where an
    /// outer key already restores the interrupt state.
    pub(crate) fn discard_key(&mut self) {
        self.key = None;
    }
}

impl<T, A: Arch> Deref for SpinLockGuard<'_, T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, A: Arch> DerefMut for SpinLockGuard<'_, T, A> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, A: Arch> Drop for SpinLockGuard<'_, T, A> {
    fn drop(&mut self) {
        self.owner.store(NO_OWNER, Ordering::Release);
        // SAFETY: dropped exactly once, here, and never touched afterwards.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        if let Some(key) = self.key.take() {
            self.arch.irq_unlock(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::posix::PosixArch;

    #[test]
    fn test_lock_masks_and_restores_interrupts() {
        let arch = PosixArch::new();
        let lock = SpinLock::new(5u32);
        {
            let mut g = lock.lock(&arch);
            *g += 1;
            assert!(!arch.interrupts_enabled());
            assert!(lock.is_locked());
        }
        assert!(arch.interrupts_enabled());
        assert_eq!(*lock.lock(&arch), 6);
    }

    #[test]
    fn test_taken_key_keeps_interrupts_masked() {
        let arch = PosixArch::new();
        let lock = SpinLock::new(());
        let key = {
            let mut g = lock.lock(&arch);
            g.take_key()
        };
        assert!(!lock.is_locked());
        assert!(!arch.interrupts_enabled());
        arch.irq_unlock(key);
        assert!(arch.interrupts_enabled());
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let arch = PosixArch::new();
        let lock = SpinLock::new(());
        let g = lock.lock(&arch);
        assert!(lock.try_lock(&arch).is_none());
        // Still masked by the outer guard.
        assert!(!arch.interrupts_enabled());
        drop(g);
        assert!(lock.try_lock(&arch).is_some());
    }

    #[test]
    #[should_panic(expected = "recursive spin lock")]
    fn test_recursive_lock_is_fatal() {
        let arch = PosixArch::new();
        let lock = SpinLock::new(());
        let _a = lock.lock(&arch);
        let _b = lock.lock(&arch);
    }
}
