//! Bounded stack of machine words.

use crate::arch::Arch;
use crate::errors::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::sched::wait_q::WaitQId;
use crate::spinlock::SpinLock;
use crate::time::Timeout;
use alloc::vec::Vec;

/// Fixed-capacity LIFO of `usize` words. A word pushed while a thread waits
/// in [`Stack::pop`] is delivered to it directly.
pub struct Stack<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    wait_q: WaitQId,
    words: SpinLock<Vec<usize>>,
    capacity: usize,
}

impl<'k, A: Arch> Stack<'k, A> {
    pub fn new(kernel: &'k Kernel<A>, capacity: usize) -> KResult<Self> {
        if capacity == 0 {
            return Err(KernelError::Invalid);
        }
        let wait_q = kernel.lock_sched().wait_qs.alloc(kernel.config(), None);
        Ok(Self { kernel, wait_q, words: SpinLock::new(Vec::with_capacity(capacity)), capacity })
    }

    /// # Returns
    ///
    /// `NoMemory` if the stack is full.
    pub fn push(&self, word: usize) -> KResult<()> {
        let mut words = self.words.lock(self.kernel.arch());
        let mut st = self.kernel.lock_sched();
        if let Some(waiter) = st.unpend_first_thread(self.wait_q) {
            st.wake(waiter, Ok(()), word);
            drop(st);
            self.kernel.reschedule_locked(words);
            return Ok(());
        }
        drop(st);
        if words.len() == self.capacity {
            return Err(KernelError::NoMemory);
        }
        words.push(word);
        Ok(())
    }

    /// Pop the top word, waiting up to `timeout` for one.
    pub fn pop(&self, timeout: Timeout) -> KResult<usize> {
        let mut words = self.words.lock(self.kernel.arch());
        if let Some(word) = words.pop() {
            return Ok(word);
        }
        if timeout.is_no_wait() {
            return Err(KernelError::WouldBlock);
        }
        let (result, word) = self.kernel.pend_curr(words, Some(self.wait_q), timeout);
        result.map(|()| word)
    }

    pub fn len(&self) -> usize {
        self.words.lock(self.kernel.arch()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<A: Arch> Drop for Stack<'_, A> {
    fn drop(&mut self) {
        let mut st = self.kernel.lock_sched();
        st.unpend_all(self.wait_q, Err(KernelError::Cancelled));
        st.wait_qs.free(self.wait_q);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::boot;

    #[test]
    fn test_push_until_full() {
        let k = boot();
        let s = Stack::new(k, 2).unwrap();
        s.push(10).unwrap();
        s.push(20).unwrap();
        assert_eq!(s.push(30), Err(KernelError::NoMemory));
        assert_eq!(s.pop(Timeout::NoWait), Ok(20));
        assert_eq!(s.pop(Timeout::NoWait), Ok(10));
        assert_eq!(s.pop(Timeout::NoWait), Err(KernelError::WouldBlock));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(Stack::new(boot(), 0).is_err());
    }
}
