//! Memory slab: a region carved into equal, aligned blocks.

use crate::arch::Arch;
use crate::errors::{KResult, KernelError};
use crate::fatal::FatalReason;
use crate::kernel::Kernel;
use crate::sched::wait_q::WaitQId;
use crate::spinlock::SpinLock;
use crate::time::Timeout;
use alloc::alloc::{alloc, dealloc, Layout};
use alloc::vec::Vec;
use core::ptr::NonNull;

struct SlabState {
    /// Indices of free blocks; the last one is handed out first.
    free: Vec<usize>,
    allocated: Vec<bool>,
    max_used: usize,
}

/// Fixed-size block allocator that threads can wait on.
///
/// Freeing a block while a thread waits in [`MemSlab::alloc`] hands that
/// block to the waiter. Freeing a pointer that is not an allocated block of
/// this slab is an application bug and raises a `KernelOops`.
pub struct MemSlab<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    wait_q: WaitQId,
    memory: NonNull<u8>,
    layout: Layout,
    block_size: usize,
    num_blocks: usize,
    state: SpinLock<SlabState>,
}

// SAFETY: the region is only handed out block by block under `state`.
unsafe impl<A: Arch> Send for MemSlab<'_, A> {}
unsafe impl<A: Arch> Sync for MemSlab<'_, A> {}

impl<'k, A: Arch> MemSlab<'k, A> {
    /// Create a slab of `num_blocks` blocks of `block_size` bytes aligned to
    /// `align`.
    ///
    /// # Returns
    ///
    /// `Invalid` for a zero size or count, a size not a multiple of `align`,
    /// or an `align` that is not a power of two. `NoMemory` if the region
    /// cannot be allocated.
    pub fn new(kernel: &'k Kernel<A>, block_size: usize, num_blocks: usize, align: usize) -> KResult<Self> {
        if block_size == 0 || num_blocks == 0 || !align.is_power_of_two() || block_size % align != 0 {
            return Err(KernelError::Invalid);
        }
        let total = block_size.checked_mul(num_blocks).ok_or(KernelError::Invalid)?;
        let layout = Layout::from_size_align(total, align).map_err(|_| KernelError::Invalid)?;
        // SAFETY: `layout` has a non-zero size.
        let memory = NonNull::new(unsafe { alloc(layout) }).ok_or(KernelError::NoMemory)?;
        let wait_q = kernel.lock_sched().wait_qs.alloc(kernel.config(), None);
        Ok(Self {
            kernel,
            wait_q,
            memory,
            layout,
            block_size,
            num_blocks,
            state: SpinLock::new(SlabState {
                free: (0..num_blocks).rev().collect(),
                allocated: alloc::vec![false; num_blocks],
                max_used: 0,
            }),
        })
    }

    fn block(&self, index: usize) -> NonNull<u8> {
        // SAFETY: `index < num_blocks`, so the offset stays in the region.
        unsafe { NonNull::new_unchecked(self.memory.as_ptr().add(index * self.block_size)) }
    }

    fn mark_used(&self, state: &mut SlabState, index: usize) {
        state.allocated[index] = true;
        let used = self.num_blocks - state.free.len();
        state.max_used = state.max_used.max(used);
    }

    /// Allocate a block, waiting up to `timeout` for one to be freed.
    ///
    /// # Returns
    ///
    /// `NoMemory` if none is free and `timeout` is `NoWait`, `TimedOut` if
    /// the wait expired.
    pub fn alloc(&self, timeout: Timeout) -> KResult<NonNull<u8>> {
        let mut state = self.state.lock(self.kernel.arch());
        if let Some(index) = state.free.pop() {
            self.mark_used(&mut state, index);
            return Ok(self.block(index));
        }
        if timeout.is_no_wait() {
            return Err(KernelError::NoMemory);
        }
        let (result, index) = self.kernel.pend_curr(state, Some(self.wait_q), timeout);
        result.map(|()| self.block(index))
    }

    /// Return `block` to the slab, or to the first waiting allocator.
    pub fn free(&self, block: NonNull<u8>) {
        let offset = (block.as_ptr() as usize).wrapping_sub(self.memory.as_ptr() as usize);
        let index = offset / self.block_size;
        let mut state = self.state.lock(self.kernel.arch());
        if offset % self.block_size != 0 || index >= self.num_blocks || !state.allocated[index] {
            drop(state);
            log::error!("invalid or double free of {:p} in slab at {:p}", block, self.memory);
            self.kernel.fatal_error(FatalReason::KernelOops);
        }
        let mut st = self.kernel.lock_sched();
        match st.unpend_first_thread(self.wait_q) {
            Some(waiter) => {
                st.wake(waiter, Ok(()), index);
                drop(st);
                self.kernel.reschedule_locked(state);
            }
            None => {
                drop(st);
                state.allocated[index] = false;
                state.free.push(index);
            }
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_used(&self) -> usize {
        self.num_blocks - self.num_free()
    }

    pub fn num_free(&self) -> usize {
        self.state.lock(self.kernel.arch()).free.len()
    }

    /// Most blocks ever in use at once.
    pub fn max_used(&self) -> usize {
        self.state.lock(self.kernel.arch()).max_used
    }
}

impl<A: Arch> Drop for MemSlab<'_, A> {
    fn drop(&mut self) {
        {
            let mut st = self.kernel.lock_sched();
            st.unpend_all(self.wait_q, Err(KernelError::Cancelled));
            st.wait_qs.free(self.wait_q);
        }
        // SAFETY: allocated in `new` with this layout.
        unsafe { dealloc(self.memory.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::boot;

    #[test]
    fn test_blocks_are_distinct_and_aligned() {
        let k = boot();
        let slab = MemSlab::new(k, 64, 3, 16).unwrap();
        let a = slab.alloc(Timeout::NoWait).unwrap();
        let b = slab.alloc(Timeout::NoWait).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % 16, 0);
        assert_eq!(slab.num_used(), 2);
        assert_eq!(slab.num_free(), 1);
        slab.free(a);
        assert_eq!(slab.num_used(), 1);
        assert_eq!(slab.max_used(), 2);
        slab.free(b);
    }

    #[test]
    fn test_exhausted_slab_reports_no_memory() {
        let k = boot();
        let slab = MemSlab::new(k, 8, 1, 8).unwrap();
        let a = slab.alloc(Timeout::NoWait).unwrap();
        assert_eq!(slab.alloc(Timeout::NoWait), Err(KernelError::NoMemory));
        assert_eq!(slab.alloc(Timeout::Ticks(2)), Err(KernelError::TimedOut));
        slab.free(a);
    }

    #[test]
    fn test_bad_geometry_rejected() {
        let k = boot();
        assert!(MemSlab::new(k, 0, 4, 8).is_err());
        assert!(MemSlab::new(k, 12, 4, 8).is_err());
        assert!(MemSlab::new(k, 16, 4, 3).is_err());
    }
}
