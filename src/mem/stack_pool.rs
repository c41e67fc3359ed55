//! Thread stack regions and a pool allocator for dynamic thread stacks.
//!
//! Every stack carries a sentinel word at its lowest address. The kernel
//! checks it whenever it switches away from a thread; a clobbered sentinel
//! means the thread overran its stack and is escalated as a fatal error.

use crate::config::STACK_SENTINEL;
use alloc::alloc::{alloc, dealloc, Layout};
use alloc::vec::Vec;
use core::ptr::NonNull;
use portable_atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// Alignment of pool-allocated stacks (one page, so a guard page could be
/// mapped below them).
const POOL_ALIGN: usize = 4096;

/// Alignment of the initial stack pointer.
pub const STACK_POINTER_ALIGN: usize = 16;

/// Stack size classes for the pool allocator.
///
/// Different threads may need different stack sizes, so we provide
/// several size classes to minimize memory waste.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSizeClass {
    /// Small stack: 4 KiB
    Small = 4096,
    /// Medium stack: 16 KiB
    Medium = 16384,
    /// Large stack: 64 KiB
    Large = 65536,
    /// Extra large stack: 256 KiB
    ExtraLarge = 262144,
}

impl StackSizeClass {
    /// Get the size in bytes for this stack class.
    pub fn size(self) -> usize {
        self as usize
    }

    /// Choose the smallest size class that can hold `requested_size` bytes.
    pub fn for_size(requested_size: usize) -> Option<Self> {
        match requested_size {
            0..=4096 => Some(Self::Small),
            4097..=16384 => Some(Self::Medium),
            16385..=65536 => Some(Self::Large),
            65537..=262144 => Some(Self::ExtraLarge),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            StackSizeClass::Small => 0,
            StackSizeClass::Medium => 1,
            StackSizeClass::Large => 2,
            StackSizeClass::ExtraLarge => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Pooled(StackSizeClass),
    External,
}

/// A stack region exclusively owned by one thread.
#[derive(Debug)]
pub struct Stack {
    /// Lowest address of the region.
    memory: NonNull<u8>,
    size: usize,
    origin: Origin,
}

impl Stack {
    /// Wrap a caller-provided region.
    ///
    /// # Safety
    ///
    /// `base..base + size` must be valid, writable, 16-byte aligned memory
    /// that nothing else uses for as long as the returned `Stack` (and any
    /// thread running on it) lives.
    pub unsafe fn from_raw(base: NonNull<u8>, size: usize) -> Self {
        Self { memory: base, size, origin: Origin::External }
    }

    /// Usable size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Size class when the stack came from a [`StackPool`].
    pub fn size_class(&self) -> Option<StackSizeClass> {
        match self.origin {
            Origin::Pooled(class) => Some(class),
            Origin::External => None,
        }
    }

    /// Lowest address of the region (where the sentinel lives).
    pub fn base(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    /// Initial stack pointer: highest address, rounded down to 16 bytes.
    pub fn initial_sp(&self) -> usize {
        (self.base() + self.size) & !(STACK_POINTER_ALIGN - 1)
    }

    /// Write the sentinel word at the base of the stack.
    pub fn install_sentinel(&self) {
        // SAFETY: the region is at least MIN_STACK_SIZE bytes and 16-aligned.
        unsafe { (self.memory.as_ptr() as *mut u32).write_volatile(STACK_SENTINEL) }
    }

    /// Whether the sentinel word is still intact.
    pub fn check_sentinel(&self) -> bool {
        // SAFETY: as in install_sentinel.
        unsafe { (self.memory.as_ptr() as *const u32).read_volatile() == STACK_SENTINEL }
    }

    #[cfg(test)]
    pub(crate) fn clobber_sentinel(&self) {
        // SAFETY: as in install_sentinel.
        unsafe { (self.memory.as_ptr() as *mut u32).write_volatile(0xDEAD_BEEF) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Origin::Pooled(class) = self.origin {
            if let Ok(layout) = Layout::from_size_align(class.size(), POOL_ALIGN) {
                // SAFETY: allocated in StackPool::allocate_new with this layout.
                unsafe { dealloc(self.memory.as_ptr(), layout) }
            }
        }
    }
}

unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

/// Pool-based allocator for thread stacks.
///
/// Separate free lists per size class; stacks of aborted dynamic threads are
/// returned here and handed to the next thread of the same class.
pub struct StackPool {
    free_stacks: [Mutex<Vec<Stack>>; 4],
    stats: StackPoolStats,
}

#[derive(Debug, Default)]
struct StackPoolStats {
    allocated: AtomicUsize,
    deallocated: AtomicUsize,
    in_use: AtomicUsize,
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StackPool {
    pub const fn new() -> Self {
        Self {
            free_stacks: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
            stats: StackPoolStats {
                allocated: AtomicUsize::new(0),
                deallocated: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
            },
        }
    }

    /// Allocate a stack of at least `size` bytes.
    ///
    /// # Returns
    ///
    /// A stack from the free list of the matching class if one is available,
    /// otherwise fresh memory. `None` if `size` exceeds every class or the
    /// allocator is exhausted.
    pub fn allocate(&self, size: usize) -> Option<Stack> {
        let class = StackSizeClass::for_size(size)?;
        if let Some(stack) = self.free_stacks[class.index()].lock().pop() {
            self.stats.in_use.fetch_add(1, Ordering::AcqRel);
            return Some(stack);
        }
        self.allocate_new(class)
    }

    /// Return a stack to the pool. Caller-provided stacks are simply dropped.
    pub fn deallocate(&self, stack: Stack) {
        if let Some(class) = stack.size_class() {
            self.free_stacks[class.index()].lock().push(stack);
            self.stats.in_use.fetch_sub(1, Ordering::AcqRel);
            self.stats.deallocated.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// (allocated, deallocated, in use) counters.
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.allocated.load(Ordering::Acquire),
            self.stats.deallocated.load(Ordering::Acquire),
            self.stats.in_use.load(Ordering::Acquire),
        )
    }

    fn allocate_new(&self, class: StackSizeClass) -> Option<Stack> {
        let layout = Layout::from_size_align(class.size(), POOL_ALIGN).ok()?;
        // SAFETY: layout has non-zero size.
        let memory = NonNull::new(unsafe { alloc(layout) })?;
        self.stats.allocated.fetch_add(1, Ordering::AcqRel);
        self.stats.in_use.fetch_add(1, Ordering::AcqRel);
        Some(Stack { memory, size: class.size(), origin: Origin::Pooled(class) })
    }
}
