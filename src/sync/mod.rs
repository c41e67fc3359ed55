//! Kernel synchronization objects.
//!
//! All of them follow one protocol: the object's own state sits behind a
//! [`crate::spinlock::SpinLock`], blocked threads sit on a wait queue owned
//! by the scheduler. A caller that cannot proceed pends on the wait queue
//! while still holding the object lock, so a give/put racing with it is
//! either seen before the check or finds the caller already queued.
//! Whoever makes the object available hands it straight to the first
//! waiter (result and data word delivered through the waiter's control
//! block), so a woken thread never has to compete for what it was given.
//!
//! [`Mutex`] keeps its state under the scheduler lock instead, since
//! priority inheritance needs owner and waiters in one place.

pub mod mem_slab;
pub mod mutex;
pub mod pipe;
pub mod queue;
pub mod sem;
pub mod stack;

pub use mem_slab::MemSlab;
pub use mutex::Mutex;
pub use pipe::Pipe;
pub use queue::{Fifo, Lifo, Queue};
pub use sem::Semaphore;
pub use stack::Stack;
