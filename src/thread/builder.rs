use super::{Priority, ThreadEntry, ThreadId, ThreadOptions};
use crate::arch::Arch;
use crate::errors::KResult;
use crate::kernel::Kernel;
use crate::mem::Stack;
use crate::time::Timeout;
use alloc::boxed::Box;
use alloc::string::String;

/// Stack size used when none is requested.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

type Closure = Box<dyn FnOnce() + Send>;

/// Thread creation parameters.
pub struct ThreadBuilder {
    pub(crate) name: Option<String>,
    pub(crate) priority: Priority,
    pub(crate) stack_size: usize,
    pub(crate) stack: Option<Stack>,
    pub(crate) options: ThreadOptions,
    pub(crate) abort_hook: Option<fn(ThreadId)>,
    pub(crate) delay: Timeout,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            priority: 0,
            stack_size: DEFAULT_STACK_SIZE,
            stack: None,
            options: ThreadOptions::empty(),
            abort_hook: None,
            delay: Timeout::NoWait,
        }
    }

    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Stack size for a stack taken from the kernel's pool.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Run on a caller-provided stack instead of a pooled one.
    pub fn stack(mut self, stack: Stack) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn options(mut self, options: ThreadOptions) -> Self {
        self.options = options;
        self
    }

    /// Any fatal error in the thread halts the system.
    pub fn essential(mut self) -> Self {
        self.options.insert(ThreadOptions::ESSENTIAL);
        self
    }

    /// Called with the thread's id right before it is aborted.
    pub fn on_abort(mut self, hook: fn(ThreadId)) -> Self {
        self.abort_hook = Some(hook);
        self
    }

    /// Start delay. `NoWait` (the default) makes the thread ready at once,
    /// `Forever` leaves it created until [`Kernel::thread_start`].
    pub fn delay(mut self, delay: Timeout) -> Self {
        self.delay = delay;
        self
    }

    /// Create a thread running `entry(p1, p2, p3)`.
    pub fn spawn_entry<A: Arch>(
        self,
        kernel: &'static Kernel<A>,
        entry: ThreadEntry,
        p1: usize,
        p2: usize,
        p3: usize,
    ) -> KResult<ThreadId> {
        kernel.thread_create(self, entry, [p1, p2, p3])
    }

    /// Create a thread running the closure `f`.
    ///
    /// # Returns
    ///
    /// The new thread's id, or the reason it could not be created.
    pub fn spawn<A, F>(self, kernel: &'static Kernel<A>, f: F) -> KResult<ThreadId>
    where
        A: Arch,
        F: FnOnce() + Send + 'static,
    {
        let closure: Box<Closure> = Box::new(Box::new(f));
        let raw = Box::into_raw(closure) as usize;
        kernel.thread_create(self, run_closure, [raw, 0, 0]).inspect_err(|_| {
            // SAFETY: the thread was not created, so nothing else owns `raw`.
            drop(unsafe { Box::from_raw(raw as *mut Closure) });
        })
    }
}

impl Default for ThreadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn run_closure(raw: usize, _: usize, _: usize) {
    // SAFETY: produced by `Box::into_raw` in `ThreadBuilder::spawn`; a thread
    // body runs at most once.
    let f = unsafe { Box::from_raw(raw as *mut Closure) };
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_and_options() {
        let b = ThreadBuilder::new();
        assert_eq!(b.priority, 0);
        assert_eq!(b.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(b.delay, Timeout::NoWait);
        let b = ThreadBuilder::new().name("worker").priority(-3).essential().delay(Timeout::Forever);
        assert_eq!(b.name.as_deref(), Some("worker"));
        assert_eq!(b.priority, -3);
        assert!(b.options.contains(ThreadOptions::ESSENTIAL));
        assert_eq!(b.delay, Timeout::Forever);
    }
}
