//! Kernel configuration.
//!
//! Build-time knobs of a classic RTOS are expressed here as a plain value
//! handed to [`crate::Kernel::new`], so several independently configured
//! kernels can coexist in one test binary.

use crate::errors::ConfigError;
use crate::thread::Priority;

/// Maximum number of CPUs a kernel instance tracks.
pub const MAX_CPUS: usize = 4;

/// Word written at the lowest address of every thread stack.
pub const STACK_SENTINEL: u32 = 0xF0F0_F0F0;

/// Smallest stack accepted for a thread.
pub const MIN_STACK_SIZE: usize = 256;

/// Ready queue implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyQueueKind {
    /// Sorted list; O(n) insert, best for a handful of threads.
    Dumb,
    /// Balanced tree keyed by (priority, insertion order).
    Scalable,
    /// One FIFO per priority plus a bitmap of non-empty levels.
    MultiQ,
}

/// Ordering of threads parked on a kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitQueueKind {
    /// Highest priority first, FIFO among equal priorities (sorted list).
    Priority,
    /// Strict arrival order regardless of priority.
    Fifo,
    /// Same ordering as `Priority`, kept in a balanced tree.
    Scalable,
}

/// Runtime configuration of a kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of CPUs scheduled by this kernel.
    pub num_cpus: usize,
    /// Cooperative priorities occupy `-num_coop_priorities..=-1`.
    pub num_coop_priorities: u8,
    /// Preemptible priorities occupy `0..num_preempt_priorities`.
    pub num_preempt_priorities: u8,
    pub ready_queue: ReadyQueueKind,
    pub wait_queue: WaitQueueKind,
    /// Time slice length in ticks; 0 disables slicing.
    pub time_slice_ticks: u32,
    /// Threads more urgent than this priority are never sliced.
    pub time_slice_max_prio: Priority,
    /// Write and check a sentinel word at the base of every thread stack.
    pub stack_sentinel: bool,
    /// Most urgent priority a mutex owner can inherit.
    pub priority_ceiling: Priority,
    /// Priority given to the thread adopted by [`crate::Kernel::init`].
    pub main_priority: Priority,
    pub idle_stack_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            num_coop_priorities: 16,
            num_preempt_priorities: 15,
            ready_queue: ReadyQueueKind::Dumb,
            wait_queue: WaitQueueKind::Priority,
            time_slice_ticks: 0,
            time_slice_max_prio: 0,
            stack_sentinel: true,
            priority_ceiling: -16,
            main_priority: 0,
            idle_stack_size: 1024,
        }
    }
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cpus(mut self, n: usize) -> Self {
        self.num_cpus = n;
        self
    }

    pub fn with_priorities(mut self, coop: u8, preempt: u8) -> Self {
        self.num_coop_priorities = coop;
        self.num_preempt_priorities = preempt;
        self.priority_ceiling = -(coop as Priority);
        self
    }

    pub fn with_ready_queue(mut self, kind: ReadyQueueKind) -> Self {
        self.ready_queue = kind;
        self
    }

    pub fn with_wait_queue(mut self, kind: WaitQueueKind) -> Self {
        self.wait_queue = kind;
        self
    }

    pub fn with_time_slice(mut self, ticks: u32, max_prio: Priority) -> Self {
        self.time_slice_ticks = ticks;
        self.time_slice_max_prio = max_prio;
        self
    }

    pub fn with_stack_sentinel(mut self, enabled: bool) -> Self {
        self.stack_sentinel = enabled;
        self
    }

    pub fn with_priority_ceiling(mut self, ceiling: Priority) -> Self {
        self.priority_ceiling = ceiling;
        self
    }

    pub fn with_main_priority(mut self, prio: Priority) -> Self {
        self.main_priority = prio;
        self
    }

    /// Most urgent valid thread priority.
    pub fn highest_priority(&self) -> Priority {
        -(self.num_coop_priorities as Priority)
    }

    /// Least urgent priority an application thread may use.
    pub fn lowest_priority(&self) -> Priority {
        self.num_preempt_priorities as Priority - 1
    }

    /// Priority reserved for the idle thread, below every application level.
    pub fn idle_priority(&self) -> Priority {
        self.num_preempt_priorities as Priority
    }

    /// Whether `prio` is a valid application thread priority.
    pub fn is_valid_priority(&self, prio: Priority) -> bool {
        prio >= self.highest_priority() && prio <= self.lowest_priority()
    }

    /// Total number of distinct levels including the idle level.
    pub fn num_levels(&self) -> usize {
        self.num_coop_priorities as usize + self.num_preempt_priorities as usize + 1
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        if self.num_cpus > MAX_CPUS {
            return Err(ConfigError::TooManyCpus(self.num_cpus));
        }
        if self.num_coop_priorities == 0 && self.num_preempt_priorities == 0 {
            return Err(ConfigError::NoPriorities);
        }
        if self.ready_queue == ReadyQueueKind::MultiQ && self.num_levels() > 32 {
            return Err(ConfigError::MultiQRange(self.num_levels()));
        }
        if self.time_slice_ticks > 0
            && (self.time_slice_max_prio < self.highest_priority()
                || self.time_slice_max_prio > self.idle_priority())
        {
            return Err(ConfigError::SliceMaxPrio(self.time_slice_max_prio));
        }
        if self.idle_stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::IdleStack(self.idle_stack_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_priority_ranges() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.highest_priority(), -16);
        assert_eq!(cfg.lowest_priority(), 14);
        assert_eq!(cfg.idle_priority(), 15);
        assert!(cfg.is_valid_priority(-16));
        assert!(!cfg.is_valid_priority(15));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_multiq_rejects_wide_ranges() {
        let cfg = KernelConfig::default().with_ready_queue(ReadyQueueKind::MultiQ);
        assert_eq!(cfg.num_levels(), 32);
        assert!(cfg.validate().is_ok());
        let narrow = KernelConfig::default()
            .with_priorities(8, 15)
            .with_ready_queue(ReadyQueueKind::MultiQ);
        assert!(narrow.validate().is_ok());
        let wide = KernelConfig::default()
            .with_priorities(16, 20)
            .with_ready_queue(ReadyQueueKind::MultiQ);
        assert_eq!(wide.validate(), Err(ConfigError::MultiQRange(37)));
    }

    #[test]
    fn test_rejects_zero_cpus() {
        assert_eq!(KernelConfig::default().with_cpus(0).validate(), Err(ConfigError::NoCpus));
        assert_eq!(
            KernelConfig::default().with_cpus(MAX_CPUS + 1).validate(),
            Err(ConfigError::TooManyCpus(MAX_CPUS + 1))
        );
    }
}
