//! Error types for recoverable kernel conditions.
//!
//! Blocking primitives report "not available right now" and "gave up after
//! the timeout" as distinct values so callers can react differently. Fatal
//! conditions (corrupted stacks, invariant violations, CPU exceptions) never
//! travel through these types; they go through [`crate::fatal`].

use crate::thread::Priority;
use core::fmt;

/// Result type for kernel operations.
pub type KResult<T> = Result<T, KernelError>;

/// Recoverable error returned by kernel services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Object unavailable and the caller asked not to wait.
    WouldBlock,
    /// The caller blocked and its timeout expired before delivery.
    TimedOut,
    /// No free block, slot or buffer space, and no wait was requested.
    NoMemory,
    /// Invalid argument, or the object is not in a state allowing the call.
    Invalid,
    /// The calling thread does not own the object.
    NotOwner,
    /// The call can never complete (for example a thread joining itself).
    Deadlock,
    /// Another party cancelled the wait.
    Cancelled,
    /// A pipe transfer could not move the minimum byte count without waiting.
    Io,
    /// The operation is not available on this backend.
    NotSupported,
    /// Kernel configuration was rejected.
    Config(ConfigError),
    /// Thread creation failed.
    Spawn(SpawnError),
}

/// Reasons a [`crate::config::KernelConfig`] is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// At least one CPU is required.
    NoCpus,
    /// More CPUs than the kernel tracks.
    TooManyCpus(usize),
    /// No preemptible or cooperative priorities at all.
    NoPriorities,
    /// The bitmap ready queue supports at most 32 distinct priorities.
    MultiQRange(usize),
    /// Time-slice priority threshold outside the priority range.
    SliceMaxPrio(Priority),
    /// Idle thread stack too small to hold the sentinel and an initial frame.
    IdleStack(usize),
}

/// Errors that can occur while creating a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// [`crate::Kernel::init`] has not run yet.
    NotInitialized,
    /// Priority outside the configured cooperative/preemptible range.
    InvalidPriority(Priority),
    /// Stack smaller than the minimum usable size.
    StackTooSmall(usize),
    /// No memory for the stack.
    OutOfMemory,
}

// Error numbers follow the kernel's minimal libc so that values logged on
// target and on the host line up.
const EPERM: i32 = 1;
const EIO: i32 = 5;
const EAGAIN: i32 = 11;
const ENOMEM: i32 = 12;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const EDEADLK: i32 = 45;
const ENOTSUP: i32 = 134;
const ECANCELED: i32 = 140;

impl KernelError {
    /// Negative errno value for this error.
    pub fn errno(&self) -> i32 {
        -match self {
            KernelError::WouldBlock => EBUSY,
            KernelError::TimedOut => EAGAIN,
            KernelError::NoMemory => ENOMEM,
            KernelError::Invalid => EINVAL,
            KernelError::NotOwner => EPERM,
            KernelError::Deadlock => EDEADLK,
            KernelError::Cancelled => ECANCELED,
            KernelError::Io => EIO,
            KernelError::NotSupported => ENOTSUP,
            KernelError::Config(_) => EINVAL,
            KernelError::Spawn(SpawnError::OutOfMemory) => ENOMEM,
            KernelError::Spawn(_) => EINVAL,
        }
    }

    /// Whether this error means "gave up waiting".
    pub fn is_timeout(&self) -> bool {
        matches!(self, KernelError::TimedOut)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::WouldBlock => write!(f, "object unavailable and no wait requested"),
            KernelError::TimedOut => write!(f, "timed out waiting for object"),
            KernelError::NoMemory => write!(f, "no free memory"),
            KernelError::Invalid => write!(f, "invalid argument or object state"),
            KernelError::NotOwner => write!(f, "caller does not own the object"),
            KernelError::Deadlock => write!(f, "operation would deadlock"),
            KernelError::Cancelled => write!(f, "wait cancelled"),
            KernelError::Io => write!(f, "minimum transfer not possible without waiting"),
            KernelError::NotSupported => write!(f, "operation not supported"),
            KernelError::Config(e) => write!(f, "configuration error: {}", e),
            KernelError::Spawn(e) => write!(f, "spawn error: {}", e),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoCpus => write!(f, "at least one CPU is required"),
            ConfigError::TooManyCpus(n) => write!(f, "{} CPUs exceeds the supported maximum", n),
            ConfigError::NoPriorities => write!(f, "no thread priorities configured"),
            ConfigError::MultiQRange(n) => {
                write!(f, "{} priorities do not fit the bitmap ready queue", n)
            }
            ConfigError::SliceMaxPrio(p) => write!(f, "time slice priority {} out of range", p),
            ConfigError::IdleStack(n) => write!(f, "idle stack of {} bytes is too small", n),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::NotInitialized => write!(f, "kernel not initialized"),
            SpawnError::InvalidPriority(p) => write!(f, "invalid priority {}", p),
            SpawnError::StackTooSmall(n) => write!(f, "stack of {} bytes is too small", n),
            SpawnError::OutOfMemory => write!(f, "out of memory for stack"),
        }
    }
}

impl From<ConfigError> for KernelError {
    fn from(err: ConfigError) -> Self {
        KernelError::Config(err)
    }
}

impl From<SpawnError> for KernelError {
    fn from(err: SpawnError) -> Self {
        KernelError::Spawn(err)
    }
}
