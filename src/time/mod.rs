//! System time base: ticks, timeouts and duration conversions.

pub mod tick;
pub mod timeout;
pub mod timer;

pub use tick::{ManualTimer, SystemTimer};
pub use timeout::{TimeoutAction, TimeoutKey, TimeoutQueue};
pub use timer::{Timer, TimerFn, TimerId};

/// Frequency of the system tick in Hz.
pub const SYS_CLOCK_TICKS_PER_SEC: u32 = 100;

/// Longest timeout representable in ticks; longer requests are clamped.
pub const MAX_TIMEOUT_TICKS: u32 = i32::MAX as u32;

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail immediately with "would block" instead of waiting.
    NoWait,
    /// Wait until the object is delivered, however long that takes.
    Forever,
    /// Wait at most this many ticks.
    Ticks(u32),
}

impl Timeout {
    /// Timeout of `ms` milliseconds, rounded up to whole ticks.
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            return Timeout::NoWait;
        }
        Timeout::Ticks(ms_to_ticks_ceil(ms))
    }

    pub fn from_duration(d: Duration) -> Self {
        if d.as_nanos() == 0 {
            return Timeout::NoWait;
        }
        Timeout::Ticks(ns_to_ticks_ceil(d.as_nanos()))
    }

    pub fn ticks(n: u32) -> Self {
        Timeout::Ticks(n.min(MAX_TIMEOUT_TICKS))
    }

    pub fn is_no_wait(self) -> bool {
        matches!(self, Timeout::NoWait | Timeout::Ticks(0))
    }

    pub fn is_forever(self) -> bool {
        matches!(self, Timeout::Forever)
    }

    /// Tick count for a finite timeout.
    pub fn as_ticks(self) -> Option<u32> {
        match self {
            Timeout::NoWait => Some(0),
            Timeout::Forever => None,
            Timeout::Ticks(n) => Some(n.min(MAX_TIMEOUT_TICKS)),
        }
    }
}

pub fn ms_to_ticks_ceil(ms: u64) -> u32 {
    let per_sec = SYS_CLOCK_TICKS_PER_SEC as u64;
    let ticks = ms.saturating_mul(per_sec).saturating_add(999) / 1000;
    ticks.min(MAX_TIMEOUT_TICKS as u64) as u32
}

pub fn ns_to_ticks_ceil(ns: u64) -> u32 {
    let per_sec = SYS_CLOCK_TICKS_PER_SEC as u128;
    let ticks = (ns as u128 * per_sec + 999_999_999) / 1_000_000_000;
    ticks.min(MAX_TIMEOUT_TICKS as u128) as u32
}

pub fn ticks_to_ms(ticks: u64) -> u64 {
    ticks * 1000 / SYS_CLOCK_TICKS_PER_SEC as u64
}

/// A duration of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(u64);

impl Duration {
    /// Create a duration from nanoseconds.
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Create a duration from microseconds.
    pub fn from_micros(micros: u64) -> Self {
        Self(micros.saturating_mul(1_000))
    }

    /// Create a duration from milliseconds.
    pub fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Create a duration spanning `ticks` system ticks.
    pub fn from_ticks(ticks: u64) -> Self {
        Self(ticks.saturating_mul(1_000_000_000 / SYS_CLOCK_TICKS_PER_SEC as u64))
    }

    /// Get nanoseconds in this duration.
    pub fn as_nanos(self) -> u64 {
        self.0
    }

    /// Get milliseconds in this duration.
    pub fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_up_to_ticks() {
        assert_eq!(Timeout::from_millis(0), Timeout::NoWait);
        assert_eq!(Timeout::from_millis(1), Timeout::Ticks(1));
        assert_eq!(Timeout::from_millis(10), Timeout::Ticks(1));
        assert_eq!(Timeout::from_millis(11), Timeout::Ticks(2));
        assert_eq!(Timeout::from_millis(1000), Timeout::Ticks(100));
        assert_eq!(Timeout::from_duration(Duration::from_micros(10_001)), Timeout::Ticks(2));
    }

    #[test]
    fn test_timeout_classification() {
        assert!(Timeout::NoWait.is_no_wait());
        assert!(Timeout::Ticks(0).is_no_wait());
        assert!(!Timeout::Ticks(1).is_no_wait());
        assert_eq!(Timeout::Forever.as_ticks(), None);
        assert_eq!(Timeout::ticks(u32::MAX).as_ticks(), Some(MAX_TIMEOUT_TICKS));
        assert_eq!(ticks_to_ms(250), 2500);
        assert_eq!(Duration::from_ticks(3).as_millis(), 30);
    }
}
