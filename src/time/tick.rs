//! Timer driver contract and a software-driven implementation.

use portable_atomic::{AtomicU32, AtomicU64, Ordering};

/// Hardware cycles per tick reported by [`ManualTimer`].
pub const MANUAL_CYCLES_PER_TICK: u64 = 10_000;

/// Contract between the kernel and a system timer driver.
///
/// The driver calls back into `Kernel::sys_clock_announce` with the number
/// of ticks that elapsed since the previous announcement. In tickless mode it
/// honours [`SystemTimer::set_timeout`] and fires only when needed; a ticking
/// driver may ignore it and announce one tick per interrupt.
pub trait SystemTimer: Send + Sync {
    /// Request an interrupt `ticks` ticks from now. `None` means nothing is
    /// scheduled; `idle` is set when the CPU is about to idle and the driver
    /// may pick a low-power strategy.
    fn set_timeout(&self, ticks: Option<u32>, idle: bool);

    /// Ticks elapsed since the last announcement that were not announced yet.
    fn elapsed(&self) -> u32;

    /// Called from the timer interrupt: the ticks to announce now. Resets
    /// the elapsed count.
    fn take_elapsed(&self) -> u32;

    /// Free-running 32-bit cycle counter.
    fn cycle_get_32(&self) -> u32;
}

/// Timer whose notion of time moves only when told to.
///
/// Used by the host backend: the idle loop asks it for the programmed
/// deadline, advances to it, and announces the elapsed ticks.
pub struct ManualTimer {
    /// Programmed deadline in ticks after the last announcement, `u64::MAX`
    /// when none.
    programmed: AtomicU64,
    /// Ticks advanced but not yet announced.
    pending: AtomicU32,
    cycles: AtomicU64,
    idle_requests: AtomicU32,
}

impl ManualTimer {
    pub const fn new() -> Self {
        Self {
            programmed: AtomicU64::new(u64::MAX),
            pending: AtomicU32::new(0),
            cycles: AtomicU64::new(0),
            idle_requests: AtomicU32::new(0),
        }
    }

    /// Deadline most recently programmed by the kernel, in ticks after the
    /// last announcement.
    pub fn programmed(&self) -> Option<u32> {
        match self.programmed.load(Ordering::Acquire) {
            u64::MAX => None,
            t => Some(t as u32),
        }
    }

    /// Let `ticks` ticks of time pass without announcing them.
    pub fn advance(&self, ticks: u32) {
        self.pending.fetch_add(ticks, Ordering::AcqRel);
        self.cycles.fetch_add(ticks as u64 * MANUAL_CYCLES_PER_TICK, Ordering::AcqRel);
    }

    /// Ticks left until the programmed deadline.
    pub fn until_deadline(&self) -> Option<u32> {
        self.programmed().map(|deadline| deadline.saturating_sub(self.elapsed()))
    }

    /// How many times the kernel programmed the timer right before idling.
    pub fn idle_requests(&self) -> u32 {
        self.idle_requests.load(Ordering::Acquire)
    }
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemTimer for ManualTimer {
    fn set_timeout(&self, ticks: Option<u32>, idle: bool) {
        let raw = ticks.map_or(u64::MAX, |t| t as u64 + self.elapsed() as u64);
        self.programmed.store(raw, Ordering::Release);
        if idle {
            self.idle_requests.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn elapsed(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    fn take_elapsed(&self) -> u32 {
        self.pending.swap(0, Ordering::AcqRel)
    }

    fn cycle_get_32(&self) -> u32 {
        self.cycles.load(Ordering::Acquire) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_timer_accumulates_until_taken() {
        let timer = ManualTimer::new();
        assert_eq!(timer.programmed(), None);
        timer.set_timeout(Some(5), false);
        assert_eq!(timer.programmed(), Some(5));
        timer.advance(2);
        assert_eq!(timer.until_deadline(), Some(3));
        // Relative to now: deadline lands 4 ticks after the 2 already elapsed.
        timer.set_timeout(Some(4), false);
        assert_eq!(timer.programmed(), Some(6));
        timer.advance(3);
        assert_eq!(timer.elapsed(), 5);
        assert_eq!(timer.cycle_get_32() as u64, 5 * MANUAL_CYCLES_PER_TICK);
        assert_eq!(timer.take_elapsed(), 5);
        assert_eq!(timer.elapsed(), 0);
        timer.set_timeout(None, true);
        assert_eq!(timer.programmed(), None);
        assert_eq!(timer.idle_requests(), 1);
    }
}
