//! Tick announcement and the system clock.

use super::Kernel;
use crate::arch::Arch;
use crate::time::{ticks_to_ms, SystemTimer};

impl<A: Arch> Kernel<A> {
    /// Account `ticks` elapsed ticks: charge the time slice, fire every
    /// timeout that fell due, and program the next deadline.
    ///
    /// Timer callbacks run without the scheduler lock. Threads readied here
    /// run once the enclosing interrupt exits.
    pub fn sys_clock_announce(&self, ticks: u32) {
        let cpu = self.cpu();
        let mut st = self.lock_sched();
        if st.cpus[cpu].current.is_some() {
            st.time_slice(cpu, ticks);
        }
        st.timeouts.begin_announce(ticks);
        while let Some(action) = st.timeouts.pop_expired() {
            if let Some(callback) = st.handle_expired(action) {
                drop(st);
                callback();
                st = self.lock_sched();
            }
        }
        st.timeouts.finish_announce();
        self.reprogram(&st);
    }

    /// Timer interrupt body: announce what the driver counted.
    pub fn timer_isr(&self) {
        let ticks = self.arch.timer().take_elapsed();
        self.sys_clock_announce(ticks);
    }

    /// Ticks since boot, including ticks not announced yet.
    pub fn uptime_ticks(&self) -> u64 {
        let st = self.lock_sched();
        st.timeouts.curr_tick() + self.arch.timer().elapsed() as u64
    }

    pub fn uptime_ms(&self) -> u64 {
        ticks_to_ms(self.uptime_ticks())
    }

    /// Ticks until the earliest queued timeout.
    pub fn next_timeout_expiry(&self) -> Option<u32> {
        let st = self.lock_sched();
        st.timeouts.next_timeout(self.arch.timer().elapsed())
    }

    /// Program the timer driver directly.
    pub fn set_timeout_expiry(&self, ticks: Option<u32>, idle: bool) {
        self.arch.timer().set_timeout(ticks, idle);
    }

    pub fn cycle_get_32(&self) -> u32 {
        self.arch.timer().cycle_get_32()
    }
}

#[cfg(any(test, feature = "std-shim"))]
impl Kernel<crate::arch::posix::PosixArch> {
    /// Let `ticks` ticks of virtual time pass and run the timer interrupt,
    /// switching to any thread that became more urgent than the caller.
    pub fn tick(&self, ticks: u32) {
        self.arch.timer().advance(ticks);
        let key = self.arch.irq_lock();
        self.isr_enter();
        self.timer_isr();
        self.isr_exit();
        self.arch.irq_unlock(key);
    }
}
