//! Kernel timers: standalone owners of a timeout node.
//!
//! A timer expires once after its initial duration and then every `period`
//! ticks until stopped. Each expiry bumps a status counter, runs the expiry
//! callback from interrupt context and wakes one thread blocked in
//! [`Timer::status_sync`].

use crate::arch::Arch;
use crate::errors::KResult;
use crate::kernel::Kernel;
use crate::sched::wait_q::WaitQId;
use crate::time::timeout::TimeoutKey;
use crate::time::Timeout;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Callback run when a timer expires or is stopped.
pub type TimerFn = Arc<dyn Fn() + Send + Sync>;

/// Handle of a timer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u32);

pub(crate) struct TimerRecord {
    pub(crate) timeout: Option<TimeoutKey>,
    pub(crate) period: u32,
    pub(crate) status: u32,
    pub(crate) expiry_fn: Option<TimerFn>,
    pub(crate) stop_fn: Option<TimerFn>,
    pub(crate) wait_q: WaitQId,
    pub(crate) user_data: usize,
}

pub(crate) struct TimerTable {
    slots: Vec<Option<TimerRecord>>,
    free: Vec<u32>,
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    pub(crate) fn insert(&mut self, record: TimerRecord) -> TimerId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(record);
                TimerId(index)
            }
            None => {
                self.slots.push(Some(record));
                TimerId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn remove(&mut self, id: TimerId) -> Option<TimerRecord> {
        let record = self.slots.get_mut(id.0 as usize)?.take();
        if record.is_some() {
            self.free.push(id.0);
        }
        record
    }

    pub(crate) fn get_mut(&mut self, id: TimerId) -> Option<&mut TimerRecord> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }
}

impl core::ops::Index<TimerId> for TimerTable {
    type Output = TimerRecord;

    fn index(&self, id: TimerId) -> &TimerRecord {
        match self.slots.get(id.0 as usize).and_then(Option::as_ref) {
            Some(record) => record,
            None => panic!("unknown timer {}", id.0),
        }
    }
}

impl core::ops::IndexMut<TimerId> for TimerTable {
    fn index_mut(&mut self, id: TimerId) -> &mut TimerRecord {
        match self.get_mut(id) {
            Some(record) => record,
            None => panic!("unknown timer {}", id.0),
        }
    }
}

/// A kernel timer bound to a kernel instance.
pub struct Timer<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    id: TimerId,
}

impl<'k, A: Arch> Timer<'k, A> {
    /// Create a stopped timer with optional expiry and stop callbacks.
    pub fn new(kernel: &'k Kernel<A>, expiry_fn: Option<TimerFn>, stop_fn: Option<TimerFn>) -> Self {
        let id = kernel.timer_create(expiry_fn, stop_fn);
        Self { kernel, id }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Start (or restart) the timer: first expiry after `duration`, then
    /// every `period` ticks. A `NoWait` duration expires at the next tick;
    /// `Forever` leaves the timer stopped. A zero or `Forever` period makes
    /// it one-shot.
    pub fn start(&self, duration: Timeout, period: Timeout) {
        self.kernel.timer_start(self.id, duration, period);
    }

    /// Stop the timer, run the stop callback if it was running and release
    /// one thread blocked in [`Timer::status_sync`].
    pub fn stop(&self) {
        self.kernel.timer_stop(self.id);
    }

    /// Expiries since the status was last read; resets it to zero.
    pub fn status_get(&self) -> u32 {
        self.kernel.timer_status_get(self.id)
    }

    /// Block until the timer expires at least once, then behave like
    /// [`Timer::status_get`]. Returns 0 immediately for a stopped timer, or
    /// when the timer is stopped while waiting.
    pub fn status_sync(&self) -> KResult<u32> {
        self.kernel.timer_status_sync(self.id)
    }

    /// Ticks until the next expiry; 0 when stopped.
    pub fn remaining_ticks(&self) -> u64 {
        self.kernel.timer_remaining_ticks(self.id)
    }

    pub fn user_data_set(&self, data: usize) {
        self.kernel.timer_user_data_set(self.id, data);
    }

    pub fn user_data(&self) -> usize {
        self.kernel.timer_user_data(self.id)
    }
}

impl<A: Arch> Drop for Timer<'_, A> {
    fn drop(&mut self) {
        self.kernel.timer_destroy(self.id);
    }
}
