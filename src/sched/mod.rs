//! Scheduler core: ready queue backends, wait queues and the thread state
//! machine.
//!
//! Cooperative threads (negative priority) run until they block or yield;
//! preemptible threads are displaced as soon as a more urgent thread becomes
//! ready. Equal priorities are served first-in first-out.

mod inherit;
mod pend;
pub(crate) mod priq;
pub(crate) mod state;
pub(crate) mod trait_def;
pub mod wait_q;

pub(crate) use state::SchedulerState;
pub use wait_q::WaitQId;
