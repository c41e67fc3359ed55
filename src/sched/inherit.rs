//! Mutex ownership and priority inheritance.
//!
//! A mutex owner runs at the most urgent of its own priority and the
//! priorities of the threads waiting on any mutex it holds, but never above
//! the configured ceiling. Whenever a waiter arrives, leaves or changes
//! priority, the owner's effective priority is recomputed, and the change is
//! carried on to the owner of the mutex the owner itself is blocked on.

use super::state::SchedulerState;
use super::trait_def::ThreadQueue;
use super::wait_q::WaitQId;
use crate::errors::{KResult, KernelError};
use crate::thread::{Priority, ThreadId};

impl<C> SchedulerState<C> {
    /// Effective priority `id` should run at.
    pub(crate) fn inherited_prio(&self, id: ThreadId) -> Priority {
        let t = &self.threads[id];
        let mut prio = t.base_prio;
        for &wq in &t.owned_mutexes {
            if let Some(waiter) = self.wait_qs[wq].queue.top_prio(&self.threads) {
                prio = prio.min(waiter.max(self.config.priority_ceiling));
            }
        }
        prio
    }

    /// Change the ordering priority of `id`, moving it within whichever
    /// queue holds it.
    pub(crate) fn set_effective_prio(&mut self, id: ThreadId, prio: Priority) {
        if self.threads[id].prio == prio {
            return;
        }
        if self.threads[id].is_queued() {
            self.ready_q.remove(&mut self.threads, id);
            self.threads[id].prio = prio;
            self.ready_q.add(&mut self.threads, id);
        } else if let Some(wq) = self.threads[id].pended_on {
            self.wait_qs[wq].queue.remove(&mut self.threads, id);
            self.threads[id].prio = prio;
            self.wait_qs[wq].queue.add(&mut self.threads, id);
        } else {
            self.threads[id].prio = prio;
        }
    }

    /// Recompute the effective priority of `id` and walk the chain of mutex
    /// owners it is blocked behind.
    pub(crate) fn update_inheritance(&mut self, id: ThreadId) {
        let mut cursor = Some(id);
        let mut hops = 0;
        while let Some(tid) = cursor {
            let prio = self.inherited_prio(tid);
            if prio == self.threads[tid].prio {
                break;
            }
            log::trace!("thread {} priority {} -> {}", tid, self.threads[tid].prio, prio);
            self.set_effective_prio(tid, prio);
            cursor = self.threads[tid]
                .pended_on
                .and_then(|wq| self.wait_qs[wq].mutex)
                .and_then(|m| m.owner);
            hops += 1;
            if hops > self.threads.len() {
                log::warn!("mutex ownership cycle through thread {}", tid);
                break;
            }
        }
    }

    /// Re-evaluate the owner of `wq` after its waiters changed.
    pub(crate) fn propagate_from_waitq(&mut self, wq: WaitQId) {
        if let Some(owner) = self.wait_qs[wq].mutex.and_then(|m| m.owner) {
            self.update_inheritance(owner);
        }
    }

    fn mutex_record(&mut self, wq: WaitQId) -> &mut super::wait_q::MutexRecord {
        match self.wait_qs[wq].mutex.as_mut() {
            Some(record) => record,
            None => panic!("{} does not belong to a mutex", wq),
        }
    }

    pub(crate) fn mutex_owner(&self, wq: WaitQId) -> Option<ThreadId> {
        self.wait_qs[wq].mutex.and_then(|m| m.owner)
    }

    pub(crate) fn mutex_lock_count(&self, wq: WaitQId) -> u32 {
        self.wait_qs[wq].mutex.map_or(0, |m| m.lock_count)
    }

    /// Take the mutex for `id` if it is free or already held by `id`.
    pub(crate) fn mutex_try_lock(&mut self, wq: WaitQId, id: ThreadId) -> KResult<()> {
        let record = self.mutex_record(wq);
        let owner = record.owner;
        match owner {
            None => {
                record.owner = Some(id);
                record.lock_count = 1;
                self.threads[id].owned_mutexes.push(wq);
                self.update_inheritance(id);
                Ok(())
            }
            Some(owner) if owner == id => {
                record.lock_count += 1;
                Ok(())
            }
            Some(_) => Err(KernelError::WouldBlock),
        }
    }

    /// Release one level of ownership held by `id`. On the last level the
    /// mutex passes straight to the first waiter, which is readied.
    ///
    /// # Returns
    ///
    /// The new owner, if ownership was handed over.
    pub(crate) fn mutex_unlock(&mut self, wq: WaitQId, id: ThreadId) -> KResult<Option<ThreadId>> {
        let record = self.mutex_record(wq);
        let owner = record.owner;
        match owner {
            None => return Err(KernelError::Invalid),
            Some(owner) if owner != id => return Err(KernelError::NotOwner),
            Some(_) => {}
        }
        if record.lock_count > 1 {
            record.lock_count -= 1;
            return Ok(None);
        }
        record.owner = None;
        record.lock_count = 0;
        self.threads[id].owned_mutexes.retain(|&owned| owned != wq);
        self.update_inheritance(id);

        let next = match self.unpend_first_thread(wq) {
            Some(next) => next,
            None => return Ok(None),
        };
        let record = self.mutex_record(wq);
        record.owner = Some(next);
        record.lock_count = 1;
        self.threads[next].owned_mutexes.push(wq);
        self.update_inheritance(next);
        self.wake(next, Ok(()), 0);
        log::trace!("mutex {} handed from {} to {}", wq, id, next);
        Ok(Some(next))
    }

    /// Forget a mutex that is being destroyed.
    pub(crate) fn mutex_forget(&mut self, wq: WaitQId) {
        if let Some(owner) = self.mutex_owner(wq) {
            if let Some(t) = self.threads.get_mut(owner) {
                t.owned_mutexes.retain(|&owned| owned != wq);
            }
            if self.threads.get(owner).is_some() {
                self.update_inheritance(owner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::tests::{start, state_with_main};
    use super::super::wait_q::MutexRecord;
    use crate::config::KernelConfig;
    use crate::sched::trait_def::ThreadQueue;
    use crate::errors::KernelError;
    use crate::time::Timeout;

    #[test]
    fn test_owner_inherits_waiter_priority() {
        let (mut st, main) = state_with_main(KernelConfig::default(), 0);
        let m = st.wait_qs.alloc(&st.config, Some(MutexRecord::default()));
        let low = start(&mut st, 10);
        let high = start(&mut st, 5);
        st.mutex_try_lock(m, low).unwrap();
        assert_eq!(st.mutex_try_lock(m, high), Err(KernelError::WouldBlock));
        st.pend_thread(high, Some(m), Timeout::Forever, 0);
        assert_eq!(st.threads[low].prio, 5);
        assert_eq!(st.threads[low].base_prio, 10);
        // The boosted owner is reordered in the ready queue.
        let _mid = start(&mut st, 7);
        assert_eq!(st.ready_q.best(&st.threads), Some(low));

        assert_eq!(st.mutex_unlock(m, low), Ok(Some(high)));
        assert_eq!(st.threads[low].prio, 10);
        assert_eq!(st.mutex_owner(m), Some(high));
        assert_eq!(st.threads[high].swap_retval, Ok(()));
        assert_eq!(st.mutex_unlock(m, main), Err(KernelError::NotOwner));
        st.validate().unwrap();
    }

    #[test]
    fn test_inheritance_is_transitive() {
        let (mut st, _main) = state_with_main(KernelConfig::default(), 0);
        let m1 = st.wait_qs.alloc(&st.config, Some(MutexRecord::default()));
        let m2 = st.wait_qs.alloc(&st.config, Some(MutexRecord::default()));
        let a = start(&mut st, 12);
        let b = start(&mut st, 9);
        let c = start(&mut st, 2);
        st.mutex_try_lock(m1, a).unwrap();
        st.mutex_try_lock(m2, b).unwrap();
        // b waits for a's mutex, c waits for b's.
        st.pend_thread(b, Some(m1), Timeout::Forever, 0);
        assert_eq!(st.threads[a].prio, 9);
        st.pend_thread(c, Some(m2), Timeout::Forever, 0);
        assert_eq!(st.threads[b].prio, 2);
        assert_eq!(st.threads[a].prio, 2);
    }

    #[test]
    fn test_waiter_timeout_drops_boost() {
        let (mut st, _main) = state_with_main(KernelConfig::default(), 0);
        let m = st.wait_qs.alloc(&st.config, Some(MutexRecord::default()));
        let low = start(&mut st, 10);
        let high = start(&mut st, 3);
        st.mutex_try_lock(m, low).unwrap();
        st.pend_thread(high, Some(m), Timeout::Ticks(2), 0);
        assert_eq!(st.threads[low].prio, 3);
        for action in st.timeouts.announce(2) {
            st.handle_expired(action);
        }
        assert_eq!(st.threads[low].prio, 10);
        assert_eq!(st.threads[high].swap_retval, Err(KernelError::TimedOut));
    }

    #[test]
    fn test_ceiling_limits_boost() {
        let cfg = KernelConfig::default().with_priority_ceiling(0);
        let (mut st, _main) = state_with_main(cfg, 0);
        let m = st.wait_qs.alloc(&st.config, Some(MutexRecord::default()));
        let low = start(&mut st, 10);
        let coop = start(&mut st, -4);
        st.mutex_try_lock(m, low).unwrap();
        st.pend_thread(coop, Some(m), Timeout::Forever, 0);
        assert_eq!(st.threads[low].prio, 0);
    }

    #[test]
    fn test_recursive_lock_counts_levels() {
        let (mut st, main) = state_with_main(KernelConfig::default(), 0);
        let m = st.wait_qs.alloc(&st.config, Some(MutexRecord::default()));
        st.mutex_try_lock(m, main).unwrap();
        st.mutex_try_lock(m, main).unwrap();
        assert_eq!(st.mutex_lock_count(m), 2);
        assert_eq!(st.mutex_unlock(m, main), Ok(None));
        assert_eq!(st.mutex_owner(m), Some(main));
        assert_eq!(st.mutex_unlock(m, main), Ok(None));
        assert_eq!(st.mutex_owner(m), None);
        assert_eq!(st.mutex_unlock(m, main), Err(KernelError::Invalid));
    }
}
