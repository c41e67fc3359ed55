//! Property-based tests for the scheduler's data structures.

#[cfg(test)]
mod timeout_properties {
    use crate::thread::ThreadId;
    use crate::time::{TimeoutAction, TimeoutQueue};
    use alloc::vec::Vec;
    use proptest::prelude::*;

    fn action(n: usize) -> TimeoutAction {
        TimeoutAction::Thread(ThreadId::new(n as u32, 1))
    }

    proptest! {
        /// Every node fires in the announcement that crosses its deadline,
        /// earliest deadline first, insertion order among equal deadlines,
        /// and the stored deltas never go negative.
        #[test]
        fn prop_timeouts_fire_at_deadline(
            ticks in proptest::collection::vec(1u32..200, 1..40),
            aborted in proptest::collection::vec(any::<bool>(), 40),
            steps in proptest::collection::vec(1u32..50, 1..30),
        ) {
            let mut q = TimeoutQueue::new();
            let keys: Vec<_> = ticks.iter().enumerate().map(|(i, &t)| q.add(action(i), t, 0).0).collect();
            for (i, key) in keys.iter().enumerate() {
                if aborted[i] {
                    prop_assert!(q.abort(*key));
                }
            }
            prop_assert!(q.deltas().iter().all(|&(_, d)| d >= 0));

            let mut now = 0u64;
            for step in steps {
                let before = now;
                now += step as u64;
                let batch = q.announce(step);
                let mut expected: Vec<(u32, usize)> = ticks
                    .iter()
                    .enumerate()
                    .filter(|&(i, &t)| !aborted[i] && (t as u64) > before && (t as u64) <= now)
                    .map(|(i, &t)| (t, i))
                    .collect();
                expected.sort();
                let expected: Vec<_> = expected.into_iter().map(|(_, i)| action(i)).collect();
                prop_assert_eq!(&batch, &expected);
                prop_assert!(q.deltas().iter().all(|&(_, d)| d >= 0));
            }
            prop_assert_eq!(q.curr_tick(), now);
            let pending = ticks.iter().enumerate().filter(|&(i, &t)| !aborted[i] && t as u64 > now).count();
            prop_assert_eq!(q.len(), pending);
        }

        /// Cumulative deltas reproduce each node's remaining time.
        #[test]
        fn prop_remaining_matches_deadline(ticks in proptest::collection::vec(1u32..1000, 1..30), elapsed in 0u32..5) {
            let mut q = TimeoutQueue::new();
            let keys: Vec<_> = ticks.iter().enumerate().map(|(i, &t)| q.add(action(i), t, elapsed).0).collect();
            for (key, &t) in keys.iter().zip(&ticks) {
                prop_assert_eq!(q.remaining(*key, elapsed), Some(t as u64));
            }
        }
    }
}

#[cfg(test)]
mod queue_properties {
    use crate::config::{KernelConfig, ReadyQueueKind, WaitQueueKind};
    use crate::sched::state::tests::{start, state_with_main};
    use crate::thread::ThreadId;
    use crate::time::Timeout;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    fn ready_kind() -> impl Strategy<Value = ReadyQueueKind> {
        prop_oneof![Just(ReadyQueueKind::Dumb), Just(ReadyQueueKind::Scalable), Just(ReadyQueueKind::MultiQ)]
    }

    fn wait_kind() -> impl Strategy<Value = WaitQueueKind> {
        prop_oneof![Just(WaitQueueKind::Priority), Just(WaitQueueKind::Scalable)]
    }

    /// Ids sorted by priority, stable for equal priorities.
    fn by_priority(threads: &[(ThreadId, i32)]) -> Vec<ThreadId> {
        let mut sorted = threads.to_vec();
        sorted.sort_by_key(|&(_, prio)| prio);
        sorted.into_iter().map(|(id, _)| id).collect()
    }

    proptest! {
        /// Blocking the running thread repeatedly dispatches the ready
        /// threads most urgent first, FIFO within a level, then idle.
        #[test]
        fn prop_ready_queue_dispatch_order(kind in ready_kind(), prios in proptest::collection::vec(-16i32..14, 1..25)) {
            let config = KernelConfig::default().with_ready_queue(kind);
            let (mut st, main) = state_with_main(config, 14);
            let threads: Vec<_> = prios.iter().map(|&p| (start(&mut st, p), p)).collect();
            st.validate().map_err(|e| TestCaseError::fail(e))?;

            let mut cur = main;
            let mut order = Vec::new();
            for _ in 0..threads.len() {
                st.pend_thread(cur, None, Timeout::Forever, 0);
                cur = st.next_up(0);
                st.set_current(0, cur, 0);
                order.push(cur);
                st.validate().map_err(|e| TestCaseError::fail(e))?;
            }
            prop_assert_eq!(order, by_priority(&threads));
            st.pend_thread(cur, None, Timeout::Forever, 0);
            let idle = st.next_up(0);
            prop_assert!(st.threads[idle].is_idle);
        }

        /// Priority wait queues release waiters most urgent first; the FIFO
        /// policy releases them in arrival order.
        #[test]
        fn prop_wait_queue_order(kind in wait_kind(), fifo in any::<bool>(), prios in proptest::collection::vec(-16i32..14, 1..25)) {
            let kind = if fifo { WaitQueueKind::Fifo } else { kind };
            let (mut st, _main) = state_with_main(KernelConfig::default().with_wait_queue(kind), 0);
            let wq = st.wait_qs.alloc(&st.config, None);
            let threads: Vec<_> = prios.iter().map(|&p| (start(&mut st, p), p)).collect();
            for &(id, _) in &threads {
                st.pend_thread(id, Some(wq), Timeout::Forever, 0);
            }
            st.validate().map_err(|e| TestCaseError::fail(e))?;

            let released: Vec<_> = core::iter::from_fn(|| st.unpend_first_thread(wq)).collect();
            let expected = if fifo {
                threads.iter().map(|&(id, _)| id).collect()
            } else {
                by_priority(&threads)
            };
            prop_assert_eq!(released, expected);
        }
    }
}
