//! Integration tests: whole kernels on the host backend, with real blocking
//! and switching between kernel threads.

#[cfg(test)]
mod scheduling_tests {
    use crate::config::KernelConfig;
    use crate::errors::KernelError;
    use crate::sync::{Mutex, Semaphore};
    use crate::tests::helpers::{boot, boot_with, leak, EventLog};
    use crate::thread::{ThreadBuilder, ThreadState};
    use crate::time::Timeout;
    use portable_atomic::{AtomicI32, AtomicU32, Ordering};

    #[test]
    fn test_more_urgent_thread_preempts_on_creation() {
        let k = boot_with(KernelConfig::default().with_main_priority(8));
        let log = EventLog::new();

        let l = log.clone();
        let low = k.spawn(move || l.push("low"), 10).unwrap();
        assert_eq!(k.thread_state(low), ThreadState::Ready);

        let l = log.clone();
        k.spawn(move || l.push("high"), 5).unwrap();
        log.push("main");

        k.thread_join(low, Timeout::Forever).unwrap();
        assert_eq!(log.take(), ["high", "main", "low"]);
    }

    #[test]
    fn test_equal_priority_runs_after_yield() {
        let k = boot();
        let log = EventLog::new();
        let l = log.clone();
        let peer = k.spawn(move || l.push("peer"), 0).unwrap();
        log.push("main");
        k.yield_now();
        log.push("main again");
        assert_eq!(log.take(), ["main", "peer", "main again"]);
        assert_eq!(k.thread_state(peer), ThreadState::Dead);
    }

    #[test]
    fn test_priority_inheritance_bounds_inversion() {
        let k = boot_with(KernelConfig::default().with_main_priority(2));
        let log = EventLog::new();
        let m = leak(Mutex::new(k));
        let release = leak(Semaphore::new(k, 0, 1).unwrap());
        let boosted = leak(AtomicI32::new(i32::MAX));

        let l = log.clone();
        let low = k
            .spawn(
                move || {
                    m.lock(Timeout::Forever).unwrap();
                    l.push("low locked");
                    release.take(Timeout::Forever).unwrap();
                    boosted.store(k.priority_get(k.current()).unwrap(), Ordering::SeqCst);
                    l.push("low unlock");
                    m.unlock().unwrap();
                    l.push("low done");
                },
                10,
            )
            .unwrap();
        k.sleep(Timeout::Ticks(1));
        assert_eq!(m.owner(), Some(low));

        let l = log.clone();
        let medium = k.spawn(move || l.push("medium"), 5).unwrap();

        release.give();
        m.lock(Timeout::Forever).unwrap();
        log.push("main locked");
        assert_eq!(k.priority_get(low), Ok(10));
        m.unlock().unwrap();

        k.thread_join(medium, Timeout::Forever).unwrap();
        k.thread_join(low, Timeout::Forever).unwrap();
        assert_eq!(boosted.load(Ordering::SeqCst), 2);
        assert_eq!(log.take(), ["low locked", "low unlock", "main locked", "medium", "low done"]);
    }

    #[test]
    fn test_timeout_fires_after_exactly_n_ticks() {
        let k = boot();
        let sem = leak(Semaphore::new(k, 0, 1).unwrap());
        let log = EventLog::new();
        let l = log.clone();
        k.spawn(
            move || {
                if sem.take(Timeout::Ticks(3)) == Err(KernelError::TimedOut) {
                    l.push("timed out");
                }
            },
            -1,
        )
        .unwrap();

        k.tick(2);
        assert_eq!(log.len(), 0);
        k.tick(1);
        assert_eq!(log.take(), ["timed out"]);
    }

    #[test]
    fn test_spawned_thread_yields_sleeps_and_returns() {
        let k = boot();
        let log = EventLog::new();
        let l = log.clone();
        let t = k
            .spawn(
                move || {
                    l.push("start");
                    k.yield_now();
                    l.push("yielded");
                    k.sleep(Timeout::Ticks(2));
                    l.push("done");
                },
                -1,
            )
            .unwrap();
        log.push("main");
        k.tick(2);
        k.thread_join(t, Timeout::Forever).unwrap();
        assert_eq!(log.take(), ["start", "yielded", "main", "done"]);
    }

    #[test]
    fn test_suspended_waiter_needs_resume_and_delivery() {
        let k = boot();
        let sem = leak(Semaphore::new(k, 0, 1).unwrap());
        let log = EventLog::new();
        let l = log.clone();
        let t = k
            .spawn(
                move || match sem.take(Timeout::Ticks(3)) {
                    Ok(()) => l.push("took"),
                    Err(_) => l.push("timed out"),
                },
                -1,
            )
            .unwrap();
        k.thread_suspend(t);
        k.tick(3);
        assert_eq!(log.len(), 0);
        assert_eq!(k.thread_state(t), ThreadState::Pending);

        sem.give();
        assert_eq!(k.thread_state(t), ThreadState::Suspended);
        assert_eq!(log.len(), 0);

        k.thread_resume(t);
        assert_eq!(log.take(), ["took"]);
        assert_eq!(k.thread_state(t), ThreadState::Dead);
    }

    #[test]
    fn test_abort_suspended_thread() {
        let k = boot();
        let t = k.spawn(|| {}, 5).unwrap();
        k.thread_suspend(t);
        assert_eq!(k.thread_state(t), ThreadState::Suspended);
        k.thread_abort(t);
        assert_eq!(k.thread_state(t), ThreadState::Dead);
        assert_eq!(k.thread_join(t, Timeout::NoWait), Ok(()));
        // A second abort of the same id is a no-op.
        k.thread_abort(t);
    }

    #[test]
    fn test_delayed_start() {
        let k = boot();
        let ran = leak(AtomicU32::new(0));
        let t = ThreadBuilder::new()
            .priority(-1)
            .delay(Timeout::Ticks(4))
            .spawn(k, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(k.thread_state(t), ThreadState::Prestart);
        k.tick(3);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        k.tick(1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let held = ThreadBuilder::new().delay(Timeout::Forever).spawn(k, || {}).unwrap();
        k.tick(100);
        assert_eq!(k.thread_state(held), ThreadState::Prestart);
        k.thread_start(held);
        assert_eq!(k.thread_join(held, Timeout::Forever), Ok(()));
    }

    #[test]
    fn test_sleep_and_early_wakeup() {
        let k = boot();
        let left = leak(AtomicU32::new(u32::MAX));
        let sleeper = k
            .spawn(
                move || {
                    left.store(k.sleep(Timeout::Ticks(10)), Ordering::SeqCst);
                },
                -1,
            )
            .unwrap();
        k.tick(3);
        assert_eq!(k.thread_state(sleeper), ThreadState::Suspended);
        // Only wakeup() ends a sleep.
        k.thread_resume(sleeper);
        assert_eq!(k.thread_state(sleeper), ThreadState::Suspended);
        k.wakeup(sleeper);
        assert_eq!(left.load(Ordering::SeqCst), 7);
        assert_eq!(k.thread_state(sleeper), ThreadState::Dead);
    }

    #[test]
    fn test_sleep_runs_for_full_duration() {
        let k = boot();
        let start = k.uptime_ticks();
        assert_eq!(k.sleep(Timeout::Ticks(6)), 0);
        assert_eq!(k.uptime_ticks() - start, 6);
        assert_eq!(k.msleep(0), 0);
    }

    #[test]
    fn test_join_rules() {
        let k = boot();
        let me = k.current();
        assert_eq!(k.thread_join(me, Timeout::Forever), Err(KernelError::Deadlock));

        let t = k.spawn(|| {}, 5).unwrap();
        assert_eq!(k.thread_join(t, Timeout::NoWait), Err(KernelError::WouldBlock));
        assert_eq!(k.thread_join(t, Timeout::Forever), Ok(()));
        assert_eq!(k.thread_state(t), ThreadState::Dead);
    }

    #[test]
    fn test_time_slice_rotates_equal_threads() {
        let k = boot_with(KernelConfig::default().with_time_slice(2, 0));
        let log = EventLog::new();
        let la = log.clone();
        let a = k
            .spawn(
                move || {
                    for _ in 0..2 {
                        la.push("a");
                        k.tick(2);
                    }
                },
                5,
            )
            .unwrap();
        let lb = log.clone();
        let b = k
            .spawn(
                move || {
                    for _ in 0..2 {
                        lb.push("b");
                        k.tick(2);
                    }
                },
                5,
            )
            .unwrap();
        k.thread_join(a, Timeout::Forever).unwrap();
        k.thread_join(b, Timeout::Forever).unwrap();
        assert_eq!(log.take(), ["a", "b", "a", "b"]);
    }

    #[test]
    fn test_sched_lock_defers_preemption() {
        let k = boot();
        let log = EventLog::new();
        k.sched_lock();
        let l = log.clone();
        k.spawn(move || l.push("urgent"), -5).unwrap();
        log.push("main");
        k.sched_unlock();
        assert_eq!(log.take(), ["main", "urgent"]);
    }

    #[test]
    fn test_priority_set_reorders() {
        let k = boot();
        let log = EventLog::new();
        let l = log.clone();
        let t = k.spawn(move || l.push("raised"), 5).unwrap();
        assert_eq!(log.len(), 0);
        k.priority_set(t, -1).unwrap();
        assert_eq!(log.take(), ["raised"]);
        assert_eq!(k.priority_set(k.current(), 1000), Err(KernelError::Invalid));
    }
}

#[cfg(test)]
mod object_tests {
    use crate::errors::KernelError;
    use crate::sync::{Fifo, MemSlab, Mutex, Pipe, Queue, Semaphore, Stack};
    use crate::tests::helpers::{boot, leak, EventLog};
    use crate::time::{Timeout, Timer, TimerFn};
    use alloc::sync::Arc;
    use portable_atomic::{AtomicU32, AtomicUsize, Ordering};

    #[test]
    fn test_semaphore_round_trip() {
        let k = boot();
        let sem = leak(Semaphore::new(k, 0, 1).unwrap());
        assert_eq!(sem.take(Timeout::NoWait), Err(KernelError::WouldBlock));
        k.spawn(move || sem.give(), 5).unwrap();
        assert_eq!(sem.take(Timeout::Ticks(10)), Ok(()));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_give_wakes_exactly_one_waiter() {
        let k = boot();
        let sem = leak(Semaphore::new(k, 0, 10).unwrap());
        let log = EventLog::new();
        for (name, prio) in [("w1", -2), ("w2", -3)] {
            let l = log.clone();
            k.spawn(
                move || {
                    if sem.take(Timeout::Forever).is_ok() {
                        l.push(name);
                    }
                },
                prio,
            )
            .unwrap();
        }
        sem.give();
        assert_eq!(log.take(), ["w2"]);
        k.tick(5);
        assert_eq!(log.len(), 0);
        assert_eq!(sem.count(), 0);
        sem.give();
        assert_eq!(log.take(), ["w1"]);
    }

    #[test]
    fn test_semaphore_reset_cancels_waiters() {
        let k = boot();
        let sem = leak(Semaphore::new(k, 0, 1).unwrap());
        let result = leak(spin::Mutex::new(Ok(())));
        k.spawn(move || *result.lock() = sem.take(Timeout::Forever), -1).unwrap();
        sem.reset();
        assert_eq!(*result.lock(), Err(KernelError::Cancelled));
    }

    #[test]
    fn test_mutex_owner_checks_and_timeout() {
        let k = boot();
        let m = leak(Mutex::new(k));
        let holder = k
            .spawn(
                move || {
                    m.lock(Timeout::Forever).unwrap();
                    k.sleep(Timeout::Forever);
                },
                -1,
            )
            .unwrap();
        assert_eq!(m.owner(), Some(holder));
        assert_eq!(m.unlock(), Err(KernelError::NotOwner));
        assert_eq!(m.lock(Timeout::NoWait), Err(KernelError::WouldBlock));
        assert_eq!(m.lock(Timeout::Ticks(3)), Err(KernelError::TimedOut));
    }

    #[test]
    fn test_queue_hands_item_to_waiter() {
        let k = boot();
        let q: &'static Queue<'static, _, u32> = leak(Queue::new(k));
        let got = leak(AtomicU32::new(0));
        k.spawn(
            move || {
                if let Ok(v) = q.get(Timeout::Forever) {
                    got.store(v, Ordering::SeqCst);
                }
            },
            -1,
        )
        .unwrap();
        q.append(7);
        assert_eq!(got.load(Ordering::SeqCst), 7);
        assert!(q.is_empty());
    }

    #[test]
    fn test_queue_cancel_wait() {
        let k = boot();
        let fifo: &'static Fifo<'static, _, u32> = leak(Fifo::new(k));
        let result = leak(spin::Mutex::new(Ok(0)));
        k.spawn(move || *result.lock() = fifo.get(Timeout::Forever), -1).unwrap();
        fifo.cancel_wait();
        assert_eq!(*result.lock(), Err(KernelError::Cancelled));
    }

    #[test]
    fn test_stack_pop_waits_for_push() {
        let k = boot();
        let s = leak(Stack::new(k, 4).unwrap());
        let got = leak(AtomicUsize::new(0));
        k.spawn(move || got.store(s.pop(Timeout::Forever).unwrap_or(0), Ordering::SeqCst), -1)
            .unwrap();
        s.push(0xABCD).unwrap();
        assert_eq!(got.load(Ordering::SeqCst), 0xABCD);
        assert!(s.is_empty());
    }

    #[test]
    fn test_slab_free_hands_block_to_waiter() {
        let k = boot();
        let slab = leak(MemSlab::new(k, 32, 1, 8).unwrap());
        let block = slab.alloc(Timeout::NoWait).unwrap();
        let got = leak(AtomicUsize::new(0));
        k.spawn(
            move || {
                if let Ok(b) = slab.alloc(Timeout::Forever) {
                    got.store(b.as_ptr() as usize, Ordering::SeqCst);
                }
            },
            -1,
        )
        .unwrap();
        assert_eq!(got.load(Ordering::SeqCst), 0);
        slab.free(block);
        assert_eq!(got.load(Ordering::SeqCst), block.as_ptr() as usize);
        assert_eq!(slab.num_used(), 1);
    }

    #[test]
    fn test_slab_double_free_aborts_thread() {
        let k = boot();
        let slab = leak(MemSlab::new(k, 16, 2, 8).unwrap());
        let log = EventLog::new();
        let l = log.clone();
        let t = k
            .spawn(
                move || {
                    let b = slab.alloc(Timeout::NoWait).unwrap();
                    slab.free(b);
                    l.push("freed");
                    slab.free(b);
                    l.push("unreachable");
                },
                5,
            )
            .unwrap();
        k.thread_join(t, Timeout::Forever).unwrap();
        assert_eq!(log.take(), ["freed"]);
        assert_eq!(slab.num_free(), 2);
    }

    #[test]
    fn test_pipe_reader_collects_partial_writes() {
        let k = boot();
        let pipe = leak(Pipe::new(k, 8).unwrap());
        let out = leak(spin::Mutex::new(([0u8; 4], Ok(0))));
        let reader = k
            .spawn(
                move || {
                    let mut buf = [0u8; 4];
                    let res = pipe.get(&mut buf, 4, Timeout::Forever);
                    *out.lock() = (buf, res);
                },
                -1,
            )
            .unwrap();
        assert_eq!(pipe.put(b"ab", 2, Timeout::NoWait), Ok(2));
        assert_eq!(pipe.read_avail(), 0);
        assert_eq!(pipe.put(b"cd", 2, Timeout::NoWait), Ok(2));
        k.thread_join(reader, Timeout::Forever).unwrap();
        let (buf, res) = *out.lock();
        assert_eq!(res, Ok(4));
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_periodic_timer() {
        let k = boot();
        let hits = Arc::new(AtomicU32::new(0));
        let stops = Arc::new(AtomicU32::new(0));
        let (h, s) = (hits.clone(), stops.clone());
        let expiry: TimerFn = Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let stop: TimerFn = Arc::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let timer = Timer::new(k, Some(expiry), Some(stop));
        timer.start(Timeout::Ticks(2), Timeout::Ticks(3));

        k.tick(1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        k.tick(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(timer.remaining_ticks(), 3);
        k.tick(3);
        assert_eq!(timer.status_get(), 2);
        assert_eq!(timer.status_get(), 0);

        timer.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(timer.remaining_ticks(), 0);
        // Stopping a stopped timer does not call the stop function again.
        timer.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_status_sync_blocks_until_expiry() {
        let k = boot();
        let timer = Timer::new(k, None, None);
        assert_eq!(timer.status_sync(), Ok(0));
        timer.start(Timeout::Ticks(4), Timeout::NoWait);
        let start = k.uptime_ticks();
        assert_eq!(timer.status_sync(), Ok(1));
        assert_eq!(k.uptime_ticks() - start, 4);
    }
}

#[cfg(test)]
mod fatal_tests {
    use crate::fatal::{FatalAction, FatalContext, FatalReason};
    use crate::sync::Semaphore;
    use crate::tests::helpers::{boot, leak, EventLog};
    use crate::thread::{ThreadBuilder, ThreadState};
    use crate::time::Timeout;
    use portable_atomic::{AtomicU32, Ordering};

    static STACK_FAILS: AtomicU32 = AtomicU32::new(0);

    fn count_stack_fail(ctx: &FatalContext) -> FatalAction {
        if ctx.reason == FatalReason::StackCheckFail {
            STACK_FAILS.fetch_add(1, Ordering::SeqCst);
        }
        crate::fatal::default_policy(ctx)
    }

    #[test]
    fn test_corrupted_stack_sentinel_aborts_thread() {
        let k = boot();
        k.set_fatal_hook(Some(count_stack_fail));
        let log = EventLog::new();
        let l = log.clone();
        let t = k
            .spawn(
                move || {
                    {
                        let st = k.lock_sched();
                        let me = st.current(0);
                        if let Some(stack) = st.threads[me].stack.as_ref() {
                            stack.clobber_sentinel();
                        }
                    }
                    l.push("clobbered");
                    k.yield_now();
                    l.push("survived");
                },
                5,
            )
            .unwrap();
        k.thread_join(t, Timeout::Forever).unwrap();
        assert_eq!(log.take(), ["clobbered"]);
        assert_eq!(k.thread_state(t), ThreadState::Dead);
        assert_eq!(STACK_FAILS.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "kernel halted")]
    fn test_everyone_blocked_forever_halts() {
        let k = boot();
        let sem = leak(Semaphore::new(k, 0, 1).unwrap());
        let _ = sem.take(Timeout::Forever);
    }

    #[test]
    #[should_panic(expected = "kernel halted")]
    fn test_aborting_essential_thread_halts() {
        let k = boot();
        let t = ThreadBuilder::new().priority(5).essential().spawn(k, || {}).unwrap();
        k.thread_abort(t);
    }

    #[test]
    #[should_panic(expected = "cannot block in an interrupt handler")]
    fn test_blocking_in_isr_panics() {
        let k = boot();
        let sem = Semaphore::new(k, 0, 1).unwrap();
        k.irq_offload(|| {
            let _ = sem.take(Timeout::Forever);
        });
    }
}
