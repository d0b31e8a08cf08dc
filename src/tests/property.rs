//! Property-based tests for the state word invariants.

#[cfg(test)]
mod property_tests {
    use crate::sched::{CpuSet, SchedParam};
    use crate::tests::helpers::TestRig;
    use crate::thread::state::check_consistency;
    use crate::thread::{InfoFlags, StateFlags, ThreadRef};
    use crate::time::{Duration, Timeout};
    use crate::wait::WaitQueue;
    use alloc::vec::Vec;

    /// Simple linear congruential generator for property testing.
    struct SimpleRng {
        state: u64,
    }

    impl SimpleRng {
        fn new(seed: u64) -> Self {
            Self { state: seed }
        }

        fn next_u64(&mut self) -> u64 {
            self.state = self
                .state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            self.state >> 11
        }

        fn gen_range(&mut self, min: u64, max: u64) -> u64 {
            min + (self.next_u64() % (max - min))
        }

        fn gen_bool(&mut self) -> bool {
            self.next_u64() & 1 == 0
        }
    }

    fn assert_consistent(rig: &TestRig, threads: &[ThreadRef], step: usize) {
        for t in threads {
            let lt = rig.kernel.lock_thread(t);
            let verdict = check_consistency(lt.state(), lt.is_queued(), lt.wchan().is_some());
            assert!(
                verdict.is_ok(),
                "step {step}: {} in {:?}: {:?}",
                t.name(),
                lt.state(),
                verdict
            );
        }
    }

    #[test]
    fn property_random_transitions_keep_state_consistent() {
        let mut rng = SimpleRng::new(0x5eed_cafe);
        let rig = TestRig::new(2);
        let threads: Vec<ThreadRef> = (0..4)
            .map(|i| rig.oob_thread(&alloc::format!("t{i}"), SchedParam::fifo(10 + i)))
            .collect();
        let owner = rig.started_thread("owner", SchedParam::fifo(1));

        for step in 0..2000 {
            let t = &threads[rng.gen_range(0, threads.len() as u64) as usize];
            match rng.gen_range(0, 11) {
                0 => {
                    let delay = Duration::from_millis(rng.gen_range(1, 20));
                    rig.kernel
                        .lock_thread(t)
                        .sleep_on(Timeout::Relative(delay), rig.kernel.clock(), None);
                }
                1 => rig.kernel.wakeup(t, StateFlags::WAKE_MASK, InfoFlags::empty()),
                2 => {
                    let _ = rig.kernel.hold(t, StateFlags::SUSP);
                }
                3 => rig.kernel.release(t, StateFlags::SUSP, InfoFlags::empty()),
                4 => rig.kernel.kick(t, InfoFlags::empty()),
                5 => {
                    rig.kernel.unblock(t);
                }
                6 => {
                    let prio = rng.gen_range(1, 100) as i32;
                    rig.kernel.set_schedparam(t, SchedParam::fifo(prio)).unwrap();
                }
                7 => {
                    if t.is_inband() {
                        let _ = rig.kernel.switch_oob(t);
                    } else {
                        rig.kernel.switch_inband(t, None);
                    }
                }
                8 => {
                    let cpus = CpuSet::from_bits(rng.gen_range(1, 4));
                    rig.kernel.set_affinity(t, cpus).unwrap();
                }
                9 => rig.advance(Duration::from_millis(rng.gen_range(1, 10))),
                _ => {
                    if rng.gen_bool() {
                        rig.kernel.boost(t, owner.id(), rng.gen_range(1, 100) as i32);
                    } else {
                        rig.kernel.unboost(t, owner.id());
                    }
                }
            }
            assert_consistent(&rig, &threads, step);
        }
    }

    #[test]
    fn property_wakeup_is_idempotent() {
        let mut rng = SimpleRng::new(42);
        let rig = TestRig::new(1);
        for i in 0..50 {
            let t = rig.oob_thread(&alloc::format!("w{i}"), SchedParam::fifo(20));
            let mask = if rng.gen_bool() {
                rig.kernel.lock_thread(&t).sleep_on(
                    Timeout::Relative(Duration::from_millis(rng.gen_range(1, 50))),
                    rig.kernel.clock(),
                    None,
                );
                StateFlags::DELAY
            } else {
                rig.kernel.hold(&t, StateFlags::SUSP).unwrap();
                StateFlags::SUSP
            };

            let wake = |thread: &ThreadRef| {
                if mask == StateFlags::SUSP {
                    rig.kernel.release(thread, mask, InfoFlags::empty());
                } else {
                    rig.kernel.wakeup(thread, mask, InfoFlags::empty());
                }
            };
            wake(&t);
            let once = rig.kernel.get_state(&t);
            wake(&t);
            assert_eq!(rig.kernel.get_state(&t), once);
            assert!(once.state.contains(StateFlags::READY));
        }
    }

    #[test]
    fn property_timeout_and_wake_are_exclusive() {
        let mut rng = SimpleRng::new(7);
        let rig = TestRig::new(1);
        for i in 0..100 {
            let t = rig.oob_thread(&alloc::format!("x{i}"), SchedParam::fifo(30));
            let timeout = rng.gen_range(1, 20);
            let wake_at = rng.gen_range(0, 25);
            rig.kernel.lock_thread(&t).sleep_on(
                Timeout::Relative(Duration::from_millis(timeout)),
                rig.kernel.clock(),
                None,
            );

            rig.advance(Duration::from_millis(wake_at));
            let timed_out = !t.state().contains(StateFlags::DELAY);
            rig.kernel.wakeup(&t, StateFlags::DELAY, InfoFlags::empty());
            rig.advance(Duration::from_millis(30));

            assert_eq!(timed_out, wake_at >= timeout);
            assert_eq!(t.info().contains(InfoFlags::TIMEO), timed_out);
            assert!(t.state().contains(StateFlags::READY));
            assert!(!t.rtimer.is_running());
            rig.kernel.detach_self(&t);
        }
    }

    #[test]
    fn property_priority_round_trip() {
        let mut rng = SimpleRng::new(0xdead_beef);
        let rig = TestRig::new(1);
        let t = rig.oob_thread("p", SchedParam::fifo(1));
        let owners: Vec<ThreadRef> = (0..3)
            .map(|i| rig.started_thread(&alloc::format!("o{i}"), SchedParam::fifo(1)))
            .collect();

        for _ in 0..300 {
            let base = rng.gen_range(1, 100) as i32;
            rig.kernel.set_schedparam(&t, SchedParam::fifo(base)).unwrap();
            let mut boosts = Vec::new();
            for owner in &owners {
                if rng.gen_bool() {
                    let prio = rng.gen_range(1, 100) as i32;
                    rig.kernel.boost(&t, owner.id(), prio);
                    boosts.push(prio);
                }
            }
            let snap = rig.kernel.get_state(&t);
            assert_eq!(snap.param, SchedParam::fifo(base));
            let expected = boosts.iter().copied().fold(base, i32::max);
            assert_eq!(snap.cprio, expected);

            for owner in &owners {
                rig.kernel.unboost(&t, owner.id());
            }
            assert_eq!(rig.kernel.get_state(&t).cprio, base);
        }
    }

    #[test]
    fn property_wait_queue_stays_sorted_without_duplicates() {
        let mut rng = SimpleRng::new(99);
        let rig = TestRig::new(1);
        let wq = WaitQueue::new("sorted", rig.kernel.clock().clone());
        let threads: Vec<ThreadRef> = (0..6)
            .map(|i| rig.oob_thread(&alloc::format!("q{i}"), SchedParam::fifo(10)))
            .collect();
        let waiters: Vec<_> = threads
            .iter()
            .map(|t| {
                let (kernel, queue, t) = (rig.kernel.clone(), wq.clone(), t.clone());
                std::thread::spawn(move || queue.wait(&kernel, &t, Timeout::Infinite))
            })
            .collect();
        rig.wait_for(|| wq.len() == threads.len());

        for _ in 0..200 {
            let t = &threads[rng.gen_range(0, threads.len() as u64) as usize];
            let prio = rng.gen_range(1, 100) as i32;
            rig.kernel.set_schedparam(t, SchedParam::fifo(prio)).unwrap();

            let order = wq.waiters();
            assert_eq!(order.len(), threads.len());
            assert!(order.windows(2).all(|w| w[0].wprio() >= w[1].wprio()));
            for (i, a) in order.iter().enumerate() {
                assert!(order[i + 1..].iter().all(|b| a.id() != b.id()));
            }
        }

        assert_eq!(wq.wake_all(&rig.kernel), threads.len());
        for w in waiters {
            assert_eq!(w.join().unwrap(), Ok(()));
        }
    }
}
