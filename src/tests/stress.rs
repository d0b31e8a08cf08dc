//! Stress tests for concurrent lifecycle operations.

#[cfg(test)]
mod stress_tests {
    use crate::errors::ThreadResult;
    use crate::sched::{priority, SchedParam};
    use crate::tests::helpers::TestRig;
    use crate::tests::TEST_CONFIG;
    use crate::thread::{StateFlags, ThreadBuilder};
    use crate::time::{Duration, Timeout};
    use crate::wait::WaitQueue;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use portable_atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_concurrent_cancel_and_join_retire_once() {
        let config = TEST_CONFIG.lock();
        let contenders = config.stress_thread_count;
        drop(config);

        let rig = TestRig::new(2);
        let handle = ThreadBuilder::new()
            .name("victim")
            .spawn(&rig.kernel, |ctx| loop {
                ctx.delay(Duration::from_millis(1))?;
            })
            .expect("spawn");
        rig.wait_for(|| handle.thread().state().contains(StateFlags::DELAY));

        let mut workers: Vec<std::thread::JoinHandle<ThreadResult<()>>> =
            Vec::with_capacity(contenders * 2);
        for _ in 0..contenders {
            let canceller = handle.clone();
            workers.push(std::thread::spawn(move || {
                canceller.cancel();
                Ok(())
            }));
            let joiner = handle.clone();
            workers.push(std::thread::spawn(move || joiner.join()));
        }
        for worker in workers {
            worker.join().unwrap().unwrap();
        }

        assert!(handle.is_finished());
        assert!(handle.thread().is_zombie());
        assert_eq!(rig.bridge.retired(), 1);
        assert_eq!(rig.kernel.thread_count(), 0);
    }

    #[test]
    fn test_spawn_cancel_join_churn() {
        let config = TEST_CONFIG.lock();
        let thread_count = config.stress_thread_count;
        drop(config);

        let rig = TestRig::new(4);
        let started = Arc::new(AtomicUsize::new(0));
        for round in 0..4 {
            let handles: Vec<_> = (0..thread_count)
                .map(|i| {
                    let started = started.clone();
                    ThreadBuilder::new()
                        .name(alloc::format!("churn_{round}_{i}"))
                        .param(SchedParam::fifo(priority::MIN + (i % 90) as i32))
                        .cpu(i % 4)
                        .spawn(&rig.kernel, move |ctx| {
                            started.fetch_add(1, Ordering::SeqCst);
                            ctx.suspend()
                        })
                        .expect("spawn")
                })
                .collect();
            for handle in &handles {
                handle.cancel();
            }
            for handle in &handles {
                handle.join().unwrap();
                assert!(handle.thread().is_zombie());
            }
            assert_eq!(rig.kernel.thread_count(), 0);
        }
        assert!(started.load(Ordering::SeqCst) <= thread_count * 4);
        assert_eq!(rig.bridge.retired(), thread_count * 4);
    }

    #[test]
    fn test_wait_queue_handoff_under_contention() {
        let config = TEST_CONFIG.lock();
        let (waiters, iterations) = (config.stress_thread_count / 2, config.stress_iterations);
        drop(config);

        let rig = TestRig::new(2);
        let wq = WaitQueue::new("handoff", rig.kernel.clock().clone());
        let woken = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..waiters)
            .map(|i| {
                let (queue, woken) = (wq.clone(), woken.clone());
                ThreadBuilder::new()
                    .name(alloc::format!("waiter_{i}"))
                    .cpu(i % 2)
                    .spawn(&rig.kernel, move |ctx| loop {
                        ctx.wait_on(&queue, Timeout::Infinite)?;
                        woken.fetch_add(1, Ordering::SeqCst);
                    })
                    .expect("spawn")
            })
            .collect();

        let mut delivered = 0;
        while delivered < iterations {
            if wq.wake_one(&rig.kernel).is_some() {
                delivered += 1;
            } else {
                std::thread::yield_now();
            }
        }
        rig.wait_for(|| woken.load(Ordering::SeqCst) == iterations);

        for handle in &handles {
            handle.cancel();
        }
        for handle in &handles {
            handle.join().unwrap();
        }
        assert!(wq.is_empty());
        assert_eq!(rig.bridge.retired(), waiters);
    }
}
