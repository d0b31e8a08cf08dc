//! Test rig: a kernel over a hand-driven clock and a recording bridge.

use crate::band::BandBridge;
use crate::config::KernelConfig;
use crate::errors::{BandError, SpawnError};
use crate::kernel::Kernel;
use crate::sched::{CpuId, PriorityPolicy, SchedParam};
use crate::signal::{HmCause, SigInfo};
use crate::thread::{Thread, ThreadBuilder, ThreadId, ThreadRef};
use crate::time::{Duration, Instant, ManualClock};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Host stand-in which parks real OS threads and records every callback.
#[derive(Default)]
pub struct MockBridge {
    current_cpu: AtomicUsize,
    parked: Mutex<HashMap<ThreadId, std::thread::Thread>>,
    switch_pending: Mutex<HashSet<ThreadId>>,
    signals_pending: Mutex<HashSet<ThreadId>>,
    delivered: Mutex<HashMap<ThreadId, usize>>,
    interrupts: Mutex<HashMap<ThreadId, usize>>,
    fail_switches: AtomicBool,
    fail_spawns: AtomicBool,
    deny_caps: AtomicBool,
    inband_work: AtomicUsize,
    observable: AtomicUsize,
    retired: AtomicUsize,
    caps_dropped: AtomicUsize,
}

impl MockBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_current_cpu(&self, cpu: CpuId) {
        self.current_cpu.store(cpu, Ordering::Relaxed);
    }

    pub fn set_switch_pending(&self, thread: &Thread, pending: bool) {
        let mut set = self.switch_pending.lock().unwrap();
        if pending {
            set.insert(thread.id());
        } else {
            set.remove(&thread.id());
        }
    }

    pub fn fail_switches(&self, fail: bool) {
        self.fail_switches.store(fail, Ordering::Relaxed);
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::Relaxed);
    }

    pub fn deny_caps(&self, deny: bool) {
        self.deny_caps.store(deny, Ordering::Relaxed);
    }

    pub fn raise_signal(&self, thread: &Thread) {
        self.signals_pending.lock().unwrap().insert(thread.id());
    }

    pub fn clear_signal(&self, thread: &Thread) {
        self.signals_pending.lock().unwrap().remove(&thread.id());
    }

    pub fn delivered_signals(&self, thread: &Thread) -> usize {
        self.delivered.lock().unwrap().get(&thread.id()).copied().unwrap_or(0)
    }

    pub fn interrupts(&self, thread: &Thread) -> usize {
        self.interrupts.lock().unwrap().get(&thread.id()).copied().unwrap_or(0)
    }

    pub fn inband_work_requests(&self) -> usize {
        self.inband_work.load(Ordering::Relaxed)
    }

    pub fn observable_reports(&self) -> usize {
        self.observable.load(Ordering::Relaxed)
    }

    pub fn retired(&self) -> usize {
        self.retired.load(Ordering::Relaxed)
    }

    pub fn caps_dropped(&self) -> usize {
        self.caps_dropped.load(Ordering::Relaxed)
    }
}

impl BandBridge for MockBridge {
    fn current_cpu(&self) -> CpuId {
        self.current_cpu.load(Ordering::Relaxed)
    }

    fn switch_oob(&self, _thread: &ThreadRef) -> Result<(), BandError> {
        if self.fail_switches.load(Ordering::Relaxed) {
            Err(BandError::SwitchFailed)
        } else {
            Ok(())
        }
    }

    fn switch_inband(&self, _thread: &ThreadRef) {}

    fn switch_pending(&self, thread: &Thread) -> bool {
        self.switch_pending.lock().unwrap().contains(&thread.id())
    }

    fn signal_pending(&self, thread: &Thread) -> bool {
        self.signals_pending.lock().unwrap().contains(&thread.id())
    }

    fn interrupt(&self, thread: &ThreadRef) {
        *self.interrupts.lock().unwrap().entry(thread.id()).or_default() += 1;
    }

    fn deliver_signal(&self, thread: &ThreadRef, _info: &SigInfo) {
        *self.delivered.lock().unwrap().entry(thread.id()).or_default() += 1;
    }

    fn notify_observable(&self, _thread: &ThreadRef, _cause: HmCause) {
        self.observable.fetch_add(1, Ordering::Relaxed);
    }

    fn schedule_inband_work(&self) {
        self.inband_work.fetch_add(1, Ordering::Relaxed);
    }

    fn suspend(&self, thread: &ThreadRef) {
        self.parked
            .lock()
            .unwrap()
            .insert(thread.id(), std::thread::current());
        // A resume racing with the registration above is caught by the
        // caller re-checking the state word.
        std::thread::park_timeout(std::time::Duration::from_millis(1));
    }

    fn resume(&self, thread: &ThreadRef) {
        if let Some(task) = self.parked.lock().unwrap().get(&thread.id()) {
            task.unpark();
        }
    }

    fn relax(&self) {
        std::thread::sleep(std::time::Duration::from_micros(50));
    }

    fn spawn_host_task(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> Result<(), SpawnError> {
        if self.fail_spawns.load(Ordering::Relaxed) {
            return Err(SpawnError::HostSpawnFailed);
        }
        std::thread::Builder::new()
            .name(name.into())
            .spawn(body)
            .map(|_| ())
            .map_err(|_| SpawnError::HostSpawnFailed)
    }

    fn raise_caps(&self, _thread: &ThreadRef) -> bool {
        !self.deny_caps.load(Ordering::Relaxed)
    }

    fn drop_caps(&self, _thread: &ThreadRef) {
        self.caps_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn thread_retired(&self, _thread: &ThreadRef) {
        self.retired.fetch_add(1, Ordering::Relaxed);
    }
}

/// A kernel wired to a [`MockBridge`] and a [`ManualClock`] starting at 0.
pub struct TestRig {
    pub kernel: Arc<Kernel<PriorityPolicy>>,
    pub bridge: Arc<MockBridge>,
    pub source: Arc<ManualClock>,
}

impl TestRig {
    pub fn new(nr_cpus: usize) -> Self {
        Self::with_config(KernelConfig::new().with_cpus(nr_cpus))
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let bridge = MockBridge::new();
        let source = Arc::new(ManualClock::new(Instant::from_nanos(0)));
        let kernel = Arc::new(Kernel::new(
            config,
            PriorityPolicy::new(),
            bridge.clone() as Arc<dyn BandBridge>,
            Box::new(source.clone()),
        ));
        Self {
            kernel,
            bridge,
            source,
        }
    }

    /// A thread mapped from the test and switched out-of-band.
    pub fn oob_thread(&self, name: &str, param: SchedParam) -> ThreadRef {
        let thread = self.started_thread(name, param);
        self.kernel
            .switch_oob(&thread)
            .expect("out-of-band switch");
        thread
    }

    /// A started thread still running in-band.
    pub fn started_thread(&self, name: &str, param: SchedParam) -> ThreadRef {
        self.kernel
            .map_current(ThreadBuilder::new().name(name).param(param).build())
            .expect("map thread")
    }

    /// Move the clock forward and run the timer tick of every CPU.
    pub fn advance(&self, delta: Duration) {
        self.source.advance(delta);
        for cpu in 0..self.kernel.nr_cpus() {
            self.kernel.clock_tick(cpu);
        }
    }

    /// Spin until `cond` holds, failing the test after a few seconds.
    pub fn wait_for(&self, cond: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "condition not reached");
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
    }
}
