//! Kernel facade tying run queues, clock, registry and bridge together.
//!
//! The kernel never switches contexts by itself. Transitions mark state
//! under the lock pair; the caller then either parks through
//! [`Kernel::block`] (the calling thread) or runs [`Kernel::schedule`]
//! (the CPU's dispatcher) to pick what runs next.

use crate::band::BandBridge;
use crate::config::KernelConfig;
use crate::errors::{
    InvalidOperationError, ScheduleError, SpawnError, ThreadError, ThreadResult, TimerError,
    WaitError,
};
use crate::registry::Registry;
use crate::sched::{CpuId, CpuSet, DefaultPolicy, RunQueue, SchedClass, SchedParam, SchedPolicy};
use crate::signal::SignalQueue;
use crate::thread::builder::MAX_NAME_LEN;
use crate::thread::{
    InfoFlags, KthreadContext, StateFlags, Thread, ThreadAttrs, ThreadHandle, ThreadId,
    ThreadInit, ThreadRef, ThreadSnapshot,
};
use crate::time::{Clock, ClockSource, Duration, Instant, Timeout, TimerKind, TimerTarget};
use portable_atomic::{AtomicU64, Ordering};

extern crate alloc;
use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// The real-time thread core.
pub struct Kernel<S: SchedPolicy = DefaultPolicy> {
    pub(crate) policy: S,
    pub(crate) config: KernelConfig,
    pub(crate) bridge: Arc<dyn BandBridge>,
    pub(crate) clock: Arc<Clock>,
    rqs: Box<[RunQueue<S>]>,
    pub(crate) registry: Registry,
    pub(crate) signals: SignalQueue,
    next_thread_id: AtomicU64,
}

impl<S: SchedPolicy> Kernel<S> {
    /// Build a kernel with one run queue and root thread per CPU.
    pub fn new(
        config: KernelConfig,
        policy: S,
        bridge: Arc<dyn BandBridge>,
        source: Box<dyn ClockSource>,
    ) -> Self {
        let nr_cpus = config.nr_cpus.clamp(1, CpuSet::MAX_CPUS);
        let clock = Arc::new(Clock::new(config.clock_name.clone(), source, nr_cpus));
        let next_thread_id = AtomicU64::new(1);
        let now = clock.now();

        let rqs: Vec<RunQueue<S>> = (0..nr_cpus)
            .map(|cpu| {
                let root = Thread::new(ThreadInit {
                    id: Self::alloc_id(&next_thread_id),
                    name: format!("ROOT/{cpu}"),
                    state: StateFlags::ROOT | StateFlags::READY,
                    param: SchedParam::idle(),
                    wprio: policy.weighted_prio(SchedClass::Idle, 0),
                    cpu,
                    affinity: CpuSet::single(cpu),
                    rrperiod: None,
                    process: None,
                });
                RunQueue::new(cpu, &policy, root, now)
            })
            .collect();

        log::debug!(
            "kernel up: {nr_cpus} cpu(s), {} thread slots, clock {}",
            config.max_threads,
            clock.name()
        );
        Self {
            registry: Registry::new(config.max_threads),
            signals: SignalQueue::new(config.signal_queue_depth),
            policy,
            config,
            bridge,
            clock,
            rqs: rqs.into_boxed_slice(),
            next_thread_id,
        }
    }

    fn alloc_id(counter: &AtomicU64) -> ThreadId {
        loop {
            if let Some(id) = ThreadId::new(counter.fetch_add(1, Ordering::Relaxed)) {
                return id;
            }
        }
    }

    /// Scheduling policy shared by every run queue.
    pub fn policy(&self) -> &S {
        &self.policy
    }

    /// Configuration the kernel was built with.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Clock every thread timer is armed against.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Host bridge.
    pub fn bridge(&self) -> &Arc<dyn BandBridge> {
        &self.bridge
    }

    /// Run queue of `cpu`.
    pub fn rq(&self, cpu: CpuId) -> &RunQueue<S> {
        &self.rqs[cpu % self.rqs.len()]
    }

    /// Number of CPUs with a run queue.
    pub fn nr_cpus(&self) -> usize {
        self.rqs.len()
    }

    /// Highest ranked runnable thread of `cpu`, the root thread if none.
    pub fn pick(&self, cpu: CpuId) -> ThreadRef {
        let rq = self.rq(cpu);
        let picked = self.policy.pick(&rq.inner.lock().queue);
        picked.unwrap_or_else(|| rq.root().clone())
    }

    /// Thread running on `cpu` since the last scheduling pass.
    pub fn current(&self, cpu: CpuId) -> ThreadRef {
        self.rq(cpu).current()
    }

    /// Registered threads.
    pub fn threads(&self) -> Vec<ThreadRef> {
        self.registry.snapshot()
    }

    /// Number of registered threads, root threads excluded.
    pub fn thread_count(&self) -> usize {
        self.registry.len()
    }

    /// Look a registered thread up by id.
    pub fn find(&self, id: ThreadId) -> Option<ThreadRef> {
        self.registry.find(id)
    }

    /// Build a thread control block from `attrs`, dormant and in-band.
    ///
    /// Nothing is left registered when this fails.
    ///
    /// # Errors
    ///
    /// `SpawnError` for a bad name, CPU, affinity, a full registry or
    /// denied capabilities; `ScheduleError::InvalidParam` for bad
    /// scheduling parameters.
    pub fn init_thread(&self, attrs: ThreadAttrs) -> ThreadResult<ThreadRef> {
        if attrs.name.is_empty() || attrs.name.len() > MAX_NAME_LEN {
            return Err(SpawnError::InvalidName.into());
        }
        self.policy.check_param(&attrs.param)?;
        let param = self.config.normalize_param(attrs.param);

        let affinity = attrs.affinity.online(self.nr_cpus());
        let cpu = match attrs.cpu {
            Some(cpu) if affinity.contains(cpu) => cpu,
            Some(cpu) => return Err(SpawnError::InvalidCpu(cpu).into()),
            None => affinity
                .first()
                .ok_or(SpawnError::InvalidAffinity(attrs.affinity.bits()))?,
        };

        let rrperiod = match param.class {
            SchedClass::RoundRobin => param.quantum,
            _ => None,
        };
        let mut state = StateFlags::DORMANT | StateFlags::INBAND;
        if attrs.user {
            state |= StateFlags::USER;
        }
        if rrperiod.is_some() {
            state |= StateFlags::RRB;
        }

        let thread = Thread::new(ThreadInit {
            id: Self::alloc_id(&self.next_thread_id),
            name: attrs.name,
            state,
            param,
            wprio: self.policy.weighted_prio(param.class, param.prio),
            cpu,
            affinity,
            rrperiod,
            process: attrs.process,
        });

        self.registry.insert(&thread)?;
        if attrs.user {
            if !self.bridge.raise_caps(&thread) {
                self.registry.remove(&thread);
                return Err(SpawnError::CapsDenied.into());
            }
            thread.core.lock().raised_cap = true;
        }

        log::debug!("created {} ({}) on cpu{cpu}", thread.name(), thread.id());
        Ok(thread)
    }

    /// Release a dormant thread.
    ///
    /// # Errors
    ///
    /// `InvalidOperationError::WrongState` if the thread already started.
    pub fn start(&self, thread: &ThreadRef) -> ThreadResult<()> {
        let mut lt = self.lock_thread(thread);
        let state = thread.state();
        if state.contains(StateFlags::ZOMBIE) {
            return Err(InvalidOperationError::Zombie.into());
        }
        if !state.contains(StateFlags::DORMANT) {
            return Err(InvalidOperationError::WrongState.into());
        }
        lt.release(StateFlags::DORMANT, InfoFlags::empty());
        log::debug!("started {}", thread.name());
        Ok(())
    }

    /// Adopt the calling host task as a real-time thread.
    ///
    /// The thread comes back started and in-band; the caller switches it
    /// out-of-band when it wants real-time service.
    pub fn map_current(&self, attrs: ThreadAttrs) -> ThreadResult<ThreadRef> {
        let thread = self.init_thread(attrs)?;
        self.start(&thread)?;
        Ok(thread)
    }

    /// Create a kernel thread running `body` on a fresh host task.
    ///
    /// The thread stays dormant until [`Kernel::start`]. A thread cancelled
    /// before it starts never runs its body.
    pub fn create_kthread<F>(self: &Arc<Self>, attrs: ThreadAttrs, body: F) -> ThreadResult<ThreadRef>
    where
        F: FnOnce(&KthreadContext<S>) -> ThreadResult<()> + Send + 'static,
    {
        let thread = self.init_thread(attrs)?;
        let kernel = Arc::clone(self);
        let this = thread.clone();
        let spawned = self.bridge.spawn_host_task(
            thread.name(),
            Box::new(move || kernel.kthread_main(this, body)),
        );
        if let Err(err) = spawned {
            self.retire(&thread);
            return Err(err.into());
        }
        Ok(thread)
    }

    /// Create and start a kernel thread.
    pub fn run_kthread<F>(self: &Arc<Self>, attrs: ThreadAttrs, body: F) -> ThreadResult<ThreadHandle<S>>
    where
        F: FnOnce(&KthreadContext<S>) -> ThreadResult<()> + Send + 'static,
    {
        let thread = self.create_kthread(attrs, body)?;
        self.start(&thread)?;
        Ok(ThreadHandle::new(Arc::clone(self), thread))
    }

    fn kthread_main<F>(self: Arc<Self>, thread: ThreadRef, body: F)
    where
        F: FnOnce(&KthreadContext<S>) -> ThreadResult<()>,
    {
        while thread.state().contains(StateFlags::DORMANT) {
            self.bridge.suspend(&thread);
        }
        if self.test_cancel(&thread).is_err() {
            return;
        }
        if let Err(err) = self.switch_oob(&thread) {
            log::warn!("{}: cannot go out-of-band: {err}", thread.name());
            self.detach_self(&thread);
            return;
        }
        if self.test_cancel(&thread).is_err() {
            return;
        }
        let ctx = KthreadContext::new(Arc::clone(&self), thread.clone());
        match body(&ctx) {
            Ok(()) | Err(ThreadError::Cancelled) => {}
            Err(err) => log::debug!("{} exited with {err}", thread.name()),
        }
        self.detach_self(&thread);
    }

    /// Park the calling thread `thread` until no blocking bit remains.
    ///
    /// Returns the reasons of the wakeup. `KICKED` is consumed here, so a
    /// kick breaks one wait only, unless the thread is being cancelled.
    /// A thread resuming on a CPU its affinity no longer allows moves to
    /// the first allowed one before returning.
    pub fn block(&self, thread: &ThreadRef) -> InfoFlags {
        loop {
            let state = thread.state();
            if !state.is_blocked() || state.intersects(StateFlags::ZOMBIE | StateFlags::INBAND) {
                break;
            }
            self.bridge.suspend(thread);
        }
        let mut lt = self.lock_thread(thread);
        let state = thread.state();
        if !state.is_blocked() && !state.intersects(StateFlags::ZOMBIE | StateFlags::ROOT) {
            let affinity = lt.affinity();
            if !affinity.contains(lt.cpu()) {
                if let Some(dest) = affinity.online(self.nr_cpus()).first() {
                    lt = lt.migrate(dest);
                    lt.check();
                }
            }
        }
        let info = thread.info();
        if !info.contains(InfoFlags::CANCELD) {
            thread.remove_info(InfoFlags::KICKED);
        }
        info
    }

    /// Sleep the calling thread `thread` for `timeout`.
    ///
    /// Returns `None` once the delay elapsed, or the time left when the
    /// sleep was broken (zero for an infinite delay).
    pub fn delay(&self, thread: &ThreadRef, timeout: Timeout) -> Option<Duration> {
        let deadline = timeout.deadline(self.clock.now());
        self.lock_thread(thread).sleep_on(timeout, &self.clock, None);
        let info = self.block(thread);
        if !info.contains(InfoFlags::BREAK) {
            return None;
        }
        Some(deadline.map_or(Duration::ZERO, |date| {
            date.saturating_duration_since(self.clock.now())
        }))
    }

    /// Make `thread` periodic with its first release one `period` after
    /// `idate` (now when `None`). A zero period stops the periodic timer.
    ///
    /// # Errors
    ///
    /// `TimerError::PeriodTooShort` below the clock resolution.
    pub fn set_period(&self, thread: &ThreadRef, idate: Option<Instant>, period: Duration) -> ThreadResult<()> {
        if thread.is_zombie() {
            return Err(InvalidOperationError::Zombie.into());
        }
        if period.is_zero() {
            thread.ptimer.stop();
            return Ok(());
        }
        if period < self.clock.resolution() {
            return Err(TimerError::PeriodTooShort.into());
        }
        let lt = self.lock_thread(thread);
        let idate = idate.unwrap_or_else(|| self.clock.now());
        thread.ptimer.start_periodic(&self.clock, lt.cpu(), idate, period);
        log::debug!("{} period {period:?} from {idate:?}", thread.name());
        Ok(())
    }

    /// Wait for the next release of the calling periodic thread.
    ///
    /// # Errors
    ///
    /// `NotPeriodic` without a period, `Interrupted` when the wait was
    /// broken, `Overrun(n)` when `n` releases were missed.
    pub fn wait_period(&self, thread: &ThreadRef) -> Result<(), WaitError> {
        loop {
            let Some(expected) = thread.ptimer.pexpect() else {
                return Err(WaitError::NotPeriodic);
            };
            {
                let mut lt = self.lock_thread(thread);
                if self.clock.now() >= expected {
                    break;
                }
                lt.sleep_on(Timeout::Infinite, &self.clock, None);
            }
            let info = self.block(thread);
            if info.contains(InfoFlags::BREAK) {
                return Err(WaitError::Interrupted);
            }
        }
        match thread.ptimer.take_overruns(self.clock.now()) {
            0 => Ok(()),
            missed => Err(WaitError::Overrun(missed)),
        }
    }

    /// Put `thread` on hold.
    pub fn hold(&self, thread: &ThreadRef, mask: StateFlags) -> Result<(), WaitError> {
        self.lock_thread(thread).hold(mask)
    }

    pub fn release(&self, thread: &ThreadRef, mask: StateFlags, info: InfoFlags) {
        self.lock_thread(thread).release(mask, info);
    }

    pub fn wakeup(&self, thread: &ThreadRef, mask: StateFlags, info: InfoFlags) {
        self.lock_thread(thread).wakeup(mask, info);
    }

    pub fn kick(&self, thread: &ThreadRef, info: InfoFlags) {
        self.lock_thread(thread).kick(info);
    }

    /// Break any wait of `thread`. Returns whether it was waiting.
    pub fn unblock(&self, thread: &ThreadRef) -> bool {
        self.lock_thread(thread).unblock()
    }

    pub fn demote(&self, thread: &ThreadRef) {
        self.lock_thread(thread).demote();
    }

    /// Change the scheduling parameters of `thread`, then let its wait
    /// channel reorder it.
    pub fn set_schedparam(&self, thread: &ThreadRef, param: SchedParam) -> ThreadResult<()> {
        let wchan = {
            let mut lt = self.lock_thread(thread);
            lt.set_schedparam(param)?;
            lt.wchan().cloned()
        };
        if let Some(wchan) = wchan {
            wchan.reorder_wait(thread);
        }
        Ok(())
    }

    /// Boost `thread` to at least `prio` on behalf of `owner`.
    pub fn boost(&self, thread: &ThreadRef, owner: ThreadId, prio: i32) {
        let wchan = {
            let mut lt = self.lock_thread(thread);
            lt.boost(owner, prio);
            lt.wchan().cloned()
        };
        if let Some(wchan) = wchan {
            wchan.reorder_wait(thread);
        }
    }

    /// Drop the boost `owner` granted to `thread`.
    pub fn unboost(&self, thread: &ThreadRef, owner: ThreadId) -> bool {
        let (dropped, wchan) = {
            let mut lt = self.lock_thread(thread);
            let dropped = lt.unboost(owner);
            (dropped, lt.wchan().cloned())
        };
        if let (true, Some(wchan)) = (dropped, wchan) {
            wchan.reorder_wait(thread);
        }
        dropped
    }

    pub fn get_state(&self, thread: &ThreadRef) -> ThreadSnapshot {
        let lt = self.lock_thread(thread);
        ThreadSnapshot::capture(thread, &lt.core, self.clock.now())
    }

    /// Restrict `thread` to `cpus`.
    ///
    /// A runnable out-of-band thread moves at once; one blocked out-of-band
    /// on a CPU it may no longer use is kicked so it moves on its way out.
    ///
    /// # Errors
    ///
    /// `ScheduleError::InvalidAffinity` when `cpus` names no online CPU.
    pub fn set_affinity(&self, thread: &ThreadRef, cpus: CpuSet) -> ThreadResult<()> {
        let online = cpus.online(self.nr_cpus());
        let Some(first) = online.first() else {
            return Err(ScheduleError::InvalidAffinity(cpus.bits()).into());
        };
        let mut lt = self.lock_thread(thread);
        if thread.is_zombie() {
            return Err(InvalidOperationError::Zombie.into());
        }
        lt.core.affinity = online;
        if online.contains(lt.cpu()) {
            return Ok(());
        }
        let state = thread.state();
        if state.contains(StateFlags::INBAND) {
            return Ok(());
        }
        if state.contains(StateFlags::READY) {
            lt = lt.migrate(first);
            lt.check();
        } else {
            drop(lt);
            self.handle_band_event(thread, crate::band::BandEvent::MigrationRequired)?;
        }
        Ok(())
    }

    /// Change the mode bits of `thread`. Returns the previous mode.
    ///
    /// Dropping both health-monitor channels also clears every trigger.
    ///
    /// # Errors
    ///
    /// `InvalidOperationError::InvalidMode` for bits outside the mode set.
    pub fn set_mode(&self, thread: &ThreadRef, clear: StateFlags, set: StateFlags) -> ThreadResult<StateFlags> {
        if !StateFlags::MODE_MASK.contains(clear | set) {
            return Err(InvalidOperationError::InvalidMode((clear | set).bits()).into());
        }
        let mut lt = self.lock_thread(thread);
        if thread.is_zombie() {
            return Err(InvalidOperationError::Zombie.into());
        }
        let old = thread.state() & StateFlags::MODE_MASK;
        let mut mode = (old - clear) | set;
        if !mode.intersects(StateFlags::HMSIG | StateFlags::HMOBS) {
            mode.remove(StateFlags::TRIGGERS);
        }
        lt.change_flags(mode, StateFlags::MODE_MASK);
        Ok(old)
    }

    /// Count an out-of-band system call issued by `thread`.
    pub fn account_syscall(&self, thread: &Thread) {
        thread.stats().count_syscall();
    }

    /// Pick the thread to run next on `cpu` and account for the switch.
    ///
    /// The round-robin timer runs while the picked thread has a budget.
    pub fn schedule(&self, cpu: CpuId) -> ThreadRef {
        let rq = self.rq(cpu);
        let now = self.clock.now();
        let mut st = rq.inner.lock();
        st.resched = false;
        let next = self
            .policy
            .pick(&st.queue)
            .unwrap_or_else(|| rq.root().clone());
        let prev = st.curr.clone();
        if !prev.is_root() {
            prev.stats().add_runtime(now.saturating_duration_since(st.switched_at));
        }
        st.switched_at = now;

        let switched = !Arc::ptr_eq(&prev, &next);
        if switched {
            if !prev.is_root() && !prev.is_zombie() {
                let preempted = prev.state().contains(StateFlags::READY);
                prev.stats().count_switch(!preempted);
            }
            st.curr = next.clone();
            rq.count_switch();
            log::trace!("cpu{cpu}: {} -> {}", prev.name(), next.name());
        }
        match next.rr_quantum() {
            Some(quantum) if switched || !rq.rr_timer.is_running() => {
                rq.rr_timer.start_oneshot(&self.clock, cpu, now + quantum);
            }
            Some(_) => {}
            None => rq.rr_timer.stop(),
        }
        next
    }

    /// Process the timers of `cpu` due at the current time.
    ///
    /// Returns whether `cpu` needs a scheduling pass.
    pub fn clock_tick(&self, cpu: CpuId) -> bool {
        let now = self.clock.now();
        for event in self.clock.collect_expired(cpu) {
            match &event.target {
                TimerTarget::Thread(weak, kind) => {
                    let Some(thread) = weak.upgrade() else {
                        continue;
                    };
                    let mut lt = self.lock_thread(&thread);
                    match kind {
                        TimerKind::Resource => {
                            if thread.rtimer.expire(event.seq, now).is_some() {
                                lt.wakeup(StateFlags::DELAY | StateFlags::PEND, InfoFlags::TIMEO);
                            }
                        }
                        TimerKind::Periodic => {
                            let fired = thread.ptimer.expire(event.seq, now).is_some();
                            if fired && thread.state().contains(StateFlags::WAIT) {
                                lt.wakeup(StateFlags::WAIT, InfoFlags::TIMEO);
                            }
                        }
                    }
                }
                TimerTarget::RunQueue(owner) => {
                    self.rq(*owner).rr_expired(&self.policy, event.seq, now);
                }
            }
        }
        self.rq(cpu).resched_pending()
    }
}

impl<S: SchedPolicy> core::fmt::Debug for Kernel<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("nr_cpus", &self.nr_cpus())
            .field("threads", &self.registry.len())
            .field("clock", &self.clock)
            .finish()
    }
}
