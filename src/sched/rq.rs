//! Per-CPU run queues and the thread/run-queue lock pair.
//!
//! Every state transition runs under a [`LockedThread`]: hard interrupts
//! off, then the thread lock, then the lock of the run queue the thread
//! currently belongs to. The token can only be obtained through
//! [`Kernel::lock_thread`], which takes the locks in that order, and moving
//! a thread to another run queue consumes it and hands back a token for the
//! destination. Run queues are locked together in CPU index order.

use super::trait_def::SchedPolicy;
use super::CpuId;
use crate::band::BandBridge;
use crate::kernel::Kernel;
use crate::sched::CpuSet;
use crate::thread::state::{self, StateFlags};
use crate::thread::{InfoFlags, ThreadCore, ThreadRef};
use crate::time::{Instant, Timer, TimerTarget};
use crate::wait::WaitChannel;
use portable_atomic::{AtomicU64, Ordering};

extern crate alloc;
use alloc::sync::Arc;

/// Scheduler-visible state of one CPU.
pub(crate) struct RqState<S: SchedPolicy> {
    pub(crate) queue: S::Queue,
    /// Thread picked by the last scheduling pass
    pub(crate) curr: ThreadRef,
    pub(crate) resched: bool,
    pub(crate) switched_at: Instant,
}

/// Run queue counters.
#[derive(Debug, Default)]
pub struct RunQueueStats {
    switches: AtomicU64,
    rr_rotations: AtomicU64,
}

impl RunQueueStats {
    /// Context switches performed by this run queue.
    pub fn switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Round-robin quantum expiries which rotated the running thread.
    pub fn rr_rotations(&self) -> u64 {
        self.rr_rotations.load(Ordering::Relaxed)
    }
}

/// Run queue of one CPU.
pub struct RunQueue<S: SchedPolicy> {
    cpu: CpuId,
    pub(crate) inner: spin::Mutex<RqState<S>>,
    /// Round-robin quantum timer, armed while an `RRB` thread runs
    pub(crate) rr_timer: Timer,
    root: ThreadRef,
    stats: RunQueueStats,
}

impl<S: SchedPolicy> RunQueue<S> {
    /// Build the run queue of `cpu` with `root` queued as its idle thread.
    pub(crate) fn new(cpu: CpuId, policy: &S, root: ThreadRef, now: Instant) -> Self {
        let mut queue = policy.new_queue(cpu);
        policy.enqueue(&mut queue, root.clone());
        Self {
            cpu,
            inner: spin::Mutex::new(RqState {
                queue,
                curr: root.clone(),
                resched: false,
                switched_at: now,
            }),
            rr_timer: Timer::new(TimerTarget::RunQueue(cpu)),
            root,
            stats: RunQueueStats::default(),
        }
    }

    /// CPU served.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Root thread standing for the host kernel on this CPU.
    pub fn root(&self) -> &ThreadRef {
        &self.root
    }

    /// Thread picked by the last scheduling pass.
    pub fn current(&self) -> ThreadRef {
        self.inner.lock().curr.clone()
    }

    /// Whether a scheduling pass is due.
    pub fn resched_pending(&self) -> bool {
        self.inner.lock().resched
    }

    /// Counters.
    pub fn stats(&self) -> &RunQueueStats {
        &self.stats
    }

    pub(crate) fn count_switch(&self) {
        self.stats.switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Handle the expiry of the round-robin timer.
    ///
    /// Rotates the running thread to the tail of its priority group when its
    /// budget is still active. Returns whether a scheduling pass is due.
    pub(crate) fn rr_expired(&self, policy: &S, seq: u64, now: Instant) -> bool {
        let mut rq = self.inner.lock();
        if self.rr_timer.expire(seq, now).is_none() {
            return rq.resched;
        }
        let curr = rq.curr.clone();
        let state = curr.state();
        if state.contains(StateFlags::RRB | StateFlags::READY) {
            policy.rotate(&mut rq.queue, &curr);
            rq.resched = true;
            self.stats.rr_rotations.fetch_add(1, Ordering::Relaxed);
            log::trace!("cpu{}: round-robin rotation of {}", self.cpu, curr.name());
        }
        rq.resched
    }
}

/// Hard interrupts disabled through the bridge for the guard's lifetime.
pub(crate) struct IrqGuard<'a> {
    bridge: &'a dyn BandBridge,
    flags: usize,
}

impl<'a> IrqGuard<'a> {
    pub(crate) fn new(bridge: &'a dyn BandBridge) -> Self {
        let flags = bridge.hard_irq_save();
        Self { bridge, flags }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.bridge.hard_irq_restore(self.flags);
    }
}

/// A thread locked together with its run queue.
///
/// Fields drop in declaration order, releasing the run queue before the
/// thread and re-enabling interrupts last.
pub struct LockedThread<'a, S: SchedPolicy> {
    pub(crate) kernel: &'a Kernel<S>,
    pub(crate) thread: &'a ThreadRef,
    pub(crate) rq: &'a RunQueue<S>,
    pub(crate) rq_state: spin::MutexGuard<'a, RqState<S>>,
    pub(crate) core: spin::MutexGuard<'a, ThreadCore>,
    pub(crate) irq: IrqGuard<'a>,
}

impl<S: SchedPolicy> Kernel<S> {
    /// Lock `thread` and the run queue it belongs to.
    pub fn lock_thread<'a>(&'a self, thread: &'a ThreadRef) -> LockedThread<'a, S> {
        let irq = IrqGuard::new(&*self.bridge);
        let core = thread.core.lock();
        let rq = self.rq(core.cpu);
        let rq_state = rq.inner.lock();
        LockedThread {
            kernel: self,
            thread,
            rq,
            rq_state,
            core,
            irq,
        }
    }
}

type RqGuard<'a, S> = spin::MutexGuard<'a, RqState<S>>;

/// Lock two distinct run queues in CPU index order.
fn lock_pair<'a, S: SchedPolicy>(
    a: &'a RunQueue<S>,
    b: &'a RunQueue<S>,
) -> (RqGuard<'a, S>, RqGuard<'a, S>) {
    if a.cpu < b.cpu {
        let ga = a.inner.lock();
        let gb = b.inner.lock();
        (ga, gb)
    } else {
        let gb = b.inner.lock();
        let ga = a.inner.lock();
        (ga, gb)
    }
}

impl<'a, S: SchedPolicy> LockedThread<'a, S> {
    /// The locked thread.
    pub fn thread(&self) -> &ThreadRef {
        self.thread
    }

    /// Current state word.
    pub fn state(&self) -> StateFlags {
        self.thread.state()
    }

    /// Reasons attached to the last wakeup.
    pub fn info(&self) -> InfoFlags {
        self.thread.info()
    }

    /// CPU of the run queue held.
    pub fn cpu(&self) -> CpuId {
        self.core.cpu
    }

    /// CPUs the thread may run on.
    pub fn affinity(&self) -> CpuSet {
        self.core.affinity
    }

    /// Wait channel the thread pends on.
    pub fn wchan(&self) -> Option<&Arc<dyn WaitChannel>> {
        self.core.wchan.as_ref()
    }

    /// Whether the thread is queued on the held run queue.
    pub fn is_queued(&self) -> bool {
        self.kernel.policy.contains(&self.rq_state.queue, self.thread)
    }

    /// Put the thread on the run queue and mark it `READY`.
    pub(crate) fn enqueue(&mut self, head: bool) {
        let kernel = self.kernel;
        let thread = Arc::clone(self.thread);
        if head {
            kernel.policy.requeue(&mut self.rq_state.queue, thread);
        } else {
            kernel.policy.enqueue(&mut self.rq_state.queue, thread);
        }
        self.thread.insert_state(StateFlags::READY);
        self.rq_state.resched = true;
    }

    /// Take the thread off the run queue if it is `READY`.
    pub(crate) fn dequeue(&mut self) {
        if !self.thread.state().contains(StateFlags::READY) {
            return;
        }
        let kernel = self.kernel;
        kernel.policy.dequeue(&mut self.rq_state.queue, self.thread);
        self.thread.remove_state(StateFlags::READY);
        self.rq_state.resched = true;
    }

    /// Move the thread to the run queue of `dest`.
    ///
    /// Both run queues are held while the binding changes; armed timers
    /// follow the thread to the timer base of `dest`.
    pub(crate) fn migrate(self, dest: CpuId) -> Self {
        let LockedThread {
            kernel,
            thread,
            rq,
            mut rq_state,
            mut core,
            irq,
        } = self;
        if dest == rq.cpu {
            return LockedThread {
                kernel,
                thread,
                rq,
                rq_state,
                core,
                irq,
            };
        }
        let was_ready = thread.state().contains(StateFlags::READY);
        if was_ready {
            kernel.policy.dequeue(&mut rq_state.queue, thread);
        }
        rq_state.resched = true;
        drop(rq_state);

        let dst = kernel.rq(dest);
        let (src_state, mut dst_state) = lock_pair(rq, dst);
        core.cpu = dest;
        thread.set_cpu(dest);
        thread.rtimer.migrate(dest);
        thread.ptimer.migrate(dest);
        if was_ready {
            kernel.policy.enqueue(&mut dst_state.queue, Arc::clone(thread));
            dst_state.resched = true;
        }
        drop(src_state);
        log::debug!("thread {} migrated cpu{} -> cpu{}", thread.name(), rq.cpu, dest);

        LockedThread {
            kernel,
            thread,
            rq: dst,
            rq_state: dst_state,
            core,
            irq,
        }
    }

    /// Verify the state word against queue membership (debug builds).
    pub(crate) fn check(&self) {
        if cfg!(debug_assertions) {
            state::debug_check(
                self.thread.name(),
                self.thread.state(),
                self.is_queued(),
                self.core.wchan.is_some(),
            );
        }
    }
}
