//! Thread control block.
//!
//! A [`Thread`] carries the state word, the reasons of the last wakeup, its
//! two timers and the scheduling placement. Fields that change together with
//! the run queue live in [`ThreadCore`] behind the thread lock; the state
//! word, weighted priority and CPU are atomics mirrored from it so the run
//! queue side can read them without taking the thread lock.

use crate::process::Process;
use crate::sched::{CpuId, CpuSet, SchedParam};
use crate::time::{Duration, Instant, Timer, TimerKind, TimerTarget};
use crate::wait::WaitChannel;
use portable_atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

extern crate alloc;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

pub mod builder;
pub mod completion;
pub mod handle;
pub mod state;

pub use builder::{ThreadAttrs, ThreadBuilder};
pub use completion::Completion;
pub use handle::{KthreadContext, ThreadHandle};
pub use state::{InfoFlags, StateFlags};

/// Shared reference to a thread control block.
pub type ThreadRef = Arc<Thread>;

const NO_SLOT: usize = usize::MAX;

/// Unique, never reused thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(core::num::NonZeroU64);

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ThreadId {
    /// Create a thread ID, `None` for zero.
    pub fn new(id: u64) -> Option<Self> {
        core::num::NonZeroU64::new(id).map(Self)
    }

    /// Get the ID as u64.
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

/// Temporary priority raise granted by another thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boost {
    /// Thread which granted the boost
    pub owner: ThreadId,
    /// Real-time priority granted
    pub prio: i32,
}

/// Fields protected by the thread lock.
pub struct ThreadCore {
    /// CPU whose run queue the thread belongs to
    pub(crate) cpu: CpuId,
    /// CPUs the thread may run on
    pub(crate) affinity: CpuSet,
    /// Base scheduling parameters
    pub(crate) base: SchedParam,
    /// Current priority, base or boosted
    pub(crate) cprio: i32,
    pub(crate) boosters: Vec<Boost>,
    /// Channel the thread pends on; set iff `PEND`
    pub(crate) wchan: Option<Arc<dyn WaitChannel>>,
    /// Round-robin quantum, `None` when disabled
    pub(crate) rrperiod: Option<Duration>,
    /// Capabilities were raised for real-time operation
    pub(crate) raised_cap: bool,
}

/// Per-thread counters, readable without locks.
#[derive(Debug, Default)]
pub struct ThreadStats {
    csw: AtomicU64,
    isw: AtomicU64,
    inband_sw: AtomicU64,
    rwa: AtomicU64,
    sc: AtomicU64,
    runtime: AtomicU64,
}

impl ThreadStats {
    /// Voluntary context switches (the thread blocked).
    pub fn voluntary_switches(&self) -> u64 {
        self.csw.load(Ordering::Relaxed)
    }

    /// Involuntary context switches (the thread was preempted).
    pub fn involuntary_switches(&self) -> u64 {
        self.isw.load(Ordering::Relaxed)
    }

    /// Switches to in-band mode.
    pub fn inband_switches(&self) -> u64 {
        self.inband_sw.load(Ordering::Relaxed)
    }

    /// Wakeups issued from another CPU.
    pub fn remote_wakeups(&self) -> u64 {
        self.rwa.load(Ordering::Relaxed)
    }

    /// Out-of-band system calls.
    pub fn syscalls(&self) -> u64 {
        self.sc.load(Ordering::Relaxed)
    }

    /// Accumulated run time out-of-band.
    pub fn runtime(&self) -> Duration {
        Duration::from_nanos(self.runtime.load(Ordering::Relaxed))
    }

    pub(crate) fn count_switch(&self, voluntary: bool) {
        if voluntary {
            self.csw.fetch_add(1, Ordering::Relaxed);
        } else {
            self.isw.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn count_inband_switch(&self) {
        self.inband_sw.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_remote_wakeup(&self) {
        self.rwa.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_syscall(&self) {
        self.sc.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_runtime(&self, ran: Duration) {
        self.runtime.fetch_add(ran.as_nanos(), Ordering::Relaxed);
    }
}

/// Everything needed to build a control block.
pub(crate) struct ThreadInit {
    pub id: ThreadId,
    pub name: String,
    pub state: StateFlags,
    pub param: SchedParam,
    pub wprio: i32,
    pub cpu: CpuId,
    pub affinity: CpuSet,
    pub rrperiod: Option<Duration>,
    pub process: Option<Arc<Process>>,
}

/// Thread control block.
pub struct Thread {
    id: ThreadId,
    name: String,
    state: AtomicU32,
    info: AtomicU32,
    wprio: AtomicI32,
    cpu: AtomicUsize,
    rr_quantum: AtomicU64,
    slot: AtomicUsize,
    pub(crate) core: spin::Mutex<ThreadCore>,
    pub(crate) rtimer: Timer,
    pub(crate) ptimer: Timer,
    stats: ThreadStats,
    exited: Completion,
    process: Option<Arc<Process>>,
}

impl Thread {
    pub(crate) fn new(init: ThreadInit) -> ThreadRef {
        Arc::new_cyclic(|this| Thread {
            id: init.id,
            name: init.name,
            state: AtomicU32::new(init.state.bits()),
            info: AtomicU32::new(0),
            wprio: AtomicI32::new(init.wprio),
            cpu: AtomicUsize::new(init.cpu),
            rr_quantum: AtomicU64::new(init.rrperiod.map_or(0, Duration::as_nanos)),
            slot: AtomicUsize::new(NO_SLOT),
            core: spin::Mutex::new(ThreadCore {
                cpu: init.cpu,
                affinity: init.affinity,
                base: init.param,
                cprio: init.param.prio,
                boosters: Vec::new(),
                wchan: None,
                rrperiod: init.rrperiod,
                raised_cap: false,
            }),
            rtimer: Timer::new(TimerTarget::Thread(this.clone(), TimerKind::Resource)),
            ptimer: Timer::new(TimerTarget::Thread(this.clone(), TimerKind::Periodic)),
            stats: ThreadStats::default(),
            exited: Completion::new(),
            process: init.process,
        })
    }

    /// Build a free-standing control block, outside any kernel.
    #[cfg(test)]
    pub(crate) fn new_detached(name: &str, param: SchedParam, wprio: i32) -> ThreadRef {
        static NEXT: AtomicU64 = AtomicU64::new(1_000_000);
        let id = NEXT.fetch_add(1, Ordering::Relaxed);
        Self::new(ThreadInit {
            id: ThreadId::new(id).expect("nonzero id"),
            name: name.into(),
            state: StateFlags::DORMANT | StateFlags::INBAND,
            param,
            wprio,
            cpu: 0,
            affinity: CpuSet::all(),
            rrperiod: None,
            process: None,
        })
    }

    /// Thread identifier.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state word.
    pub fn state(&self) -> StateFlags {
        StateFlags::from_bits_retain(self.state.load(Ordering::Acquire))
    }

    /// Reasons attached to the last wakeup.
    pub fn info(&self) -> InfoFlags {
        InfoFlags::from_bits_retain(self.info.load(Ordering::Acquire))
    }

    /// Weighted priority used to order the thread.
    pub fn wprio(&self) -> i32 {
        self.wprio.load(Ordering::Acquire)
    }

    /// CPU of the run queue the thread belongs to.
    pub fn cpu(&self) -> CpuId {
        self.cpu.load(Ordering::Acquire)
    }

    /// Round-robin quantum, if the budget is active.
    pub fn rr_quantum(&self) -> Option<Duration> {
        match self.rr_quantum.load(Ordering::Acquire) {
            0 => None,
            ns => Some(Duration::from_nanos(ns)),
        }
    }

    /// Whether this is a per-CPU root thread.
    pub fn is_root(&self) -> bool {
        self.state().contains(StateFlags::ROOT)
    }

    /// Whether the thread backs a user-space task.
    pub fn is_user(&self) -> bool {
        self.state().contains(StateFlags::USER)
    }

    /// Whether the thread currently runs on the in-band stage.
    pub fn is_inband(&self) -> bool {
        self.state().contains(StateFlags::INBAND)
    }

    /// Whether the thread has been retired.
    pub fn is_zombie(&self) -> bool {
        self.state().contains(StateFlags::ZOMBIE)
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.info().contains(InfoFlags::CANCELD)
    }

    /// Counters.
    pub fn stats(&self) -> &ThreadStats {
        &self.stats
    }

    /// Latch signaled once the thread has been retired.
    pub fn exited(&self) -> &Completion {
        &self.exited
    }

    /// Process the thread belongs to, if any.
    pub fn process(&self) -> Option<&Arc<Process>> {
        self.process.as_ref()
    }

    /// Whether both threads belong to the same process.
    pub fn same_process(&self, other: &Thread) -> bool {
        match (&self.process, &other.process) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Whether the thread sits blocked out-of-band on any of `mask`.
    pub fn blocked_on(&self, mask: StateFlags) -> bool {
        let state = self.state();
        state.intersects(mask) && !state.contains(StateFlags::INBAND)
    }

    // State writes happen under the lock pair only; the atomics let
    // readers observe them lock-free.

    pub(crate) fn insert_state(&self, bits: StateFlags) {
        self.state.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_state(&self, bits: StateFlags) {
        self.state.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    pub(crate) fn insert_info(&self, bits: InfoFlags) {
        self.info.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_info(&self, bits: InfoFlags) {
        self.info.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    /// Set `bits`, returning whether none of them were set before.
    pub(crate) fn test_and_set_info(&self, bits: InfoFlags) -> bool {
        let old = self.info.fetch_or(bits.bits(), Ordering::AcqRel);
        old & bits.bits() == 0
    }

    pub(crate) fn set_wprio(&self, wprio: i32) {
        self.wprio.store(wprio, Ordering::Release);
    }

    pub(crate) fn set_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu, Ordering::Release);
    }

    pub(crate) fn set_rr_quantum(&self, quantum: Option<Duration>) {
        self.rr_quantum
            .store(quantum.map_or(0, Duration::as_nanos), Ordering::Release);
    }

    pub(crate) fn slot(&self) -> Option<usize> {
        match self.slot.load(Ordering::Acquire) {
            NO_SLOT => None,
            slot => Some(slot),
        }
    }

    pub(crate) fn set_slot(&self, slot: Option<usize>) {
        self.slot.store(slot.unwrap_or(NO_SLOT), Ordering::Release);
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("info", &self.info())
            .field("wprio", &self.wprio())
            .finish()
    }
}

/// Point-in-time view of a thread, as returned by `Kernel::get_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub name: String,
    pub state: StateFlags,
    pub info: InfoFlags,
    pub param: SchedParam,
    /// Current priority, including boosts
    pub cprio: i32,
    pub wprio: i32,
    pub cpu: CpuId,
    pub affinity: CpuSet,
    pub rrperiod: Option<Duration>,
    /// Time left on the pending timeout, if any
    pub timeout: Option<Duration>,
    /// Period of the periodic timer, if armed
    pub period: Option<Duration>,
    pub voluntary_switches: u64,
    pub involuntary_switches: u64,
    pub inband_switches: u64,
    pub remote_wakeups: u64,
    pub syscalls: u64,
    pub runtime: Duration,
}

impl ThreadSnapshot {
    pub(crate) fn capture(thread: &Thread, core: &ThreadCore, now: Instant) -> Self {
        let stats = thread.stats();
        Self {
            id: thread.id(),
            name: thread.name.clone(),
            state: thread.state(),
            info: thread.info(),
            param: core.base,
            cprio: core.cprio,
            wprio: thread.wprio(),
            cpu: core.cpu,
            affinity: core.affinity,
            rrperiod: core.rrperiod,
            timeout: thread
                .rtimer
                .is_running()
                .then(|| thread.rtimer.remaining(now)),
            period: thread.ptimer.interval(),
            voluntary_switches: stats.voluntary_switches(),
            involuntary_switches: stats.involuntary_switches(),
            inband_switches: stats.inband_switches(),
            remote_wakeups: stats.remote_wakeups(),
            syscalls: stats.syscalls(),
            runtime: stats.runtime(),
        }
    }
}
