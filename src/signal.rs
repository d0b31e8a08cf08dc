//! Signal delivery across bands and health-monitor reporting.
//!
//! Signals raised from out-of-band context cannot be delivered there: they
//! are queued, each entry owning a reference to its target so the thread
//! outlives the deferral, and the bridge is asked to run in-band work which
//! drains the queue through [`Kernel::flush_deferred_signals`].

use crate::errors::{InvalidOperationError, ResourceError, ThreadResult};
use crate::kernel::Kernel;
use crate::sched::SchedPolicy;
use crate::thread::{StateFlags, ThreadRef};
use portable_atomic::{AtomicU64, Ordering};

extern crate alloc;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Signal number used for health-monitor reports.
pub const SIGDEBUG: i32 = 24;

/// Payload of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: i32,
    pub code: i32,
    pub value: i64,
}

impl SigInfo {
    pub const fn new(signo: i32) -> Self {
        Self {
            signo,
            code: 0,
            value: 0,
        }
    }

    pub const fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    pub const fn with_value(mut self, value: i64) -> Self {
        self.value = value;
        self
    }
}

/// Why a health-monitor report was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum HmCause {
    /// Switched in-band to handle a signal
    Signal = 1,
    /// Switched in-band for a host system call
    Syscall = 2,
    /// Switched in-band on a fault
    Fault = 3,
    /// Switched in-band to migrate
    Migration = 4,
    /// Waited on a lock held by a lower priority thread
    LockInversion = 5,
    /// Entered a section excluded from the real-time stage
    StageExclusion = 6,
    /// Ran past its watchdog
    Watchdog = 7,
}

impl HmCause {
    /// Mode bit which enables reporting this cause.
    pub fn trigger(self) -> StateFlags {
        match self {
            HmCause::LockInversion => StateFlags::WOLI,
            HmCause::StageExclusion => StateFlags::WOSX,
            _ => StateFlags::WOSS,
        }
    }
}

/// A signal waiting for in-band delivery.
#[derive(Debug)]
pub struct PendingSignal {
    pub thread: ThreadRef,
    pub info: SigInfo,
}

/// Bounded queue of deferred signals.
pub struct SignalQueue {
    depth: usize,
    queue: spin::Mutex<VecDeque<PendingSignal>>,
    dropped: AtomicU64,
}

impl SignalQueue {
    /// Create a queue holding at most `depth` signals.
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            queue: spin::Mutex::new(VecDeque::with_capacity(depth)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a signal.
    ///
    /// # Errors
    ///
    /// `ResourceError::QueueFull` when `depth` signals are already queued;
    /// the signal is dropped.
    pub fn push(&self, thread: ThreadRef, info: SigInfo) -> Result<(), ResourceError> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.depth {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(ResourceError::QueueFull);
        }
        queue.push_back(PendingSignal { thread, info });
        Ok(())
    }

    /// Take every queued signal, oldest first.
    pub fn drain(&self) -> Vec<PendingSignal> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Signals dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<S: SchedPolicy> Kernel<S> {
    /// Send `info` to `target`.
    ///
    /// From in-band context the signal is delivered at once; otherwise it is
    /// queued for the in-band worker.
    ///
    /// # Errors
    ///
    /// `InvalidOperationError::Zombie` for a retired target,
    /// `ResourceError::QueueFull` when the deferral queue is full.
    pub fn signal_thread(&self, target: &ThreadRef, info: SigInfo, from_inband: bool) -> ThreadResult<()> {
        if target.is_zombie() {
            return Err(InvalidOperationError::Zombie.into());
        }
        if from_inband {
            self.bridge.deliver_signal(target, &info);
            return Ok(());
        }
        if let Err(err) = self.signals.push(target.clone(), info) {
            log::warn!("signal {} to {} dropped: {err}", info.signo, target.name());
            return Err(err.into());
        }
        self.bridge.schedule_inband_work();
        Ok(())
    }

    /// Deliver every deferred signal. Returns how many were delivered.
    ///
    /// Called by the in-band worker the bridge schedules.
    pub fn flush_deferred_signals(&self) -> usize {
        let pending = self.signals.drain();
        let count = pending.len();
        for PendingSignal { thread, info } in pending {
            if thread.is_zombie() {
                log::debug!("signal {} to retired {} discarded", info.signo, thread.name());
                continue;
            }
            self.bridge.deliver_signal(&thread, &info);
        }
        count
    }

    /// Report a health-monitor event for `thread`.
    ///
    /// Nothing is reported unless the trigger of `cause` is set in the
    /// thread's mode. The report goes to the signal channel with `HMSIG`,
    /// to the observable channel with `HMOBS`, or to both.
    pub fn notify_health(&self, thread: &ThreadRef, cause: HmCause) -> bool {
        let mode = thread.state();
        if !mode.contains(cause.trigger()) {
            return false;
        }
        log::warn!("health monitor: {} raised {cause:?}", thread.name());
        let mut reported = false;
        if mode.contains(StateFlags::HMSIG) {
            let info = SigInfo::new(SIGDEBUG).with_code(cause as i32);
            reported |= self.signal_thread(thread, info, thread.is_inband()).is_ok();
        }
        if mode.contains(StateFlags::HMOBS) {
            self.bridge.notify_observable(thread, cause);
            reported = true;
        }
        reported
    }

    /// Signals waiting for in-band delivery.
    pub fn deferred_signals(&self) -> usize {
        self.signals.len()
    }
}
