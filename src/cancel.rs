//! Cancellation, retirement and join.
//!
//! Cancellation is a request: the target notices it at its next blocking
//! point or cancellation checkpoint. Every way out of the core (cancel,
//! self-detach, address space teardown) ends in [`Kernel::retire`], which
//! runs once per thread no matter how many paths race into it.

use crate::errors::{BandError, JoinError, ThreadError, ThreadResult};
use crate::kernel::Kernel;
use crate::sched::SchedPolicy;
use crate::thread::{InfoFlags, StateFlags, ThreadRef};

extern crate alloc;
use alloc::sync::Arc;
use alloc::vec::Vec;

impl<S: SchedPolicy> Kernel<S> {
    /// Request cancellation of `thread`.
    ///
    /// Repeated requests are no-ops. A thread which never started is let
    /// go with `KICKED` so it notices at once. A user thread is demoted and
    /// interrupted; any other thread is kicked out of its waits and must
    /// reach a checkpoint by itself. Administrative holds are lifted in
    /// both cases.
    pub fn cancel(&self, thread: &ThreadRef) {
        if thread.is_root() {
            log::error!("cancel: refusing to cancel root thread {}", thread.name());
            return;
        }
        let mut lt = self.lock_thread(thread);
        if thread.is_zombie() || !thread.test_and_set_info(InfoFlags::CANCELD) {
            return;
        }
        log::debug!("cancel {}", thread.name());
        let state = thread.state();
        if state.contains(StateFlags::DORMANT) {
            lt.release(StateFlags::DORMANT, InfoFlags::KICKED);
            return;
        }
        if state.contains(StateFlags::USER) {
            lt.demote();
            if state.contains(StateFlags::INBAND) {
                self.bridge.interrupt(thread);
            }
        } else {
            lt.kick(InfoFlags::empty());
        }
        lt.release(StateFlags::SUSP | StateFlags::HALT, InfoFlags::KICKED);
    }

    /// Cancel the calling thread `thread`; always returns
    /// [`ThreadError::Cancelled`] once it has been retired.
    pub fn cancel_self(&self, thread: &ThreadRef) -> ThreadError {
        thread.insert_info(InfoFlags::CANCELD);
        match self.test_cancel(thread) {
            Err(err) => err,
            Ok(()) => ThreadError::Cancelled,
        }
    }

    /// Cancellation checkpoint for the calling thread `thread`.
    ///
    /// # Errors
    ///
    /// [`ThreadError::Cancelled`] when cancellation was requested; the
    /// thread has then been switched in-band and retired.
    pub fn test_cancel(&self, thread: &ThreadRef) -> ThreadResult<()> {
        if !thread.is_cancelled() {
            return Ok(());
        }
        self.switch_inband(thread, None);
        self.retire(thread);
        Err(ThreadError::Cancelled)
    }

    /// The calling thread `thread` leaves the core for good.
    pub fn detach_self(&self, thread: &ThreadRef) {
        self.switch_inband(thread, None);
        self.retire(thread);
    }

    /// Tear `thread` down. Returns `false` if it was already retired.
    ///
    /// Unwinds the timers, the wait channel, priority boosts, the registry
    /// entry, stop-sync membership and raised capabilities, then signals
    /// `exited`.
    pub(crate) fn retire(&self, thread: &ThreadRef) -> bool {
        let raised_cap = {
            let mut lt = self.lock_thread(thread);
            if thread.is_zombie() {
                return false;
            }
            lt.dequeue();
            thread.rtimer.stop();
            thread.ptimer.stop();
            lt.core.wchan = None;
            lt.core.boosters.clear();
            thread.remove_state(StateFlags::WAKE_MASK | StateFlags::HOLD_MASK | StateFlags::RRB);
            thread.insert_state(StateFlags::ZOMBIE);
            core::mem::take(&mut lt.core.raised_cap)
        };
        self.registry.remove(thread);
        if let Some(halted) = thread.process().and_then(|p| p.stop_sync().leave(thread)) {
            self.release_halted(halted);
        }
        if raised_cap {
            self.bridge.drop_caps(thread);
        }
        thread.exited().complete();
        self.bridge.thread_retired(thread);
        log::debug!("{} retired", thread.name());
        true
    }

    /// Wait until `target` has been retired.
    ///
    /// `caller` is the joining thread, `None` for a plain host context. An
    /// out-of-band caller is moved in-band for the wait and back afterwards.
    ///
    /// # Errors
    ///
    /// `JoinError::SelfJoin` when `caller` is `target`,
    /// `JoinError::Interrupted` when an interruptible join sees a signal.
    pub fn join(&self, caller: Option<&ThreadRef>, target: &ThreadRef, interruptible: bool) -> ThreadResult<()> {
        if caller.is_some_and(|c| Arc::ptr_eq(c, target)) {
            return Err(JoinError::SelfJoin.into());
        }
        let relaxed = match caller {
            Some(c) if !c.is_inband() && !c.is_root() => {
                self.switch_inband(c, None);
                Some(c)
            }
            _ => None,
        };

        let result = {
            let _waiting = target.exited().enter_wait();
            loop {
                if target.exited().is_done() {
                    break Ok(());
                }
                if interruptible && caller.is_some_and(|c| self.bridge.signal_pending(c)) {
                    break Err(JoinError::Interrupted.into());
                }
                self.bridge.relax();
            }
        };

        if let Some(c) = relaxed {
            if c.is_inband() {
                self.switch_oob(c)?;
            }
        }
        if result.is_ok() {
            log::debug!("{} joined", target.name());
        }
        result
    }

    /// Cancel every registered thread whose state holds all of `mask` and
    /// wait for them to retire. Returns how many were cancelled.
    ///
    /// # Errors
    ///
    /// `BandError::WrongBand` when `caller` runs out-of-band.
    pub fn kill_all(&self, caller: Option<&ThreadRef>, mask: StateFlags) -> ThreadResult<usize> {
        if caller.is_some_and(|c| !c.is_inband()) {
            return Err(BandError::WrongBand.into());
        }
        let victims: Vec<ThreadRef> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|t| !caller.is_some_and(|c| Arc::ptr_eq(c, t)))
            .filter(|t| t.state().contains(mask))
            .collect();
        log::debug!("kill_all: {} thread(s) matching {mask:?}", victims.len());
        for victim in &victims {
            self.cancel(victim);
        }
        for victim in &victims {
            self.join(caller, victim, false)?;
        }
        Ok(victims.len())
    }
}
