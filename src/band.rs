//! Moving threads between the in-band and out-of-band stages.
//!
//! The [`BandBridge`] is the host side of the dual kernel: it performs the
//! actual stage switches, parks and resumes host tasks, and reports
//! asynchronous events back to the core as [`BandEvent`]s.

use crate::errors::{BandError, InvalidOperationError, SpawnError, ThreadError, ThreadResult};
use crate::kernel::Kernel;
use crate::sched::{CpuId, SchedPolicy};
use crate::signal::{HmCause, SigInfo};
use crate::thread::{InfoFlags, StateFlags, Thread, ThreadRef};

extern crate alloc;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Host services the core relies on.
///
/// Methods marked as called under the lock pair run with the thread and
/// run queue locked and interrupts disabled: they must not block or call
/// back into the kernel.
pub trait BandBridge: Send + Sync {
    /// CPU the caller runs on.
    fn current_cpu(&self) -> CpuId {
        0
    }

    /// Host part of an out-of-band switch for the calling thread.
    ///
    /// # Errors
    ///
    /// `BandError::SwitchFailed` when the host cannot hand the task over.
    fn switch_oob(&self, thread: &ThreadRef) -> Result<(), BandError>;

    /// Host part of an in-band switch for the calling thread.
    fn switch_inband(&self, thread: &ThreadRef);

    /// Whether the host asked `thread` to switch in-band.
    ///
    /// Called under the lock pair.
    fn switch_pending(&self, thread: &Thread) -> bool;

    /// Whether an in-band signal is pending for `thread`.
    fn signal_pending(&self, thread: &Thread) -> bool;

    /// Force `thread` into the host at the next opportunity.
    ///
    /// Called under the lock pair.
    fn interrupt(&self, thread: &ThreadRef);

    /// Deliver a signal in-band.
    fn deliver_signal(&self, thread: &ThreadRef, info: &SigInfo);

    /// Publish a health-monitor report on the observable channel.
    fn notify_observable(&self, _thread: &ThreadRef, _cause: HmCause) {}

    /// Run [`Kernel::flush_deferred_signals`] from in-band context soon.
    fn schedule_inband_work(&self);

    /// Park the calling thread until [`BandBridge::resume`] or a spurious
    /// wakeup. The core re-checks the state word after each return.
    fn suspend(&self, thread: &ThreadRef);

    /// Make a thread parked in [`BandBridge::suspend`] runnable.
    ///
    /// Called under the lock pair.
    fn resume(&self, thread: &ThreadRef);

    /// Yield the CPU while polling an in-band condition.
    fn relax(&self) {
        core::hint::spin_loop();
    }

    /// Start a host task running `body`.
    ///
    /// # Errors
    ///
    /// `SpawnError::HostSpawnFailed` when the host cannot create the task.
    fn spawn_host_task(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> Result<(), SpawnError>;

    /// Grant a user thread the capabilities real-time operation needs.
    fn raise_caps(&self, _thread: &ThreadRef) -> bool {
        true
    }

    /// Revoke what [`BandBridge::raise_caps`] granted.
    fn drop_caps(&self, _thread: &ThreadRef) {}

    /// `thread` has been retired.
    fn thread_retired(&self, _thread: &ThreadRef) {}

    /// Disable hard interrupts, returning the previous state.
    fn hard_irq_save(&self) -> usize {
        0
    }

    /// Restore the interrupt state saved by [`BandBridge::hard_irq_save`].
    fn hard_irq_restore(&self, _flags: usize) {}
}

/// Asynchronous notifications from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandEvent {
    /// An in-band signal is pending for the thread
    SignalWake,
    /// The thread must move to another CPU
    MigrationRequired,
    /// The thread is about to resume user code
    ReturningToUser,
    /// The debugger stopped the thread
    DebugStop,
    /// The debugger single-steps the thread
    DebugStep,
    /// The debugger let the thread go
    DebugContinue,
    /// The address space of the thread is going away
    AddressSpaceTornDown {
        /// The task is exiting, as opposed to exec'ing a new image
        exiting: bool,
    },
}

impl<S: SchedPolicy> Kernel<S> {
    /// Move the calling thread `thread` to the out-of-band stage.
    ///
    /// Waits first while the stop-sync barrier of its process is closed,
    /// and moves the thread to an allowed CPU if its affinity changed.
    ///
    /// # Errors
    ///
    /// `WaitError::Restart` when a signal interrupted the barrier wait,
    /// `BandError::SwitchFailed` when the host refused the switch,
    /// `InvalidOperationError::Zombie` for a retired thread.
    pub fn switch_oob(&self, thread: &ThreadRef) -> ThreadResult<()> {
        loop {
            if thread.is_zombie() {
                return Err(InvalidOperationError::Zombie.into());
            }
            if !thread.is_inband() {
                return Ok(());
            }
            if let Some(process) = thread.process() {
                process.stop_sync().wait(&*self.bridge, thread, true)?;
            }
            self.bridge.switch_oob(thread)?;

            let mut lt = self.lock_thread(thread);
            if thread.process().is_some_and(|p| p.stop_sync().is_closed()) {
                // Closed again between the wait and the lock.
                drop(lt);
                self.bridge.switch_inband(thread);
                continue;
            }
            let affinity = lt.affinity();
            if !affinity.contains(lt.cpu()) {
                if let Some(dest) = affinity.online(self.nr_cpus()).first() {
                    lt = lt.migrate(dest);
                }
            }
            if !thread.is_cancelled() {
                thread.remove_info(InfoFlags::KICKED);
            }
            thread.remove_info(InfoFlags::PTSIG);
            thread.remove_state(StateFlags::INBAND);
            if !thread.state().is_blocked() {
                lt.enqueue(false);
            }
            lt.check();
            log::trace!("{} switched out-of-band on cpu{}", thread.name(), lt.cpu());
            return Ok(());
        }
    }

    /// Move the calling thread `thread` to the in-band stage.
    ///
    /// `cause` names an involuntary switch, reported to the health monitor
    /// when the thread asked for it.
    pub fn switch_inband(&self, thread: &ThreadRef, cause: Option<HmCause>) {
        {
            let mut lt = self.lock_thread(thread);
            let state = thread.state();
            if state.intersects(StateFlags::INBAND | StateFlags::ZOMBIE | StateFlags::ROOT) {
                return;
            }
            lt.dequeue();
            thread.insert_state(StateFlags::INBAND);
            if !thread.is_cancelled() {
                thread.remove_info(InfoFlags::KICKED);
            }
            thread.stats().count_inband_switch();
            lt.check();
        }
        self.bridge.switch_inband(thread);
        log::trace!("{} switched in-band ({cause:?})", thread.name());
        if let Some(cause) = cause {
            self.notify_health(thread, cause);
        }
    }

    /// React to a host notification about `thread`.
    ///
    /// # Errors
    ///
    /// Only `ReturningToUser` fails, when the switch back out-of-band cannot
    /// complete before the host handles a pending signal.
    pub fn handle_band_event(&self, thread: &ThreadRef, event: BandEvent) -> ThreadResult<()> {
        log::debug!("{}: {event:?}", thread.name());
        match event {
            BandEvent::SignalWake | BandEvent::MigrationRequired => {
                self.kick(thread, InfoFlags::empty());
                Ok(())
            }
            BandEvent::ReturningToUser => self.return_to_user(thread),
            BandEvent::DebugStop => {
                self.debug_stop(thread);
                Ok(())
            }
            BandEvent::DebugStep => {
                self.lock_thread(thread)
                    .change_flags(StateFlags::SSTEP, StateFlags::empty());
                self.debug_resume(thread);
                Ok(())
            }
            BandEvent::DebugContinue => {
                self.lock_thread(thread)
                    .change_flags(StateFlags::empty(), StateFlags::SSTEP | StateFlags::PTRACE);
                self.debug_resume(thread);
                Ok(())
            }
            BandEvent::AddressSpaceTornDown { exiting } => {
                if !exiting && !thread.is_zombie() {
                    // exec() in progress: the thread leaves the real-time core.
                    self.detach_self(thread);
                } else if let Some(process) = thread.process() {
                    self.release_halted(process.stop_sync().reset());
                }
                Ok(())
            }
        }
    }

    fn debug_stop(&self, thread: &ThreadRef) {
        thread.insert_info(InfoFlags::PTSTOP);
        self.lock_thread(thread)
            .change_flags(StateFlags::PTRACE, StateFlags::SSTEP);
        let Some(process) = thread.process() else {
            return;
        };
        let sync = process.stop_sync();
        if !sync.join(thread) {
            return;
        }
        for sibling in self.registry.snapshot() {
            if Arc::ptr_eq(&sibling, thread) || !sibling.same_process(thread) {
                continue;
            }
            // `switch_oob` tests the barrier under this same lock.
            let mut lt = self.lock_thread(&sibling);
            let state = sibling.state();
            if state.intersects(StateFlags::INBAND | StateFlags::ZOMBIE) || !sync.park(&sibling) {
                continue;
            }
            if lt.hold(StateFlags::HALT).is_ok() {
                lt.kick(InfoFlags::PTSIG);
            }
        }
    }

    fn debug_resume(&self, thread: &ThreadRef) {
        thread.remove_info(InfoFlags::PTSTOP);
        if let Some(halted) = thread.process().and_then(|p| p.stop_sync().leave(thread)) {
            self.release_halted(halted);
        }
    }

    /// Let go of the siblings halted while a stop-sync barrier was closed,
    /// each at the head of its priority group.
    pub(crate) fn release_halted(&self, halted: Vec<ThreadRef>) {
        for sibling in halted {
            let mut lt = self.lock_thread(&sibling);
            if !sibling.is_zombie() {
                lt.release(StateFlags::HALT, InfoFlags::empty());
            }
        }
    }

    fn return_to_user(&self, thread: &ThreadRef) -> ThreadResult<()> {
        let state = thread.state();
        if !state.contains(StateFlags::USER)
            || !state.contains(StateFlags::INBAND)
            || state.intersects(StateFlags::DORMANT | StateFlags::ZOMBIE)
        {
            return Ok(());
        }
        loop {
            match self.switch_oob(thread) {
                Ok(()) => return Ok(()),
                Err(err) if self.bridge.signal_pending(thread) => {
                    log::debug!("{}: back to user deferred: {err}", thread.name());
                    return Err(BandError::SignalPending.into());
                }
                Err(err @ ThreadError::InvalidOperation(_)) => return Err(err),
                Err(err) => {
                    log::warn!("{}: out-of-band switch failed, retrying: {err}", thread.name());
                    self.bridge.relax();
                }
            }
        }
    }
}
