//! Wait channels and a priority-ordered wait queue.
//!
//! A wait channel is whatever a pending thread sleeps on. The core keeps a
//! reference to it in the thread control block while `PEND` is set, asks it
//! to reorder its waiters when a pending thread changes priority, and
//! otherwise treats it as opaque.
//!
//! Lock order: wait queue, then thread, then run queue.

use crate::errors::WaitError;
use crate::kernel::Kernel;
use crate::sched::SchedPolicy;
use crate::thread::{InfoFlags, StateFlags, Thread, ThreadRef};
use crate::time::{Clock, Timeout};

extern crate alloc;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

/// Something a thread can pend on.
pub trait WaitChannel: Send + Sync {
    /// Channel name, for diagnostics.
    fn name(&self) -> &str;

    /// Reposition `thread` after its weighted priority changed.
    ///
    /// Called without any thread or run queue lock held.
    fn reorder_wait(&self, thread: &ThreadRef);
}

/// Whether `wchan` is `channel`.
pub(crate) fn same_channel<T: ?Sized>(wchan: &Arc<dyn WaitChannel>, channel: &T) -> bool {
    core::ptr::eq(
        Arc::as_ptr(wchan) as *const (),
        channel as *const T as *const (),
    )
}

/// Map the reasons of a finished wait to its outcome.
pub(crate) fn wait_outcome(info: InfoFlags) -> Result<(), WaitError> {
    if info.contains(InfoFlags::RMID) {
        Err(WaitError::Removed)
    } else if info.contains(InfoFlags::TIMEO) {
        Err(WaitError::TimedOut)
    } else if info.contains(InfoFlags::BREAK) {
        Err(WaitError::Interrupted)
    } else {
        Ok(())
    }
}

/// Waiters ordered by weighted priority, FIFO within a priority.
pub struct WaitQueue {
    name: String,
    clock: Arc<Clock>,
    this: Weak<WaitQueue>,
    waiters: spin::Mutex<Vec<ThreadRef>>,
}

impl WaitQueue {
    /// Create a wait queue timed against `clock`.
    pub fn new(name: impl Into<String>, clock: Arc<Clock>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.into(),
            clock,
            this: this.clone(),
            waiters: spin::Mutex::new(Vec::new()),
        })
    }

    /// Number of threads queued.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Whether no thread is queued.
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Snapshot of the waiters, highest priority first.
    pub fn waiters(&self) -> Vec<ThreadRef> {
        self.waiters.lock().clone()
    }

    fn insert(waiters: &mut Vec<ThreadRef>, thread: ThreadRef) {
        let wprio = thread.wprio();
        let pos = waiters
            .iter()
            .position(|w| w.wprio() < wprio)
            .unwrap_or(waiters.len());
        waiters.insert(pos, thread);
    }

    fn remove(waiters: &mut Vec<ThreadRef>, thread: &Thread) -> Option<ThreadRef> {
        let pos = waiters.iter().position(|w| core::ptr::eq(&**w, thread))?;
        Some(waiters.remove(pos))
    }

    /// Block `thread` on this queue until woken, flushed or timed out.
    ///
    /// `thread` must be the caller, running out-of-band.
    ///
    /// # Errors
    ///
    /// `TimedOut`, `Interrupted` when the wait was broken, `Removed` when
    /// the queue was flushed.
    pub fn wait<S: SchedPolicy>(
        &self,
        kernel: &Kernel<S>,
        thread: &ThreadRef,
        timeout: Timeout,
    ) -> Result<(), WaitError> {
        let Some(this) = self.this.upgrade() else {
            return Err(WaitError::Removed);
        };
        {
            let mut waiters = self.waiters.lock();
            let mut lt = kernel.lock_thread(thread);
            lt.sleep_on(timeout, &self.clock, Some(this as Arc<dyn WaitChannel>));
            if thread.state().contains(StateFlags::PEND) {
                Self::insert(&mut waiters, thread.clone());
            }
        }
        let info = kernel.block(thread);
        Self::remove(&mut self.waiters.lock(), thread);
        wait_outcome(info)
    }

    /// Wake the highest priority waiter still pending here.
    pub fn wake_one<S: SchedPolicy>(&self, kernel: &Kernel<S>) -> Option<ThreadRef> {
        let mut waiters = self.waiters.lock();
        while !waiters.is_empty() {
            let thread = waiters.remove(0);
            if self.wake(kernel, &thread, InfoFlags::empty()) {
                return Some(thread);
            }
        }
        None
    }

    /// Wake every waiter. Returns how many were woken.
    pub fn wake_all<S: SchedPolicy>(&self, kernel: &Kernel<S>) -> usize {
        self.drain(kernel, InfoFlags::empty())
    }

    /// Wake every waiter with `RMID`, as when the object is deleted.
    pub fn flush<S: SchedPolicy>(&self, kernel: &Kernel<S>) -> usize {
        self.drain(kernel, InfoFlags::RMID)
    }

    fn drain<S: SchedPolicy>(&self, kernel: &Kernel<S>, info: InfoFlags) -> usize {
        let mut waiters = self.waiters.lock();
        let drained: Vec<ThreadRef> = waiters.drain(..).collect();
        drained
            .iter()
            .filter(|thread| self.wake(kernel, thread, info))
            .count()
    }

    fn wake<S: SchedPolicy>(&self, kernel: &Kernel<S>, thread: &ThreadRef, info: InfoFlags) -> bool {
        let mut lt = kernel.lock_thread(thread);
        let pending_here = lt.wchan().is_some_and(|w| same_channel(w, self));
        if pending_here {
            lt.wakeup(StateFlags::PEND, info);
        }
        pending_here
    }
}

impl WaitChannel for WaitQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn reorder_wait(&self, thread: &ThreadRef) {
        let mut waiters = self.waiters.lock();
        if let Some(waiter) = Self::remove(&mut waiters, thread) {
            Self::insert(&mut waiters, waiter);
        }
    }
}

impl core::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitQueue")
            .field("name", &self.name)
            .field("waiters", &self.len())
            .finish()
    }
}
