//! Handles given out by the spawn path.
//!
//! [`ThreadHandle`] is what the spawner keeps; [`KthreadContext`] is what the
//! body of a kernel thread runs with.

use super::{InfoFlags, ThreadId, ThreadRef, ThreadSnapshot};
use crate::errors::{ThreadResult, WaitError};
use crate::kernel::Kernel;
use crate::sched::{DefaultPolicy, SchedPolicy};
use crate::time::{Duration, Instant, Timeout};
use crate::wait::{wait_outcome, WaitQueue};

extern crate alloc;
use alloc::sync::Arc;

/// Owner-side view of a kernel thread.
pub struct ThreadHandle<S: SchedPolicy = DefaultPolicy> {
    kernel: Arc<Kernel<S>>,
    thread: ThreadRef,
}

impl<S: SchedPolicy> ThreadHandle<S> {
    pub(crate) fn new(kernel: Arc<Kernel<S>>, thread: ThreadRef) -> Self {
        Self { kernel, thread }
    }

    /// Wait from host context until the thread has been retired.
    pub fn join(&self) -> ThreadResult<()> {
        self.kernel.join(None, &self.thread, false)
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.kernel.cancel(&self.thread);
    }

    /// Consistent view of the thread's scheduling state.
    pub fn snapshot(&self) -> ThreadSnapshot {
        self.kernel.get_state(&self.thread)
    }

    pub fn id(&self) -> ThreadId {
        self.thread.id()
    }

    pub fn thread(&self) -> &ThreadRef {
        &self.thread
    }

    pub fn is_finished(&self) -> bool {
        self.thread.exited().is_done()
    }
}

impl<S: SchedPolicy> Clone for ThreadHandle<S> {
    fn clone(&self) -> Self {
        Self::new(self.kernel.clone(), self.thread.clone())
    }
}

impl<S: SchedPolicy> core::fmt::Debug for ThreadHandle<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("thread", &self.thread)
            .finish()
    }
}

/// What a kernel thread body sees of itself.
///
/// Every blocking helper is also a cancellation checkpoint: once the thread
/// has been cancelled it returns [`crate::ThreadError::Cancelled`] and the
/// body is expected to propagate it.
pub struct KthreadContext<S: SchedPolicy = DefaultPolicy> {
    kernel: Arc<Kernel<S>>,
    thread: ThreadRef,
}

impl<S: SchedPolicy> KthreadContext<S> {
    pub(crate) fn new(kernel: Arc<Kernel<S>>, thread: ThreadRef) -> Self {
        Self { kernel, thread }
    }

    pub fn thread(&self) -> &ThreadRef {
        &self.thread
    }

    pub fn kernel(&self) -> &Arc<Kernel<S>> {
        &self.kernel
    }

    /// Sleep for `delay`.
    ///
    /// # Errors
    ///
    /// `WaitError::Interrupted` when woken early, `Cancelled` when the wakeup
    /// was a cancellation.
    pub fn delay(&self, delay: Duration) -> ThreadResult<()> {
        let broken = self.kernel.delay(&self.thread, Timeout::Relative(delay));
        self.test_cancel()?;
        match broken {
            None => Ok(()),
            Some(_) => Err(WaitError::Interrupted.into()),
        }
    }

    /// Make the thread periodic, first release one `period` after `idate`
    /// (now when `None`).
    pub fn set_period(&self, idate: Option<Instant>, period: Duration) -> ThreadResult<()> {
        self.kernel.set_period(&self.thread, idate, period)
    }

    /// Wait for the next periodic release.
    ///
    /// # Errors
    ///
    /// `WaitError::Overrun(n)` when `n` releases were missed, which is not
    /// fatal; the next call waits for the following release.
    pub fn wait_period(&self) -> ThreadResult<()> {
        let outcome = self.kernel.wait_period(&self.thread);
        self.test_cancel()?;
        outcome.map_err(Into::into)
    }

    /// Cancellation checkpoint.
    pub fn test_cancel(&self) -> ThreadResult<()> {
        self.kernel.test_cancel(&self.thread)
    }

    /// Suspend until released or kicked.
    pub fn suspend(&self) -> ThreadResult<()> {
        if let Err(err) = self.kernel.hold(&self.thread, super::StateFlags::SUSP) {
            self.test_cancel()?;
            return Err(err.into());
        }
        let info = self.kernel.block(&self.thread);
        self.test_cancel()?;
        if info.contains(InfoFlags::KICKED) {
            return Err(WaitError::Interrupted.into());
        }
        Ok(())
    }

    /// Pend on `queue`.
    pub fn wait_on(&self, queue: &WaitQueue, timeout: Timeout) -> ThreadResult<()> {
        let outcome = queue.wait(&self.kernel, &self.thread, timeout);
        self.test_cancel()?;
        outcome.map_err(Into::into)
    }

    /// Reasons of the last wakeup.
    pub fn last_wakeup(&self) -> Result<(), WaitError> {
        wait_outcome(self.thread.info())
    }
}
