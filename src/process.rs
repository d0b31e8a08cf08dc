//! Processes and their stop-sync barrier.
//!
//! Real-time threads of one process stop and resume together while a
//! debugger controls any of them. The first thread hit by a stop joins the
//! barrier and closes it. Siblings running out-of-band are halted where
//! they stand and kicked, siblings in-band cannot switch back while the
//! barrier is closed. Threads leave when their stop condition clears, and
//! the last one out reopens the barrier, letting every waiter through and
//! handing back the halted siblings to release at once.

use crate::band::BandBridge;
use crate::errors::WaitError;
use crate::thread::{InfoFlags, Thread, ThreadRef};
use portable_atomic::{AtomicBool, AtomicU64, Ordering};

extern crate alloc;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// A host address space hosting real-time threads.
pub struct Process {
    pid: u64,
    name: String,
    stop_sync: StopSync,
}

impl Process {
    /// Create a process descriptor.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            stop_sync: StopSync::new(),
        })
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Barrier shared by the real-time threads of this process.
    pub fn stop_sync(&self) -> &StopSync {
        &self.stop_sync
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("stopped", &self.stop_sync.is_closed())
            .finish()
    }
}

struct Members {
    threads: Vec<ThreadRef>,
    halted: Vec<ThreadRef>,
    generation: u64,
}

/// Process-wide stop rendezvous.
///
/// Membership is mirrored by `PTJOIN` in each member's info word, which is
/// only changed under the barrier lock.
pub struct StopSync {
    closed: AtomicBool,
    generation: AtomicU64,
    members: spin::Mutex<Members>,
}

impl StopSync {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            members: spin::Mutex::new(Members {
                threads: Vec::new(),
                halted: Vec::new(),
                generation: 0,
            }),
        }
    }

    /// Whether some member is still stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of times the barrier has been reopened.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Threads currently joined.
    pub fn members(&self) -> Vec<ThreadRef> {
        self.members.lock().threads.clone()
    }

    /// Add `thread` to the pending list. Returns whether this closed the
    /// barrier.
    pub fn join(&self, thread: &ThreadRef) -> bool {
        let mut members = self.members.lock();
        if !thread.test_and_set_info(InfoFlags::PTJOIN) {
            return false;
        }
        members.threads.push(thread.clone());
        let first = members.threads.len() == 1;
        if first {
            self.closed.store(true, Ordering::Release);
            log::debug!("stop-sync closed by {}", thread.name());
        }
        first
    }

    /// Record `thread` as halted by the current closing.
    ///
    /// Returns `false`, recording nothing, once the barrier has reopened.
    /// Called with the thread locked.
    pub(crate) fn park(&self, thread: &ThreadRef) -> bool {
        let mut members = self.members.lock();
        if !self.is_closed() {
            return false;
        }
        if !members.halted.iter().any(|t| Arc::ptr_eq(t, thread)) {
            members.halted.push(thread.clone());
        }
        true
    }

    /// Remove `thread` from the pending list.
    ///
    /// Returns the siblings halted during the closing when this emptied the
    /// list and reopened the barrier, `None` otherwise.
    pub fn leave(&self, thread: &Thread) -> Option<Vec<ThreadRef>> {
        let mut members = self.members.lock();
        if !thread.info().contains(InfoFlags::PTJOIN) {
            return None;
        }
        thread.remove_info(InfoFlags::PTJOIN);
        members.threads.retain(|t| !core::ptr::eq(&**t, thread));
        if !members.threads.is_empty() {
            return None;
        }
        let halted = self.open(&mut members);
        log::debug!("stop-sync reopened by {}", thread.name());
        Some(halted)
    }

    /// Drop every member and reopen, as when the address space goes away.
    /// Returns the halted siblings.
    pub fn reset(&self) -> Vec<ThreadRef> {
        let mut members = self.members.lock();
        for thread in members.threads.drain(..) {
            thread.remove_info(InfoFlags::PTJOIN);
        }
        if self.is_closed() {
            self.open(&mut members)
        } else {
            Vec::new()
        }
    }

    fn open(&self, members: &mut Members) -> Vec<ThreadRef> {
        members.generation += 1;
        self.generation.store(members.generation, Ordering::Release);
        self.closed.store(false, Ordering::Release);
        core::mem::take(&mut members.halted)
    }

    /// Wait in-band until the barrier opens.
    ///
    /// Every waiter of a given closing is let through by the same opening,
    /// even if the barrier closes again right after.
    ///
    /// # Errors
    ///
    /// `WaitError::Restart` when interruptible and a signal is pending for
    /// `thread`.
    pub fn wait(
        &self,
        bridge: &dyn BandBridge,
        thread: &Thread,
        interruptible: bool,
    ) -> Result<(), WaitError> {
        let generation = self.generation();
        while self.is_closed() && self.generation() == generation {
            if interruptible && bridge.signal_pending(thread) {
                return Err(WaitError::Restart);
            }
            bridge.relax();
        }
        Ok(())
    }
}
