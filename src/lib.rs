#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Thread lifecycle and scheduling-state core for a dual-kernel real-time
//! stage.
//!
//! Threads live either in-band, scheduled by the host kernel, or
//! out-of-band, scheduled by the fixed-priority policy of this crate. The
//! core keeps each thread's state word consistent with run-queue
//! membership, drives timed, periodic and channel waits, moves threads
//! between the two stages, and carries cancellation through to a single,
//! complete teardown.
//!
//! The host side plugs in through [`BandBridge`]; time comes from a
//! [`ClockSource`].
//!
//! # Quick Start
//!
//! ```ignore
//! use dualband_threads::{Kernel, KernelConfig, PriorityPolicy, SchedParam, ThreadBuilder};
//! use alloc::sync::Arc;
//!
//! let kernel = Arc::new(Kernel::new(
//!     KernelConfig::new().with_cpus(2),
//!     PriorityPolicy::new(),
//!     bridge,
//!     Box::new(clock_source),
//! ));
//!
//! let handle = ThreadBuilder::new()
//!     .name("sampler")
//!     .param(SchedParam::fifo(80))
//!     .spawn(&kernel, |ctx| {
//!         ctx.set_period(None, Duration::from_millis(1))?;
//!         loop {
//!             ctx.wait_period()?;
//!             /* cyclic work */
//!         }
//!     })?;
//!
//! handle.cancel();
//! handle.join()?;
//! ```
//!
//! # Locking
//!
//! Every transition runs under a [`LockedThread`] token: interrupts off,
//! thread lock, then run-queue lock. Wait queues are locked before threads.

pub mod band;
pub mod cancel;
pub mod config;
pub mod errors;
pub mod kernel;
pub mod process;
pub mod registry;
pub mod sched;
pub mod signal;
pub mod thread;
pub mod time;
pub mod wait;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests;

extern crate alloc;

// ============================================================================
// Public API
// ============================================================================

// Kernel
pub use config::KernelConfig;
pub use kernel::Kernel;

// Host side
pub use band::{BandBridge, BandEvent};
pub use process::{Process, StopSync};
pub use signal::{HmCause, SigInfo, SIGDEBUG};

// Scheduling
pub use sched::{
    priority, CpuId, CpuSet, DefaultPolicy, LockedThread, PriorityPolicy, RunQueue, SchedClass,
    SchedParam, SchedPolicy,
};

// Threads
pub use thread::{
    Completion, InfoFlags, KthreadContext, StateFlags, Thread, ThreadAttrs, ThreadBuilder,
    ThreadHandle, ThreadId, ThreadRef, ThreadSnapshot,
};
pub use wait::{WaitChannel, WaitQueue};

// Time
pub use time::{Clock, ClockSource, Duration, Instant, ManualClock, Timeout};

// Errors
pub use errors::{
    BandError, InvalidOperationError, JoinError, ResourceError, ScheduleError, SpawnError,
    ThreadError, ThreadResult, TimerError, WaitError,
};
