//! Error handling for the thread core.
//!
//! Three families of outcome flow through these types:
//! usage errors (rejected synchronously, no state mutated), contention
//! outcomes (`WaitError`, ordinary results callers branch on) and
//! resource failures raised while building a thread. Invariant violations
//! are not errors: they are logged and the offending call is a no-op.

#![allow(clippy::uninlined_format_args)]

use core::fmt;

use crate::sched::SchedClass;

/// Result type for thread core operations.
pub type ThreadResult<T> = Result<T, ThreadError>;

/// Error type for all thread core operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    /// Thread construction errors
    Spawn(SpawnError),
    /// Join errors
    Join(JoinError),
    /// Scheduling parameter errors
    Schedule(ScheduleError),
    /// Outcome of a wait that did not complete normally
    Wait(WaitError),
    /// Timer configuration errors
    Timer(TimerError),
    /// Execution band errors
    Band(BandError),
    /// Resource limit errors
    Resource(ResourceError),
    /// Invalid operation errors
    InvalidOperation(InvalidOperationError),
    /// The calling thread observed its own cancellation and has been retired
    Cancelled,
}

/// Errors that can occur while building a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// Maximum number of threads reached
    TooManyThreads,
    /// Initial CPU does not exist
    InvalidCpu(usize),
    /// Affinity names no existing CPU
    InvalidAffinity(u64),
    /// The host refused to raise the capabilities a real-time thread needs
    CapsDenied,
    /// The host could not start the backing task
    HostSpawnFailed,
    /// Thread name is empty or too long
    InvalidName,
}

/// Errors that can occur while joining a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// A thread cannot join itself
    SelfJoin,
    /// An interruptible join was broken by a signal
    Interrupted,
}

/// Errors related to scheduling parameters and placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Class and priority do not form a valid combination
    InvalidParam {
        /// Requested class
        class: SchedClass,
        /// Requested priority
        prio: i32,
    },
    /// Affinity set is empty or names no existing CPU
    InvalidAffinity(u64),
}

/// Contention outcomes of a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The timeout elapsed
    TimedOut,
    /// The wait was broken by a kick, an unblock or a cancellation
    Interrupted,
    /// The wait channel was deleted while waiting
    Removed,
    /// A periodic release was missed this many times
    Overrun(u64),
    /// A signal arrived; the caller should restart the operation
    Restart,
    /// Waiting for a period without having set one
    NotPeriodic,
}

/// Timer configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    /// Period is shorter than the clock resolution
    PeriodTooShort,
}

/// Errors raised by the execution band transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandError {
    /// The bridge could not move the thread to the real-time stage
    SwitchFailed,
    /// The caller runs on the wrong stage for this operation
    WrongBand,
    /// A signal is pending for the caller
    SignalPending,
}

/// Resource limit errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// A bounded queue is full
    QueueFull,
}

/// Invalid operation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidOperationError {
    /// A mode mask contains bits outside the mode set
    InvalidMode(u32),
    /// Operation on a thread which has already been retired
    Zombie,
    /// Operation called in wrong state
    WrongState,
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadError::Spawn(e) => write!(f, "Thread spawn error: {}", e),
            ThreadError::Join(e) => write!(f, "Thread join error: {}", e),
            ThreadError::Schedule(e) => write!(f, "Scheduling error: {}", e),
            ThreadError::Wait(e) => write!(f, "Wait error: {}", e),
            ThreadError::Timer(e) => write!(f, "Timer error: {}", e),
            ThreadError::Band(e) => write!(f, "Band error: {}", e),
            ThreadError::Resource(e) => write!(f, "Resource error: {}", e),
            ThreadError::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            ThreadError::Cancelled => write!(f, "Thread was cancelled"),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::TooManyThreads => write!(f, "Maximum number of threads reached"),
            SpawnError::InvalidCpu(cpu) => write!(f, "Invalid initial CPU: {}", cpu),
            SpawnError::InvalidAffinity(mask) => write!(f, "Invalid CPU affinity: {:#x}", mask),
            SpawnError::CapsDenied => write!(f, "Host refused real-time capabilities"),
            SpawnError::HostSpawnFailed => write!(f, "Host could not start the backing task"),
            SpawnError::InvalidName => write!(f, "Invalid thread name"),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::SelfJoin => write!(f, "Thread cannot join itself"),
            JoinError::Interrupted => write!(f, "Join interrupted by a signal"),
        }
    }
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::InvalidParam { class, prio } => {
                write!(f, "Invalid priority {} for class {:?}", prio, class)
            }
            ScheduleError::InvalidAffinity(mask) => write!(f, "Invalid CPU affinity: {:#x}", mask),
        }
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::TimedOut => write!(f, "Wait timed out"),
            WaitError::Interrupted => write!(f, "Wait interrupted"),
            WaitError::Removed => write!(f, "Wait channel removed"),
            WaitError::Overrun(count) => write!(f, "Missed {} periodic release(s)", count),
            WaitError::Restart => write!(f, "Signal pending, restart required"),
            WaitError::NotPeriodic => write!(f, "No period set for this thread"),
        }
    }
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::PeriodTooShort => write!(f, "Period shorter than clock resolution"),
        }
    }
}

impl fmt::Display for BandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandError::SwitchFailed => write!(f, "Out-of-band switch failed"),
            BandError::WrongBand => write!(f, "Operation not allowed from this execution stage"),
            BandError::SignalPending => write!(f, "Signal pending"),
        }
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::QueueFull => write!(f, "Queue is full"),
        }
    }
}

impl fmt::Display for InvalidOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidOperationError::InvalidMode(mask) => write!(f, "Invalid mode mask: {:#x}", mask),
            InvalidOperationError::Zombie => write!(f, "Thread already retired"),
            InvalidOperationError::WrongState => write!(f, "Operation called in wrong state"),
        }
    }
}

// Conversion implementations for ergonomic error handling

impl From<SpawnError> for ThreadError {
    fn from(error: SpawnError) -> Self {
        ThreadError::Spawn(error)
    }
}

impl From<JoinError> for ThreadError {
    fn from(error: JoinError) -> Self {
        ThreadError::Join(error)
    }
}

impl From<ScheduleError> for ThreadError {
    fn from(error: ScheduleError) -> Self {
        ThreadError::Schedule(error)
    }
}

impl From<WaitError> for ThreadError {
    fn from(error: WaitError) -> Self {
        ThreadError::Wait(error)
    }
}

impl From<TimerError> for ThreadError {
    fn from(error: TimerError) -> Self {
        ThreadError::Timer(error)
    }
}

impl From<BandError> for ThreadError {
    fn from(error: BandError) -> Self {
        ThreadError::Band(error)
    }
}

impl From<ResourceError> for ThreadError {
    fn from(error: ResourceError) -> Self {
        ThreadError::Resource(error)
    }
}

impl From<InvalidOperationError> for ThreadError {
    fn from(error: InvalidOperationError) -> Self {
        ThreadError::InvalidOperation(error)
    }
}

impl ThreadError {
    /// Whether this is a contention outcome rather than a failure.
    pub fn is_contention(&self) -> bool {
        matches!(self, ThreadError::Wait(_))
    }

    /// Whether the caller may simply retry the operation.
    pub fn is_restart(&self) -> bool {
        matches!(
            self,
            ThreadError::Wait(WaitError::Restart) | ThreadError::Band(BandError::SignalPending)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display_nests_inner_error() {
        let err: ThreadError = WaitError::Overrun(3).into();
        assert_eq!(err.to_string(), "Wait error: Missed 3 periodic release(s)");
    }

    #[test]
    fn test_contention_classification() {
        assert!(ThreadError::from(WaitError::TimedOut).is_contention());
        assert!(!ThreadError::from(JoinError::SelfJoin).is_contention());
        assert!(ThreadError::from(BandError::SignalPending).is_restart());
        assert!(!ThreadError::Cancelled.is_restart());
    }

    #[test]
    fn test_spawn_failures_render_their_cause() {
        let cases = [
            (SpawnError::InvalidCpu(7), "Thread spawn error: Invalid initial CPU: 7"),
            (SpawnError::InvalidAffinity(0), "Thread spawn error: Invalid CPU affinity: 0x0"),
            (SpawnError::CapsDenied, "Thread spawn error: Host refused real-time capabilities"),
        ];
        for (err, text) in cases {
            assert_eq!(ThreadError::from(err).to_string(), text);
        }
        let mode: ThreadError = InvalidOperationError::InvalidMode(0x40).into();
        assert!(mode.to_string().ends_with("Invalid mode mask: 0x40"));
    }
}
