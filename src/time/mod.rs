//! Time values, clocks and the timer bases attached to them.

use portable_atomic::{AtomicU64, Ordering};

extern crate alloc;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

pub mod timer;

pub use timer::{Timer, TimerBase, TimerEvent, TimerKind, TimerTarget};

use crate::sched::CpuId;

/// Nanoseconds since the epoch of the clock which produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant(u64);

impl Instant {
    /// Create a new instant from nanoseconds since epoch.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Get nanoseconds since epoch.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Duration elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Add a duration, clamping at the end of time.
    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos()))
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Self;

    fn add(self, duration: Duration) -> Self {
        self.saturating_add(duration)
    }
}

/// A span of time in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(u64);

impl Duration {
    /// The empty duration.
    pub const ZERO: Duration = Duration(0);

    /// Create a duration from nanoseconds.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Create a duration from microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros * 1_000)
    }

    /// Create a duration from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Get nanoseconds in this duration.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Get microseconds in this duration.
    pub const fn as_micros(self) -> u64 {
        self.0 / 1_000
    }

    /// Get milliseconds in this duration.
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Whether this duration is empty.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until explicitly woken
    Infinite,
    /// Wait at most this long from now
    Relative(Duration),
    /// Wait until this date on the clock given with the timeout
    Absolute(Instant),
}

impl Timeout {
    /// Whether no timer needs arming for this timeout.
    pub fn is_infinite(&self) -> bool {
        matches!(self, Timeout::Infinite)
    }

    /// Absolute expiry date, `None` for an infinite timeout.
    pub fn deadline(&self, now: Instant) -> Option<Instant> {
        match *self {
            Timeout::Infinite => None,
            Timeout::Relative(delay) => Some(now + delay),
            Timeout::Absolute(date) => Some(date),
        }
    }
}

/// A monotonic time source, typically backed by a hardware counter.
pub trait ClockSource: Send + Sync {
    /// Read the current time.
    fn read(&self) -> Instant;

    /// Smallest interval the source can meaningfully program.
    fn resolution(&self) -> Duration {
        Duration::from_nanos(1)
    }
}

impl<T: ClockSource + ?Sized> ClockSource for alloc::sync::Arc<T> {
    fn read(&self) -> Instant {
        (**self).read()
    }

    fn resolution(&self) -> Duration {
        (**self).resolution()
    }
}

/// A clock source advanced by hand, for simulation and tests.
pub struct ManualClock {
    now: AtomicU64,
    resolution: Duration,
}

impl ManualClock {
    /// Create a clock reading `start` with a 1µs resolution.
    pub const fn new(start: Instant) -> Self {
        Self {
            now: AtomicU64::new(start.as_nanos()),
            resolution: Duration::from_micros(1),
        }
    }

    /// Override the reported resolution.
    pub fn with_resolution(mut self, resolution: Duration) -> Self {
        self.resolution = resolution;
        self
    }

    /// Move the clock forward.
    pub fn advance(&self, delta: Duration) -> Instant {
        let nanos = self.now.fetch_add(delta.as_nanos(), Ordering::AcqRel) + delta.as_nanos();
        Instant::from_nanos(nanos)
    }

    /// Set the clock to `date`; the clock never goes backwards.
    pub fn set(&self, date: Instant) {
        self.now.fetch_max(date.as_nanos(), Ordering::AcqRel);
    }
}

impl ClockSource for ManualClock {
    fn read(&self) -> Instant {
        Instant::from_nanos(self.now.load(Ordering::Acquire))
    }

    fn resolution(&self) -> Duration {
        self.resolution
    }
}

/// A clock with one timer base per CPU.
///
/// Timers armed against this clock are queued on the base of the CPU their
/// owner is bound to. The hardware backend calls back into the kernel on
/// each tick, which collects the expired timers from here.
pub struct Clock {
    name: String,
    source: Box<dyn ClockSource>,
    bases: Box<[TimerBase]>,
}

impl Clock {
    /// Create a clock over `source` with `nr_cpus` timer bases.
    pub fn new(name: impl Into<String>, source: Box<dyn ClockSource>, nr_cpus: usize) -> Self {
        let bases: Vec<TimerBase> = (0..nr_cpus.max(1)).map(TimerBase::new).collect();
        Self {
            name: name.into(),
            source,
            bases: bases.into_boxed_slice(),
        }
    }

    /// Clock name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current time.
    pub fn now(&self) -> Instant {
        self.source.read()
    }

    /// Minimum programmable interval.
    pub fn resolution(&self) -> Duration {
        self.source.resolution()
    }

    pub(crate) fn base(&self, cpu: CpuId) -> &TimerBase {
        &self.bases[cpu % self.bases.len()]
    }

    /// Number of armed timers on `cpu`.
    pub fn armed_timers(&self, cpu: CpuId) -> usize {
        self.base(cpu).len()
    }

    /// Pop every timer of `cpu` due at the current time.
    pub(crate) fn collect_expired(&self, cpu: CpuId) -> Vec<TimerEvent> {
        self.base(cpu).collect_expired(self.now())
    }
}

impl core::fmt::Debug for Clock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("now", &self.now())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_deadline() {
        let now = Instant::from_nanos(1_000);
        assert_eq!(
            Timeout::Relative(Duration::from_nanos(500)).deadline(now),
            Some(Instant::from_nanos(1_500))
        );
        assert_eq!(Timeout::Infinite.deadline(now), None);
    }

    #[test]
    fn test_manual_clock_is_monotonic() {
        let clock = ManualClock::new(Instant::from_nanos(100));
        clock.set(Instant::from_nanos(50));
        assert_eq!(clock.read(), Instant::from_nanos(100));
        assert_eq!(clock.advance(Duration::from_nanos(10)), Instant::from_nanos(110));
    }

    #[test]
    fn test_saturating_arithmetic() {
        let late = Instant::from_nanos(10);
        assert_eq!(late.saturating_duration_since(Instant::from_nanos(20)), Duration::ZERO);
        assert_eq!(Instant::from_nanos(u64::MAX) + Duration::from_millis(1), Instant::from_nanos(u64::MAX));
    }
}
