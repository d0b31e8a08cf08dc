//! Scheduling placement, parameters and the pluggable policy.
//!
//! The policy only orders runnable threads; every state transition around
//! it lives in [`transition`], under the lock pair provided by [`rq`].

pub mod prio;
pub mod rq;
pub mod trait_def;
pub mod transition;

pub use prio::PriorityPolicy;
pub use rq::{LockedThread, RunQueue, RunQueueStats};
pub use trait_def::SchedPolicy;

use crate::time::Duration;

/// CPU identifier type.
pub type CpuId = usize;

/// Default scheduling policy.
pub type DefaultPolicy = PriorityPolicy;

/// A set of CPUs, one bit per CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuSet(u64);

impl CpuSet {
    /// Maximum number of CPUs a set can describe.
    pub const MAX_CPUS: usize = 64;

    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every CPU.
    pub const fn all() -> Self {
        Self(u64::MAX)
    }

    /// A set holding `cpu` only.
    pub const fn single(cpu: CpuId) -> Self {
        Self(1 << (cpu % Self::MAX_CPUS))
    }

    /// Build a set from a raw mask.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw mask.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether `cpu` belongs to the set.
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu < Self::MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    /// Whether the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Restrict the set to the first `nr_cpus` CPUs.
    pub const fn online(self, nr_cpus: usize) -> Self {
        if nr_cpus >= Self::MAX_CPUS {
            self
        } else {
            Self(self.0 & ((1u64 << nr_cpus) - 1))
        }
    }

    /// Lowest CPU in the set.
    pub fn first(self) -> Option<CpuId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as CpuId)
        }
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Scheduling classes known to the core.
///
/// The ordering between classes and the legal priority range of each are
/// defined by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedClass {
    /// Fixed priority, first in first out within a priority level
    Fifo,
    /// Fixed priority with a time quantum
    RoundRobin,
    /// Below every real-time class, used for demoted threads
    Weak,
    /// Placeholder class of the per-CPU root threads
    Idle,
}

/// Class and priority of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedParam {
    /// Scheduling class
    pub class: SchedClass,
    /// Base priority within the class
    pub prio: i32,
    /// Round-robin quantum; `None` picks the kernel default
    pub quantum: Option<Duration>,
}

impl SchedParam {
    /// FIFO parameters at `prio`.
    pub const fn fifo(prio: i32) -> Self {
        Self {
            class: SchedClass::Fifo,
            prio,
            quantum: None,
        }
    }

    /// Round-robin parameters at `prio` with an optional quantum.
    pub const fn round_robin(prio: i32, quantum: Option<Duration>) -> Self {
        Self {
            class: SchedClass::RoundRobin,
            prio,
            quantum,
        }
    }

    /// Weak class parameters at `prio`.
    pub const fn weak(prio: i32) -> Self {
        Self {
            class: SchedClass::Weak,
            prio,
            quantum: None,
        }
    }

    /// Idle class parameters.
    pub const fn idle() -> Self {
        Self {
            class: SchedClass::Idle,
            prio: 0,
            quantum: None,
        }
    }
}

impl Default for SchedParam {
    fn default() -> Self {
        Self::fifo(priority::NORMAL)
    }
}

/// Priority levels for the real-time classes.
///
/// These are convenience constants for common priority levels.
pub mod priority {
    /// Lowest real-time priority
    pub const MIN: i32 = 1;

    /// Low priority - background real-time work
    pub const LOW: i32 = 10;

    /// Normal priority - default for new threads
    pub const NORMAL: i32 = 50;

    /// High priority - latency-critical work
    pub const HIGH: i32 = 80;

    /// Highest real-time priority
    pub const MAX: i32 = 99;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpuset_online_restriction() {
        let set = CpuSet::from_bits(0b1010);
        assert_eq!(set.online(2), CpuSet::from_bits(0b10));
        assert_eq!(set.first(), Some(1));
        assert!(CpuSet::from_bits(0b1000).online(3).is_empty());
    }

    #[test]
    fn test_cpuset_contains() {
        let set = CpuSet::single(3);
        assert!(set.contains(3));
        assert!(!set.contains(2));
        assert!(!CpuSet::all().contains(CpuSet::MAX_CPUS));
    }
}
