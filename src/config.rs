//! Kernel configuration.

use crate::sched::{CpuSet, SchedClass, SchedParam};
use crate::time::Duration;

extern crate alloc;
use alloc::string::String;

/// Tunables fixed when the kernel is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of run queues and per-CPU timer bases
    pub nr_cpus: usize,
    /// Maximum number of registered threads
    pub max_threads: usize,
    /// Bound of the deferred-signal queue
    pub signal_queue_depth: usize,
    /// Quantum given to round-robin threads which did not pick one
    pub default_rr_quantum: Duration,
    /// Name of the kernel clock
    pub clock_name: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 1,
            max_threads: 256,
            signal_queue_depth: 64,
            default_rr_quantum: Duration::from_millis(10),
            clock_name: String::from("monotonic"),
        }
    }
}

impl KernelConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CPU count, clamped to `1..=CpuSet::MAX_CPUS`.
    pub fn with_cpus(mut self, nr_cpus: usize) -> Self {
        self.nr_cpus = nr_cpus.clamp(1, CpuSet::MAX_CPUS);
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_signal_queue_depth(mut self, depth: usize) -> Self {
        self.signal_queue_depth = depth.max(1);
        self
    }

    pub fn with_rr_quantum(mut self, quantum: Duration) -> Self {
        if !quantum.is_zero() {
            self.default_rr_quantum = quantum;
        }
        self
    }

    pub fn with_clock_name(mut self, name: impl Into<String>) -> Self {
        self.clock_name = name.into();
        self
    }

    /// Fill in the defaults a parameter set leaves open.
    pub fn normalize_param(&self, mut param: SchedParam) -> SchedParam {
        if param.class == SchedClass::RoundRobin && param.quantum.is_none() {
            param.quantum = Some(self.default_rr_quantum);
        }
        param
    }
}
