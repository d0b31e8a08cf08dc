//! Multi-level priority policy.
//!
//! One FIFO per weighted priority level; the highest non-empty level runs.
//! Real-time classes (FIFO and round-robin) share the same levels and
//! always rank above the weak class, which ranks above the idle class
//! holding the per-CPU root threads.

use super::trait_def::SchedPolicy;
use super::{CpuId, SchedClass, SchedParam};
use crate::errors::ScheduleError;
use crate::thread::{Thread, ThreadRef};

extern crate alloc;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;

const WEAK_BASE: i32 = 1;
const RT_BASE: i32 = 101;

/// Default policy: fixed priorities, FIFO within a level.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityPolicy;

/// Per-CPU queue of [`PriorityPolicy`].
#[derive(Default)]
pub struct PriorityQueue {
    cpu: CpuId,
    levels: BTreeMap<i32, VecDeque<ThreadRef>>,
    count: usize,
}

impl PriorityQueue {
    /// CPU this queue serves.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    fn level_of(&mut self, wprio: i32) -> &mut VecDeque<ThreadRef> {
        self.levels.entry(wprio).or_default()
    }

    fn remove_at(&mut self, wprio: i32, thread: &Thread) -> Option<ThreadRef> {
        let level = self.levels.get_mut(&wprio)?;
        let pos = level.iter().position(|t| core::ptr::eq(&**t, thread))?;
        let taken = level.remove(pos);
        if level.is_empty() {
            self.levels.remove(&wprio);
        }
        taken
    }
}

impl PriorityPolicy {
    /// Create the policy.
    pub const fn new() -> Self {
        Self
    }
}

impl SchedPolicy for PriorityPolicy {
    type Queue = PriorityQueue;

    fn new_queue(&self, cpu: CpuId) -> PriorityQueue {
        PriorityQueue {
            cpu,
            levels: BTreeMap::new(),
            count: 0,
        }
    }

    fn check_param(&self, param: &SchedParam) -> Result<(), ScheduleError> {
        let valid = match param.class {
            SchedClass::Fifo | SchedClass::RoundRobin => {
                (super::priority::MIN..=super::priority::MAX).contains(&param.prio)
            }
            SchedClass::Weak => (0..=super::priority::MAX).contains(&param.prio),
            // Reserved for root threads.
            SchedClass::Idle => false,
        };
        let quantum_ok = match (param.class, param.quantum) {
            (SchedClass::RoundRobin, Some(q)) => !q.is_zero(),
            (_, Some(_)) => false,
            (_, None) => true,
        };
        if valid && quantum_ok {
            Ok(())
        } else {
            Err(ScheduleError::InvalidParam {
                class: param.class,
                prio: param.prio,
            })
        }
    }

    fn weighted_prio(&self, class: SchedClass, prio: i32) -> i32 {
        match class {
            SchedClass::Fifo | SchedClass::RoundRobin => RT_BASE + prio,
            SchedClass::Weak => WEAK_BASE + prio,
            SchedClass::Idle => 0,
        }
    }

    fn enqueue(&self, queue: &mut PriorityQueue, thread: ThreadRef) {
        let wprio = thread.wprio();
        queue.level_of(wprio).push_back(thread);
        queue.count += 1;
    }

    fn requeue(&self, queue: &mut PriorityQueue, thread: ThreadRef) {
        let wprio = thread.wprio();
        queue.level_of(wprio).push_front(thread);
        queue.count += 1;
    }

    fn take(&self, queue: &mut PriorityQueue, thread: &Thread) -> Option<ThreadRef> {
        let taken = queue.remove_at(thread.wprio(), thread).or_else(|| {
            // The weighted priority moved while queued; fall back to a scan.
            let level = queue
                .levels
                .iter()
                .find(|(_, q)| q.iter().any(|t| core::ptr::eq(&**t, thread)))
                .map(|(wprio, _)| *wprio)?;
            queue.remove_at(level, thread)
        });
        if taken.is_some() {
            queue.count -= 1;
        }
        taken
    }

    fn pick(&self, queue: &PriorityQueue) -> Option<ThreadRef> {
        queue
            .levels
            .values()
            .next_back()
            .and_then(|level| level.front())
            .map(Arc::clone)
    }

    fn contains(&self, queue: &PriorityQueue, thread: &Thread) -> bool {
        queue
            .levels
            .values()
            .any(|level| level.iter().any(|t| core::ptr::eq(&**t, thread)))
    }

    fn len(&self, queue: &PriorityQueue) -> usize {
        queue.count
    }
}
