//! Scheduling policy trait.

use super::{CpuId, SchedClass, SchedParam};
use crate::errors::ScheduleError;
use crate::thread::{Thread, ThreadRef};

/// Pluggable ordering strategy for runnable threads.
///
/// The policy owns one queue per run queue and decides which runnable
/// thread comes first. It never changes thread state: the core calls it
/// with the owning run queue locked, after it has decided a thread must
/// enter or leave the runnable population.
///
/// Ordering is by weighted priority (see [`Thread::wprio`]); ties are broken
/// by enqueue order. The running thread stays queued while it runs.
pub trait SchedPolicy: Send + Sync + 'static {
    /// Per-CPU queue of runnable threads.
    type Queue: Send;

    /// Build the queue for `cpu`.
    fn new_queue(&self, cpu: CpuId) -> Self::Queue;

    /// Validate a class/priority combination.
    ///
    /// # Errors
    ///
    /// `ScheduleError::InvalidParam` when the priority is out of range for
    /// the class or the class cannot be requested by callers.
    fn check_param(&self, param: &SchedParam) -> Result<(), ScheduleError>;

    /// Map a class and effective priority to a weighted priority.
    ///
    /// Weighted priorities are comparable across classes.
    fn weighted_prio(&self, class: SchedClass, prio: i32) -> i32;

    /// Parameters of the weakest class, used to demote a thread.
    fn weakest(&self) -> SchedParam {
        SchedParam::weak(0)
    }

    /// Insert at the tail of the thread's priority group.
    fn enqueue(&self, queue: &mut Self::Queue, thread: ThreadRef);

    /// Insert at the head of the thread's priority group.
    fn requeue(&self, queue: &mut Self::Queue, thread: ThreadRef);

    /// Remove a thread. Returns whether it was queued.
    fn dequeue(&self, queue: &mut Self::Queue, thread: &Thread) -> bool {
        self.take(queue, thread).is_some()
    }

    /// Highest ranked runnable thread, left in place.
    fn pick(&self, queue: &Self::Queue) -> Option<ThreadRef>;

    /// Move a queued thread to the tail of its priority group.
    ///
    /// Used when a round-robin quantum expires.
    fn rotate(&self, queue: &mut Self::Queue, thread: &Thread) {
        if let Some(thread) = self.take(queue, thread) {
            self.enqueue(queue, thread);
        }
    }

    /// Remove a thread and hand back the queued reference.
    fn take(&self, queue: &mut Self::Queue, thread: &Thread) -> Option<ThreadRef>;

    /// Whether the thread is queued.
    fn contains(&self, queue: &Self::Queue, thread: &Thread) -> bool;

    /// Number of queued threads.
    fn len(&self, queue: &Self::Queue) -> usize;
}
