//! One-shot and periodic timers queued on per-CPU timer bases.
//!
//! Lock order is timer state first, then the timer base queue. Expiry pops
//! entries under the base lock only and hands [`TimerEvent`]s back to the
//! kernel, which resolves each event to its timer and calls
//! [`Timer::expire`] without holding the base lock.

use super::{Clock, Duration, Instant};
use crate::sched::CpuId;
use crate::thread::Thread;
use portable_atomic::{AtomicU64, Ordering};

extern crate alloc;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Which of a thread's timers an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Generic timeout timer backing `DELAY` and timed `PEND`
    Resource,
    /// Periodic release timer backing `WAIT`
    Periodic,
}

/// Owner of a timer, used to route expiry events.
#[derive(Debug, Clone)]
pub enum TimerTarget {
    /// One of the timers embedded in a thread control block
    Thread(Weak<Thread>, TimerKind),
    /// The round-robin timer of a run queue
    RunQueue(CpuId),
}

/// An expired timer entry, popped from a base.
#[derive(Debug, Clone)]
pub struct TimerEvent {
    pub(crate) target: TimerTarget,
    pub(crate) seq: u64,
}

struct Armed {
    clock: Arc<Clock>,
    cpu: CpuId,
    date: Instant,
    seq: u64,
}

#[derive(Default)]
struct TimerState {
    armed: Option<Armed>,
    /// Bumped on every start and stop; expiry events carry the value seen
    /// when they fired so stale events can be told apart.
    gen: u64,
    interval: Option<Duration>,
    start_date: Instant,
    pexpect_ticks: u64,
    fired: u64,
}

/// A timer bound to a single owner.
pub struct Timer {
    target: TimerTarget,
    state: spin::Mutex<TimerState>,
}

impl Timer {
    /// Create an idle timer for `target`.
    pub fn new(target: TimerTarget) -> Self {
        Self {
            target,
            state: spin::Mutex::new(TimerState::default()),
        }
    }

    /// Arm a one-shot expiry at `date`.
    pub fn start_oneshot(&self, clock: &Arc<Clock>, cpu: CpuId, date: Instant) {
        let mut st = self.state.lock();
        self.dequeue(&mut st);
        st.gen = st.gen.wrapping_add(1);
        st.interval = None;
        st.start_date = date;
        st.pexpect_ticks = 0;
        st.fired = 0;
        self.enqueue(&mut st, clock.clone(), cpu, date);
    }

    /// Arm a periodic timer whose period starts at `idate`.
    ///
    /// Releases happen at `idate + k * period` for `k >= 1`.
    pub fn start_periodic(&self, clock: &Arc<Clock>, cpu: CpuId, idate: Instant, period: Duration) {
        let mut st = self.state.lock();
        self.dequeue(&mut st);
        st.gen = st.gen.wrapping_add(1);
        st.interval = Some(period);
        st.start_date = idate;
        st.pexpect_ticks = 0;
        st.fired = 0;
        self.enqueue(&mut st, clock.clone(), cpu, idate + period);
    }

    /// Disarm the timer. Stale expiry events become no-ops.
    pub fn stop(&self) {
        let mut st = self.state.lock();
        self.dequeue(&mut st);
        st.gen = st.gen.wrapping_add(1);
        st.interval = None;
    }

    /// Whether the timer is armed.
    pub fn is_running(&self) -> bool {
        self.state.lock().armed.is_some()
    }

    /// Whether the timer reloads itself.
    pub fn is_periodic(&self) -> bool {
        self.state.lock().interval.is_some()
    }

    /// Current arming generation.
    pub fn generation(&self) -> u64 {
        self.state.lock().gen
    }

    /// Next expiry date, if armed.
    pub fn date(&self) -> Option<Instant> {
        self.state.lock().armed.as_ref().map(|a| a.date)
    }

    /// Reload interval, if periodic.
    pub fn interval(&self) -> Option<Duration> {
        self.state.lock().interval
    }

    /// Clock the timer is armed against.
    pub fn clock(&self) -> Option<Arc<Clock>> {
        self.state.lock().armed.as_ref().map(|a| a.clock.clone())
    }

    /// Time left before the next expiry, zero if overdue or idle.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.state.lock().armed.as_ref() {
            Some(armed) => armed.date.saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Number of periods elapsed since the timer was started.
    pub fn fired(&self) -> u64 {
        self.state.lock().fired
    }

    /// Release date the periodic waiter expects next.
    pub fn pexpect(&self) -> Option<Instant> {
        let st = self.state.lock();
        let interval = st.interval?;
        Some(Self::release_date(&st, interval, st.pexpect_ticks))
    }

    /// Account for the releases missed since the last call.
    ///
    /// Returns how many releases were skipped and advances the expected
    /// release by one period plus that count. The timer's own reload date
    /// is not touched.
    pub fn take_overruns(&self, now: Instant) -> u64 {
        let mut st = self.state.lock();
        let Some(interval) = st.interval else {
            return 0;
        };
        let expected = Self::release_date(&st, interval, st.pexpect_ticks);
        let mut overruns = 0;
        if now >= expected && !interval.is_zero() {
            overruns = now.saturating_duration_since(expected).as_nanos() / interval.as_nanos();
            st.pexpect_ticks += overruns;
        }
        st.pexpect_ticks += 1;
        overruns
    }

    /// Handle an expiry event popped from a base.
    ///
    /// Returns the generation the timer had when it fired, or `None` when
    /// the event is stale (timer restarted or stopped since it was queued).
    /// Periodic timers are reloaded past `now`.
    pub(crate) fn expire(&self, seq: u64, now: Instant) -> Option<u64> {
        let mut st = self.state.lock();
        match st.armed.as_ref() {
            Some(armed) if armed.seq == seq => {}
            _ => return None,
        }
        let gen = st.gen;
        let Some(armed) = st.armed.take() else {
            return None;
        };
        if let Some(interval) = st.interval.filter(|i| !i.is_zero()) {
            let late = now.saturating_duration_since(armed.date).as_nanos();
            let periods = late / interval.as_nanos() + 1;
            st.fired += periods;
            let next = armed.date + Duration::from_nanos(periods * interval.as_nanos());
            self.enqueue(&mut st, armed.clock, armed.cpu, next);
        } else {
            st.fired += 1;
        }
        Some(gen)
    }

    /// Move the timer to the base of `cpu`, keeping its date.
    pub(crate) fn migrate(&self, cpu: CpuId) {
        let mut st = self.state.lock();
        let Some(armed) = st.armed.as_ref() else {
            return;
        };
        if armed.cpu == cpu {
            return;
        }
        let (clock, date) = (armed.clock.clone(), armed.date);
        self.dequeue(&mut st);
        self.enqueue(&mut st, clock, cpu, date);
    }

    fn release_date(st: &TimerState, interval: Duration, ticks: u64) -> Instant {
        st.start_date + Duration::from_nanos(interval.as_nanos().saturating_mul(ticks + 1))
    }

    fn enqueue(&self, st: &mut TimerState, clock: Arc<Clock>, cpu: CpuId, date: Instant) {
        let seq = next_seq();
        clock.base(cpu).insert(date, seq, self.target.clone());
        st.armed = Some(Armed { clock, cpu, date, seq });
    }

    fn dequeue(&self, st: &mut TimerState) {
        if let Some(armed) = st.armed.take() {
            armed.clock.base(armed.cpu).remove(armed.date, armed.seq);
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if let Some(armed) = st.armed.take() {
            armed.clock.base(armed.cpu).remove(armed.date, armed.seq);
        }
    }
}

impl core::fmt::Debug for Timer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Timer")
            .field("date", &st.armed.as_ref().map(|a| a.date))
            .field("interval", &st.interval)
            .field("gen", &st.gen)
            .finish()
    }
}

/// Date-ordered queue of armed timers for one CPU.
pub struct TimerBase {
    cpu: CpuId,
    queue: spin::Mutex<BTreeMap<(Instant, u64), TimerTarget>>,
}

impl TimerBase {
    /// Create an empty base for `cpu`.
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            queue: spin::Mutex::new(BTreeMap::new()),
        }
    }

    /// CPU this base serves.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether no timer is armed.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Earliest expiry date.
    pub fn next_date(&self) -> Option<Instant> {
        self.queue.lock().keys().next().map(|(date, _)| *date)
    }

    fn insert(&self, date: Instant, seq: u64, target: TimerTarget) {
        self.queue.lock().insert((date, seq), target);
    }

    fn remove(&self, date: Instant, seq: u64) {
        self.queue.lock().remove(&(date, seq));
    }

    pub(crate) fn collect_expired(&self, now: Instant) -> Vec<TimerEvent> {
        let mut queue = self.queue.lock();
        let mut events = Vec::new();
        while let Some(entry) = queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, seq), target) = entry.remove_entry();
            events.push(TimerEvent { target, seq });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use alloc::boxed::Box;

    fn clock() -> (Arc<Clock>, Arc<ManualClock>) {
        let source = Arc::new(ManualClock::new(Instant::from_nanos(0)));
        (Arc::new(Clock::new("test", Box::new(source.clone()), 2)), source)
    }

    fn expire_all(clock: &Clock, timer: &Timer, cpu: CpuId) -> usize {
        let now = clock.now();
        clock
            .collect_expired(cpu)
            .into_iter()
            .filter(|ev| timer.expire(ev.seq, now).is_some())
            .count()
    }

    #[test]
    fn test_oneshot_fires_once() {
        let (clock, source) = clock();
        let timer = Timer::new(TimerTarget::RunQueue(0));
        timer.start_oneshot(&clock, 0, Instant::from_nanos(100));
        assert_eq!(expire_all(&clock, &timer, 0), 0);
        source.advance(Duration::from_nanos(100));
        assert_eq!(expire_all(&clock, &timer, 0), 1);
        assert!(!timer.is_running());
        assert_eq!(clock.armed_timers(0), 0);
    }

    #[test]
    fn test_stopped_timer_event_is_stale() {
        let (clock, source) = clock();
        let timer = Timer::new(TimerTarget::RunQueue(0));
        timer.start_oneshot(&clock, 0, Instant::from_nanos(10));
        source.advance(Duration::from_nanos(20));
        let events = clock.collect_expired(0);
        timer.stop();
        assert_eq!(events.len(), 1);
        assert!(timer.expire(events[0].seq, clock.now()).is_none());
    }

    #[test]
    fn test_periodic_reload_skips_missed_periods() {
        let (clock, source) = clock();
        let timer = Timer::new(TimerTarget::RunQueue(1));
        timer.start_periodic(&clock, 1, Instant::from_nanos(0), Duration::from_nanos(10));
        assert_eq!(timer.date(), Some(Instant::from_nanos(10)));
        source.advance(Duration::from_nanos(35));
        assert_eq!(expire_all(&clock, &timer, 1), 1);
        assert_eq!(timer.fired(), 3);
        assert_eq!(timer.date(), Some(Instant::from_nanos(40)));
    }

    #[test]
    fn test_overruns_do_not_move_reload_date() {
        let (clock, _source) = clock();
        let timer = Timer::new(TimerTarget::RunQueue(0));
        timer.start_periodic(&clock, 0, Instant::from_nanos(0), Duration::from_nanos(10));
        assert_eq!(timer.take_overruns(Instant::from_nanos(20)), 1);
        assert_eq!(timer.pexpect(), Some(Instant::from_nanos(30)));
        assert_eq!(timer.date(), Some(Instant::from_nanos(10)));
        assert_eq!(timer.take_overruns(Instant::from_nanos(30)), 0);
    }

    #[test]
    fn test_migrate_moves_between_bases() {
        let (clock, _source) = clock();
        let timer = Timer::new(TimerTarget::RunQueue(0));
        timer.start_oneshot(&clock, 0, Instant::from_nanos(50));
        timer.migrate(1);
        assert_eq!(clock.armed_timers(0), 0);
        assert_eq!(clock.armed_timers(1), 1);
        assert_eq!(timer.date(), Some(Instant::from_nanos(50)));
    }
}
