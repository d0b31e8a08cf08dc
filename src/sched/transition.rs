//! State transitions of a locked thread.
//!
//! None of these yield the CPU: they mark the new state and flag the run
//! queue for rescheduling, leaving the context switch to the caller.
//! Illegal masks and mutations of a retired thread are logged and ignored.

use super::rq::LockedThread;
use super::trait_def::SchedPolicy;
use super::{SchedClass, SchedParam};
use crate::errors::{InvalidOperationError, ThreadResult, WaitError};
use crate::thread::{Boost, InfoFlags, StateFlags, ThreadId};
use crate::time::{Clock, Timeout};
use crate::wait::WaitChannel;

extern crate alloc;
use alloc::sync::Arc;

impl<S: SchedPolicy> LockedThread<'_, S> {
    fn refuse_zombie(&self, op: &str) -> bool {
        if self.thread.is_zombie() {
            log::error!("{op} on retired thread {}", self.thread.name());
            true
        } else {
            false
        }
    }

    /// Put the thread to sleep, optionally on a wait channel.
    ///
    /// A finite timeout arms the resource timer and sets `DELAY`; a wait
    /// channel sets `PEND`. With neither, the thread waits (`WAIT`) for its
    /// periodic release. A thread kicked or cancelled while running does
    /// not sleep: it gets `BREAK` so the caller returns at once. An absolute timeout
    /// already in the past yields `TIMEO` without blocking.
    pub fn sleep_on(
        &mut self,
        timeout: Timeout,
        clock: &Arc<Clock>,
        wchan: Option<Arc<dyn WaitChannel>>,
    ) {
        let thread = self.thread;
        if self.refuse_zombie("sleep_on") {
            return;
        }
        let oldstate = thread.state();
        if oldstate.intersects(StateFlags::INBAND | StateFlags::ROOT) {
            log::error!("sleep_on: {} cannot block out-of-band ({oldstate:?})", thread.name());
            return;
        }

        if !oldstate.is_blocked() {
            if thread.info().intersects(InfoFlags::KICKED | InfoFlags::CANCELD) {
                thread.remove_info(InfoFlags::RMID | InfoFlags::TIMEO);
                thread.insert_info(InfoFlags::BREAK);
                return;
            }
            thread.remove_info(InfoFlags::WAKE_REASONS);
        }

        let now = clock.now();
        let mut block = StateFlags::empty();
        match timeout.deadline(now) {
            Some(date) if date <= now && matches!(timeout, Timeout::Absolute(_)) => {
                thread.insert_info(InfoFlags::TIMEO);
                return;
            }
            Some(date) => {
                thread.rtimer.start_oneshot(clock, self.core.cpu, date);
                block |= StateFlags::DELAY;
            }
            None if wchan.is_none() => block |= StateFlags::WAIT,
            None => {}
        }

        if let Some(wchan) = wchan {
            self.core.wchan = Some(wchan);
            block |= StateFlags::PEND;
        }

        self.dequeue();
        thread.insert_state(block);
        log::trace!("{} sleeps on {block:?} ({timeout:?})", thread.name());
        self.check();
    }

    /// Clear the wait conditions of `mask` which the thread is blocked on.
    ///
    /// Clearing `PEND` also clears `DELAY` and detaches the wait channel.
    /// The thread becomes runnable once no blocking condition remains.
    pub fn wakeup(&mut self, mask: StateFlags, info: InfoFlags) {
        let thread = self.thread;
        if !StateFlags::WAKE_MASK.contains(mask) {
            log::error!("wakeup: illegal mask {mask:?} for {}", thread.name());
            return;
        }
        if self.refuse_zombie("wakeup") {
            return;
        }
        let oldstate = thread.state();
        let mut clear = oldstate & mask;
        if clear.is_empty() {
            return;
        }
        if clear.contains(StateFlags::PEND) {
            clear |= oldstate & StateFlags::DELAY;
            self.core.wchan = None;
        }
        if clear.intersects(StateFlags::DELAY | StateFlags::PEND) {
            thread.rtimer.stop();
        }
        thread.remove_state(clear);
        thread.insert_info(info);

        if !thread.state().is_blocked() {
            self.enqueue(false);
        }
        if self.kernel.bridge.current_cpu() != self.core.cpu {
            thread.stats().count_remote_wakeup();
        }
        log::trace!("{} woken from {clear:?} ({info:?})", thread.name());
        self.check();
        self.kernel.bridge.resume(thread);
    }

    /// Suspend the thread on `mask` (a subset of `SUSP|HALT|DORMANT`).
    ///
    /// # Errors
    ///
    /// `WaitError::Interrupted` without blocking when an out-of-band thread
    /// has a pending band switch, or was kicked or cancelled before a
    /// `SUSP` hold.
    pub fn hold(&mut self, mask: StateFlags) -> Result<(), WaitError> {
        let thread = self.thread;
        if mask.is_empty() || !StateFlags::HOLD_MASK.contains(mask) {
            log::error!("hold: illegal mask {mask:?} for {}", thread.name());
            return Ok(());
        }
        if self.refuse_zombie("hold") {
            return Ok(());
        }
        let oldstate = thread.state();
        if !oldstate.contains(StateFlags::INBAND) {
            let kicked = mask.contains(StateFlags::SUSP)
                && thread.info().intersects(InfoFlags::KICKED | InfoFlags::CANCELD);
            if kicked || self.kernel.bridge.switch_pending(thread) {
                thread.remove_info(InfoFlags::RMID | InfoFlags::TIMEO);
                thread.insert_info(InfoFlags::BREAK);
                return Err(WaitError::Interrupted);
            }
        }
        if !oldstate.is_blocked() {
            thread.remove_info(InfoFlags::RMID | InfoFlags::TIMEO);
        }
        self.dequeue();
        thread.insert_state(mask);
        log::trace!("{} held on {mask:?}", thread.name());
        self.check();
        Ok(())
    }

    /// Lift the holds of `mask`.
    ///
    /// Threads released from `HALT` or from a stop rendezvous go back to the
    /// head of their priority group, others to the tail.
    pub fn release(&mut self, mask: StateFlags, info: InfoFlags) {
        let thread = self.thread;
        if !StateFlags::HOLD_MASK.contains(mask) {
            log::error!("release: illegal mask {mask:?} for {}", thread.name());
            return;
        }
        if self.refuse_zombie("release") {
            return;
        }
        let clear = thread.state() & mask;
        if clear.is_empty() {
            return;
        }
        thread.remove_state(clear);
        thread.insert_info(info);
        if !thread.state().is_blocked() {
            let head = clear.contains(StateFlags::HALT) || info.intersects(InfoFlags::PTRACE_MASK);
            self.enqueue(head);
        }
        log::trace!("{} released from {clear:?}", thread.name());
        self.check();
        self.kernel.bridge.resume(thread);
    }

    /// Force the thread out of any wait or suspension.
    ///
    /// The thread observes `KICKED`; if it is running out-of-band, its next
    /// attempt to sleep breaks immediately. User threads are also
    /// interrupted so they reach a point where the host can act on them.
    pub fn kick(&mut self, info: InfoFlags) {
        let thread = self.thread;
        if self.refuse_zombie("kick") {
            return;
        }
        let state = thread.state();
        if state.contains(StateFlags::INBAND) {
            return;
        }
        if state.intersects(StateFlags::WAKE_MASK) {
            self.wakeup(
                StateFlags::WAKE_MASK,
                InfoFlags::KICKED | InfoFlags::BREAK | info,
            );
        }
        if state.contains(StateFlags::SUSP) {
            self.release(StateFlags::SUSP, InfoFlags::KICKED | info);
        }
        thread.insert_info(InfoFlags::KICKED | info);
        if thread.is_user() {
            self.kernel.bridge.interrupt(thread);
        }
        log::debug!("{} kicked ({info:?})", thread.name());
    }

    /// Set and clear flags which do not affect runnability.
    pub(crate) fn change_flags(&mut self, set: StateFlags, clear: StateFlags) {
        let runnability = StateFlags::BLOCKING | StateFlags::READY | StateFlags::ZOMBIE;
        if (set | clear).intersects(runnability) {
            log::error!("change_flags: {set:?}/{clear:?} would alter runnability");
            return;
        }
        if self.refuse_zombie("change_flags") {
            return;
        }
        self.thread.remove_state(clear);
        self.thread.insert_state(set);
    }

    /// Break any wait of the thread without marking it kicked.
    pub fn unblock(&mut self) -> bool {
        let state = self.thread.state();
        if !state.intersects(StateFlags::WAKE_MASK) || self.refuse_zombie("unblock") {
            return false;
        }
        self.wakeup(StateFlags::WAKE_MASK, InfoFlags::BREAK);
        true
    }

    /// Drop the thread to the weakest class, then kick it.
    pub fn demote(&mut self) {
        if self.refuse_zombie("demote") {
            return;
        }
        let weakest = self.kernel.policy.weakest();
        self.apply_param(weakest);
        self.kick(InfoFlags::empty());
    }

    /// Change the base scheduling parameters.
    ///
    /// The thread is repositioned at the tail of its new priority group
    /// when queued. A thread pending on a wait channel gets `SCHEDP`; the
    /// caller must ask the channel to reorder its waiters once the locks
    /// are dropped.
    ///
    /// # Errors
    ///
    /// `ScheduleError::InvalidParam` when the policy rejects the parameters,
    /// `InvalidOperationError::Zombie` for a retired thread.
    pub fn set_schedparam(&mut self, param: SchedParam) -> ThreadResult<()> {
        if self.thread.is_zombie() {
            return Err(InvalidOperationError::Zombie.into());
        }
        if self.thread.is_root() {
            return Err(InvalidOperationError::WrongState.into());
        }
        self.kernel.policy.check_param(&param)?;
        let param = self.kernel.config.normalize_param(param);
        self.apply_param(param);
        if self.thread.state().contains(StateFlags::PEND) {
            self.thread.insert_info(InfoFlags::SCHEDP);
        }
        log::debug!("{} schedparam {param:?}", self.thread.name());
        Ok(())
    }

    fn apply_param(&mut self, param: SchedParam) {
        self.core.base = param;
        self.core.rrperiod = match param.class {
            SchedClass::RoundRobin => param.quantum,
            _ => None,
        };
        if self.core.rrperiod.is_some() {
            self.thread.insert_state(StateFlags::RRB);
        } else {
            self.thread.remove_state(StateFlags::RRB);
        }
        self.thread.set_rr_quantum(self.core.rrperiod);
        self.requeue_by_priority();
    }

    /// Raise the current priority to at least `prio` on behalf of `owner`.
    ///
    /// A second boost from the same owner replaces the first.
    pub fn boost(&mut self, owner: ThreadId, prio: i32) {
        if self.refuse_zombie("boost") {
            return;
        }
        match self.core.boosters.iter_mut().find(|b| b.owner == owner) {
            Some(boost) => boost.prio = prio,
            None => self.core.boosters.push(Boost { owner, prio }),
        }
        self.requeue_by_priority();
    }

    /// Drop the boost granted by `owner`. Returns whether one existed.
    pub fn unboost(&mut self, owner: ThreadId) -> bool {
        let before = self.core.boosters.len();
        self.core.boosters.retain(|b| b.owner != owner);
        if self.core.boosters.len() == before {
            return false;
        }
        if !self.thread.is_zombie() {
            self.requeue_by_priority();
        }
        true
    }

    /// Recompute the current and weighted priority, moving the thread to
    /// the tail of its new priority group if queued.
    fn requeue_by_priority(&mut self) {
        let policy = &self.kernel.policy;
        let base = self.core.base;
        let mut cprio = base.prio;
        let mut wprio = policy.weighted_prio(base.class, base.prio);
        for boost in &self.core.boosters {
            let boosted = policy.weighted_prio(SchedClass::Fifo, boost.prio);
            if boosted > wprio {
                wprio = boosted;
                cprio = boost.prio;
            }
        }
        self.core.cprio = cprio;
        if wprio == self.thread.wprio() {
            return;
        }
        let queued = self.thread.state().contains(StateFlags::READY);
        if queued {
            self.dequeue();
        }
        self.thread.set_wprio(wprio);
        if queued {
            self.enqueue(false);
        }
        self.rq_state.resched = true;
        self.check();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::priority;
    use crate::tests::helpers::TestRig;
    use crate::time::{Duration, Instant};

    #[test]
    fn test_sleep_on_delay_then_timeout() {
        let rig = TestRig::new(1);
        let t = rig.oob_thread("sleeper", SchedParam::fifo(10));
        {
            let mut lt = rig.kernel.lock_thread(&t);
            lt.sleep_on(Timeout::Relative(Duration::from_millis(50)), rig.kernel.clock(), None);
        }
        assert!(t.state().contains(StateFlags::DELAY));
        assert!(!t.state().contains(StateFlags::READY));
        rig.advance(Duration::from_millis(49));
        assert!(t.state().contains(StateFlags::DELAY));
        rig.advance(Duration::from_millis(1));
        assert!(t.state().contains(StateFlags::READY));
        assert!(t.info().contains(InfoFlags::TIMEO));
    }

    #[test]
    fn test_sleep_on_past_absolute_date_times_out_immediately() {
        let rig = TestRig::new(1);
        rig.advance(Duration::from_millis(10));
        let t = rig.oob_thread("late", SchedParam::fifo(10));
        {
            let mut lt = rig.kernel.lock_thread(&t);
            lt.sleep_on(Timeout::Absolute(Instant::from_nanos(5)), rig.kernel.clock(), None);
        }
        assert!(t.state().contains(StateFlags::READY));
        assert!(t.info().contains(InfoFlags::TIMEO));
    }

    #[test]
    fn test_kicked_thread_does_not_sleep() {
        let rig = TestRig::new(1);
        let t = rig.oob_thread("kicked", SchedParam::fifo(10));
        let mut lt = rig.kernel.lock_thread(&t);
        lt.kick(InfoFlags::empty());
        lt.sleep_on(Timeout::Infinite, rig.kernel.clock(), None);
        assert!(t.state().contains(StateFlags::READY));
        assert!(t.info().contains(InfoFlags::BREAK | InfoFlags::KICKED));
    }

    #[test]
    fn test_wakeup_disjoint_mask_is_noop() {
        let rig = TestRig::new(1);
        let t = rig.oob_thread("idle", SchedParam::fifo(10));
        let mut lt = rig.kernel.lock_thread(&t);
        lt.sleep_on(Timeout::Relative(Duration::from_millis(5)), rig.kernel.clock(), None);
        let (state, info) = (t.state(), t.info());
        lt.wakeup(StateFlags::WAIT, InfoFlags::BREAK);
        assert_eq!(t.state(), state);
        assert_eq!(t.info(), info);
        assert!(t.rtimer.is_running());
    }

    #[test]
    fn test_wakeup_illegal_mask_is_ignored() {
        let rig = TestRig::new(1);
        let t = rig.oob_thread("held", SchedParam::fifo(10));
        let mut lt = rig.kernel.lock_thread(&t);
        lt.hold(StateFlags::SUSP).unwrap();
        lt.wakeup(StateFlags::SUSP, InfoFlags::empty());
        assert!(t.state().contains(StateFlags::SUSP));
    }

    #[test]
    fn test_hold_interrupted_by_pending_switch() {
        let rig = TestRig::new(1);
        let t = rig.oob_thread("switching", SchedParam::fifo(10));
        rig.bridge.set_switch_pending(&t, true);
        let mut lt = rig.kernel.lock_thread(&t);
        assert_eq!(lt.hold(StateFlags::SUSP), Err(WaitError::Interrupted));
        assert!(t.state().contains(StateFlags::READY));
        assert!(t.info().contains(InfoFlags::BREAK));
    }

    #[test]
    fn test_release_from_halt_goes_to_head() {
        let rig = TestRig::new(1);
        let a = rig.oob_thread("a", SchedParam::fifo(10));
        let b = rig.oob_thread("b", SchedParam::fifo(10));
        rig.kernel.lock_thread(&b).hold(StateFlags::HALT).unwrap();
        assert!(Arc::ptr_eq(&rig.kernel.pick(0), &a));
        rig.kernel.lock_thread(&b).release(StateFlags::HALT, InfoFlags::empty());
        assert!(Arc::ptr_eq(&rig.kernel.pick(0), &b));

        rig.kernel.lock_thread(&b).hold(StateFlags::SUSP).unwrap();
        rig.kernel.lock_thread(&b).release(StateFlags::SUSP, InfoFlags::empty());
        assert!(Arc::ptr_eq(&rig.kernel.pick(0), &a));
    }

    #[test]
    fn test_pend_clear_detaches_wchan_and_stops_timer() {
        let rig = TestRig::new(1);
        let t = rig.oob_thread("pender", SchedParam::fifo(10));
        let wq = crate::wait::WaitQueue::new("wq", rig.kernel.clock().clone());
        let mut lt = rig.kernel.lock_thread(&t);
        lt.sleep_on(
            Timeout::Relative(Duration::from_millis(5)),
            rig.kernel.clock(),
            Some(wq.clone() as Arc<dyn WaitChannel>),
        );
        assert!(t.state().contains(StateFlags::PEND | StateFlags::DELAY));
        lt.wakeup(StateFlags::PEND, InfoFlags::empty());
        assert!(lt.wchan().is_none());
        assert!(!t.state().intersects(StateFlags::PEND | StateFlags::DELAY));
        assert!(!t.rtimer.is_running());
    }

    #[test]
    fn test_boost_raises_and_unboost_restores() {
        let rig = TestRig::new(1);
        let t = rig.oob_thread("boosted", SchedParam::weak(3));
        let owner = rig.oob_thread("owner", SchedParam::fifo(priority::HIGH));
        let base = t.wprio();
        let mut lt = rig.kernel.lock_thread(&t);
        lt.boost(owner.id(), priority::HIGH);
        assert!(t.wprio() > base);
        assert_eq!(lt.core.cprio, priority::HIGH);
        assert!(lt.unboost(owner.id()));
        assert!(!lt.unboost(owner.id()));
        assert_eq!(t.wprio(), base);
        assert!(lt.is_queued());
    }

    #[test]
    fn test_set_schedparam_rejects_invalid_without_change() {
        let rig = TestRig::new(1);
        let t = rig.oob_thread("rt", SchedParam::fifo(10));
        let before = t.wprio();
        let err = rig.kernel.lock_thread(&t).set_schedparam(SchedParam::fifo(500));
        assert!(err.is_err());
        assert_eq!(t.wprio(), before);
    }

    #[test]
    fn test_round_robin_sets_budget_flag() {
        let rig = TestRig::new(1);
        let t = rig.oob_thread("rr", SchedParam::fifo(10));
        rig.kernel
            .lock_thread(&t)
            .set_schedparam(SchedParam::round_robin(10, None))
            .unwrap();
        assert!(t.state().contains(StateFlags::RRB));
        assert_eq!(t.rr_quantum(), Some(rig.kernel.config().default_rr_quantum));
        rig.kernel
            .lock_thread(&t)
            .set_schedparam(SchedParam::fifo(10))
            .unwrap();
        assert!(!t.state().contains(StateFlags::RRB));
        assert_eq!(t.rr_quantum(), None);
    }
}
