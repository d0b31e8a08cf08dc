//! Named state and information flags of a thread control block.
//!
//! `StateFlags` describe where a thread stands (runnable, blocked and on
//! what, which band it runs in) plus its reporting mode. `InfoFlags` record
//! why the last wakeup happened; they are consumed by the woken thread.

use bitflags::bitflags;

bitflags! {
    /// Persistent state of a thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateFlags: u32 {
        /// Administratively suspended
        const SUSP = 1 << 0;
        /// Sleeping on a wait channel
        const PEND = 1 << 1;
        /// Sleeping until a timeout elapses
        const DELAY = 1 << 2;
        /// Waiting for the next periodic release
        const WAIT = 1 << 3;
        /// Queued on a run queue
        const READY = 1 << 4;
        /// Created, never started
        const DORMANT = 1 << 5;
        /// Retired; terminal
        const ZOMBIE = 1 << 6;
        /// Held by the stop machinery
        const HALT = 1 << 7;
        /// Running under the host scheduler
        const INBAND = 1 << 8;
        /// Per-CPU placeholder for the host kernel
        const ROOT = 1 << 9;
        /// Backed by a user-space task
        const USER = 1 << 10;
        /// Round-robin budget active
        const RRB = 1 << 11;
        /// Under debugger control
        const PTRACE = 1 << 12;
        /// Single-stepping
        const SSTEP = 1 << 13;
        /// Report switches to in-band mode
        const WOSS = 1 << 16;
        /// Report priority inversions on locks
        const WOLI = 1 << 17;
        /// Report stage exclusion violations
        const WOSX = 1 << 18;
        /// Report through the signal channel
        const HMSIG = 1 << 19;
        /// Report through the observable channel
        const HMOBS = 1 << 20;
    }
}

bitflags! {
    /// Transient reasons attached to the last wakeup.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InfoFlags: u32 {
        /// The timeout elapsed
        const TIMEO = 1 << 0;
        /// The wait channel was deleted
        const RMID = 1 << 1;
        /// The wait was broken
        const BREAK = 1 << 2;
        /// Forcibly unblocked
        const KICKED = 1 << 3;
        /// Cancellation requested
        const CANCELD = 1 << 4;
        /// Scheduling parameters changed while pending
        const SCHEDP = 1 << 5;
        /// Kicked by a sibling's debug stop
        const PTSIG = 1 << 6;
        /// Stopped by the debugger
        const PTSTOP = 1 << 7;
        /// Member of the stop-sync barrier
        const PTJOIN = 1 << 8;
    }
}

impl StateFlags {
    /// Any of these keeps a thread off the run queues.
    pub const BLOCKING: Self = Self::from_bits_retain(
        Self::SUSP.bits()
            | Self::PEND.bits()
            | Self::DELAY.bits()
            | Self::WAIT.bits()
            | Self::HALT.bits()
            | Self::DORMANT.bits()
            | Self::INBAND.bits(),
    );

    /// Bits a wakeup may clear.
    pub const WAKE_MASK: Self =
        Self::from_bits_retain(Self::DELAY.bits() | Self::PEND.bits() | Self::WAIT.bits());

    /// Bits a hold may set.
    pub const HOLD_MASK: Self =
        Self::from_bits_retain(Self::SUSP.bits() | Self::HALT.bits() | Self::DORMANT.bits());

    /// Health-monitor triggers.
    pub const TRIGGERS: Self =
        Self::from_bits_retain(Self::WOSS.bits() | Self::WOLI.bits() | Self::WOSX.bits());

    /// Bits callers may change through `set_mode`.
    pub const MODE_MASK: Self = Self::from_bits_retain(
        Self::TRIGGERS.bits() | Self::HMSIG.bits() | Self::HMOBS.bits(),
    );

    /// Whether any blocking condition holds.
    pub fn is_blocked(self) -> bool {
        self.intersects(Self::BLOCKING)
    }
}

impl InfoFlags {
    /// Reasons cleared when a thread enters a fresh wait.
    pub const WAKE_REASONS: Self = Self::from_bits_retain(
        Self::TIMEO.bits() | Self::RMID.bits() | Self::BREAK.bits() | Self::KICKED.bits(),
    );

    /// Bits owned by the stop-sync machinery.
    pub const PTRACE_MASK: Self =
        Self::from_bits_retain(Self::PTSIG.bits() | Self::PTSTOP.bits() | Self::PTJOIN.bits());
}

/// Check the legal combinations of a state word.
///
/// `queued` tells whether the thread sits in a run queue and `has_wchan`
/// whether a wait channel is attached. Returns the first rule broken.
pub fn check_consistency(state: StateFlags, queued: bool, has_wchan: bool) -> Result<(), &'static str> {
    let parked = state.is_blocked() || state.contains(StateFlags::ZOMBIE);
    if state.contains(StateFlags::READY) == parked {
        return Err("READY must be set iff no blocking bit is");
    }
    if state.contains(StateFlags::READY) != queued {
        return Err("READY must match run queue membership");
    }
    if has_wchan && !state.contains(StateFlags::PEND) {
        return Err("wait channel attached without PEND");
    }
    if state.contains(StateFlags::ZOMBIE) && state.contains(StateFlags::READY) {
        return Err("zombie left on a run queue");
    }
    if state.contains(StateFlags::ROOT) && state.intersects(StateFlags::DORMANT | StateFlags::USER) {
        return Err("root thread cannot be dormant or user");
    }
    Ok(())
}

/// Run [`check_consistency`] in debug builds, logging any breach.
#[inline]
pub(crate) fn debug_check(name: &str, state: StateFlags, queued: bool, has_wchan: bool) {
    if cfg!(debug_assertions) {
        if let Err(rule) = check_consistency(state, queued, has_wchan) {
            log::error!("thread {name}: inconsistent state {state:?}: {rule}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_set() {
        assert!(StateFlags::PEND.is_blocked());
        assert!(StateFlags::INBAND.is_blocked());
        assert!(!(StateFlags::READY | StateFlags::USER | StateFlags::RRB).is_blocked());
        assert!(StateFlags::BLOCKING.contains(StateFlags::WAKE_MASK));
        assert!(StateFlags::BLOCKING.contains(StateFlags::HOLD_MASK));
    }

    #[test]
    fn test_consistency_rules() {
        assert!(check_consistency(StateFlags::READY, true, false).is_ok());
        assert!(check_consistency(StateFlags::DORMANT | StateFlags::INBAND, false, false).is_ok());
        assert!(check_consistency(StateFlags::PEND, false, true).is_ok());
        assert!(check_consistency(StateFlags::READY | StateFlags::DELAY, true, false).is_err());
        assert!(check_consistency(StateFlags::READY, false, false).is_err());
        assert!(check_consistency(StateFlags::DELAY, false, true).is_err());
        assert!(check_consistency(StateFlags::empty(), false, false).is_err());
        assert!(check_consistency(StateFlags::ZOMBIE, false, false).is_ok());
    }

    #[test]
    fn test_mode_mask_excludes_state_bits() {
        assert!(!StateFlags::MODE_MASK.intersects(StateFlags::BLOCKING | StateFlags::READY));
        assert!(StateFlags::MODE_MASK.contains(StateFlags::TRIGGERS));
    }
}
