//! One-shot completion latch.

use portable_atomic::{AtomicBool, AtomicU32, Ordering};

/// Latch signaled once, observed by any number of waiters.
///
/// Waiters poll [`Completion::is_done`]; how they yield between polls is
/// up to the band bridge.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
    waiters: AtomicU32,
}

impl Completion {
    /// Create an unsignaled latch.
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            waiters: AtomicU32::new(0),
        }
    }

    /// Signal the latch. Returns `false` if it was already signaled.
    pub fn complete(&self) -> bool {
        self.done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the latch has been signaled.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Number of callers currently waiting.
    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Acquire)
    }

    pub(crate) fn enter_wait(&self) -> WaiterGuard<'_> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        WaiterGuard { latch: self }
    }
}

/// Keeps the waiter count accurate across early returns.
pub(crate) struct WaiterGuard<'a> {
    latch: &'a Completion,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.latch.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_once() {
        let latch = Completion::new();
        assert!(!latch.is_done());
        assert!(latch.complete());
        assert!(!latch.complete());
        assert!(latch.is_done());
    }

    #[test]
    fn test_waiter_count_follows_guards() {
        let latch = Completion::new();
        {
            let _a = latch.enter_wait();
            let _b = latch.enter_wait();
            assert_eq!(latch.waiters(), 2);
        }
        assert_eq!(latch.waiters(), 0);
    }
}
