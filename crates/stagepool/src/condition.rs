//! Latched one-shot condition without lost-notify or spurious-wakeup hazards.
//!
//! Unlike a bare condvar, signalling *before* a waiter arrives still releases
//! that waiter: the latch is checked again after the waiter registers on the
//! internal [`WaitQueue`], which closes the window between the first check
//! and the registration.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::wait_queue::{Signal, WaitQueue};

/// One-shot broadcast condition.
///
/// Once [`signal_all`](OneShotCondition::signal_all) has run, every present
/// and future waiter returns immediately. There is no single-wake operation;
/// the latch makes it meaningless.
pub struct OneShotCondition {
    signalled: AtomicBool,
    waiting: OnceLock<WaitQueue>,
}

impl OneShotCondition {
    pub fn new() -> Self {
        Self {
            signalled: AtomicBool::new(false),
            waiting: OnceLock::new(),
        }
    }

    #[inline]
    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::SeqCst)
    }

    /// Sets the latch and wakes every registered waiter. Idempotent.
    pub fn signal_all(&self) {
        self.signalled.store(true, Ordering::SeqCst);
        if let Some(queue) = self.waiting.get() {
            queue.signal_all();
        }
    }

    /// Blocks until the latch is set. Returns immediately if it already is.
    pub fn wait(&self) {
        if self.is_signalled() {
            return;
        }
        let signal = self.waiting.get_or_init(WaitQueue::new).register();
        // The latch may have been set between the check above and the
        // registration; without this re-check a racing signal_all would have
        // broadcast to a queue we were not yet on.
        if self.is_signalled() {
            signal.cancel();
        } else {
            signal.wait();
        }
        debug_assert!(self.is_signalled());
    }

    /// Blocks until the latch is set or `deadline` passes. Returns whether
    /// the latch is set.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        if self.is_signalled() {
            return true;
        }
        let signal = self.waiting.get_or_init(WaitQueue::new).register();
        if self.is_signalled() {
            signal.cancel();
            return true;
        }
        signal.wait_until(deadline) || self.is_signalled()
    }

    /// Blocks for at most `timeout`. Returns whether the latch is set.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }
}

impl Default for OneShotCondition {
    fn default() -> Self {
        Self::new()
    }
}
