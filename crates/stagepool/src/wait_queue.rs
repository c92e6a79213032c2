//! Park/unpark coordination for threads waiting on an external condition.
//!
//! A [`WaitQueue`] holds one-shot wait slots ([`Signal`]s) in registration
//! order. Producers wake either the oldest live waiter (`signal`) or every
//! waiter present at call time (`signal_all`); waiters that give up retire
//! their slot with `cancel`, and a slot cancelled *after* it was already
//! signalled forwards the wake to the next live waiter so a delivered signal
//! is never swallowed.
//!
//! Signal state transitions are plain atomic CAS operations and a signaller
//! never waits on a waiter. The entry list itself is a coarsely locked FIFO
//! with an explicit sweep for cancelled entries; the lock guards membership
//! only and is never held across a park.
//!
//! Waking rides on `std::thread::park`/`Thread::unpark`, whose per-thread
//! permit means an unpark that races ahead of the corresponding park still
//! lets the next park return immediately.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, Thread, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;

const NOT_SET: u8 = 0;
const SIGNALLED: u8 = 1;
const CANCELLED: u8 = 2;

/// A one-shot wait slot owned by the thread that registered it.
///
/// A signal is transient: it tells the owner that the guarded condition *may*
/// have changed and should be re-checked, nothing more. Implementations never
/// wake spuriously; a wake always corresponds to a `signal`/`signal_all`.
///
/// Only the owning thread may call [`wait`](Signal::wait),
/// [`cancel`](Signal::cancel) or [`check_and_clear`](Signal::check_and_clear).
/// Once `is_set` reports true the state is final and the signal should be
/// discarded.
pub trait Signal {
    /// True once a wake was delivered to this slot.
    fn is_signalled(&self) -> bool;

    /// True once the owner retired the slot without consuming a wake.
    fn is_cancelled(&self) -> bool;

    /// `is_signalled() || is_cancelled()`.
    fn is_set(&self) -> bool {
        self.is_signalled() || self.is_cancelled()
    }

    /// Atomically cancels the slot if it is still unset, or reports that it
    /// was signalled. A caller racing with `signal` on an unset slot loses
    /// the CAS and observes the wake (returns true).
    fn check_and_clear(&self) -> bool;

    /// Retires the slot. If a wake had already been delivered, it is
    /// forwarded to another waiter on the same queue.
    fn cancel(&self);

    /// Parks the owning thread until signalled. On return `is_signalled()`
    /// holds and the slot is terminal.
    fn wait(&self) {
        while !self.is_signalled() {
            thread::park();
        }
        self.check_and_clear();
    }

    /// Parks the owning thread until signalled or `deadline` passes.
    ///
    /// Returns true when signalled. On false the slot was cancelled by the
    /// timeout. A deadline at or before now returns the current state
    /// without parking.
    fn wait_until(&self, deadline: Instant) -> bool {
        loop {
            if self.is_signalled() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
        self.check_and_clear()
    }
}

struct SignalNode {
    state: AtomicU8,
    thread: Thread,
}

impl SignalNode {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(NOT_SET),
            thread: thread::current(),
        }
    }

    #[inline(always)]
    fn is_signalled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == SIGNALLED
    }

    #[inline(always)]
    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    #[inline(always)]
    fn is_set(&self) -> bool {
        self.state.load(Ordering::SeqCst) != NOT_SET
    }

    /// NOT_SET -> SIGNALLED plus unpark. Returns the woken thread's id, or
    /// None when the slot was already terminal.
    fn try_signal(&self) -> Option<ThreadId> {
        if self
            .state
            .compare_exchange(NOT_SET, SIGNALLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let id = self.thread.id();
            self.thread.unpark();
            Some(id)
        } else {
            None
        }
    }

    fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(NOT_SET, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

struct QueueInner {
    entries: Mutex<VecDeque<Arc<SignalNode>>>,
}

impl QueueInner {
    fn signal(&self) -> bool {
        let mut entries = self.entries.lock();
        while let Some(node) = entries.pop_front() {
            if node.try_signal().is_some() {
                return true;
            }
            // terminal entry: discarding it is the removal
        }
        false
    }

    fn signal_all(&self) {
        // A woken waiter may re-register behind us while we walk, so an
        // unbounded walk could chase its own tail. Periodically (at
        // geometrically growing intervals) remember the thread of a woken
        // waiter; meeting that thread again means the walk has lapped itself
        // and can stop.
        let mut woken = 0usize;
        let mut next_mark = 5usize;
        let mut marked: Option<ThreadId> = None;

        loop {
            let node = match self.entries.lock().pop_front() {
                Some(node) => node,
                None => return,
            };
            if let Some(id) = node.try_signal() {
                if marked == Some(id) {
                    return;
                }
                woken += 1;
                if woken == next_mark {
                    marked = Some(id);
                    next_mark <<= 1;
                }
            }
        }
    }

    /// Drops cancelled entries. Runs whenever an owner retires a slot.
    fn sweep_cancelled(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|node| !node.is_cancelled());
    }
}

/// FIFO collection of [`Signal`]s with single and broadcast wake.
///
/// Cloning is cheap and clones address the same queue.
#[derive(Clone)]
pub struct WaitQueue {
    inner: Arc<QueueInner>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                entries: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Appends a fresh slot bound to the calling thread.
    ///
    /// Must be called by the thread that will wait on the returned signal;
    /// wakes are delivered by unparking that thread.
    pub fn register(&self) -> RegisteredSignal {
        let node = Arc::new(SignalNode::new());
        self.inner.entries.lock().push_back(node.clone());
        RegisteredSignal {
            queue: self.inner.clone(),
            node,
        }
    }

    /// Wakes the oldest live waiter, discarding terminal entries on the way.
    ///
    /// Returns false only when the queue drained without finding a wakeable
    /// waiter.
    pub fn signal(&self) -> bool {
        self.inner.signal()
    }

    /// Wakes every waiter registered at call time.
    pub fn signal_all(&self) {
        self.inner.signal_all();
    }

    /// True when any entry is present, cancelled stragglers included.
    pub fn has_waiters(&self) -> bool {
        !self.inner.entries.lock().is_empty()
    }

    /// Number of registered, non-cancelled waiters.
    pub fn waiter_count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|node| !node.is_cancelled())
            .count()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Signal`] registered on a [`WaitQueue`].
pub struct RegisteredSignal {
    queue: Arc<QueueInner>,
    node: Arc<SignalNode>,
}

impl Signal for RegisteredSignal {
    fn is_signalled(&self) -> bool {
        self.node.is_signalled()
    }

    fn is_cancelled(&self) -> bool {
        self.node.is_cancelled()
    }

    fn is_set(&self) -> bool {
        self.node.is_set()
    }

    fn check_and_clear(&self) -> bool {
        if self.node.is_set() {
            // signalled, or a repeated call on an already retired slot
            !self.node.is_cancelled()
        } else if self.node.try_cancel() {
            self.queue.sweep_cancelled();
            false
        } else {
            // lost the race against a signaller: the wake is ours
            true
        }
    }

    fn cancel(&self) {
        if self.node.is_cancelled() {
            return;
        }
        if !self.node.try_cancel() {
            // Already signalled: downgrade to cancelled and pass the wake on
            // so it is not lost with this slot.
            self.node.state.store(CANCELLED, Ordering::SeqCst);
            self.queue.signal();
        }
        self.queue.sweep_cancelled();
    }
}

/// Composite over child signals; state predicates fan out to the children.
///
/// Composites own no queue entry of their own. The composing thread is
/// expected to have registered every child itself, so any child's wake
/// unparks it and the inherited park loop in [`Signal::wait`] applies
/// unchanged.
pub struct MultiSignal {
    signals: Vec<Box<dyn Signal>>,
    mode: MultiMode,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MultiMode {
    Any,
    All,
}

impl Signal for MultiSignal {
    fn is_signalled(&self) -> bool {
        match self.mode {
            MultiMode::Any => self.signals.iter().any(|s| s.is_signalled()),
            MultiMode::All => self.signals.iter().all(|s| s.is_signalled()),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.signals.iter().all(|s| s.is_cancelled())
    }

    fn is_set(&self) -> bool {
        match self.mode {
            MultiMode::Any => self.signals.iter().any(|s| s.is_set()),
            MultiMode::All => self.signals.iter().all(|s| s.is_set()),
        }
    }

    fn check_and_clear(&self) -> bool {
        for signal in &self.signals {
            signal.check_and_clear();
        }
        self.is_signalled()
    }

    fn cancel(&self) {
        for signal in &self.signals {
            signal.cancel();
        }
    }
}

/// A signal that is signalled as soon as any child is, and cancelled only
/// when every child is.
pub fn any(signals: Vec<Box<dyn Signal>>) -> MultiSignal {
    MultiSignal {
        signals,
        mode: MultiMode::Any,
    }
}

/// A signal that is signalled only once every child is.
pub fn all(signals: Vec<Box<dyn Signal>>) -> MultiSignal {
    MultiSignal {
        signals,
        mode: MultiMode::All,
    }
}
