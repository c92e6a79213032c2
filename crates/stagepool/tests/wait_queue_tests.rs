//! Concurrency tests for the wait/signal primitive and the one-shot
//! condition: broadcast coverage, single-wake exclusivity, forwarding on
//! cancel, and the signal-before-wait latch property.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use stagepool::condition::OneShotCondition;
use stagepool::wait_queue::{Signal, WaitQueue};

#[test]
fn broadcast_wakes_all_hundred_waiters() {
    const WAITERS: usize = 100;

    let queue = Arc::new(WaitQueue::new());
    let registered = Arc::new(Barrier::new(WAITERS + 1));
    let woken = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let queue = queue.clone();
            let registered = registered.clone();
            let woken = woken.clone();
            thread::spawn(move || {
                let signal = queue.register();
                registered.wait();
                signal.wait();
                assert!(signal.is_signalled());
                woken.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    registered.wait();
    queue.signal_all();

    for handle in handles {
        handle.join().expect("waiter panicked");
    }
    assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
    assert!(
        !queue.has_waiters(),
        "broadcast should leave no registered waiters behind"
    );
}

#[test]
fn single_signal_wakes_exactly_one_waiter() {
    let queue = Arc::new(WaitQueue::new());
    let registered = Arc::new(Barrier::new(3));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let queue = queue.clone();
            let registered = registered.clone();
            thread::spawn(move || {
                let signal = queue.register();
                registered.wait();
                signal.wait_until(Instant::now() + Duration::from_millis(500))
            })
        })
        .collect();

    registered.wait();
    assert!(queue.signal(), "a live waiter must be wakeable");

    let woken: usize = handles
        .into_iter()
        .map(|handle| handle.join().expect("waiter panicked") as usize)
        .sum();
    assert_eq!(woken, 1, "exactly one of the two waiters may be woken");
}

#[test]
fn cancel_after_wake_forwards_the_signal() {
    let queue = WaitQueue::new();
    // Registration order matters: the wake lands on the older slot.
    let first = queue.register();
    let second = queue.register();

    assert!(queue.signal());
    assert!(first.is_signalled());
    assert!(!second.is_set());

    // The owner retires the already-woken slot without consuming the wake;
    // the wake must move on instead of vanishing with it.
    first.cancel();
    assert!(first.is_cancelled());
    assert!(
        second.is_signalled(),
        "a wake given up by cancel must be forwarded to the next waiter"
    );
}

#[test]
fn cancelled_waiters_do_not_absorb_wakes() {
    let queue = WaitQueue::new();
    let stale = queue.register();
    let live = queue.register();

    stale.cancel();
    assert!(queue.signal());
    assert!(live.is_signalled());
}

#[test]
fn timed_wait_expires_and_cancels() {
    let queue = Arc::new(WaitQueue::new());
    let waiter = {
        let queue = queue.clone();
        thread::spawn(move || {
            let signal = queue.register();
            let woken = signal.wait_until(Instant::now() + Duration::from_millis(50));
            (woken, signal.is_cancelled())
        })
    };

    let (woken, cancelled) = waiter.join().expect("waiter panicked");
    assert!(!woken, "no signal was ever sent");
    assert!(cancelled, "a timed-out slot must end cancelled");
    // the cancelled entry is swept, so a later signal finds nothing
    assert!(!queue.signal());
}

// ---------------------------------------------------------------------------
// OneShotCondition
// ---------------------------------------------------------------------------

#[test]
fn signal_before_await_returns_immediately() {
    let condition = Arc::new(OneShotCondition::new());
    condition.signal_all();

    let waiter = {
        let condition = condition.clone();
        thread::spawn(move || {
            let start = Instant::now();
            condition.wait();
            start.elapsed()
        })
    };
    let waited = waiter.join().expect("waiter panicked");
    assert!(condition.is_signalled());
    assert!(
        waited < Duration::from_millis(100),
        "await after signal_all must not park, waited {waited:?}"
    );
}

#[test]
fn racing_signal_and_await_never_hangs() {
    // Shake the window between the latch check and the queue registration:
    // whichever interleaving happens, the waiter must come back.
    for _ in 0..200 {
        let condition = Arc::new(OneShotCondition::new());
        let waiter = {
            let condition = condition.clone();
            thread::spawn(move || {
                assert!(
                    condition.wait_until(Instant::now() + Duration::from_secs(5)),
                    "waiter timed out despite signal_all"
                );
            })
        };
        thread::yield_now();
        condition.signal_all();
        waiter.join().expect("waiter panicked");
    }
}

#[test]
fn broadcast_releases_every_condition_waiter() {
    let condition = Arc::new(OneShotCondition::new());
    let entered = Arc::new(Barrier::new(11));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let condition = condition.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                entered.wait();
                condition.wait();
            })
        })
        .collect();

    entered.wait();
    // give the waiters a moment to actually park
    thread::sleep(Duration::from_millis(20));
    condition.signal_all();
    for handle in handles {
        handle.join().expect("waiter panicked");
    }
}

#[test]
fn repeated_signal_all_is_indistinguishable_from_one() {
    let condition = OneShotCondition::new();
    condition.signal_all();
    condition.signal_all();
    assert!(condition.is_signalled());
    condition.wait();
    assert!(condition.wait_for(Duration::from_millis(0)));
}
