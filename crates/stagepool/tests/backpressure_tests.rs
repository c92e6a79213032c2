//! Submitter backpressure: soft queue caps, rendezvous at a zero cap,
//! rejection and drain behavior around shutdown, and the submission hooks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use stagepool::metrics::{
    CURRENTLY_BLOCKED_TASKS, MetricNameFactory, STAGE_METRIC_TYPE, TOTAL_BLOCKED_TASKS, registry,
};
use stagepool::pool::{PoolConfig, SharedPool};
use stagepool::stage::{SubmissionHooks, SubmitError};

fn small_pool(name: &str) -> SharedPool {
    SharedPool::with_config(
        name,
        PoolConfig {
            max_workers: 2,
            ..PoolConfig::default()
        },
    )
}

fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn third_submit_blocks_until_room_and_dispatch_is_fifo() {
    let pool = small_pool("bp-fifo");
    let stage = pool.new_executor(1, 1, "bp-fifo-stage");
    let order = Arc::new(Mutex::new(Vec::new()));

    let task = |index: usize| {
        let order = order.clone();
        move || {
            thread::sleep(Duration::from_millis(100));
            order.lock().unwrap().push(index);
        }
    };

    stage.submit(task(0)).expect("first submit");
    stage.submit(task(1)).expect("second submit");

    // queue cap is 1 and it is occupied: this submission must block until
    // the worker frees a slot, roughly one task duration away
    let blocked_at = Instant::now();
    stage.submit(task(2)).expect("third submit");
    let blocked_for = blocked_at.elapsed();
    assert!(
        blocked_for >= Duration::from_millis(40),
        "third submit should have blocked on the full queue, blocked {blocked_for:?}"
    );

    assert!(
        wait_for(Duration::from_secs(5), || stage.completed_count() == 3),
        "all three tasks should complete"
    );
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2], "dispatch must be FIFO");

    let names = MetricNameFactory::new(STAGE_METRIC_TYPE, "bp-fifo", "bp-fifo-stage");
    let total_blocked = registry()
        .value(&names.create(TOTAL_BLOCKED_TASKS))
        .expect("TotalBlockedTasks registered");
    assert!(total_blocked >= 1, "one submitter blocked, saw {total_blocked}");
    assert_eq!(
        registry().value(&names.create(CURRENTLY_BLOCKED_TASKS)),
        Some(0),
        "nobody is blocked anymore"
    );
}

#[test]
fn zero_queue_cap_forces_rendezvous() {
    let pool = small_pool("bp-rendezvous");
    let stage = pool.new_executor(1, 0, "bp-rendezvous-stage");
    let picked_up = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let picked_up = picked_up.clone();
        stage
            .submit(move || {
                picked_up.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
        // with max_queued = 0 a submit only returns once a worker has taken
        // the task off the queue
        assert_eq!(stage.pending_tasks(), 0, "rendezvous must leave nothing queued");
    }

    assert!(wait_for(Duration::from_secs(5), || {
        picked_up.load(Ordering::SeqCst) == 3
    }));
}

#[test]
fn submit_after_shutdown_is_rejected() {
    let pool = small_pool("bp-reject");
    let stage = pool.new_executor(1, 4, "bp-reject-stage");
    stage.shutdown();

    let rejection = stage.submit(|| {});
    assert_eq!(
        rejection,
        Err(SubmitError::Rejected {
            stage: "bp-reject-stage".to_string()
        })
    );
}

#[test]
fn tasks_enqueued_before_shutdown_still_run() {
    let pool = small_pool("bp-drain");
    let stage = pool.new_executor(1, 64, "bp-drain-stage");
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..16 {
        let completed = completed.clone();
        stage
            .submit(move || {
                thread::sleep(Duration::from_millis(2));
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit before shutdown");
    }
    stage.shutdown();

    assert!(
        stage.await_termination(Duration::from_secs(5)),
        "stage should drain and terminate"
    );
    assert_eq!(
        completed.load(Ordering::SeqCst),
        16,
        "every task enqueued before shutdown must run exactly once"
    );
    assert_eq!(stage.completed_count(), 16);
    assert_eq!(stage.pending_tasks(), 0);
}

#[derive(Default)]
struct RecordingHooks {
    initial_rejections: AtomicUsize,
    final_accepts: AtomicUsize,
    final_rejections: AtomicUsize,
}

impl SubmissionHooks for RecordingHooks {
    fn on_initial_rejection(&self, _stage: &str) {
        self.initial_rejections.fetch_add(1, Ordering::SeqCst);
    }
    fn on_final_accept(&self, _stage: &str) {
        self.final_accepts.fetch_add(1, Ordering::SeqCst);
    }
    fn on_final_rejection(&self, _stage: &str) {
        self.final_rejections.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn blocked_submitter_is_rejected_when_stage_shuts_down() {
    let pool = SharedPool::with_config(
        "bp-blocked-reject",
        PoolConfig {
            max_workers: 1,
            ..PoolConfig::default()
        },
    );
    let stage = pool.new_executor(1, 1, "bp-blocked-stage");
    let hooks = Arc::new(RecordingHooks::default());
    stage.set_submission_hooks(hooks.clone());

    // keep the single worker busy long enough for the queue to stay full
    stage
        .submit(|| thread::sleep(Duration::from_millis(300)))
        .expect("running task");
    assert!(
        wait_for(Duration::from_secs(2), || stage.active_count() == 1),
        "worker should pick up the first task"
    );
    stage.submit(|| {}).expect("queued task");

    let blocked = {
        let stage = stage.clone();
        thread::spawn(move || stage.submit(|| {}))
    };
    assert!(
        wait_for(Duration::from_secs(2), || {
            hooks.initial_rejections.load(Ordering::SeqCst) == 1
        }),
        "third submission should report the initial rejection"
    );

    stage.shutdown();
    let outcome = blocked.join().expect("submitter panicked");
    assert!(
        matches!(outcome, Err(SubmitError::Rejected { .. })),
        "a submission still blocked at shutdown is withdrawn and rejected"
    );
    assert_eq!(hooks.final_rejections.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.final_accepts.load(Ordering::SeqCst), 0);

    assert!(stage.await_termination(Duration::from_secs(5)));
    assert_eq!(
        stage.completed_count(),
        2,
        "the withdrawn task must not run, the accepted two must"
    );
}
