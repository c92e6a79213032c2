//! Shared worker pool servicing every stage.
//!
//! Workers are plain OS threads spawned lazily up to a pool-wide ceiling.
//! An idle worker spins briefly, then parks on the pool's descheduled queue;
//! submitters wake one parked worker per nudge, or spawn a new one when none
//! is parked and the ceiling allows. Parked workers retire after a keep-alive
//! without work.
//!
//! Work selection is a round-robin scan over the live stages: a stage is
//! eligible while it has pending tasks and spare permits under its own
//! concurrency cap. The scan never idles a worker while any eligible stage
//! exists, and the rotating start index keeps every eligible stage visited.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::condition::OneShotCondition;
use crate::stage::{StageExecutor, StageInner};
use crate::task::{TaskBody, run_contained};
use crate::wait_queue::{Signal, WaitQueue};

/// Tuning knobs for a [`SharedPool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Ceiling on concurrently live worker threads.
    pub max_workers: usize,
    /// How long a parked worker waits for work before retiring.
    pub keep_alive: Duration,
    /// Busy-check iterations before an idle worker parks.
    pub spin_iterations: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: thread::available_parallelism().map(usize::from).unwrap_or(4),
            keep_alive: Duration::from_secs(60),
            spin_iterations: 128,
        }
    }
}

pub(crate) struct PoolInner {
    name: String,
    config: PoolConfig,
    /// Back-reference handed to spawned workers.
    self_ref: Weak<PoolInner>,
    /// Live stages; read on every work scan, written only on stage
    /// creation/retirement.
    stages: RwLock<Vec<Arc<StageInner>>>,
    /// Signals of parked workers.
    descheduled: WaitQueue,
    shutdown: AtomicBool,
    /// Live worker threads, keyed by worker id. Locked on membership change
    /// only.
    workers: Mutex<HashMap<usize, Thread>>,
    worker_count: AtomicUsize,
    next_worker_id: AtomicUsize,
    scan_cursor: AtomicUsize,
    terminated: OneShotCondition,
}

impl PoolInner {
    pub(crate) fn maybe_schedule(&self) {
        // A parked worker is the cheapest capacity; wake one if any.
        if self.descheduled.signal() {
            return;
        }
        // Otherwise grow, up to the ceiling. Spinning/working peers will see
        // the new work on their own.
        let mut count = self.worker_count.load(Ordering::SeqCst);
        loop {
            if count >= self.config.max_workers {
                return;
            }
            match self.worker_count.compare_exchange(
                count,
                count + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.spawn_worker();
                    return;
                }
                Err(observed) => count = observed,
            }
        }
    }

    fn spawn_worker(&self) {
        let Some(pool) = self.self_ref.upgrade() else {
            self.worker_count.fetch_sub(1, Ordering::SeqCst);
            return;
        };
        let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{}", self.name, id))
            .spawn(move || worker_loop(pool, id));
        match spawned {
            Ok(_) => trace!(pool = %self.name, worker = id, "spawned worker"),
            Err(source) => {
                // Roll the reservation back; queued work stays visible to
                // the surviving workers.
                self.worker_count.fetch_sub(1, Ordering::SeqCst);
                error!(pool = %self.name, worker = id, %source, "failed to spawn worker");
            }
        }
    }

    pub(crate) fn remove_stage(&self, stage: &StageInner) {
        self.stages
            .write()
            .retain(|live| !std::ptr::eq(Arc::as_ptr(live), stage));
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn has_eligible_work(&self) -> bool {
        self.stages.read().iter().any(|stage| stage.is_eligible())
    }

    fn queues_empty(&self) -> bool {
        self.stages.read().iter().all(|stage| stage.pending() == 0)
    }

    /// Round-robin scan for a stage with backlog and a free permit. Returns
    /// the stage with a permit held and the dequeued task body.
    fn poll_stages(&self) -> Option<(Arc<StageInner>, TaskBody)> {
        let stages = self.stages.read();
        let len = stages.len();
        if len == 0 {
            return None;
        }
        let start = self.scan_cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let stage = &stages[(start + offset) % len];
            if stage.pending() == 0 || !stage.try_acquire_permit() {
                continue;
            }
            if let Some(body) = stage.try_take_task() {
                return Some((stage.clone(), body));
            }
            // Lost the dequeue race after reserving; hand the permit back.
            stage.release_permit();
        }
        None
    }

    fn on_worker_exit(&self, id: usize) {
        self.workers.lock().remove(&id);
        let remaining = self.worker_count.fetch_sub(1, Ordering::SeqCst) - 1;
        trace!(pool = %self.name, worker = id, remaining, "worker exited");
        if self.is_shutdown() {
            // Cascade: parked peers re-check the exit condition and follow.
            self.descheduled.signal_all();
            if remaining == 0 && self.queues_empty() {
                self.terminated.signal_all();
            }
        }
    }
}

fn worker_loop(pool: Arc<PoolInner>, id: usize) {
    pool.workers.lock().insert(id, thread::current());
    trace!(pool = %pool.name, worker = id, "worker running");

    loop {
        if let Some((stage, body)) = pool.poll_stages() {
            run_stage_tasks(&stage, body);
            continue;
        }

        if pool.is_shutdown() && pool.queues_empty() {
            break;
        }

        if spin_for_work(&pool) {
            continue;
        }

        // Park: register first, then re-check, so a submission racing with
        // the registration finds us wakeable. During shutdown a worker still
        // parks while ineligible backlog drains elsewhere; completion nudges
        // and the exit cascade wake it.
        let signal = pool.descheduled.register();
        if pool.has_eligible_work() || (pool.is_shutdown() && pool.queues_empty()) {
            signal.cancel();
            continue;
        }
        if signal.wait_until(Instant::now() + pool.config.keep_alive) {
            continue;
        }

        // Keep-alive expired without a wake.
        if pool.has_eligible_work() || pool.is_shutdown() {
            continue;
        }
        trace!(pool = %pool.name, worker = id, "worker idle past keep-alive, retiring");
        break;
    }

    pool.on_worker_exit(id);

    // Work that raced with retirement is handed to a peer (or a respawn).
    if !pool.is_shutdown() && pool.has_eligible_work() {
        pool.maybe_schedule();
    }
}

/// Runs the acquired task, then keeps draining the same stage while it has
/// backlog and spare permits before returning to the global scan.
fn run_stage_tasks(stage: &Arc<StageInner>, first: TaskBody) {
    let mut body = first;
    loop {
        run_contained(body);
        stage.on_task_complete();

        if stage.pending() == 0 || !stage.try_acquire_permit() {
            return;
        }
        match stage.try_take_task() {
            Some(next) => body = next,
            None => {
                stage.release_permit();
                return;
            }
        }
    }
}

fn spin_for_work(pool: &Arc<PoolInner>) -> bool {
    for round in 0..pool.config.spin_iterations {
        if pool.has_eligible_work() {
            return true;
        }
        if round % 16 == 15 {
            thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
    pool.has_eligible_work()
}

/// A named pool of worker threads shared by many [`StageExecutor`]s.
#[derive(Clone)]
pub struct SharedPool {
    inner: Arc<PoolInner>,
}

impl SharedPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, PoolConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: PoolConfig) -> Self {
        assert!(config.max_workers > 0, "pool needs at least one worker");
        let name = name.into();
        debug!(pool = %name, max_workers = config.max_workers, "pool created");
        Self {
            inner: Arc::new_cyclic(|self_ref| PoolInner {
                name,
                config,
                self_ref: self_ref.clone(),
                stages: RwLock::new(Vec::new()),
                descheduled: WaitQueue::new(),
                shutdown: AtomicBool::new(false),
                workers: Mutex::new(HashMap::new()),
                worker_count: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
                scan_cursor: AtomicUsize::new(0),
                terminated: OneShotCondition::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Creates a stage served by this pool's workers.
    ///
    /// `max_workers` caps the stage's concurrent executions, `max_queued`
    /// bounds its queue before submitters block.
    pub fn new_executor(
        &self,
        max_workers: usize,
        max_queued: usize,
        stage_name: impl Into<String>,
    ) -> StageExecutor {
        let stage_name = stage_name.into();
        let stage = StageInner::new(
            Arc::downgrade(&self.inner),
            &self.inner.name,
            max_workers,
            max_queued,
            stage_name,
        );
        self.inner.stages.write().push(stage.clone());
        let executor = StageExecutor::from_inner(stage);
        if self.inner.is_shutdown() {
            warn!(pool = %self.inner.name, stage = %executor.name(),
                "stage created on a shut-down pool");
            executor.shutdown();
        }
        executor
    }

    /// Shuts down the pool and all of its stages. Tasks whose enqueue
    /// completed before this call still run; parked workers are woken to
    /// drain and exit.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pool = %self.inner.name, "pool shutting down");

        let stages: Vec<Arc<StageInner>> = self.inner.stages.read().clone();
        for stage in &stages {
            StageExecutor::from_inner(stage.clone()).shutdown();
        }

        self.inner.descheduled.signal_all();
        for stage in &stages {
            if stage.pending() > 0 {
                self.inner.maybe_schedule();
            }
        }

        if self.inner.worker_count.load(Ordering::SeqCst) == 0 && self.inner.queues_empty() {
            self.inner.terminated.signal_all();
        }
    }

    /// Blocks until the pool has shut down and every worker exited, or
    /// `timeout` elapses. Returns whether the pool terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.terminated.wait_for(timeout)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.is_signalled()
    }

    /// Worker threads currently registered with the pool.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// Number of stages not yet retired.
    pub fn stage_count(&self) -> usize {
        self.inner.stages.read().len()
    }
}
