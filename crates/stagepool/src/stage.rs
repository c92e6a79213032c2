//! Per-stage submission endpoint.
//!
//! A stage is a named FIFO of tasks with a hard cap on concurrent executions
//! (`max_workers`) and a soft cap on queued tasks (`max_queued`). All stages
//! of a pool are serviced by the pool's shared workers; the stage itself only
//! accounts permits, applies submitter backpressure, and exposes metrics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, trace};

use crate::condition::OneShotCondition;
use crate::metrics::{StageCounters, StageMetrics};
use crate::pool::PoolInner;
use crate::task::{Task, TaskBody, TaskFuture};
use crate::wait_queue::{Signal, WaitQueue};

/// How long one bounded offer attempt waits before the submitter re-checks
/// queue capacity and shutdown.
const OFFER_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Submission refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("stage '{stage}' is shut down")]
    Rejected { stage: String },
}

/// Observability callbacks around the blocking-submission sequence.
///
/// `on_initial_rejection` fires when a submission first finds the queue over
/// its cap; exactly one of `on_final_accept` / `on_final_rejection` follows.
pub trait SubmissionHooks: Send + Sync {
    fn on_initial_rejection(&self, _stage: &str) {}
    fn on_final_accept(&self, _stage: &str) {}
    fn on_final_rejection(&self, _stage: &str) {}
}

struct NoopHooks;

impl SubmissionHooks for NoopHooks {}

pub(crate) struct StageInner {
    name: String,
    max_workers: usize,
    max_queued: usize,
    queue: SegQueue<Arc<Task>>,
    pub(crate) counters: Arc<StageCounters>,
    shutdown: AtomicBool,
    /// Submitters blocked on a full queue.
    permit_waiters: WaitQueue,
    drained: OneShotCondition,
    pool: Weak<PoolInner>,
    metrics: StageMetrics,
    metrics_released: AtomicBool,
    hooks: RwLock<Arc<dyn SubmissionHooks>>,
}

impl StageInner {
    pub(crate) fn new(
        pool: Weak<PoolInner>,
        pool_name: &str,
        max_workers: usize,
        max_queued: usize,
        name: String,
    ) -> Arc<Self> {
        let counters = StageCounters::new();
        let metrics = StageMetrics::new(pool_name, &name, max_workers, &counters);
        Arc::new(Self {
            name,
            max_workers,
            max_queued,
            queue: SegQueue::new(),
            counters,
            shutdown: AtomicBool::new(false),
            permit_waiters: WaitQueue::new(),
            drained: OneShotCondition::new(),
            pool,
            metrics,
            metrics_released: AtomicBool::new(false),
            hooks: RwLock::new(Arc::new(NoopHooks)),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn pending(&self) -> usize {
        self.counters.queued.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// True when a worker could usefully poll this stage right now.
    pub(crate) fn is_eligible(&self) -> bool {
        self.pending() > 0 && self.active() < self.max_workers
    }

    /// Reserves one execution permit under the concurrency cap.
    pub(crate) fn try_acquire_permit(&self) -> bool {
        let mut current = self.counters.active.load(Ordering::SeqCst);
        loop {
            if current >= self.max_workers {
                return false;
            }
            match self.counters.active.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn release_permit(&self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Dequeues the next task body, skipping revoked entries. The caller must
    /// hold a permit.
    pub(crate) fn try_take_task(&self) -> Option<TaskBody> {
        while let Some(task) = self.queue.pop() {
            if let Some(body) = task.take() {
                self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                // one slot freed, one blocked submitter may proceed
                self.permit_waiters.signal();
                return Some(body);
            }
        }
        None
    }

    /// Bookkeeping after a task body ran (worker-side or inline).
    pub(crate) fn on_task_complete(&self) {
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        self.release_permit();
        if self.pending() > 0 {
            self.nudge_pool();
        }
        self.maybe_signal_drained();
    }

    fn nudge_pool(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.maybe_schedule();
        }
    }

    pub(crate) fn maybe_signal_drained(&self) {
        if self.is_shutdown() && self.pending() == 0 && self.active() == 0 {
            self.drained.signal_all();
            if let Some(pool) = self.pool.upgrade() {
                pool.remove_stage(self);
            }
        }
    }

    fn release_metrics(&self) {
        if !self.metrics_released.swap(true, Ordering::SeqCst) {
            self.metrics.release();
        }
    }

    fn enqueue(&self, body: TaskBody) -> Result<(), SubmitError> {
        if self.is_shutdown() {
            return Err(SubmitError::Rejected {
                stage: self.name.clone(),
            });
        }
        let task = Task::new(body);
        self.queue.push(task.clone());
        let queued = self.counters.queued.fetch_add(1, Ordering::SeqCst) + 1;
        self.nudge_pool();
        if self.is_shutdown() {
            // Shutdown landed between the check and the push; nudge again so
            // a drain worker exists for the task we just made visible.
            self.nudge_pool();
        }
        if queued > self.max_queued {
            return self.block_until_accepted(task);
        }
        Ok(())
    }

    /// Backpressure: the task is enqueued, but the submitter does not return
    /// until the queue is back within its cap. A submitter that observes
    /// shutdown while blocked withdraws the task if no worker has claimed it
    /// yet; a claimed task counts as accepted.
    fn block_until_accepted(&self, task: Arc<Task>) -> Result<(), SubmitError> {
        let hooks = self.hooks.read().clone();
        hooks.on_initial_rejection(&self.name);
        self.metrics.total_blocked.inc();
        self.metrics.currently_blocked.inc();
        trace!(stage = %self.name, "submission blocked on full queue");

        let accepted = loop {
            if self.counters.queued.load(Ordering::SeqCst) <= self.max_queued {
                break true;
            }
            if self.is_shutdown() {
                if task.revoke() {
                    self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                    self.maybe_signal_drained();
                    break false;
                }
                break true;
            }
            let signal = self.permit_waiters.register();
            if self.counters.queued.load(Ordering::SeqCst) <= self.max_queued || self.is_shutdown()
            {
                signal.cancel();
                continue;
            }
            let _ = signal.wait_until(Instant::now() + OFFER_RETRY_INTERVAL);
        };

        self.metrics.currently_blocked.dec();
        if accepted {
            hooks.on_final_accept(&self.name);
            Ok(())
        } else {
            hooks.on_final_rejection(&self.name);
            Err(SubmitError::Rejected {
                stage: self.name.clone(),
            })
        }
    }

    fn shutdown_stage(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(stage = %self.name, pending = self.pending(), "stage shutting down");
        self.permit_waiters.signal_all();
        self.release_metrics();
        if self.pending() > 0 {
            self.nudge_pool();
        }
        self.maybe_signal_drained();
    }
}

/// Handle to a stage of a [`SharedPool`](crate::pool::SharedPool).
///
/// Clones address the same stage.
#[derive(Clone)]
pub struct StageExecutor {
    inner: Arc<StageInner>,
}

impl StageExecutor {
    pub(crate) fn from_inner(inner: Arc<StageInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Enqueues a task and nudges the pool.
    ///
    /// Blocks while the stage queue is over `max_queued`; with
    /// `max_queued == 0` every submission rendezvouses with a worker pickup.
    /// Fails with [`SubmitError::Rejected`] once the stage is shut down.
    pub fn submit(&self, body: impl FnOnce() + Send + 'static) -> Result<(), SubmitError> {
        self.inner.enqueue(Box::new(body))
    }

    /// Same contract as [`submit`](StageExecutor::submit).
    pub fn execute(&self, body: impl FnOnce() + Send + 'static) -> Result<(), SubmitError> {
        self.submit(body)
    }

    /// Submits a task and returns a completion handle for its value.
    pub fn spawn<R, F>(&self, body: F) -> Result<TaskFuture<R>, SubmitError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let future = TaskFuture::new();
        self.inner.enqueue(future.wrap(body))?;
        Ok(future)
    }

    /// Runs the task inline on the calling thread when an execution permit is
    /// free, falling back to a normal submission otherwise.
    ///
    /// Inline runs hold a permit and count toward `active_count` and
    /// `completed_count` exactly like worker-side runs.
    pub fn maybe_execute_immediately(
        &self,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<(), SubmitError> {
        if self.inner.is_shutdown() {
            return Err(SubmitError::Rejected {
                stage: self.inner.name().to_string(),
            });
        }
        if self.inner.try_acquire_permit() {
            crate::task::run_contained(Box::new(body));
            self.inner.on_task_complete();
            Ok(())
        } else {
            self.inner.enqueue(Box::new(body))
        }
    }

    /// Stops accepting new work. Already queued tasks still drain.
    pub fn shutdown(&self) {
        self.inner.shutdown_stage();
    }

    /// Blocks until the stage is shut down and fully drained, or `timeout`
    /// elapses. Returns whether the stage terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.drained.wait_for(timeout)
    }

    /// Replaces the stage's submission hooks.
    pub fn set_submission_hooks(&self, hooks: Arc<dyn SubmissionHooks>) {
        *self.inner.hooks.write() = hooks;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    /// Tasks currently executing.
    pub fn active_count(&self) -> usize {
        self.inner.active()
    }

    /// Tasks executed to completion so far.
    pub fn completed_count(&self) -> u64 {
        self.inner.counters.completed.load(Ordering::SeqCst)
    }

    /// Tasks queued and not yet dispatched.
    pub fn pending_tasks(&self) -> usize {
        self.inner.pending()
    }

    /// The stage's concurrency cap.
    pub fn max_pool_size(&self) -> usize {
        self.inner.max_workers
    }
}
