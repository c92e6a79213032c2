//! Task representation and failure plumbing.
//!
//! A queued task is a one-shot closure held in a revocable cell: the body is
//! consumed either by the worker that dequeues it or by a submitter backing
//! out of a rejected submission, never both. Panics escaping a task body are
//! routed through [`stability`](crate::stability) and then to the installed
//! process-wide failure handler, falling back to the log.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::error;

use crate::condition::OneShotCondition;
use crate::stability;

pub(crate) type TaskBody = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work queued on a stage.
pub(crate) struct Task {
    body: Mutex<Option<TaskBody>>,
}

impl Task {
    pub(crate) fn new(body: TaskBody) -> Arc<Self> {
        Arc::new(Self {
            body: Mutex::new(Some(body)),
        })
    }

    /// Takes the body for execution. Returns None when the task was revoked
    /// or already taken.
    pub(crate) fn take(&self) -> Option<TaskBody> {
        self.body.lock().take()
    }

    /// Attempts to withdraw the task before a worker consumes it.
    pub(crate) fn revoke(&self) -> bool {
        self.body.lock().take().is_some()
    }
}

/// Why a joined task produced no value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("task failed: {0}")]
    Failed(String),
    #[error("timed out waiting for task completion")]
    Timeout,
}

struct FutureShared<R> {
    done: OneShotCondition,
    outcome: Mutex<Option<Result<R, JoinError>>>,
}

/// Completion handle for a task submitted with
/// [`StageExecutor::spawn`](crate::stage::StageExecutor::spawn).
///
/// Captures the task's value, or the panic message if the body panicked.
/// A panic is still routed to the process-wide failure handler; the handle
/// only adds an explicit completion channel on top.
pub struct TaskFuture<R> {
    shared: Arc<FutureShared<R>>,
}

impl<R: Send + 'static> TaskFuture<R> {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(FutureShared {
                done: OneShotCondition::new(),
                outcome: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn wrap(&self, body: impl FnOnce() -> R + Send + 'static) -> TaskBody {
        let shared = self.shared.clone();
        Box::new(move || {
            match panic::catch_unwind(AssertUnwindSafe(body)) {
                Ok(value) => {
                    *shared.outcome.lock() = Some(Ok(value));
                    shared.done.signal_all();
                }
                Err(payload) => {
                    let message = failure_message(payload.as_ref());
                    *shared.outcome.lock() = Some(Err(JoinError::Failed(message)));
                    shared.done.signal_all();
                    // Re-raise so the worker wrapper sees the failure too:
                    // spawned tasks are inspected and logged like any other.
                    panic::resume_unwind(payload);
                }
            }
        })
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.is_signalled()
    }

    /// Blocks until the task completes.
    pub fn wait(&self) -> Result<R, JoinError> {
        self.shared.done.wait();
        self.take_outcome()
    }

    /// Blocks until the task completes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, JoinError> {
        if !self.shared.done.wait_until(Instant::now() + timeout) {
            return Err(JoinError::Timeout);
        }
        self.take_outcome()
    }

    fn take_outcome(&self) -> Result<R, JoinError> {
        self.shared
            .outcome
            .lock()
            .take()
            .unwrap_or(Err(JoinError::Timeout))
    }
}

type FailureHandler = dyn Fn(&str) + Send + Sync;

fn failure_handler() -> &'static RwLock<Option<Arc<FailureHandler>>> {
    static HANDLER: std::sync::OnceLock<RwLock<Option<Arc<FailureHandler>>>> =
        std::sync::OnceLock::new();
    HANDLER.get_or_init(|| RwLock::new(None))
}

/// Installs the process-wide task-failure handler.
///
/// The handler receives the rendered panic message of every task body that
/// failed. Installing replaces any previous handler.
pub fn set_failure_handler(handler: impl Fn(&str) + Send + Sync + 'static) {
    *failure_handler().write() = Some(Arc::new(handler));
}

/// Clears the process-wide task-failure handler.
pub fn clear_failure_handler() {
    *failure_handler().write() = None;
}

/// Forwards `message` to the installed failure handler, or logs it when no
/// handler is installed.
pub fn handle_or_log(message: &str) {
    let handler = failure_handler().read().clone();
    match handler {
        Some(handler) => handler(message),
        None => error!(failure = message, "task failed with no handler installed"),
    }
}

/// Renders a panic payload into a message.
pub(crate) fn failure_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked with a non-string payload".to_string()
    }
}

/// Runs a task body, containing any panic.
///
/// The failure is first inspected for fatal conditions (which may terminate
/// the process) and then handed to the failure handler; the calling worker
/// carries on either way.
pub(crate) fn run_contained(body: TaskBody) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
        let message = failure_message(payload.as_ref());
        stability::inspect_failure(&message);
        handle_or_log(&message);
    }
}

/// Wraps a recurring task body so that failures are logged instead of
/// propagated, keeping an external scheduler's recurrence alive.
pub fn swallow_failures<F>(mut body: F) -> impl FnMut() + Send
where
    F: FnMut() + Send,
{
    move || {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(&mut body)) {
            handle_or_log(&failure_message(payload.as_ref()));
        }
    }
}
