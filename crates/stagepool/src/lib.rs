//! Shared-pool stage executor.
//!
//! Many named submission endpoints ([`StageExecutor`]s) multiplex over one
//! shared set of worker threads (a [`SharedPool`]). Each stage enforces its
//! own concurrency cap and queue bound with backpressure on submitters, while
//! the pool keeps workers busy across stages and parks them when idle.
//!
//! The coordination layer underneath is exported as well:
//! [`WaitQueue`]/[`Signal`] provide single wake, broadcast, and
//! cancellation with wake forwarding, and [`OneShotCondition`] is a latched
//! condition without lost notifies. Both the submission backpressure and
//! the worker idle-park paths are built on it.

pub mod condition;
pub mod metrics;
pub mod pool;
pub mod stability;
pub mod stage;
pub mod task;
pub mod wait_queue;

pub use condition::OneShotCondition;
pub use metrics::{MetricName, MetricNameFactory, MetricsRegistry, StageMetrics, registry};
pub use pool::{PoolConfig, SharedPool};
pub use stability::{FATAL_EXIT_CODE, FatalHooks, install_fatal_hooks};
pub use stage::{StageExecutor, SubmissionHooks, SubmitError};
pub use task::{JoinError, TaskFuture, handle_or_log, set_failure_handler, swallow_failures};
pub use wait_queue::{RegisteredSignal, Signal, WaitQueue, all, any};
