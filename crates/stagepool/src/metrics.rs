//! Per-stage observational metrics.
//!
//! Gauges are live closures over the stage's counters; counters are shared
//! handles bumped on the submission path. Everything is registered in a
//! process-wide registry under a structured name and released again when the
//! stage shuts down.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

/// Metric group for every stage metric.
pub const METRICS_GROUP: &str = "stagepool.metrics";

/// Metric type under which stage metrics are filed.
pub const STAGE_METRIC_TYPE: &str = "Stages";

pub const ACTIVE_TASKS: &str = "ActiveTasks";
pub const PENDING_TASKS: &str = "PendingTasks";
pub const COMPLETED_TASKS: &str = "CompletedTasks";
pub const TOTAL_BLOCKED_TASKS: &str = "TotalBlockedTasks";
pub const CURRENTLY_BLOCKED_TASKS: &str = "CurrentlyBlockedTasks";
pub const MAX_POOL_SIZE: &str = "MaxPoolSize";

const STAGE_METRIC_NAMES: &[&str] = &[
    ACTIVE_TASKS,
    PENDING_TASKS,
    COMPLETED_TASKS,
    TOTAL_BLOCKED_TASKS,
    CURRENTLY_BLOCKED_TASKS,
    MAX_POOL_SIZE,
];

/// Fully qualified metric identity: `(group, type, path, scope, name)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricName {
    pub group: &'static str,
    pub metric_type: &'static str,
    /// Pool the stage belongs to.
    pub path: String,
    /// Stage name.
    pub scope: String,
    pub name: &'static str,
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:type={},path={},scope={},name={}",
            self.group, self.metric_type, self.path, self.scope, self.name
        )
    }
}

/// Builds the metric names for one `(pool, stage)` pair.
#[derive(Clone)]
pub struct MetricNameFactory {
    metric_type: &'static str,
    path: String,
    scope: String,
}

impl MetricNameFactory {
    pub fn new(metric_type: &'static str, path: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            metric_type,
            path: path.into(),
            scope: scope.into(),
        }
    }

    pub fn create(&self, name: &'static str) -> MetricName {
        MetricName {
            group: METRICS_GROUP,
            metric_type: self.metric_type,
            path: self.path.clone(),
            scope: self.scope.clone(),
            name,
        }
    }
}

/// Monotonic-or-current counter with explicit increment and decrement.
#[derive(Default)]
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

type GaugeFn = Arc<dyn Fn() -> u64 + Send + Sync>;

enum Metric {
    Gauge(GaugeFn),
    Counter(Arc<Counter>),
}

/// Process-wide metric registry.
pub struct MetricsRegistry {
    metrics: RwLock<HashMap<MetricName, Metric>>,
}

impl MetricsRegistry {
    fn new() -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_gauge(&self, name: MetricName, gauge: impl Fn() -> u64 + Send + Sync + 'static) {
        self.metrics
            .write()
            .insert(name, Metric::Gauge(Arc::new(gauge)));
    }

    pub fn register_counter(&self, name: MetricName) -> Arc<Counter> {
        let counter = Arc::new(Counter::default());
        self.metrics
            .write()
            .insert(name, Metric::Counter(counter.clone()));
        counter
    }

    pub fn remove(&self, name: &MetricName) {
        self.metrics.write().remove(name);
    }

    pub fn contains(&self, name: &MetricName) -> bool {
        self.metrics.read().contains_key(name)
    }

    /// Current value of a registered metric; gauges are sampled live.
    pub fn value(&self, name: &MetricName) -> Option<i64> {
        match self.metrics.read().get(name)? {
            Metric::Gauge(gauge) => Some(gauge() as i64),
            Metric::Counter(counter) => Some(counter.get()),
        }
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }
}

/// The process-wide registry stage metrics are filed in.
pub fn registry() -> &'static MetricsRegistry {
    static REGISTRY: std::sync::OnceLock<MetricsRegistry> = std::sync::OnceLock::new();
    REGISTRY.get_or_init(MetricsRegistry::new)
}

/// Live counters shared between a stage and its gauges.
pub(crate) struct StageCounters {
    pub(crate) active: CachePadded<AtomicUsize>,
    pub(crate) queued: CachePadded<AtomicUsize>,
    pub(crate) completed: CachePadded<AtomicU64>,
}

impl StageCounters {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            active: CachePadded::new(AtomicUsize::new(0)),
            queued: CachePadded::new(AtomicUsize::new(0)),
            completed: CachePadded::new(AtomicU64::new(0)),
        })
    }
}

/// The metric facet of one stage.
pub struct StageMetrics {
    factory: MetricNameFactory,
    pub(crate) total_blocked: Arc<Counter>,
    pub(crate) currently_blocked: Arc<Counter>,
}

impl StageMetrics {
    pub(crate) fn new(
        pool_name: &str,
        stage_name: &str,
        max_workers: usize,
        counters: &Arc<StageCounters>,
    ) -> Self {
        let factory = MetricNameFactory::new(STAGE_METRIC_TYPE, pool_name, stage_name);
        let registry = registry();

        let sampled = counters.clone();
        registry.register_gauge(factory.create(ACTIVE_TASKS), move || {
            sampled.active.load(Ordering::SeqCst) as u64
        });
        let sampled = counters.clone();
        registry.register_gauge(factory.create(PENDING_TASKS), move || {
            sampled.queued.load(Ordering::SeqCst) as u64
        });
        let sampled = counters.clone();
        registry.register_gauge(factory.create(COMPLETED_TASKS), move || {
            sampled.completed.load(Ordering::SeqCst)
        });
        registry.register_gauge(factory.create(MAX_POOL_SIZE), move || max_workers as u64);

        let total_blocked = registry.register_counter(factory.create(TOTAL_BLOCKED_TASKS));
        let currently_blocked = registry.register_counter(factory.create(CURRENTLY_BLOCKED_TASKS));

        Self {
            factory,
            total_blocked,
            currently_blocked,
        }
    }

    /// Deregisters every metric of this stage.
    pub(crate) fn release(&self) {
        let registry = registry();
        for name in STAGE_METRIC_NAMES {
            registry.remove(&self.factory.create(name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_name_renders_full_tuple() {
        let factory = MetricNameFactory::new(STAGE_METRIC_TYPE, "pool-a", "stage-b");
        let name = factory.create(ACTIVE_TASKS);
        assert_eq!(
            name.to_string(),
            "stagepool.metrics:type=Stages,path=pool-a,scope=stage-b,name=ActiveTasks"
        );
    }

    #[test]
    fn stage_metrics_register_and_release() {
        let counters = StageCounters::new();
        let metrics = StageMetrics::new("pool-m", "stage-m", 7, &counters);
        let factory = MetricNameFactory::new(STAGE_METRIC_TYPE, "pool-m", "stage-m");

        for name in STAGE_METRIC_NAMES {
            assert!(
                registry().contains(&factory.create(name)),
                "{name} should be registered"
            );
        }
        assert_eq!(registry().value(&factory.create(MAX_POOL_SIZE)), Some(7));

        counters.queued.store(3, Ordering::SeqCst);
        assert_eq!(registry().value(&factory.create(PENDING_TASKS)), Some(3));

        metrics.total_blocked.inc();
        assert_eq!(
            registry().value(&factory.create(TOTAL_BLOCKED_TASKS)),
            Some(1)
        );

        metrics.release();
        for name in STAGE_METRIC_NAMES {
            assert!(!registry().contains(&factory.create(name)));
        }
    }
}
