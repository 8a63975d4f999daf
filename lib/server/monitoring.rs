use crate::build_info;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

/// Registers immutable build metadata as a labeled gauge with value `1`.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: "insights_worker",
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    let sub_registry = registry.sub_registry_with_prefix(prefix);
    sub_registry.register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

/// Label set for upstream failures, keyed by normalized error kind.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub kind: &'static str,
}

/// Label set for orchestrator sub-task outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskLabels {
    pub task: &'static str,
    pub outcome: &'static str,
}

#[derive(Clone)]
pub struct InsightsMetrics {
    /// Upstream insights calls, one per chunk and metric list.
    pub upstream_calls_total: Counter,
    pub upstream_failures_total: Family<FailureLabels, Counter>,
    /// Calls that fell back to the reduced metric list.
    pub metric_fallbacks_total: Counter,
    pub snapshot_rows_written_total: Counter,
    pub cache_hits_total: Counter,
    pub cache_misses_total: Counter,
    /// Requests that joined an in-flight computation.
    pub cache_joins_total: Counter,
    pub cache_not_modified_total: Counter,
    pub cache_entries: Gauge,
    pub backfill_inserted_total: Counter,
    pub backfill_skipped_total: Counter,
    pub throttled_total: Counter,
    pub orchestrator_tasks_total: Family<TaskLabels, Counter>,
}

impl InsightsMetrics {
    fn init() -> Self {
        Self {
            upstream_calls_total: Counter::default(),
            upstream_failures_total: Family::default(),
            metric_fallbacks_total: Counter::default(),
            snapshot_rows_written_total: Counter::default(),
            cache_hits_total: Counter::default(),
            cache_misses_total: Counter::default(),
            cache_joins_total: Counter::default(),
            cache_not_modified_total: Counter::default(),
            cache_entries: Gauge::default(),
            backfill_inserted_total: Counter::default(),
            backfill_skipped_total: Counter::default(),
            throttled_total: Counter::default(),
            orchestrator_tasks_total: Family::default(),
        }
    }

    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::init();
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "upstream_calls",
            "Total number of upstream insights calls",
            metrics.upstream_calls_total.clone(),
        );
        sub_registry.register(
            "upstream_failures",
            "Total number of failed upstream calls by error kind",
            metrics.upstream_failures_total.clone(),
        );
        sub_registry.register(
            "metric_fallbacks",
            "Total number of calls retried with the fallback metric list",
            metrics.metric_fallbacks_total.clone(),
        );
        sub_registry.register(
            "snapshot_rows_written",
            "Total number of daily snapshot rows upserted",
            metrics.snapshot_rows_written_total.clone(),
        );
        sub_registry.register(
            "cache_hits",
            "Total number of read requests served from the response cache",
            metrics.cache_hits_total.clone(),
        );
        sub_registry.register(
            "cache_misses",
            "Total number of read requests that computed a fresh response",
            metrics.cache_misses_total.clone(),
        );
        sub_registry.register(
            "cache_joins",
            "Total number of read requests that joined an in-flight computation",
            metrics.cache_joins_total.clone(),
        );
        sub_registry.register(
            "cache_not_modified",
            "Total number of conditional reads answered with 304",
            metrics.cache_not_modified_total.clone(),
        );
        sub_registry.register(
            "backfill_inserted",
            "Total number of days written by backfill",
            metrics.backfill_inserted_total.clone(),
        );
        sub_registry.register(
            "backfill_skipped",
            "Total number of missing days upstream had no data for",
            metrics.backfill_skipped_total.clone(),
        );
        sub_registry.register(
            "cache_entries",
            "Current number of response cache entries",
            metrics.cache_entries.clone(),
        );
        sub_registry.register(
            "throttled",
            "Total number of prewarm or repair requests rejected by cooldown",
            metrics.throttled_total.clone(),
        );
        sub_registry.register(
            "orchestrator_tasks",
            "Total number of prewarm and repair sub-tasks by outcome",
            metrics.orchestrator_tasks_total.clone(),
        );
        metrics
    }
}

pub static INSIGHTS_METRICS: OnceCell<InsightsMetrics> = OnceCell::const_new();
