//! Prometheus metrics for lease coordination.
//!
//! Metrics cover:
//! - Lease store operations (acquire, renew, release, checkpoint, ...)
//! - Concurrency conflicts absorbed by the lease updater
//! - Partition ownership and supervisor close reasons
//! - Load balancing decisions
//! - Change processing throughput and estimated remaining work
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "feedlease" prefix
//! to avoid name collisions with other libraries using the default Prometheus
//! registry. Registration errors are handled gracefully - if a metric fails to
//! register, an unregistered fallback is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for feedlease metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("feedlease".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Lease metrics
// =============================================================================

define_counter_vec!(
    LEASE_OPERATIONS,
    "lease_operations_total",
    "Lease store operations by operation and outcome",
    ["operation", "status"]
);
define_counter!(
    LEASE_UPDATE_CONFLICTS,
    "lease_update_conflicts_total",
    "Concurrency conflicts absorbed by the lease updater"
);
define_histogram_vec!(
    LEASE_OPERATION_DURATION,
    "lease_operation_duration_seconds",
    "Latency of lease store operations",
    ["operation"],
    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
);

// =============================================================================
// Partition metrics
// =============================================================================

define_gauge!(
    OWNED_PARTITIONS,
    "owned_partitions",
    "Number of partitions currently supervised by this host"
);
define_counter_vec!(
    SUPERVISOR_CLOSES,
    "supervisor_closes_total",
    "Partition supervisors stopped, by close reason",
    ["reason"]
);
define_counter!(
    PARTITION_SPLITS,
    "partition_splits_total",
    "Partition splits handled by this host"
);
define_counter!(
    CHANGES_PROCESSED,
    "changes_processed_total",
    "Feed items delivered to change handlers"
);

// =============================================================================
// Balancing metrics
// =============================================================================

define_counter_vec!(
    LEASES_TAKEN,
    "leases_taken_total",
    "Leases selected by the balancing strategy, by reason",
    ["reason"]
);
define_counter_vec!(
    BALANCING_PASSES,
    "balancing_passes_total",
    "Load balancing passes by outcome",
    ["status"]
);
define_counter_vec!(
    BOOTSTRAP_OPERATIONS,
    "bootstrap_operations_total",
    "Bootstrap steps by outcome",
    ["step", "status"]
);
define_gauge!(
    ESTIMATED_REMAINING_WORK,
    "estimated_remaining_work",
    "Last aggregate estimate of unprocessed feed items"
);

/// Register an IntGauge safely, returning a fallback on error.
fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntCounterVec safely, returning a fallback on error.
fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Register an IntCounter safely, returning a fallback on error.
fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

/// Register a HistogramVec safely, returning a fallback on error.
fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric so they appear before first use.
pub fn init_metrics() {
    let _ = &*LEASE_OPERATIONS;
    let _ = &*LEASE_UPDATE_CONFLICTS;
    let _ = &*LEASE_OPERATION_DURATION;
    let _ = &*OWNED_PARTITIONS;
    let _ = &*SUPERVISOR_CLOSES;
    let _ = &*PARTITION_SPLITS;
    let _ = &*CHANGES_PROCESSED;
    let _ = &*LEASES_TAKEN;
    let _ = &*BALANCING_PASSES;
    let _ = &*BOOTSTRAP_OPERATIONS;
    let _ = &*ESTIMATED_REMAINING_WORK;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Gather all metric families from the registry.
pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

/// Record a lease store operation outcome.
pub fn record_lease_operation(operation: &str, status: &str) {
    LEASE_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record the latency of a lease store operation.
pub fn record_lease_duration(operation: &str, duration_secs: f64) {
    LEASE_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Record a concurrency conflict absorbed by the updater.
pub fn record_update_conflict() {
    LEASE_UPDATE_CONFLICTS.inc();
}

/// Record a supervisor stop with its close reason.
pub fn record_supervisor_close(reason: &str) {
    SUPERVISOR_CLOSES.with_label_values(&[reason]).inc();
}

/// Record leases selected by the strategy.
pub fn record_leases_taken(reason: &str, count: usize) {
    LEASES_TAKEN
        .with_label_values(&[reason])
        .inc_by(count as u64);
}

/// Record a load balancing pass outcome.
pub fn record_balancing_pass(status: &str) {
    BALANCING_PASSES.with_label_values(&[status]).inc();
}

/// Record a bootstrap step outcome.
pub fn record_bootstrap(step: &str, status: &str) {
    BOOTSTRAP_OPERATIONS
        .with_label_values(&[step, status])
        .inc();
}
