//! Prometheus metrics for a pool node.
//!
//! Compiled only with the `metrics` feature.
//!
//! ## Counters
//! - `poolnode_jobs_fetched_total` - Jobs returned by pending-job polls
//! - `poolnode_poll_errors_total` - Failed poll cycles
//! - `poolnode_announce_total` - Announcements by target and result
//!
//! ## Histograms
//! - `poolnode_job_duration_seconds` - Job lifecycle duration by outcome
#![cfg(feature = "metrics")]

use std::sync::LazyLock;

use prometheus::{exponential_buckets, CounterVec, HistogramVec, Opts, Registry};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `runner`.
pub static JOBS_FETCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "poolnode_jobs_fetched_total",
        "Jobs returned by pending-job polls",
    );
    CounterVec::new(opts, &["runner"]).expect("poolnode_jobs_fetched_total metric creation failed")
});

/// Labels: `runner`.
pub static POLL_ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("poolnode_poll_errors_total", "Failed poll cycles");
    CounterVec::new(opts, &["runner"]).expect("poolnode_poll_errors_total metric creation failed")
});

/// Labels: `target` (`node` or runner name), `result` (`ok`, `error`).
pub static ANNOUNCE_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("poolnode_announce_total", "Announcements sent to the pool");
    CounterVec::new(opts, &["target", "result"])
        .expect("poolnode_announce_total metric creation failed")
});

/// Labels: `runner`, `outcome`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.005, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "poolnode_job_duration_seconds",
        "Job lifecycle duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["runner", "outcome"])
        .expect("poolnode_job_duration_seconds metric creation failed")
});

/// Registers every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_FETCHED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(POLL_ERRORS_TOTAL.clone()),
        Box::new(ANNOUNCE_TOTAL.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_jobs_fetched(runner: &str, count: usize) {
    JOBS_FETCHED_TOTAL
        .with_label_values(&[runner])
        .inc_by(count as f64);
}

pub fn record_poll_error(runner: &str) {
    POLL_ERRORS_TOTAL.with_label_values(&[runner]).inc();
}

pub fn record_announce(target: &str, success: bool) {
    let result = if success { "ok" } else { "error" };
    ANNOUNCE_TOTAL.with_label_values(&[target, result]).inc();
}

pub fn observe_job(runner: &str, outcome: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[runner, outcome])
        .observe(duration_secs);
}

/// Gathers every registered metric in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
