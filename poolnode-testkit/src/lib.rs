//! Test support for poolnode: an in-memory pool, a transport handing it
//! out and runners with scripted behavior.

mod pool;
mod runner;
mod transport;

pub use pool::{InMemoryPool, PoolCall};
pub use runner::{Behavior, RunRecord, ScriptedRunner};
pub use transport::InMemoryTransport;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use poolnode::{
    Job, JobId, JobInput, JobRunner, NodeConfig, NodeMeta, NodeRuntime, NodeRuntimeBuilder,
    RuntimeTimings,
};

/// A pending job of `kind` whose first input is `data`.
pub fn text_job(id: &str, kind: u32, data: &str) -> Job {
    Job {
        id: JobId::from(id),
        kind,
        inputs: vec![JobInput::text(data)],
        ..Default::default()
    }
}

/// Timings short enough for tests to observe several loop iterations.
pub fn fast_timings() -> RuntimeTimings {
    RuntimeTimings {
        announce_interval_ms: 20,
        scheduler_interval_ms: 10,
        lock_ttl_ms: 60_000,
        poll_wait_ms: 50,
        error_backoff_ms: 20,
        sub_job_wait_ms: 10,
        sub_job_poll_interval_ms: 5,
        shutdown_grace_ms: 2_000,
    }
}

/// Node named `test-node` using [`fast_timings`] and caching under
/// `cache_dir`.
pub fn test_config(cache_dir: &Path) -> NodeConfig {
    NodeConfig::new(NodeMeta::new("test-node").with_version("0.1.0"))
        .with_cache_dir(cache_dir)
        .with_timings(fast_timings())
}

/// Builds a node on `pool` with `runners` registered.
pub fn test_node(
    pool: &InMemoryPool,
    config: NodeConfig,
    runners: Vec<Arc<dyn JobRunner>>,
) -> anyhow::Result<NodeRuntime> {
    runners
        .into_iter()
        .fold(
            NodeRuntimeBuilder::new(config)
                .with_transport(Arc::new(InMemoryTransport::new(pool.clone()))),
            |builder, runner| builder.with_runner(runner),
        )
        .build()
}

/// Polls `condition` every few milliseconds until it holds or `limit`
/// passes. Returns whether it held.
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Awaits `future`, failing the test if it takes longer than `limit`.
pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(limit, future).await {
        Ok(value) => value,
        Err(_) => panic!("operation did not finish within {limit:?}"),
    }
}
