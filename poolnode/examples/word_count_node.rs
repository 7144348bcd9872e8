//! Pool node example against the in-memory pool.
//!
//! Registers a word-count runner with a typed socket schema, feeds it a few
//! jobs and prints what the pool received. The runner caches counts in the
//! local cache tier, so the repeated input is served without recounting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use poolnode::*;
use poolnode_testkit::{fast_timings, text_job, wait_until, InMemoryPool, InMemoryTransport};

struct WordCount {
    config: RunnerConfig,
}

impl WordCount {
    fn new() -> Self {
        let meta = RunnerMeta {
            kind: 5003,
            name: "word-count".to_string(),
            description: "Counts the words of a text input".to_string(),
            tags: vec!["text".to_string(), "tool".to_string()],
            ..Default::default()
        };
        let sockets = SocketSchema::default()
            .with_input(
                "text",
                SocketSpec::new(SocketType::String).with_title("Text to count"),
            )
            .with_output("count", SocketSpec::new(SocketType::Integer));
        Self {
            config: RunnerConfig::new(meta)
                .with_template("{\"kind\":5003,\"content\":\"{{in.text}}\"}")
                .with_sockets(sockets)
                .with_parallel(true),
        }
    }
}

#[async_trait]
impl JobRunner for WordCount {
    fn config(&self) -> &RunnerConfig {
        &self.config
    }

    async fn can_run(&self, ctx: &JobContext) -> bool {
        ctx.input(None).is_some()
    }

    async fn run(&self, ctx: &JobContext) -> anyhow::Result<String> {
        let text = ctx
            .input(None)
            .map(|input| input.data.clone())
            .unwrap_or_default();

        if let Some(count) = ctx.cache_get::<usize>(&text, 0, CacheLocation::Local).await {
            ctx.logger().info("served from cache");
            return Ok(count.to_string());
        }

        let count = text.split_whitespace().count();
        ctx.cache_set(&text, &count, CacheOptions::local(1)).await;
        ctx.logger().info(format!("counted {count} words"));
        Ok(count.to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing(logging::default_directive())?;

    let cache_dir = tempfile::tempdir()?;
    let pool = InMemoryPool::new().with_refresh_interval(Duration::from_secs(5));
    let config = NodeConfig::new(NodeMeta::new("example-node").with_version("0.1.0"))
        .with_cache_dir(cache_dir.path())
        .with_timings(fast_timings());

    let node = NodeRuntimeBuilder::new(config)
        .with_transport(Arc::new(InMemoryTransport::new(pool.clone())))
        .with_runner(Arc::new(WordCount::new()))
        .build()?;

    pool.push_job(text_job("job-1", 5003, "the quick brown fox"));
    pool.push_job(text_job("job-2", 5003, "jumps over the lazy dog"));

    node.start(StartOptions::default()).await?;
    wait_until(Duration::from_secs(5), || pool.completed_jobs().len() == 2).await;

    pool.push_job(text_job("job-3", 5003, "the quick brown fox"));
    wait_until(Duration::from_secs(5), || pool.completed_jobs().len() == 3).await;

    node.shutdown().await?;

    for (job_id, output) in pool.completed_jobs() {
        println!("{job_id}: {output} words");
        for line in pool.logs_for(&job_id) {
            println!("    {line}");
        }
    }
    Ok(())
}
