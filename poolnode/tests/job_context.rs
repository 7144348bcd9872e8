//! Job context tests against the in-memory pool: storage handles, the two
//! cache tiers, action discovery and sub-job dispatch.

use std::sync::Arc;
use std::time::Duration;

use poolnode::*;
use poolnode_testkit::{test_config, test_node, text_job, within, InMemoryPool, PoolCall, ScriptedRunner};
use serde_json::{json, Value};
use tempfile::TempDir;

const LIMIT: Duration = Duration::from_secs(5);

struct Harness {
    _dir: TempDir,
    pool: InMemoryPool,
    node: NodeRuntime,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let pool = InMemoryPool::new();
        let node = test_node(&pool, test_config(dir.path()), Vec::new()).unwrap();
        Self {
            _dir: dir,
            pool,
            node,
        }
    }

    async fn context(&self, job: Job) -> JobContext {
        let runner: Arc<dyn JobRunner> = Arc::new(ScriptedRunner::echo("echo"));
        JobContext::open(&self.node, runner, job).await.unwrap()
    }
}

#[tokio::test]
async fn accessors_expose_job() {
    let harness = Harness::new();
    let mut job = text_job("job-1", 5003, "what is rust");
    job.output_format = "application/json".into();
    job.params.push(JobParam::new("tools", ["search", "fetch"]));
    job.inputs.push(JobInput::text("extra").with_marker("context"));

    let ctx = harness.context(job).await;
    assert_eq!(ctx.job_id().as_str(), "job-1");
    assert_eq!(ctx.param_value("tools"), Some("search"));
    assert_eq!(ctx.param_values("tools").unwrap().len(), 2);
    assert_eq!(ctx.input(None).unwrap().data, "what is rust");
    assert_eq!(ctx.input(Some("context")).unwrap().data, "extra");
    assert_eq!(ctx.inputs(None).len(), 2);
    assert_eq!(ctx.output_format(), "application/json");
    assert_eq!(ctx.logger().name(), "test-node.echo");
    ctx.close().await;
}

#[tokio::test]
async fn storage_handles_reused_and_closed_once() {
    let harness = Harness::new();
    let ctx = harness.context(text_job("job-1", 5003, "")).await;

    let first = ctx.open_storage("hyp://dataset").await.unwrap();
    let again = ctx.open_storage("hyp://dataset").await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    let scratch = ctx.create_storage(Some("scratch"), None, None).await.unwrap();
    let scratch_again = ctx.create_storage(Some("scratch"), None, None).await.unwrap();
    assert!(Arc::ptr_eq(&scratch, &scratch_again));
    assert_eq!(scratch.url(), "hyp://scratch");
    harness.pool.assert_call_count_eq("create_disk", 1);
    harness.pool.assert_call_count_eq("open_disk", 2);

    ctx.close().await;
    ctx.close().await;
    assert!(ctx.is_closed());
    assert!(first.is_closed());
    assert!(scratch.is_closed());
    assert_eq!(harness.pool.disk_close_count(first.id()), 1);
    assert_eq!(harness.pool.disk_close_count(scratch.id()), 1);

    let err = first.list("").await.unwrap_err();
    assert!(matches!(err, DiskError::Closed { .. }));
}

#[tokio::test]
async fn unnamed_storage_created_each_time() {
    let harness = Harness::new();
    let ctx = harness.context(text_job("job-1", 5003, "")).await;

    let a = ctx.create_storage(None, Some("k3y"), Some(true)).await.unwrap();
    let b = ctx.create_storage(None, None, None).await.unwrap();
    assert_ne!(a.id(), b.id());
    assert!(a.url().ends_with("?key=k3y"));
    harness.pool.assert_call_count_eq("create_disk", 2);
    ctx.close().await;
}

#[tokio::test]
async fn storage_round_trip_through_pool() {
    let harness = Harness::new();
    let ctx = harness.context(text_job("job-1", 5003, "")).await;
    let disk = ctx.create_storage(Some("out"), None, None).await.unwrap();

    let mut writer = disk.open_write_stream("notes/a.txt", 4).await.unwrap();
    writer.write(b"hello ").await.unwrap();
    writer.write(b"world").await.unwrap();
    assert!(writer.finish().await.unwrap());

    let sizes: Vec<_> = harness
        .pool
        .write_frames()
        .iter()
        .map(|frame| frame.data.len())
        .collect();
    assert_eq!(sizes, vec![4, 4, 3]);

    let content = disk.open_read_stream("notes/a.txt").await.unwrap().read_to_end().await.unwrap();
    assert_eq!(&content[..], b"hello world");
    assert_eq!(disk.list("notes/").await.unwrap(), vec!["notes/a.txt".to_string()]);

    assert!(disk.delete("notes/a.txt").await.unwrap());
    assert!(!disk.delete("notes/a.txt").await.unwrap());
    let missing = disk.open_read_stream("notes/a.txt").await.unwrap().read_to_end().await;
    assert!(matches!(missing, Err(DiskError::NotFound { .. })));
    ctx.close().await;
}

#[tokio::test]
async fn local_cache_shared_between_jobs() {
    let harness = Harness::new();
    let first = harness.context(text_job("job-1", 5003, "")).await;
    assert!(
        first
            .cache_set("embeddings", &json!({"dims": 384}), CacheOptions::local(2))
            .await
    );
    first.close().await;

    let second = harness.context(text_job("job-2", 5003, "")).await;
    let hit: Option<Value> = second.cache_get("embeddings", 1, CacheLocation::Local).await;
    assert_eq!(hit, Some(json!({"dims": 384})));
    let stale: Option<Value> = second.cache_get("embeddings", 2, CacheLocation::Local).await;
    assert!(stale.is_none());
    second.close().await;

    assert_eq!(harness.pool.call_count("cache_set"), 0);
}

#[tokio::test]
async fn remote_cache_through_pool() {
    let harness = Harness::new();
    let ctx = harness.context(text_job("job-1", 5003, "")).await;

    let stored = ctx
        .cache_set(
            "index",
            &vec!["a", "b", "c"],
            CacheOptions::remote(5).with_chunk_size(3),
        )
        .await;
    assert!(stored);

    let hit: Option<Vec<String>> = ctx.cache_get("index", 4, CacheLocation::Remote).await;
    assert_eq!(hit.unwrap(), vec!["a", "b", "c"]);
    let miss: Option<Vec<String>> = ctx.cache_get("index", 5, CacheLocation::Remote).await;
    assert!(miss.is_none());
    ctx.close().await;
}

#[tokio::test]
async fn cache_errors_logged_as_miss() {
    let harness = Harness::new();
    let ctx = harness.context(text_job("job-1", 5003, "")).await;
    harness.pool.fail_next("cache_get", RpcCode::Unavailable, 1);

    let miss: Option<Value> = ctx.cache_get("index", 0, CacheLocation::Remote).await;
    assert!(miss.is_none());
    ctx.close().await;

    let logs = harness.pool.logs_for(&JobId::from("job-1"));
    assert_eq!(logs.len(), 1);
    assert!(logs[0].starts_with("cache get index failed"));
}

#[tokio::test]
async fn discovery_filters_and_parsing() {
    let harness = Harness::new();
    harness.pool.add_action(
        json!({
            "template": "{\"kind\":5003}",
            "meta": {"id": "tpl-1", "kind": 5003, "name": "Search", "tags": ["tool"]},
            "sockets": {"in": {"query": {"type": "string"}}, "out": {}}
        })
        .to_string(),
    );
    harness.pool.add_action("not a descriptor");
    let ctx = harness.context(text_job("job-1", 5003, "")).await;

    let filter = DiscoveryFilter::default()
        .with_kind_range(5000, 5999)
        .with_tag("tool")
        .with_pool("pool-b");
    let actions = ctx.discover_actions(&filter).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].kind(), 5003);
    assert_eq!(actions[0].name(), "Search");
    assert_eq!(actions[0].meta.id.as_deref(), Some("tpl-1"));

    ctx.discover_nearby_actions(&filter).await.unwrap();
    let requests: Vec<_> = harness
        .pool
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            PoolCall::DiscoverActions(request) | PoolCall::DiscoverNearbyActions(request) => {
                Some(request)
            }
            _ => None,
        })
        .collect();
    assert_eq!(requests[0].filter_by_kind_ranges, vec!["5000-5999"]);
    assert_eq!(requests[0].filter_by_tags, vec!["tool"]);
    assert_eq!(requests[0].filter_by_pools, vec!["pool-b"]);
    assert!(requests[1].filter_by_pools.is_empty());
    ctx.close().await;
}

#[tokio::test]
async fn sub_job_inherits_provider_and_forwards_logs() {
    let harness = Harness::new();
    let mut parent = text_job("job-1", 5003, "");
    parent.provider = Some("npub-customer".into());
    parent.encrypted = true;
    let ctx = harness.context(parent).await;

    let sub = ctx.send_sub_job_request("{\"kind\":5005}").await.unwrap();
    assert_eq!(sub.provider.as_deref(), Some("npub-customer"));
    assert!(sub.encrypted);

    let pool = harness.pool.clone();
    let sub_id = sub.id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.append_job_log(&sub_id, "fetching page");
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.append_job_log(&sub_id, "summarizing");
        pool.resolve_job(&sub_id, "summary text");
    });

    let content = within(
        LIMIT,
        ctx.wait_for_content(&sub, WaitOptions::default().with_timeout(LIMIT)),
    )
    .await
    .unwrap();
    assert_eq!(content, "summary text");
    ctx.close().await;

    let logs = harness.pool.logs_for(&JobId::from("job-1"));
    assert_eq!(logs, vec!["fetching page", "summarizing"]);
}

#[tokio::test]
async fn wait_without_logs_forwards_nothing() {
    let harness = Harness::new();
    let ctx = harness.context(text_job("job-1", 5003, "")).await;
    let sub = ctx.send_job_request("{}", None, None).await.unwrap();
    harness.pool.append_job_log(&sub.id, "noise");
    harness.pool.resolve_job(&sub.id, "ok");

    let done = ctx
        .wait_for(&sub, WaitOptions::default().without_logs())
        .await
        .unwrap();
    assert!(done.is_resolved());
    ctx.close().await;
    assert!(harness.pool.logs_for(&JobId::from("job-1")).is_empty());
}

#[tokio::test]
async fn wait_times_out() {
    let harness = Harness::new();
    let ctx = harness.context(text_job("job-1", 5003, "")).await;
    let sub = ctx.send_sub_job_request("{}").await.unwrap();

    let err = ctx
        .wait_for(&sub, WaitOptions::default().with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, WaitError::TimedOut { ref job_id, .. } if *job_id == sub.id.to_string()));
    ctx.close().await;
}

#[tokio::test]
async fn wait_retries_transient_errors() {
    let harness = Harness::new();
    let ctx = harness.context(text_job("job-1", 5003, "")).await;
    let sub = ctx.send_sub_job_request("{}").await.unwrap();
    harness.pool.resolve_job(&sub.id, "late answer");
    harness.pool.fail_next("get_job", RpcCode::Unavailable, 2);

    let content = within(LIMIT, ctx.wait_for_content(&sub, WaitOptions::default()))
        .await
        .unwrap();
    assert_eq!(content, "late answer");
    harness.pool.assert_call_count_eq("get_job", 3);
    ctx.close().await;
}

#[tokio::test]
async fn wait_retries_server_side_failures() {
    let harness = Harness::new();
    let ctx = harness.context(text_job("job-1", 5003, "")).await;
    let sub = ctx.send_sub_job_request("{}").await.unwrap();
    harness.pool.resolve_job(&sub.id, "recovered");
    harness.pool.fail_next("get_job", RpcCode::Internal, 2);

    let content = within(LIMIT, ctx.wait_for_content(&sub, WaitOptions::default()))
        .await
        .unwrap();
    assert_eq!(content, "recovered");
    harness.pool.assert_call_count_eq("get_job", 3);
    ctx.close().await;
}

#[tokio::test]
async fn wait_aborts_on_permanent_error() {
    let harness = Harness::new();
    let ctx = harness.context(text_job("job-1", 5003, "")).await;
    let sub = ctx.send_sub_job_request("{}").await.unwrap();
    harness.pool.fail_next("get_job", RpcCode::PermissionDenied, 1);

    let err = within(LIMIT, ctx.wait_for(&sub, WaitOptions::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, WaitError::Rpc(ref rpc) if rpc.code == RpcCode::PermissionDenied));
    ctx.close().await;
}

#[tokio::test]
async fn wait_stops_on_shutdown() {
    let harness = Harness::new();
    let ctx = harness.context(text_job("job-1", 5003, "")).await;
    let sub = ctx.send_sub_job_request("{}").await.unwrap();

    let token = harness.node.shutdown_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
    });

    let err = within(LIMIT, ctx.wait_for(&sub, WaitOptions::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, WaitError::Shutdown { .. }));
    ctx.close().await;
}

#[tokio::test]
async fn logger_forwards_in_order_and_keeps_debug_local() {
    let harness = Harness::new();
    let ctx = harness.context(text_job("job-1", 5003, "")).await;

    ctx.logger().debug("local detail");
    for i in 0..20 {
        ctx.logger().info(format!("line {i}"));
    }
    ctx.logger().warn("careful");
    ctx.logger().error("bad");
    ctx.close().await;
    ctx.logger().info("after close");

    let logs = harness.pool.logs_for(&JobId::from("job-1"));
    assert_eq!(logs.len(), 22);
    assert_eq!(logs[0], "line 0");
    assert_eq!(logs[19], "line 19");
    assert_eq!(&logs[20..], ["careful", "bad"]);
}
