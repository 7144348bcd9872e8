use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify, OnceCell};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::{NodeConfig, NodeMeta, StartOptions};
use crate::context::JobContext;
use crate::error::{JobFailure, JobStage};
use crate::events::{NodeEvent, NodeEventPayload, NodeEventPublisher};
use crate::job::{Job, JobId};
use crate::lease::LockedJobs;
use crate::pool::{
    AnnounceNodeRequest, AnnounceTemplateRequest, Announcement, PoolConnector, PoolEndpoint,
    PoolTransport,
};
use crate::runner::JobRunner;
use crate::telemetry::{self, JobOutcome, JobTimingHandle};

/// Token for signaling graceful shutdown to the node loops.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not lost.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`NodeRuntime::register_runner`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RunnerId(u64);

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runner-{}", self.0)
    }
}

struct RunnerRegistration {
    id: RunnerId,
    runner: Arc<dyn JobRunner>,
    /// `None` until the first successful template announcement.
    next_announcement: Mutex<Option<Instant>>,
    init: OnceCell<()>,
    active: AtomicBool,
}

impl RunnerRegistration {
    fn name(&self) -> &str {
        &self.runner.meta().name
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn announcement_due(&self, now: Instant) -> bool {
        self.next_announcement.lock().map_or(true, |next| now >= next)
    }
}

/// The worker-node runtime.
///
/// Owns the shared pool client and drives four kinds of loops once
/// [`start`](Self::start)ed: announcements, runner ticks, the poll-task
/// scheduler and one poll task per registered runner. Cloning is cheap and
/// every clone controls the same node.
#[derive(Clone)]
pub struct NodeRuntime {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    transport: Arc<dyn PoolTransport>,
    events: Arc<dyn NodeEventPublisher>,
    endpoint: OnceLock<PoolEndpoint>,
    tick_interval: OnceLock<Duration>,
    client: OnceCell<Arc<dyn PoolConnector>>,
    runners: RwLock<Vec<Arc<RunnerRegistration>>>,
    next_runner_id: AtomicU64,
    next_node_announcement: Mutex<Option<Instant>>,
    locks: Mutex<LockedJobs>,
    poll_tasks: Mutex<HashMap<RunnerId, JoinHandle<()>>>,
    job_tasks: Mutex<Vec<JoinHandle<()>>>,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: ShutdownToken,
    started: AtomicBool,
}

impl fmt::Debug for NodeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRuntime")
            .field("meta", &self.inner.config.meta)
            .field("endpoint", &self.inner.endpoint.get())
            .field("runner_count", &self.inner.runners.read().len())
            .field("locked_jobs", &self.inner.locks.lock().len())
            .field("connected", &self.inner.client.initialized())
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .field("shutdown_cancelled", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl NodeRuntime {
    /// Create a node runtime with the given components.
    ///
    /// Nothing connects or spawns until [`start`](Self::start); the
    /// [`NodeRuntimeBuilder`](crate::NodeRuntimeBuilder) is the usual entry
    /// point.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn PoolTransport>,
        events: Arc<dyn NodeEventPublisher>,
    ) -> Self {
        let locks = LockedJobs::new(config.timings.lock_ttl());
        Self {
            inner: Arc::new(NodeInner {
                config,
                transport,
                events,
                endpoint: OnceLock::new(),
                tick_interval: OnceLock::new(),
                client: OnceCell::new(),
                runners: RwLock::new(Vec::new()),
                next_runner_id: AtomicU64::new(1),
                next_node_announcement: Mutex::new(None),
                locks: Mutex::new(locks),
                poll_tasks: Mutex::new(HashMap::new()),
                job_tasks: Mutex::new(Vec::new()),
                loop_handles: Mutex::new(Vec::new()),
                shutdown: ShutdownToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Get the node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Get the node metadata used for announcements and job logs.
    pub fn meta(&self) -> &NodeMeta {
        &self.inner.config.meta
    }

    /// Get a clone of the event publisher.
    pub fn events(&self) -> Arc<dyn NodeEventPublisher> {
        Arc::clone(&self.inner.events)
    }

    /// Subscribe to node lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Get a clone of the shutdown token shared by every loop.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.inner.shutdown.clone()
    }

    /// Endpoint resolved at start, or the configured one before that.
    pub fn endpoint(&self) -> PoolEndpoint {
        self.inner
            .endpoint
            .get()
            .cloned()
            .unwrap_or_else(|| self.inner.config.resolve_endpoint(&StartOptions::default()))
    }

    /// Register a runner. It is announced and polled from the next loop
    /// pass, also when the node is already started.
    pub fn register_runner(&self, runner: impl JobRunner) -> RunnerId {
        self.register_shared(Arc::new(runner))
    }

    /// Register a runner that is shared with the caller.
    pub fn register_shared(&self, runner: Arc<dyn JobRunner>) -> RunnerId {
        let id = RunnerId(self.inner.next_runner_id.fetch_add(1, Ordering::SeqCst));
        tracing::info!(runner = %runner.meta().name, %id, "runner registered");
        self.inner.runners.write().push(Arc::new(RunnerRegistration {
            id,
            runner,
            next_announcement: Mutex::new(None),
            init: OnceCell::new(),
            active: AtomicBool::new(true),
        }));
        id
    }

    /// Removes a runner. Its poll task stops before its next cycle; a job
    /// already being processed runs to the end.
    pub fn deregister_runner(&self, id: RunnerId) -> bool {
        let mut runners = self.inner.runners.write();
        let Some(position) = runners.iter().position(|reg| reg.id == id) else {
            return false;
        };
        let reg = runners.remove(position);
        reg.active.store(false, Ordering::SeqCst);
        tracing::info!(runner = %reg.name(), %id, "runner deregistered");
        true
    }

    /// Get the ids of all registered runners in registration order.
    pub fn runner_ids(&self) -> Vec<RunnerId> {
        self.inner.runners.read().iter().map(|reg| reg.id).collect()
    }

    fn registrations(&self) -> Vec<Arc<RunnerRegistration>> {
        self.inner.runners.read().clone()
    }

    /// Ids currently excluded from pending-job polls.
    pub fn locked_job_ids(&self) -> Vec<String> {
        self.inner.locks.lock().excluded_ids()
    }

    /// Shared pool client, connected on first use. A failed connect is
    /// retried by the next caller.
    pub async fn client(&self) -> anyhow::Result<Arc<dyn PoolConnector>> {
        let client = self
            .inner
            .client
            .get_or_try_init(|| async {
                let endpoint = self.endpoint();
                tracing::info!(
                    "Connecting to pool at {} (ssl: {})",
                    endpoint.authority(),
                    endpoint.ssl
                );
                self.inner.transport.connect(&endpoint).await
            })
            .await?;
        Ok(Arc::clone(client))
    }

    /// Accept a job on the pool.
    pub async fn accept_job(&self, job_id: &JobId) -> anyhow::Result<()> {
        self.client().await?.accept_job(job_id).await?;
        Ok(())
    }

    /// Cancel a job on the pool; `reason` is shown to the customer.
    pub async fn cancel_job(&self, job_id: &JobId, reason: &str) -> anyhow::Result<()> {
        self.client().await?.cancel_job(job_id, reason).await?;
        Ok(())
    }

    /// Complete a job with the runner output.
    pub async fn complete_job(&self, job_id: &JobId, output: &str) -> anyhow::Result<()> {
        self.client().await?.complete_job(job_id, output).await?;
        Ok(())
    }

    /// Append one log line to a job.
    pub async fn log_for_job(&self, job_id: &JobId, log: &str) -> anyhow::Result<()> {
        self.client().await?.log_for_job(job_id, log).await?;
        Ok(())
    }

    /// Start the node.
    ///
    /// Resolves the endpoint and tick rate (explicit option, then
    /// configuration, then default) and spawns the announce, tick and
    /// scheduler loops. Fails if the node was already started.
    pub async fn start(&self, options: StartOptions) -> anyhow::Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("node already started");
        }
        #[cfg(feature = "metrics")]
        if let Err(err) = crate::metrics::init_metrics() {
            tracing::warn!("metrics registration failed: {err:#}");
        }
        let endpoint = self.inner.config.resolve_endpoint(&options);
        let tick_interval = self.inner.config.resolve_tick_interval(&options);
        tracing::info!(
            node = %self.meta().name,
            pool = %endpoint.authority(),
            tick_ms = tick_interval.as_millis() as u64,
            "starting pool node"
        );
        let _ = self.inner.endpoint.set(endpoint);
        let _ = self.inner.tick_interval.set(tick_interval);

        let handles = vec![
            tokio::spawn(self.clone().announce_loop()),
            tokio::spawn(self.clone().tick_loop(tick_interval)),
            tokio::spawn(self.clone().scheduler_loop()),
        ];
        self.inner.loop_handles.lock().extend(handles);
        Ok(())
    }

    /// Stop every loop and wait for spawned tasks to finish.
    ///
    /// All tasks share one deadline of `shutdown_grace_ms`; tasks still
    /// running when it passes (a runner stuck in `run`, for instance) are
    /// aborted.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of pool node");
        self.inner.shutdown.cancel();

        let mut handles = std::mem::take(&mut *self.inner.loop_handles.lock());
        handles.extend(self.inner.poll_tasks.lock().drain().map(|(_, handle)| handle));
        handles.extend(std::mem::take(&mut *self.inner.job_tasks.lock()));

        let deadline = tokio::time::Instant::now() + self.inner.config.timings.shutdown_grace();
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Node task failed: {:?}", e),
                Err(_) => {
                    tracing::warn!("Node task timed out during shutdown, aborting");
                    handle.abort();
                }
            }
        }

        tracing::info!("Pool node shutdown complete");
        Ok(())
    }

    async fn emit(&self, payload: NodeEventPayload) {
        if let Err(err) = self.inner.events.publish(NodeEvent::new(payload)).await {
            tracing::error!("publish node event failed: {err}");
        }
    }

    async fn announce_loop(self) {
        let interval = self.inner.config.timings.announce_interval();
        let shutdown = self.shutdown_token();
        loop {
            self.announce_pass().await;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Announcer shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn announce_pass(&self) {
        let fallback = self.inner.config.timings.announce_interval();
        let now = Instant::now();

        let node_due = self
            .inner
            .next_node_announcement
            .lock()
            .map_or(true, |next| now >= next);
        if node_due {
            let next = match self.announce_node().instrument(telemetry::announce_span("node")).await {
                Ok(announcement) => {
                    tracing::info!(
                        "Node announced, next announcement in {} ms",
                        announcement.refresh_interval_ms
                    );
                    self.emit(NodeEventPayload::NodeAnnounced {
                        refresh_interval_ms: announcement.refresh_interval_ms,
                    })
                    .await;
                    telemetry::record_announce("node", true);
                    Instant::now() + Duration::from_millis(announcement.refresh_interval_ms)
                }
                Err(err) => {
                    tracing::error!("Error announcing node: {err:#}");
                    telemetry::record_announce("node", false);
                    Instant::now() + fallback
                }
            };
            *self.inner.next_node_announcement.lock() = Some(next);
        }

        for reg in self.registrations() {
            if !reg.announcement_due(now) {
                continue;
            }
            let span = telemetry::announce_span(reg.name());
            match self.announce_template(&reg).instrument(span).await {
                Ok(announcement) => {
                    tracing::info!(
                        runner = %reg.name(),
                        "Template announced, next announcement in {} ms",
                        announcement.refresh_interval_ms
                    );
                    *reg.next_announcement.lock() =
                        Some(now + Duration::from_millis(announcement.refresh_interval_ms));
                    self.emit(NodeEventPayload::TemplateAnnounced {
                        runner: reg.name().to_string(),
                        kind: reg.runner.meta().kind,
                    })
                    .await;
                    telemetry::record_announce(reg.name(), true);
                }
                Err(err) => {
                    tracing::error!(runner = %reg.name(), "Error announcing template: {err:#}");
                    telemetry::record_announce(reg.name(), false);
                }
            }
        }
    }

    async fn announce_node(&self) -> anyhow::Result<Announcement> {
        let meta = self.meta();
        let request = AnnounceNodeRequest {
            name: meta.name.clone(),
            description: meta.description.clone(),
            icon_url: meta.picture.clone().unwrap_or_default(),
        };
        Ok(self.client().await?.announce_node(request).await?)
    }

    async fn announce_template(&self, reg: &RunnerRegistration) -> anyhow::Result<Announcement> {
        let config = reg.runner.config();
        let request = AnnounceTemplateRequest {
            meta: serde_json::to_string(&config.meta)?,
            template: config.template.clone(),
            sockets: serde_json::to_string(&config.sockets)?,
        };
        Ok(self.client().await?.announce_event_template(request).await?)
    }

    async fn tick_loop(self, interval: Duration) {
        let shutdown = self.shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Ticker shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    let node = &self;
                    let regs = self.registrations();
                    let ticks = regs.iter().map(|reg| async move {
                        if let Err(err) = reg.runner.tick(node).await {
                            tracing::warn!(runner = %reg.name(), "tick failed: {err:#}");
                        }
                    });
                    futures::future::join_all(ticks).await;
                }
            }
        }
    }

    async fn scheduler_loop(self) {
        let interval = self.inner.config.timings.scheduler_interval();
        let shutdown = self.shutdown_token();
        loop {
            self.schedule_pollers();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Ensures exactly one live poll task per registered runner.
    fn schedule_pollers(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let regs = self.registrations();
        let mut tasks = self.inner.poll_tasks.lock();
        tasks.retain(|id, handle| !handle.is_finished() || regs.iter().any(|reg| reg.id == *id));

        for reg in regs {
            let running = tasks
                .get(&reg.id)
                .is_some_and(|handle| !handle.is_finished());
            if !running {
                tracing::debug!(runner = %reg.name(), "spawning poll task");
                let handle = tokio::spawn(self.clone().poll_loop(reg.clone()));
                tasks.insert(reg.id, handle);
            }
        }
    }

    async fn poll_loop(self, reg: Arc<RunnerRegistration>) {
        let backoff = self.inner.config.timings.error_backoff();
        let shutdown = self.shutdown_token();
        loop {
            if shutdown.is_cancelled() || !reg.is_active() {
                break;
            }
            let span = telemetry::poll_span(reg.name(), reg.runner.meta().kind);
            if let Err(err) = self.poll_cycle(&reg).instrument(span).await {
                tracing::error!(runner = %reg.name(), "Error executing jobs for runner: {err:#}");
                telemetry::record_poll_error(reg.name());
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
        tracing::debug!(runner = %reg.name(), "poll task finished");
    }

    async fn poll_cycle(&self, reg: &Arc<RunnerRegistration>) -> anyhow::Result<()> {
        reg.init.get_or_try_init(|| reg.runner.init(self)).await?;

        let client = self.client().await?;
        let exclude_ids = {
            let mut locks = self.inner.locks.lock();
            locks.prune();
            locks.excluded_ids()
        };
        let request = reg
            .runner
            .config()
            .filter
            .to_request(exclude_ids, self.inner.config.timings.poll_wait_ms);

        let shutdown = self.shutdown_token();
        let jobs = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            jobs = client.get_pending_jobs(request) => jobs?,
        };

        telemetry::record_jobs_fetched(reg.name(), jobs.len());
        if jobs.is_empty() {
            tracing::debug!("No jobs for runner {}", reg.name());
            return Ok(());
        }
        tracing::info!("Found {} jobs for runner {}", jobs.len(), reg.name());
        self.emit(NodeEventPayload::JobsFetched {
            runner: reg.name().to_string(),
            count: jobs.len(),
        })
        .await;

        for job in jobs {
            if shutdown.is_cancelled() || !reg.is_active() {
                break;
            }
            let span = telemetry::job_span(job.id.as_str(), reg.name());
            self.process_job(reg, job).instrument(span).await;
        }
        Ok(())
    }

    /// Runs one fetched job through admission, lock, accept and execution.
    async fn process_job(&self, reg: &Arc<RunnerRegistration>, job: Job) {
        let job_id = job.id.clone();
        let runner_name = reg.name().to_string();
        let timing = telemetry::record_job_start(job_id.as_str());

        let ctx = match JobContext::open(self, Arc::clone(&reg.runner), job).await {
            Ok(ctx) => ctx,
            Err(err) => {
                let failure = JobFailure::new(JobStage::Context, &err);
                tracing::error!(job_id = %job_id, "{failure}");
                self.emit(NodeEventPayload::JobFailed {
                    job_id,
                    runner: runner_name.clone(),
                    failure,
                })
                .await;
                telemetry::record_job_end(timing, &runner_name, JobOutcome::Failed);
                return;
            }
        };

        if !reg.runner.can_run(&ctx).await {
            ctx.close().await;
            tracing::debug!(job_id = %job_id, "job declined by runner");
            self.emit(NodeEventPayload::JobSkipped {
                job_id,
                runner: runner_name.clone(),
            })
            .await;
            telemetry::record_job_end(timing, &runner_name, JobOutcome::Skipped);
            return;
        }

        self.inner.locks.lock().lock(job_id.clone());

        if let Err(err) = self.accept_job(&job_id).await {
            let failure = JobFailure::new(JobStage::Accept, &err);
            ctx.logger().error(format!(
                "Job failed in {} seconds on node {}: {}",
                timing.elapsed().as_secs(),
                self.meta().name,
                failure.reason()
            ));
            ctx.close().await;
            self.emit(NodeEventPayload::JobFailed {
                job_id,
                runner: runner_name.clone(),
                failure,
            })
            .await;
            telemetry::record_job_end(timing, &runner_name, JobOutcome::Failed);
            return;
        }

        self.emit(NodeEventPayload::JobAccepted {
            job_id,
            runner: runner_name,
        })
        .await;
        ctx.logger().info(format!("Job started on node {}", self.meta().name));

        let execution = self
            .clone()
            .execute_accepted(Arc::clone(reg), ctx, timing)
            .in_current_span();
        if reg.runner.is_parallel() {
            let handle = tokio::spawn(execution);
            let mut tasks = self.inner.job_tasks.lock();
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        } else {
            execution.await;
        }
    }

    async fn execute_accepted(
        self,
        reg: Arc<RunnerRegistration>,
        ctx: JobContext,
        timing: JobTimingHandle,
    ) {
        let job_id = ctx.job_id().clone();
        let runner_name = reg.name().to_string();

        let outcome = match AssertUnwindSafe(run_hooks(reg.runner.as_ref(), &ctx))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(JobFailure {
                stage: JobStage::Run,
                message: "runner panicked".to_string(),
            }),
        };

        let outcome = match outcome {
            Ok(output) => {
                ctx.logger().info(format!(
                    "Job completed in {} seconds on node {}",
                    timing.elapsed().as_secs(),
                    self.meta().name
                ));
                ctx.logger().flush().await;
                self.complete_job(&job_id, &output)
                    .await
                    .map_err(|err| JobFailure::new(JobStage::Complete, &err))
            }
            Err(failure) => Err(failure),
        };

        match outcome {
            Ok(()) => {
                self.emit(NodeEventPayload::JobCompleted {
                    job_id,
                    runner: runner_name.clone(),
                })
                .await;
                ctx.close().await;
                telemetry::record_job_end(timing, &runner_name, JobOutcome::Completed);
            }
            Err(failure) => {
                ctx.logger().error(format!(
                    "Job failed in {} seconds on node {}: {}",
                    timing.elapsed().as_secs(),
                    self.meta().name,
                    failure
                ));
                ctx.logger().flush().await;
                if let Err(err) = self.cancel_job(&job_id, failure.reason()).await {
                    tracing::error!(job_id = %job_id, "cancel job failed: {err:#}");
                }
                ctx.close().await;
                self.emit(NodeEventPayload::JobCanceled {
                    job_id,
                    runner: runner_name.clone(),
                    failure,
                })
                .await;
                telemetry::record_job_end(timing, &runner_name, JobOutcome::Canceled);
            }
        }
    }
}

async fn run_hooks(runner: &dyn JobRunner, ctx: &JobContext) -> Result<String, JobFailure> {
    runner
        .pre_run(ctx)
        .await
        .map_err(|err| JobFailure::new(JobStage::PreRun, &err))?;
    let output = runner
        .run(ctx)
        .await
        .map_err(|err| JobFailure::new(JobStage::Run, &err))?;
    runner
        .post_run(ctx)
        .await
        .map_err(|err| JobFailure::new(JobStage::PostRun, &err))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());
        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let clone = token.clone();
                tokio::spawn(async move { clone.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(waiters))
            .await
            .expect("waiters did not observe cancellation within 5 seconds");
        for r in results {
            r.expect("waiter task panicked");
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_default_not_cancelled() {
        let token = ShutdownToken::default();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_runner_id_display() {
        assert_eq!(RunnerId(7).to_string(), "runner-7");
    }
}
