use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::cache::{CacheLocation, CacheOptions, LocalCache, RemoteCache};
use crate::discovery::{ActionDescriptor, DiscoveryFilter};
use crate::disk::Disk;
use crate::error::WaitError;
use crate::job::{Job, JobId, JobInput};
use crate::logger::JobLogger;
use crate::pool::{CreateDiskRequest, JobRequest, PoolConnector};
use crate::runner::JobRunner;
use crate::runtime::NodeRuntime;

/// Options for [`JobContext::wait_for`].
#[derive(Clone, Copy, Debug)]
pub struct WaitOptions {
    /// Give up after this long. `None` waits until the job resolves or the
    /// node shuts down.
    pub timeout: Option<Duration>,
    /// Replay the sub-job's log lines through this job's logger.
    pub log_passthrough: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            log_passthrough: true,
        }
    }
}

impl WaitOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_logs(mut self) -> Self {
        self.log_passthrough = false;
        self
    }
}

/// Disks opened by one context, keyed by session id.
#[derive(Default)]
struct DiskRegistry {
    disks: HashMap<String, Arc<Disk>>,
    by_url: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

impl DiskRegistry {
    fn by_url(&self, url: &str) -> Option<Arc<Disk>> {
        self.by_url.get(url).and_then(|id| self.disks.get(id)).cloned()
    }

    fn by_name(&self, name: &str) -> Option<Arc<Disk>> {
        self.by_name.get(name).and_then(|id| self.disks.get(id)).cloned()
    }

    fn insert(&mut self, disk: Arc<Disk>) {
        self.by_url.insert(disk.url().to_string(), disk.id().to_string());
        self.disks.insert(disk.id().to_string(), disk);
    }

    fn name(&mut self, name: &str, disk: &Disk) {
        self.by_name.insert(name.to_string(), disk.id().to_string());
    }

    fn drain(&mut self) -> Vec<Arc<Disk>> {
        self.by_url.clear();
        self.by_name.clear();
        self.disks.drain().map(|(_, disk)| disk).collect()
    }
}

/// Everything a runner can reach while executing one job.
///
/// A context is created per fetched job and closed by the runtime when the
/// job leaves the lifecycle, whatever the outcome.
pub struct JobContext {
    job: Job,
    runner: Arc<dyn JobRunner>,
    node: NodeRuntime,
    client: Arc<dyn PoolConnector>,
    local_cache: LocalCache,
    disks: Mutex<DiskRegistry>,
    logger: JobLogger,
    closed: AtomicBool,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("runner", &self.runner.meta().name)
            .field("cache_root", &self.local_cache.root())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl JobContext {
    pub async fn open(
        node: &NodeRuntime,
        runner: Arc<dyn JobRunner>,
        job: Job,
    ) -> anyhow::Result<Self> {
        let client = node.client().await?;
        let meta = node.meta();
        let logger = JobLogger::new(
            format!("{}.{}", meta.name, runner.meta().name),
            meta.version.clone(),
            job.id.clone(),
            Arc::clone(&client),
        );

        Ok(Self {
            job,
            runner,
            node: node.clone(),
            client,
            local_cache: LocalCache::new(node.config().cache_dir.clone()),
            disks: Mutex::new(DiskRegistry::default()),
            logger,
            closed: AtomicBool::new(false),
        })
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    pub fn runner(&self) -> &Arc<dyn JobRunner> {
        &self.runner
    }

    pub fn node(&self) -> &NodeRuntime {
        &self.node
    }

    pub fn logger(&self) -> &JobLogger {
        &self.logger
    }

    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.job.param_value(key)
    }

    pub fn param_values(&self, key: &str) -> Option<&[String]> {
        self.job.param_values(key)
    }

    pub fn input(&self, marker: Option<&str>) -> Option<&JobInput> {
        self.job.input(marker)
    }

    pub fn inputs(&self, marker: Option<&str>) -> Vec<&JobInput> {
        self.job.inputs_with(marker)
    }

    pub fn output_format(&self) -> &str {
        &self.job.output_format
    }

    /// Opens the disk at `url`, reusing the handle if this context already
    /// opened it.
    pub async fn open_storage(&self, url: &str) -> anyhow::Result<Arc<Disk>> {
        let mut disks = self.disks.lock().await;
        if let Some(disk) = disks.by_url(url) {
            return Ok(disk);
        }
        self.open_into(&mut disks, url).await
    }

    /// Creates a disk and opens it. A named disk is created once per context.
    pub async fn create_storage(
        &self,
        name: Option<&str>,
        encryption_key: Option<&str>,
        include_key_in_url: Option<bool>,
    ) -> anyhow::Result<Arc<Disk>> {
        let mut disks = self.disks.lock().await;
        if let Some(disk) = name.and_then(|name| disks.by_name(name)) {
            return Ok(disk);
        }

        let url = self
            .client
            .create_disk(CreateDiskRequest {
                name: name.map(str::to_string),
                encryption_key: encryption_key.map(str::to_string),
                include_encryption_key_in_url: include_key_in_url,
            })
            .await?;

        let disk = match disks.by_url(&url) {
            Some(disk) => disk,
            None => self.open_into(&mut disks, &url).await?,
        };
        if let Some(name) = name {
            disks.name(name, &disk);
        }
        Ok(disk)
    }

    async fn open_into(&self, disks: &mut DiskRegistry, url: &str) -> anyhow::Result<Arc<Disk>> {
        let id = self.client.open_disk(url).await?;
        let disk = Arc::new(Disk::new(id, url, Arc::clone(&self.client)));
        disks.insert(Arc::clone(&disk));
        Ok(disk)
    }

    /// Stores `value` under `key`; failures are logged and reported as
    /// `false`.
    pub async fn cache_set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: CacheOptions,
    ) -> bool {
        let outcome = match options.location {
            CacheLocation::Local => self
                .local_cache
                .set(key, value, options.version, options.expire_at)
                .await
                .map(|()| true),
            CacheLocation::Remote => {
                RemoteCache::new(Arc::clone(&self.client))
                    .set(key, value, options.version, options.expire_at, options.chunk_size)
                    .await
            }
        };
        match outcome {
            Ok(stored) => stored,
            Err(err) => {
                self.logger.error(format!("cache set {key} failed: {err}"));
                false
            }
        }
    }

    /// Reads `key` if a version newer than `last_version` is stored; failures
    /// are logged and reported as a miss.
    pub async fn cache_get<T: DeserializeOwned>(
        &self,
        key: &str,
        last_version: u64,
        location: CacheLocation,
    ) -> Option<T> {
        let outcome = match location {
            CacheLocation::Local => self.local_cache.get(key, last_version).await,
            CacheLocation::Remote => {
                RemoteCache::new(Arc::clone(&self.client))
                    .get(key, last_version)
                    .await
            }
        };
        match outcome {
            Ok(value) => value,
            Err(err) => {
                self.logger.error(format!("cache get {key} failed: {err}"));
                None
            }
        }
    }

    pub async fn discover_actions(
        &self,
        filter: &DiscoveryFilter,
    ) -> anyhow::Result<Vec<ActionDescriptor>> {
        let raw = self
            .client
            .discover_actions(filter.to_request(true))
            .await?;
        Ok(ActionDescriptor::parse_all(raw))
    }

    /// Discovery restricted to the pool this node is connected to; the
    /// filter's pool list is ignored.
    pub async fn discover_nearby_actions(
        &self,
        filter: &DiscoveryFilter,
    ) -> anyhow::Result<Vec<ActionDescriptor>> {
        let raw = self
            .client
            .discover_nearby_actions(filter.to_request(false))
            .await?;
        Ok(ActionDescriptor::parse_all(raw))
    }

    pub async fn send_job_request(
        &self,
        event: impl Into<String>,
        provider: Option<&str>,
        encrypted: Option<bool>,
    ) -> anyhow::Result<Job> {
        let job = self
            .client
            .send_job_request(JobRequest {
                event: event.into(),
                provider: provider.map(str::to_string),
                encrypted,
            })
            .await?;
        Ok(job)
    }

    /// Submits a job that inherits this job's provider and encryption flag.
    pub async fn send_sub_job_request(&self, event: impl Into<String>) -> anyhow::Result<Job> {
        self.send_job_request(event, self.job.provider.as_deref(), Some(self.job.encrypted))
            .await
    }

    /// Polls `job` until the pool reports it succeeded with a result.
    ///
    /// Log lines the sub-job publishes meanwhile are replayed through this
    /// context's logger, each at most once. RPC errors are retried unless
    /// [`RpcCode::is_permanent`](crate::RpcCode::is_permanent).
    pub async fn wait_for(&self, job: &Job, options: WaitOptions) -> Result<Job, WaitError> {
        let job_id = job.id.clone();
        let shutdown = self.node.shutdown_token();
        let started = Instant::now();

        let bounded = async {
            match options.timeout {
                Some(limit) => tokio::time::timeout(limit, self.poll_until_resolved(&job_id, options))
                    .await
                    .map_err(|_| WaitError::TimedOut {
                        job_id: job_id.to_string(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })?,
                None => self.poll_until_resolved(&job_id, options).await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => Err(WaitError::Shutdown {
                job_id: job_id.to_string(),
            }),
            outcome = bounded => outcome,
        }
    }

    /// Waits for `job` and returns its result content.
    pub async fn wait_for_content(
        &self,
        job: &Job,
        options: WaitOptions,
    ) -> Result<String, WaitError> {
        Ok(self.wait_for(job, options).await?.result.content)
    }

    async fn poll_until_resolved(&self, job_id: &JobId, options: WaitOptions) -> Result<Job, WaitError> {
        let timings = &self.node.config().timings;
        let mut last_log = 0_i64;
        loop {
            match self.client.get_job(job_id, timings.sub_job_wait_ms).await {
                Ok(job) => {
                    if options.log_passthrough {
                        for log in &job.state.logs {
                            if log.timestamp > last_log {
                                self.logger.info(&log.log);
                                last_log = log.timestamp;
                            }
                        }
                    }
                    if job.is_resolved() {
                        return Ok(job);
                    }
                }
                Err(err) if err.code.is_permanent() => return Err(err.into()),
                Err(err) => {
                    tracing::debug!(job_id = %job_id, "sub-job poll failed: {err}");
                }
            }
            tokio::time::sleep(timings.sub_job_poll_interval()).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes every disk opened through this context, then the logger.
    /// Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let disks = self.disks.lock().await.drain();
        for disk in disks {
            if let Err(err) = disk.close().await {
                self.logger.warn(format!("closing disk {} failed: {err}", disk.id()));
            }
        }
        self.logger.close().await;
    }
}
