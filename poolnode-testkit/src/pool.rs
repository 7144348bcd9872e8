use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use poolnode::*;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// One call received by an [`InMemoryPool`].
#[derive(Clone, Debug)]
pub enum PoolCall {
    AnnounceNode(AnnounceNodeRequest),
    AnnounceTemplate(AnnounceTemplateRequest),
    GetPendingJobs(PendingJobsRequest),
    AcceptJob(JobId),
    CancelJob { job_id: JobId, reason: String },
    CompleteJob { job_id: JobId, output: String },
    LogForJob { job_id: JobId, log: String },
    GetJob(JobId),
    SendJobRequest(JobRequest),
    OpenDisk(String),
    CreateDisk(CreateDiskRequest),
    CloseDisk(String),
    ListFiles { disk_id: String, prefix: String },
    DeleteFile { disk_id: String, path: String },
    ReadFile { disk_id: String, path: String },
    WriteFile { disk_id: String, path: String, chunk_size: usize },
    CacheSet,
    CacheGet { key: String, last_version: u64 },
    DiscoverActions(DiscoveryRequest),
    DiscoverNearbyActions(DiscoveryRequest),
}

impl PoolCall {
    /// Name of the connector method that produced this call.
    pub fn method(&self) -> &'static str {
        match self {
            PoolCall::AnnounceNode(_) => "announce_node",
            PoolCall::AnnounceTemplate(_) => "announce_event_template",
            PoolCall::GetPendingJobs(_) => "get_pending_jobs",
            PoolCall::AcceptJob(_) => "accept_job",
            PoolCall::CancelJob { .. } => "cancel_job",
            PoolCall::CompleteJob { .. } => "complete_job",
            PoolCall::LogForJob { .. } => "log_for_job",
            PoolCall::GetJob(_) => "get_job",
            PoolCall::SendJobRequest(_) => "send_job_request",
            PoolCall::OpenDisk(_) => "open_disk",
            PoolCall::CreateDisk(_) => "create_disk",
            PoolCall::CloseDisk(_) => "close_disk",
            PoolCall::ListFiles { .. } => "disk_list_files",
            PoolCall::DeleteFile { .. } => "disk_delete_file",
            PoolCall::ReadFile { .. } => "disk_read_file",
            PoolCall::WriteFile { .. } => "disk_write_file",
            PoolCall::CacheSet => "cache_set",
            PoolCall::CacheGet { .. } => "cache_get",
            PoolCall::DiscoverActions(_) => "discover_actions",
            PoolCall::DiscoverNearbyActions(_) => "discover_nearby_actions",
        }
    }
}

#[derive(Clone, Debug)]
struct InjectedFailure {
    code: RpcCode,
    remaining: usize,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    data: Bytes,
    version: u64,
    expire_at: i64,
}

struct PoolState {
    calls: Vec<PoolCall>,
    jobs: HashMap<JobId, Job>,
    /// Ids offered through `get_pending_jobs`, in submission order.
    offered: Vec<JobId>,
    failures: HashMap<&'static str, InjectedFailure>,
    /// Files keyed by disk url, then path.
    files: HashMap<String, HashMap<String, Bytes>>,
    /// Open disk sessions: id to url.
    sessions: HashMap<String, String>,
    write_frames: Vec<DiskWriteFrame>,
    cache: HashMap<String, CacheEntry>,
    actions: Vec<String>,
    refresh_interval_ms: u64,
    poll_cap: Duration,
    read_chunk: usize,
    last_log_timestamp: i64,
}

impl Default for PoolState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            jobs: HashMap::new(),
            offered: Vec::new(),
            failures: HashMap::new(),
            files: HashMap::new(),
            sessions: HashMap::new(),
            write_frames: Vec::new(),
            cache: HashMap::new(),
            actions: Vec::new(),
            refresh_interval_ms: 60_000,
            poll_cap: Duration::from_millis(20),
            read_chunk: 4,
            last_log_timestamp: 0,
        }
    }
}

impl PoolState {
    fn next_id(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4().simple())
    }

    fn take_failure(&mut self, method: &'static str) -> RpcResult<()> {
        let Some(failure) = self.failures.get_mut(method) else {
            return Ok(());
        };
        let code = failure.code;
        failure.remaining -= 1;
        if failure.remaining == 0 {
            self.failures.remove(method);
        }
        Err(RpcError::new(code, format!("injected {method} failure")))
    }

    fn pending_for(&self, request: &PendingJobsRequest) -> Vec<Job> {
        self.offered
            .iter()
            .filter(|id| !request.exclude_ids.iter().any(|excluded| excluded == id.as_str()))
            .filter_map(|id| self.jobs.get(id))
            .filter(|job| job.state.status == JobStatus::Pending)
            .filter(|job| {
                request
                    .filter_by_kind
                    .as_deref()
                    .map_or(true, |kind| kind == job.kind.to_string())
            })
            .cloned()
            .collect()
    }

    fn job_mut(&mut self, job_id: &JobId) -> RpcResult<&mut Job> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| RpcError::new(RpcCode::NotFound, format!("unknown job {job_id}")))
    }

    fn session_url(&self, disk_id: &str) -> RpcResult<String> {
        self.sessions
            .get(disk_id)
            .cloned()
            .ok_or_else(|| RpcError::new(RpcCode::NotFound, format!("unknown disk {disk_id}")))
    }

    /// Strictly increasing so watermark readers see every line.
    fn log_timestamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis().max(self.last_log_timestamp + 1);
        self.last_log_timestamp = now;
        now
    }
}

/// In-memory pool implementing [`PoolConnector`].
///
/// Records every call, serves jobs pushed with [`push_job`](Self::push_job)
/// and keeps disks, cache entries and sub-jobs in memory. Failures can be
/// injected per method with [`fail_next`](Self::fail_next).
#[derive(Clone, Default)]
pub struct InMemoryPool {
    state: Arc<Mutex<PoolState>>,
    jobs_changed: Arc<Notify>,
}

impl InMemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh interval returned from announcements.
    pub fn with_refresh_interval(self, interval: Duration) -> Self {
        self.state.lock().refresh_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Upper bound on how long an empty `get_pending_jobs` call is held.
    pub fn with_poll_cap(self, cap: Duration) -> Self {
        self.state.lock().poll_cap = cap;
        self
    }

    /// Size of the frames served by `disk_read_file` and `cache_get`.
    pub fn with_read_chunk(self, chunk: usize) -> Self {
        self.state.lock().read_chunk = chunk.max(1);
        self
    }

    /// Makes the next `times` calls of `method` fail with `code`.
    pub fn fail_next(&self, method: &'static str, code: RpcCode, times: usize) {
        if times == 0 {
            return;
        }
        self.state.lock().failures.insert(
            method,
            InjectedFailure {
                code,
                remaining: times,
            },
        );
    }

    /// Offers `job` to polling nodes.
    pub fn push_job(&self, job: Job) {
        {
            let mut state = self.state.lock();
            state.offered.push(job.id.clone());
            state.jobs.insert(job.id.clone(), job);
        }
        self.jobs_changed.notify_waiters();
    }

    pub fn job(&self, job_id: &JobId) -> Option<Job> {
        self.state.lock().jobs.get(job_id).cloned()
    }

    /// Publishes a successful result for `job_id`.
    pub fn resolve_job(&self, job_id: &JobId, content: impl Into<String>) {
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.state.status = JobStatus::Success;
            job.result = JobResult {
                content: content.into(),
                timestamp: Utc::now().timestamp_millis(),
            };
        }
    }

    /// Appends a log line to `job_id` as if its executor had sent it.
    pub fn append_job_log(&self, job_id: &JobId, line: impl Into<String>) {
        let mut state = self.state.lock();
        let timestamp = state.log_timestamp();
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.state.logs.push(JobLog {
                log: line.into(),
                timestamp,
            });
        }
    }

    /// Stores `data` at `path` of the disk at `url`.
    pub fn put_file(&self, url: &str, path: &str, data: impl Into<Bytes>) {
        self.state
            .lock()
            .files
            .entry(url.to_string())
            .or_default()
            .insert(path.to_string(), data.into());
    }

    pub fn file(&self, url: &str, path: &str) -> Option<Bytes> {
        self.state
            .lock()
            .files
            .get(url)
            .and_then(|files| files.get(path))
            .cloned()
    }

    /// Adds a JSON action descriptor returned by discovery calls.
    pub fn add_action(&self, descriptor: impl Into<String>) {
        self.state.lock().actions.push(descriptor.into());
    }

    pub fn calls(&self) -> Vec<PoolCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.method() == method)
            .count()
    }

    pub fn accepted_jobs(&self) -> Vec<JobId> {
        self.collect_calls(|call| match call {
            PoolCall::AcceptJob(job_id) => Some(job_id.clone()),
            _ => None,
        })
    }

    pub fn canceled_jobs(&self) -> Vec<(JobId, String)> {
        self.collect_calls(|call| match call {
            PoolCall::CancelJob { job_id, reason } => Some((job_id.clone(), reason.clone())),
            _ => None,
        })
    }

    pub fn completed_jobs(&self) -> Vec<(JobId, String)> {
        self.collect_calls(|call| match call {
            PoolCall::CompleteJob { job_id, output } => Some((job_id.clone(), output.clone())),
            _ => None,
        })
    }

    /// Lines received through `log_for_job` for `job_id`, in arrival order.
    pub fn logs_for(&self, job_id: &JobId) -> Vec<String> {
        self.collect_calls(|call| match call {
            PoolCall::LogForJob { job_id: id, log } if id == job_id => Some(log.clone()),
            _ => None,
        })
    }

    pub fn pending_requests(&self) -> Vec<PendingJobsRequest> {
        self.collect_calls(|call| match call {
            PoolCall::GetPendingJobs(request) => Some(request.clone()),
            _ => None,
        })
    }

    pub fn template_announcements(&self) -> Vec<AnnounceTemplateRequest> {
        self.collect_calls(|call| match call {
            PoolCall::AnnounceTemplate(request) => Some(request.clone()),
            _ => None,
        })
    }

    pub fn disk_close_count(&self, disk_id: &str) -> usize {
        self.collect_calls(|call| match call {
            PoolCall::CloseDisk(id) if id == disk_id => Some(()),
            _ => None,
        })
        .len()
    }

    /// Frames received by `disk_write_file` calls, in arrival order.
    pub fn write_frames(&self) -> Vec<DiskWriteFrame> {
        self.state.lock().write_frames.clone()
    }

    pub fn assert_call_count_eq(&self, method: &str, expected: usize) {
        let actual = self.call_count(method);
        assert_eq!(
            actual, expected,
            "Expected {} {} calls, got {}",
            expected, method, actual
        );
    }

    fn collect_calls<T>(&self, select: impl Fn(&PoolCall) -> Option<T>) -> Vec<T> {
        self.state.lock().calls.iter().filter_map(select).collect()
    }

    /// Records `call` and applies any injected failure for its method.
    fn enter(&self, call: PoolCall) -> RpcResult<()> {
        let method = call.method();
        let mut state = self.state.lock();
        state.calls.push(call);
        state.take_failure(method)
    }

    fn frames_of(data: &Bytes, chunk: usize) -> Vec<Bytes> {
        if data.is_empty() {
            return vec![Bytes::new()];
        }
        data.chunks(chunk).map(Bytes::copy_from_slice).collect()
    }
}

impl std::fmt::Debug for InMemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryPool")
            .field("calls", &state.calls.len())
            .field("jobs", &state.jobs.len())
            .field("sessions", &state.sessions.len())
            .finish()
    }
}

#[async_trait]
impl PoolConnector for InMemoryPool {
    async fn announce_node(&self, request: AnnounceNodeRequest) -> RpcResult<Announcement> {
        self.enter(PoolCall::AnnounceNode(request))?;
        Ok(Announcement {
            refresh_interval_ms: self.state.lock().refresh_interval_ms,
        })
    }

    async fn announce_event_template(
        &self,
        request: AnnounceTemplateRequest,
    ) -> RpcResult<Announcement> {
        self.enter(PoolCall::AnnounceTemplate(request))?;
        Ok(Announcement {
            refresh_interval_ms: self.state.lock().refresh_interval_ms,
        })
    }

    async fn get_pending_jobs(&self, request: PendingJobsRequest) -> RpcResult<Vec<Job>> {
        self.enter(PoolCall::GetPendingJobs(request.clone()))?;
        tokio::task::yield_now().await;

        let notified = self.jobs_changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let (jobs, cap) = {
            let state = self.state.lock();
            (state.pending_for(&request), state.poll_cap)
        };
        if !jobs.is_empty() {
            return Ok(jobs);
        }

        let wait = cap.min(Duration::from_millis(request.wait_ms));
        let _ = tokio::time::timeout(wait, notified).await;
        Ok(self.state.lock().pending_for(&request))
    }

    async fn accept_job(&self, job_id: &JobId) -> RpcResult<()> {
        self.enter(PoolCall::AcceptJob(job_id.clone()))?;
        let mut state = self.state.lock();
        let job = state.job_mut(job_id)?;
        if job.state.status != JobStatus::Pending {
            return Err(RpcError::new(
                RpcCode::FailedPrecondition,
                format!("job {job_id} is not pending"),
            ));
        }
        job.state.status = JobStatus::Processing;
        Ok(())
    }

    async fn cancel_job(&self, job_id: &JobId, reason: &str) -> RpcResult<()> {
        self.enter(PoolCall::CancelJob {
            job_id: job_id.clone(),
            reason: reason.to_string(),
        })?;
        let mut state = self.state.lock();
        state.job_mut(job_id)?.state.status = JobStatus::Error;
        Ok(())
    }

    async fn complete_job(&self, job_id: &JobId, output: &str) -> RpcResult<()> {
        self.enter(PoolCall::CompleteJob {
            job_id: job_id.clone(),
            output: output.to_string(),
        })?;
        let mut state = self.state.lock();
        let job = state.job_mut(job_id)?;
        job.state.status = JobStatus::Success;
        job.result = JobResult {
            content: output.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        };
        Ok(())
    }

    async fn log_for_job(&self, job_id: &JobId, log: &str) -> RpcResult<()> {
        self.enter(PoolCall::LogForJob {
            job_id: job_id.clone(),
            log: log.to_string(),
        })?;
        let mut state = self.state.lock();
        let timestamp = state.log_timestamp();
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.state.logs.push(JobLog {
                log: log.to_string(),
                timestamp,
            });
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId, _wait_ms: u64) -> RpcResult<Job> {
        self.enter(PoolCall::GetJob(job_id.clone()))?;
        let mut state = self.state.lock();
        Ok(state.job_mut(job_id)?.clone())
    }

    async fn send_job_request(&self, request: JobRequest) -> RpcResult<Job> {
        self.enter(PoolCall::SendJobRequest(request.clone()))?;
        let mut state = self.state.lock();
        let job = Job {
            id: JobId::new(PoolState::next_id("job")),
            provider: request.provider,
            encrypted: request.encrypted.unwrap_or(false),
            ..Default::default()
        };
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn open_disk(&self, url: &str) -> RpcResult<String> {
        self.enter(PoolCall::OpenDisk(url.to_string()))?;
        let mut state = self.state.lock();
        let id = PoolState::next_id("disk");
        state.files.entry(url.to_string()).or_default();
        state.sessions.insert(id.clone(), url.to_string());
        Ok(id)
    }

    async fn create_disk(&self, request: CreateDiskRequest) -> RpcResult<String> {
        self.enter(PoolCall::CreateDisk(request.clone()))?;
        let mut state = self.state.lock();
        let name = match request.name {
            Some(name) => name,
            None => PoolState::next_id("volume"),
        };
        let url = match (request.encryption_key, request.include_encryption_key_in_url) {
            (Some(key), Some(true)) => format!("hyp://{name}?key={key}"),
            _ => format!("hyp://{name}"),
        };
        state.files.entry(url.clone()).or_default();
        Ok(url)
    }

    async fn close_disk(&self, disk_id: &str) -> RpcResult<()> {
        self.enter(PoolCall::CloseDisk(disk_id.to_string()))?;
        self.state
            .lock()
            .sessions
            .remove(disk_id)
            .map(|_| ())
            .ok_or_else(|| RpcError::new(RpcCode::NotFound, format!("unknown disk {disk_id}")))
    }

    async fn disk_list_files(&self, disk_id: &str, path: &str) -> RpcResult<Vec<String>> {
        self.enter(PoolCall::ListFiles {
            disk_id: disk_id.to_string(),
            prefix: path.to_string(),
        })?;
        let state = self.state.lock();
        let url = state.session_url(disk_id)?;
        let mut paths: Vec<String> = state
            .files
            .get(&url)
            .map(|files| {
                files
                    .keys()
                    .filter(|file| file.starts_with(path))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        paths.sort();
        Ok(paths)
    }

    async fn disk_delete_file(&self, disk_id: &str, path: &str) -> RpcResult<bool> {
        self.enter(PoolCall::DeleteFile {
            disk_id: disk_id.to_string(),
            path: path.to_string(),
        })?;
        let mut state = self.state.lock();
        let url = state.session_url(disk_id)?;
        Ok(state
            .files
            .get_mut(&url)
            .and_then(|files| files.remove(path))
            .is_some())
    }

    async fn disk_read_file(
        &self,
        disk_id: &str,
        path: &str,
    ) -> RpcResult<ServerStream<DiskReadFrame>> {
        self.enter(PoolCall::ReadFile {
            disk_id: disk_id.to_string(),
            path: path.to_string(),
        })?;
        let state = self.state.lock();
        let url = state.session_url(disk_id)?;
        let frames: Vec<RpcResult<DiskReadFrame>> =
            match state.files.get(&url).and_then(|files| files.get(path)) {
                Some(data) => Self::frames_of(data, state.read_chunk)
                    .into_iter()
                    .map(|data| Ok(DiskReadFrame { exists: true, data }))
                    .collect(),
                None => vec![Ok(DiskReadFrame {
                    exists: false,
                    data: Bytes::new(),
                })],
            };
        Ok(stream::iter(frames).boxed())
    }

    async fn disk_write_file(
        &self,
        disk_id: &str,
        path: &str,
        chunk_size: usize,
    ) -> RpcResult<ClientStream<DiskWriteFrame, bool>> {
        self.enter(PoolCall::WriteFile {
            disk_id: disk_id.to_string(),
            path: path.to_string(),
            chunk_size,
        })?;
        let url = self.state.lock().session_url(disk_id)?;

        let (sender, mut receiver) = mpsc::channel::<DiskWriteFrame>(16);
        let state = Arc::clone(&self.state);
        let target = path.to_string();
        let collector = tokio::spawn(async move {
            let mut content = BytesMut::new();
            while let Some(frame) = receiver.recv().await {
                content.extend_from_slice(&frame.data);
                state.lock().write_frames.push(frame);
            }
            state
                .lock()
                .files
                .entry(url)
                .or_default()
                .insert(target, content.freeze());
            true
        });
        let response = async move {
            collector
                .await
                .map_err(|err| RpcError::new(RpcCode::Internal, err.to_string()))
        }
        .boxed();
        Ok(ClientStream::new(sender, response))
    }

    async fn cache_set(&self) -> RpcResult<ClientStream<CacheSetFrame, bool>> {
        self.enter(PoolCall::CacheSet)?;

        let (sender, mut receiver) = mpsc::channel::<CacheSetFrame>(16);
        let state = Arc::clone(&self.state);
        let collector = tokio::spawn(async move {
            let mut entry: Option<(String, CacheEntry)> = None;
            let mut content = BytesMut::new();
            while let Some(frame) = receiver.recv().await {
                content.extend_from_slice(&frame.data);
                entry.get_or_insert_with(|| {
                    (
                        frame.key.clone(),
                        CacheEntry {
                            data: Bytes::new(),
                            version: frame.version,
                            expire_at: frame.expire_at,
                        },
                    )
                });
            }
            match entry {
                Some((key, mut entry)) => {
                    entry.data = content.freeze();
                    state.lock().cache.insert(key, entry);
                    true
                }
                None => false,
            }
        });
        let response = async move {
            collector
                .await
                .map_err(|err| RpcError::new(RpcCode::Internal, err.to_string()))
        }
        .boxed();
        Ok(ClientStream::new(sender, response))
    }

    async fn cache_get(
        &self,
        key: &str,
        last_version: u64,
    ) -> RpcResult<ServerStream<CacheGetFrame>> {
        self.enter(PoolCall::CacheGet {
            key: key.to_string(),
            last_version,
        })?;
        let state = self.state.lock();
        let now = Utc::now().timestamp_millis();
        let live = state.cache.get(key).filter(|entry| {
            entry.version > last_version && (entry.expire_at == 0 || entry.expire_at > now)
        });
        let frames: Vec<RpcResult<CacheGetFrame>> = match live {
            Some(entry) => Self::frames_of(&entry.data, state.read_chunk)
                .into_iter()
                .map(|data| Ok(CacheGetFrame { exists: true, data }))
                .collect(),
            None => vec![Ok(CacheGetFrame {
                exists: false,
                data: Bytes::new(),
            })],
        };
        Ok(stream::iter(frames).boxed())
    }

    async fn discover_actions(&self, request: DiscoveryRequest) -> RpcResult<Vec<String>> {
        self.enter(PoolCall::DiscoverActions(request))?;
        Ok(self.state.lock().actions.clone())
    }

    async fn discover_nearby_actions(
        &self,
        request: DiscoveryRequest,
    ) -> RpcResult<Vec<String>> {
        self.enter(PoolCall::DiscoverNearbyActions(request))?;
        Ok(self.state.lock().actions.clone())
    }
}
