use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{RpcError, RpcResult};
use crate::job::{Job, JobId};

/// Largest message the node sends or accepts on the pool channel.
pub const MAX_MESSAGE_BYTES: usize = 20 * 1024 * 1024;

/// Where and how to reach the pool.
#[derive(Clone, Serialize, Deserialize)]
pub struct PoolEndpoint {
    pub address: String,
    pub port: u16,
    pub ssl: bool,
    /// Sent as the `authorization` metadata on every call.
    pub auth_token: Option<String>,
    pub max_message_bytes: usize,
}

impl PoolEndpoint {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Debug for PoolEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEndpoint")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("ssl", &self.ssl)
            .field("auth_token_set", &self.auth_token.is_some())
            .field("max_message_bytes", &self.max_message_bytes)
            .finish()
    }
}

/// Response stream of a server-streaming call.
pub type ServerStream<T> = BoxStream<'static, RpcResult<T>>;

/// Request half of a client-streaming call.
///
/// Frames are pushed with [`send`](Self::send); [`finish`](Self::finish)
/// closes the request side and resolves the single response.
pub struct ClientStream<T, O> {
    sender: mpsc::Sender<T>,
    response: BoxFuture<'static, RpcResult<O>>,
}

impl<T, O> ClientStream<T, O>
where
    T: Send + 'static,
    O: Send + 'static,
{
    pub fn new(
        sender: mpsc::Sender<T>,
        response: BoxFuture<'static, RpcResult<O>>,
    ) -> Self {
        Self { sender, response }
    }

    pub async fn send(&mut self, frame: T) -> RpcResult<()> {
        self.sender
            .send(frame)
            .await
            .map_err(|_| RpcError::stream_closed())
    }

    pub async fn finish(self) -> RpcResult<O> {
        let Self { sender, response } = self;
        drop(sender);
        response.await
    }
}

impl<T, O> fmt::Debug for ClientStream<T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStream")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AnnounceNodeRequest {
    pub name: String,
    pub description: String,
    pub icon_url: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AnnounceTemplateRequest {
    /// JSON-encoded runner metadata.
    pub meta: String,
    pub template: String,
    /// JSON-encoded socket schema.
    pub sockets: String,
}

/// Pool reply to an announcement.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Announcement {
    /// Milliseconds until the pool expects the next announcement.
    pub refresh_interval_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PendingJobsRequest {
    pub filter_by_run_on: Option<String>,
    pub filter_by_customer: Option<String>,
    pub filter_by_description: Option<String>,
    pub filter_by_id: Option<String>,
    pub filter_by_kind: Option<String>,
    pub exclude_ids: Vec<String>,
    /// Long-poll budget in milliseconds.
    pub wait_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobRequest {
    /// Raw event describing the job.
    pub event: String,
    pub provider: Option<String>,
    pub encrypted: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateDiskRequest {
    pub name: Option<String>,
    pub encryption_key: Option<String>,
    pub include_encryption_key_in_url: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct DiskReadFrame {
    pub exists: bool,
    pub data: Bytes,
}

#[derive(Clone, Debug, Default)]
pub struct DiskWriteFrame {
    pub disk_id: String,
    pub path: String,
    pub data: Bytes,
}

#[derive(Clone, Debug, Default)]
pub struct CacheSetFrame {
    pub key: String,
    pub data: Bytes,
    pub version: u64,
    pub expire_at: i64,
}

#[derive(Clone, Debug, Default)]
pub struct CacheGetFrame {
    pub exists: bool,
    pub data: Bytes,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub filter_by_kinds: Vec<u32>,
    pub filter_by_nodes: Vec<String>,
    pub filter_by_tags: Vec<String>,
    /// Each range encoded as `"min-max"`.
    pub filter_by_kind_ranges: Vec<String>,
    pub filter_by_pools: Vec<String>,
}

/// Client side of the pool connector service.
///
/// Implementors adapt a concrete channel: every unary call resolves to the
/// response or an [`RpcError`], and streaming calls surface status failures as
/// stream items or as the finished response.
#[async_trait]
pub trait PoolConnector: Send + Sync {
    async fn announce_node(
        &self,
        request: AnnounceNodeRequest,
    ) -> RpcResult<Announcement>;

    async fn announce_event_template(
        &self,
        request: AnnounceTemplateRequest,
    ) -> RpcResult<Announcement>;

    /// Long-poll for jobs matching the filters, waiting up to `wait_ms`.
    async fn get_pending_jobs(
        &self,
        request: PendingJobsRequest,
    ) -> RpcResult<Vec<Job>>;

    async fn accept_job(&self, job_id: &JobId) -> RpcResult<()>;

    async fn cancel_job(&self, job_id: &JobId, reason: &str) -> RpcResult<()>;

    async fn complete_job(&self, job_id: &JobId, output: &str) -> RpcResult<()>;

    async fn log_for_job(&self, job_id: &JobId, log: &str) -> RpcResult<()>;

    /// Fetch a job, letting the pool hold the call up to `wait_ms` for a
    /// state change.
    async fn get_job(&self, job_id: &JobId, wait_ms: u64) -> RpcResult<Job>;

    async fn send_job_request(&self, request: JobRequest) -> RpcResult<Job>;

    /// Open a disk by url; returns its session id.
    async fn open_disk(&self, url: &str) -> RpcResult<String>;

    /// Create a disk; returns its url.
    async fn create_disk(&self, request: CreateDiskRequest) -> RpcResult<String>;

    async fn close_disk(&self, disk_id: &str) -> RpcResult<()>;

    async fn disk_list_files(
        &self,
        disk_id: &str,
        path: &str,
    ) -> RpcResult<Vec<String>>;

    async fn disk_delete_file(&self, disk_id: &str, path: &str) -> RpcResult<bool>;

    async fn disk_read_file(
        &self,
        disk_id: &str,
        path: &str,
    ) -> RpcResult<ServerStream<DiskReadFrame>>;

    async fn disk_write_file(
        &self,
        disk_id: &str,
        path: &str,
        chunk_size: usize,
    ) -> RpcResult<ClientStream<DiskWriteFrame, bool>>;

    async fn cache_set(&self) -> RpcResult<ClientStream<CacheSetFrame, bool>>;

    async fn cache_get(
        &self,
        key: &str,
        last_version: u64,
    ) -> RpcResult<ServerStream<CacheGetFrame>>;

    /// Returns JSON action descriptors.
    async fn discover_actions(
        &self,
        request: DiscoveryRequest,
    ) -> RpcResult<Vec<String>>;

    /// Like [`discover_actions`](Self::discover_actions), restricted to the
    /// pool this node is connected to.
    async fn discover_nearby_actions(
        &self,
        request: DiscoveryRequest,
    ) -> RpcResult<Vec<String>>;
}

/// Opens the shared connector for an endpoint.
///
/// Called lazily on first use; a failed attempt is retried by the next caller.
#[async_trait]
pub trait PoolTransport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &PoolEndpoint,
    ) -> anyhow::Result<Arc<dyn PoolConnector>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_client_stream_finish_closes_request_side() {
        let (tx, mut rx) = mpsc::channel::<u32>(4);
        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(frame) = rx.recv().await {
                seen.push(frame);
            }
            seen
        });
        let response = async move {
            collector
                .await
                .map(|seen| seen.len())
                .map_err(|e| RpcError::new(crate::error::RpcCode::Internal, e.to_string()))
        }
        .boxed();

        let mut call = ClientStream::new(tx, response);
        call.send(1).await.unwrap();
        call.send(2).await.unwrap();
        assert_eq!(call.finish().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_client_stream_send_after_remote_drop_fails() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        let mut call: ClientStream<u32, ()> =
            ClientStream::new(tx, async { Ok(()) }.boxed());
        let err = call.send(7).await.unwrap_err();
        assert_eq!(err.code, crate::error::RpcCode::Cancelled);
    }

    #[test]
    fn test_endpoint_debug_hides_token() {
        let endpoint = PoolEndpoint {
            address: "pool.example".into(),
            port: 5000,
            ssl: true,
            auth_token: Some("secret".into()),
            max_message_bytes: MAX_MESSAGE_BYTES,
        };
        let debug = format!("{endpoint:?}");
        assert!(!debug.contains("secret"));
        assert_eq!(endpoint.authority(), "pool.example:5000");
    }
}
