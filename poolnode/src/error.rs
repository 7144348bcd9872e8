use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status codes reported by the pool channel.
///
/// Mirrors the status space of the underlying RPC framework so transports can
/// map their native status one-to-one.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RpcCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl RpcCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcCode::Cancelled => "CANCELLED",
            RpcCode::Unknown => "UNKNOWN",
            RpcCode::InvalidArgument => "INVALID_ARGUMENT",
            RpcCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            RpcCode::NotFound => "NOT_FOUND",
            RpcCode::AlreadyExists => "ALREADY_EXISTS",
            RpcCode::PermissionDenied => "PERMISSION_DENIED",
            RpcCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            RpcCode::FailedPrecondition => "FAILED_PRECONDITION",
            RpcCode::Aborted => "ABORTED",
            RpcCode::OutOfRange => "OUT_OF_RANGE",
            RpcCode::Unimplemented => "UNIMPLEMENTED",
            RpcCode::Internal => "INTERNAL",
            RpcCode::Unavailable => "UNAVAILABLE",
            RpcCode::DataLoss => "DATA_LOSS",
            RpcCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }

    /// Whether repeating the same call can never succeed: the caller lacks
    /// credentials or rights, or the request itself is unusable. Every other
    /// code is treated as retryable.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RpcCode::Unauthenticated
                | RpcCode::PermissionDenied
                | RpcCode::InvalidArgument
                | RpcCode::Unimplemented
        )
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call on the pool channel: non-OK status plus detail text.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("rpc failed with status {code}: {detail}")]
pub struct RpcError {
    pub code: RpcCode,
    pub detail: String,
}

impl RpcError {
    pub fn new(code: RpcCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// The request side of a streaming call was dropped by the remote end.
    pub fn stream_closed() -> Self {
        Self::new(RpcCode::Cancelled, "request stream closed")
    }
}

/// Result of a call on the pool channel.
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors raised by [`Disk`](crate::disk::Disk) operations.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("disk {disk_id} is closed")]
    Closed { disk_id: String },

    #[error("file not found: {path}")]
    NotFound { path: String },

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Errors raised by the local and remote cache tiers.
///
/// These never reach a runner: the job context logs them and reports a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Reasons a sub-job wait stopped before the job succeeded.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {elapsed_ms}ms waiting for job {job_id}")]
    TimedOut { job_id: String, elapsed_ms: u64 },

    #[error("node shut down while waiting for job {job_id}")]
    Shutdown { job_id: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Lifecycle stage at which a job failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobStage {
    Context,
    Accept,
    PreRun,
    Run,
    PostRun,
    Complete,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Context => "context",
            JobStage::Accept => "accept",
            JobStage::PreRun => "pre_run",
            JobStage::Run => "run",
            JobStage::PostRun => "post_run",
            JobStage::Complete => "complete",
        }
    }

    /// Stages reached only after the pool acknowledged acceptance.
    pub fn is_after_accept(&self) -> bool {
        matches!(
            self,
            JobStage::PreRun
                | JobStage::Run
                | JobStage::PostRun
                | JobStage::Complete
        )
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured description of a failed job.
///
/// The pool only receives [`JobFailure::reason`]; the stage travels with the
/// lifecycle events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobFailure {
    pub stage: JobStage,
    pub message: String,
}

impl JobFailure {
    pub fn new(stage: JobStage, error: &anyhow::Error) -> Self {
        Self {
            stage,
            message: format!("{error:#}"),
        }
    }

    /// Free-text reason sent with `cancelJob`.
    pub fn reason(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_display_carries_code_and_detail() {
        let err = RpcError::new(RpcCode::Unavailable, "pool restarting");
        assert_eq!(
            err.to_string(),
            "rpc failed with status UNAVAILABLE: pool restarting"
        );
    }

    #[test]
    fn test_permanent_codes() {
        assert!(RpcCode::PermissionDenied.is_permanent());
        assert!(RpcCode::Unauthenticated.is_permanent());
        assert!(!RpcCode::Unavailable.is_permanent());
        assert!(!RpcCode::NotFound.is_permanent());
        assert!(!RpcCode::Internal.is_permanent());
    }

    #[test]
    fn test_job_failure_reason_keeps_error_chain() {
        let err = anyhow::anyhow!("model unavailable").context("tool call");
        let failure = JobFailure::new(JobStage::Run, &err);
        assert_eq!(failure.reason(), "tool call: model unavailable");
        assert_eq!(failure.to_string(), "run failed: tool call: model unavailable");
    }

    #[test]
    fn test_stage_after_accept() {
        assert!(!JobStage::Accept.is_after_accept());
        assert!(!JobStage::Context.is_after_accept());
        assert!(JobStage::Run.is_after_accept());
        assert!(JobStage::Complete.is_after_accept());
    }
}
