//! Tracing spans and record helpers for the node lifecycle.
//!
//! Every helper logs through `tracing`; with the `metrics` feature enabled
//! the same calls also update the Prometheus collectors in
//! [`crate::metrics`].
//!
//! ```ignore
//! use poolnode::telemetry::{job_span, record_job_start, record_job_end};
//!
//! let timing = record_job_start(job.id.as_str());
//! run_job().instrument(job_span(job.id.as_str(), "echo")).await;
//! record_job_end(timing, "echo", JobOutcome::Completed);
//! ```

use std::time::Instant;

use tracing::{info_span, Span};

/// How a job left the lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    /// Runner output was delivered with `complete_job`.
    Completed,
    /// The job was accepted, then canceled after a failure.
    Canceled,
    /// `can_run` declined the job; it was never accepted.
    Skipped,
    /// The job failed before acceptance (context or accept error).
    Failed,
}

impl JobOutcome {
    /// Label used in logs and metric series.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Canceled => "canceled",
            JobOutcome::Skipped => "skipped",
            JobOutcome::Failed => "failed",
        }
    }
}

/// Create a tracing span for one poll cycle of a runner.
///
/// The span includes the runner name and the job kind it serves.
///
/// # Arguments
/// * `runner` - The runner name from its metadata
/// * `kind` - The event kind the runner announces
#[must_use]
pub fn poll_span(runner: impl AsRef<str>, kind: u32) -> Span {
    info_span!("poolnode.poll", runner = %runner.as_ref(), kind = kind)
}

/// Create a tracing span for the lifecycle of one job.
///
/// Covers admission, acceptance, the runner hooks and the final complete or
/// cancel call.
///
/// # Arguments
/// * `job_id` - The pool-assigned job identifier
/// * `runner` - The runner executing the job
///
/// # Example
/// ```ignore
/// let span = job_span("job-123", "echo");
/// process_job(job).instrument(span).await;
/// ```
#[must_use]
pub fn job_span(job_id: impl AsRef<str>, runner: impl AsRef<str>) -> Span {
    info_span!(
        "poolnode.job",
        job_id = %job_id.as_ref(),
        runner = %runner.as_ref(),
    )
}

/// Create a tracing span for one announcement.
///
/// # Arguments
/// * `target` - `node` for the node announcement, otherwise the runner name
#[must_use]
pub fn announce_span(target: impl AsRef<str>) -> Span {
    info_span!("poolnode.announce", target = %target.as_ref())
}

/// Record the size of one pending-jobs batch.
pub fn record_jobs_fetched(runner: impl AsRef<str>, count: usize) {
    tracing::debug!(runner = %runner.as_ref(), count = count, "jobs fetched");

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_fetched(runner.as_ref(), count);
}

/// Record a failed poll cycle.
pub fn record_poll_error(runner: impl AsRef<str>) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_poll_error(runner.as_ref());
    #[cfg(not(feature = "metrics"))]
    let _ = runner;
}

/// Record the result of a node or template announcement.
pub fn record_announce(target: impl AsRef<str>, success: bool) {
    tracing::debug!(target_name = %target.as_ref(), success = success, "announce finished");

    #[cfg(feature = "metrics")]
    crate::metrics::record_announce(target.as_ref(), success);
}

/// Start timing one job.
///
/// Pass the returned handle to [`record_job_end`] once the job leaves the
/// lifecycle.
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: Instant::now(),
    }
}

/// Record the end of a job with its outcome and duration.
pub fn record_job_end(handle: JobTimingHandle, runner: impl AsRef<str>, outcome: JobOutcome) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    tracing::info!(
        job_id = %handle.job_id,
        runner = %runner.as_ref(),
        outcome = outcome.as_str(),
        duration_secs = duration_secs,
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job(runner.as_ref(), outcome.as_str(), duration_secs);
}

/// Handle for tracking job timing, created by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: Instant,
}

impl JobTimingHandle {
    /// Get the job ID.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Get the elapsed time since the job started.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        // Without a subscriber the spans are disabled and carry no metadata.
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            assert_eq!(
                poll_span("echo", 5003).metadata().map(|m| m.name()),
                Some("poolnode.poll")
            );
            assert_eq!(
                job_span("job-1", "echo").metadata().map(|m| m.name()),
                Some("poolnode.job")
            );
            assert_eq!(
                announce_span("node").metadata().map(|m| m.name()),
                Some("poolnode.announce")
            );
        });
    }

    #[test]
    fn test_timing_handle() {
        let handle = record_job_start("job-123");
        assert_eq!(handle.job_id(), "job-123");
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(handle.elapsed().as_nanos() > 0);
        record_job_end(handle, "echo", JobOutcome::Completed);
    }
}
