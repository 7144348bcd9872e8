//! Node-local job locks.
//!
//! A long-poll for pending jobs can hand back a job this node is still
//! working on. Before every poll the runtime prunes [`LockedJobs`] and sends
//! the surviving ids as the exclusion list.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Default lifetime of a local job lock.
pub const DEFAULT_LOCK_TTL_SECS: i64 = 60;

/// A job this node has taken and must not lease again while the lock lives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLock {
    /// ID of the locked job.
    pub job_id: JobId,
    /// Timestamp when the lock was taken.
    pub locked_at: DateTime<Utc>,
}

impl JobLock {
    /// Create a lock taken now.
    pub fn new(job_id: JobId) -> Self {
        Self::at(job_id, Utc::now())
    }

    /// Create a lock taken at `locked_at`.
    pub fn at(job_id: JobId, locked_at: DateTime<Utc>) -> Self {
        Self { job_id, locked_at }
    }

    /// Checks if the lock has outlived `ttl` at `now`.
    pub fn is_expired_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.locked_at >= ttl
    }
}

/// Node-local exclusion table for jobs currently being processed.
///
/// The pool stays authoritative for delivery; this table only keeps the
/// long-poll from handing the same job back to this node while it works on
/// it. Entries are never removed on completion, they age out after the TTL.
#[derive(Clone, Debug)]
pub struct LockedJobs {
    ttl: Duration,
    locks: Vec<JobLock>,
}

impl Default for LockedJobs {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_LOCK_TTL_SECS))
    }
}

impl LockedJobs {
    /// Create an empty table whose locks live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            locks: Vec::new(),
        }
    }

    /// Get the lock lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Lock `job_id` as of now.
    pub fn lock(&mut self, job_id: JobId) {
        self.lock_at(job_id, Utc::now());
    }

    /// Lock `job_id` as of `now`.
    pub fn lock_at(&mut self, job_id: JobId, now: DateTime<Utc>) {
        self.locks.push(JobLock::at(job_id, now));
    }

    /// Drops every lock older than the TTL; returns how many were removed.
    pub fn prune(&mut self) -> usize {
        self.prune_at(Utc::now())
    }

    /// Same as [`prune`](Self::prune) with an explicit clock.
    pub fn prune_at(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.locks.len();
        let ttl = self.ttl;
        self.locks.retain(|lock| !lock.is_expired_at(ttl, now));
        before - self.locks.len()
    }

    /// Check if `job_id` is currently locked.
    pub fn is_locked(&self, job_id: &JobId) -> bool {
        self.locks.iter().any(|lock| &lock.job_id == job_id)
    }

    /// IDs to pass as the `excludeId` list of the next pending-jobs poll.
    pub fn excluded_ids(&self) -> Vec<String> {
        self.locks
            .iter()
            .map(|lock| lock.job_id.0.clone())
            .collect()
    }

    /// Get the number of live locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_expiry_boundary() {
        let now = Utc::now();
        let lock = JobLock::at(JobId::from("a"), now);
        let ttl = Duration::seconds(60);

        assert!(!lock.is_expired_at(ttl, now + Duration::seconds(59)));
        assert!(lock.is_expired_at(ttl, now + Duration::seconds(60)));
    }

    #[test]
    fn test_locked_job_excluded_until_ttl() {
        let start = Utc::now();
        let mut table = LockedJobs::default();
        table.lock_at(JobId::from("job-1"), start);

        assert_eq!(table.prune_at(start + Duration::seconds(30)), 0);
        assert_eq!(table.excluded_ids(), vec!["job-1".to_string()]);
        assert!(table.is_locked(&JobId::from("job-1")));

        assert_eq!(table.prune_at(start + Duration::seconds(61)), 1);
        assert!(table.excluded_ids().is_empty());
        assert!(!table.is_locked(&JobId::from("job-1")));
    }

    #[test]
    fn test_prune_keeps_younger_locks() {
        let start = Utc::now();
        let mut table = LockedJobs::new(Duration::seconds(10));
        table.lock_at(JobId::from("old"), start);
        table.lock_at(JobId::from("new"), start + Duration::seconds(8));

        let removed = table.prune_at(start + Duration::seconds(12));
        assert_eq!(removed, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.excluded_ids(), vec!["new".to_string()]);
    }

    #[test]
    fn test_relock_after_expiry() {
        let start = Utc::now();
        let mut table = LockedJobs::new(Duration::seconds(1));
        table.lock_at(JobId::from("job"), start);
        table.prune_at(start + Duration::seconds(2));
        assert!(table.is_empty());

        table.lock_at(JobId::from("job"), start + Duration::seconds(2));
        assert!(table.is_locked(&JobId::from("job")));
    }
}
