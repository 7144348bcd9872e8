//! Node lifecycle events.
//!
//! The runtime publishes a [`NodeEvent`] at every lifecycle transition: node
//! and template announcements, fetched batches, and each job's way through
//! admission, acceptance and completion or cancellation. Embedders and tests
//! subscribe through [`NodeEventPublisher::subscribe`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::JobFailure;
use crate::job::JobId;

/// Lifecycle event emitted by a running node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeEvent {
    /// When the runtime emitted the event.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub payload: NodeEventPayload,
}

impl NodeEvent {
    /// Create an event stamped with the current time.
    pub fn new(payload: NodeEventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Job the event refers to, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match &self.payload {
            NodeEventPayload::JobSkipped { job_id, .. }
            | NodeEventPayload::JobAccepted { job_id, .. }
            | NodeEventPayload::JobCompleted { job_id, .. }
            | NodeEventPayload::JobCanceled { job_id, .. }
            | NodeEventPayload::JobFailed { job_id, .. } => Some(job_id),
            _ => None,
        }
    }
}

/// Event payload emitted for node and job lifecycle transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum NodeEventPayload {
    /// The pool accepted the node announcement.
    NodeAnnounced { refresh_interval_ms: u64 },
    /// The pool accepted a runner's template.
    TemplateAnnounced { runner: String, kind: u32 },
    /// A poll cycle returned jobs.
    JobsFetched { runner: String, count: usize },
    /// The runner declined the job; it was neither locked nor accepted.
    JobSkipped { job_id: JobId, runner: String },
    /// The pool confirmed `accept_job`; the runner hooks run next.
    JobAccepted { job_id: JobId, runner: String },
    /// The runner output was delivered with `complete_job`.
    JobCompleted { job_id: JobId, runner: String },
    /// The job failed after acceptance and was canceled on the pool.
    JobCanceled {
        job_id: JobId,
        runner: String,
        failure: JobFailure,
    },
    /// The job failed before acceptance; the pool was not notified.
    JobFailed {
        job_id: JobId,
        runner: String,
        failure: JobFailure,
    },
}

/// Sink for node lifecycle events.
#[async_trait]
pub trait NodeEventPublisher: Send + Sync {
    /// Publish an event to all subscribers.
    ///
    /// Returns an error if the event cannot be published. The runtime logs
    /// such errors and carries on.
    async fn publish(&self, event: NodeEvent) -> anyhow::Result<()>;

    /// Subscribe to events, returning a broadcast receiver.
    ///
    /// Multiple subscribers can receive the same events (fan-out).
    fn subscribe(&self) -> broadcast::Receiver<NodeEvent>;
}

/// In-process event bus using tokio broadcast channels.
///
/// Publishing never waits for subscribers; a subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged`.
pub struct InProcEventBus {
    sender: broadcast::Sender<NodeEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl InProcEventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Get the channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events published while nobody subscribes are dropped.
    pub fn publish_event(&self, event: NodeEvent) {
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl NodeEventPublisher for InProcEventBus {
    async fn publish(&self, event: NodeEvent) -> anyhow::Result<()> {
        self.publish_event(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobStage;
    use std::time::Duration;
    use tokio::time::timeout;

    fn accepted(id: &str) -> NodeEvent {
        NodeEvent::new(NodeEventPayload::JobAccepted {
            job_id: JobId::from(id),
            runner: "echo".into(),
        })
    }

    #[tokio::test]
    async fn test_event_bus_broadcast_to_multiple_subscribers() {
        let bus = InProcEventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        for i in 0..3 {
            bus.publish(accepted(&format!("job-{i}"))).await.unwrap();
        }

        for i in 0..3 {
            let a = timeout(Duration::from_millis(100), rx1.recv()).await.unwrap().unwrap();
            let b = timeout(Duration::from_millis(100), rx2.recv()).await.unwrap().unwrap();
            assert_eq!(a.job_id().unwrap().as_str(), format!("job-{i}"));
            assert_eq!(b.job_id().unwrap().as_str(), format!("job-{i}"));
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(accepted(&i.to_string())).await.unwrap();
        }

        let result = timeout(Duration::from_millis(100), rx.recv()).await.unwrap();
        assert!(matches!(result, Err(broadcast::error::RecvError::Lagged(_))));
    }

    #[test]
    fn test_job_id_only_for_job_events() {
        let announced = NodeEvent::new(NodeEventPayload::NodeAnnounced {
            refresh_interval_ms: 5_000,
        });
        assert!(announced.job_id().is_none());

        let canceled = NodeEvent::new(NodeEventPayload::JobCanceled {
            job_id: JobId::from("j"),
            runner: "echo".into(),
            failure: JobFailure::new(JobStage::Run, &anyhow::anyhow!("boom")),
        });
        assert_eq!(canceled.job_id().unwrap().as_str(), "j");
    }

    #[test]
    fn test_debug_reports_subscribers() {
        let bus = InProcEventBus::new(8);
        let _rx = bus.subscribe();
        let debug = format!("{bus:?}");
        assert!(debug.contains("subscribers: 1"));
        assert!(debug.contains("capacity: 8"));
    }
}
