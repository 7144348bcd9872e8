use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::job::JobId;
use crate::pool::PoolConnector;

/// Logger bound to one job execution.
///
/// Every line is emitted as a `tracing` event tagged with the logger name,
/// version and job id. Lines at info level and above are also forwarded to
/// the pool through `log_for_job`, in order, by a background task;
/// [`flush`](Self::flush) and [`close`](Self::close) wait for that queue to
/// drain.
pub struct JobLogger {
    name: String,
    version: String,
    job_id: JobId,
    sender: Mutex<Option<mpsc::UnboundedSender<Forward>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

enum Forward {
    Line(String),
    Flush(oneshot::Sender<()>),
}

impl fmt::Debug for JobLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLogger")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("job_id", &self.job_id)
            .field("closed", &self.sender.lock().is_none())
            .finish()
    }
}

impl JobLogger {
    /// Must be called from within a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        job_id: JobId,
        client: Arc<dyn PoolConnector>,
    ) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Forward>();
        let forward_id = job_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    Forward::Line(line) => {
                        if let Err(err) = client.log_for_job(&forward_id, &line).await {
                            tracing::debug!(job_id = %forward_id, "log forwarding failed: {err}");
                        }
                    }
                    Forward::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            name: name.into(),
            version: version.into(),
            job_id,
            sender: Mutex::new(Some(sender)),
            forwarder: Mutex::new(Some(forwarder)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Local only.
    pub fn debug(&self, message: impl fmt::Display) {
        tracing::debug!(
            logger = %self.name,
            version = %self.version,
            job_id = %self.job_id,
            "{message}"
        );
    }

    pub fn info(&self, message: impl fmt::Display) {
        let line = message.to_string();
        tracing::info!(
            logger = %self.name,
            version = %self.version,
            job_id = %self.job_id,
            "{line}"
        );
        self.forward(line);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        let line = message.to_string();
        tracing::warn!(
            logger = %self.name,
            version = %self.version,
            job_id = %self.job_id,
            "{line}"
        );
        self.forward(line);
    }

    pub fn error(&self, message: impl fmt::Display) {
        let line = message.to_string();
        tracing::error!(
            logger = %self.name,
            version = %self.version,
            job_id = %self.job_id,
            "{line}"
        );
        self.forward(line);
    }

    fn forward(&self, line: String) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(Forward::Line(line));
        }
    }

    /// Waits until every line logged so far has been handed to the pool.
    /// Returns immediately once the logger is closed.
    pub async fn flush(&self) {
        let (done, flushed) = oneshot::channel();
        let queued = self
            .sender
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.send(Forward::Flush(done)).is_ok());
        if queued {
            let _ = flushed.await;
        }
    }

    /// Stops accepting lines and waits until queued ones reached the pool.
    /// Later lines are still traced locally.
    pub async fn close(&self) {
        self.sender.lock().take();
        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            if let Err(err) = forwarder.await {
                tracing::warn!(job_id = %self.job_id, "log forwarder failed: {err}");
            }
        }
    }
}
