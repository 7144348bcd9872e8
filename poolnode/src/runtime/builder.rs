use std::fmt;
use std::sync::Arc;

use crate::config::NodeConfig;
use crate::events::{InProcEventBus, NodeEventPublisher};
use crate::pool::PoolTransport;
use crate::runner::JobRunner;

use super::supervisor::NodeRuntime;

/// Builder for a [`NodeRuntime`] with explicit dependencies.
///
/// Only the transport is required. Without an event publisher the node
/// gets its own [`InProcEventBus`].
///
/// # Example
///
/// ```ignore
/// use poolnode::*;
///
/// let node = NodeRuntimeBuilder::new(NodeConfig::from_env())
///     .with_transport(transport)
///     .with_runner(Arc::new(ToolSelector::new()))
///     .build()?;
/// node.start(StartOptions::default()).await?;
/// ```
pub struct NodeRuntimeBuilder {
    config: NodeConfig,
    transport: Option<Arc<dyn PoolTransport>>,
    events: Option<Arc<dyn NodeEventPublisher>>,
    runners: Vec<Arc<dyn JobRunner>>,
}

impl fmt::Debug for NodeRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRuntimeBuilder")
            .field("config", &self.config)
            .field("transport_set", &self.transport.is_some())
            .field("events_set", &self.events.is_some())
            .field("runner_count", &self.runners.len())
            .finish()
    }
}

impl NodeRuntimeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            transport: None,
            events: None,
            runners: Vec::new(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn PoolTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn NodeEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Registers `runner` when the node is built. May be called repeatedly.
    pub fn with_runner(mut self, runner: Arc<dyn JobRunner>) -> Self {
        self.runners.push(runner);
        self
    }

    /// # Errors
    ///
    /// Returns an error if no transport was configured.
    pub fn build(self) -> anyhow::Result<NodeRuntime> {
        let transport = self
            .transport
            .ok_or_else(|| anyhow::anyhow!("transport dependency missing"))?;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::default()));

        let node = NodeRuntime::new(self.config, transport, events);
        for runner in self.runners {
            node.register_shared(runner);
        }
        Ok(node)
    }
}
