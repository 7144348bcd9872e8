use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use poolnode::{PoolConnector, PoolEndpoint, PoolTransport};

use crate::InMemoryPool;

/// Transport handing out a shared [`InMemoryPool`].
///
/// The first `refuse` connects fail, which exercises the node's lazy
/// reconnect.
#[derive(Clone)]
pub struct InMemoryTransport {
    pool: InMemoryPool,
    connects: Arc<AtomicUsize>,
    refuse: Arc<AtomicUsize>,
    endpoints: Arc<Mutex<Vec<PoolEndpoint>>>,
}

impl InMemoryTransport {
    pub fn new(pool: InMemoryPool) -> Self {
        Self {
            pool,
            connects: Arc::new(AtomicUsize::new(0)),
            refuse: Arc::new(AtomicUsize::new(0)),
            endpoints: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn refusing(self, attempts: usize) -> Self {
        self.refuse.store(attempts, Ordering::SeqCst);
        self
    }

    pub fn pool(&self) -> &InMemoryPool {
        &self.pool
    }

    /// Number of connect attempts, failed ones included.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Endpoints passed to `connect`, in order.
    pub fn endpoints(&self) -> Vec<PoolEndpoint> {
        self.endpoints.lock().clone()
    }
}

#[async_trait]
impl PoolTransport for InMemoryTransport {
    async fn connect(&self, endpoint: &PoolEndpoint) -> anyhow::Result<Arc<dyn PoolConnector>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().push(endpoint.clone());
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            anyhow::bail!("connection to {} refused", endpoint.authority());
        }
        Ok(Arc::new(self.pool.clone()))
    }
}
