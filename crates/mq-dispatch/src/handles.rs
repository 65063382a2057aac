//! Process-scoped cache of broker queue handles.

use crate::broker::{Broker, BrokerQueue};
use crate::error::QueueError;
use crate::queue_names::QueueName;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "handles_tests.rs"]
mod tests;

type HandleCell = Arc<OnceCell<Arc<dyn BrokerQueue>>>;

/// Get-or-create map of broker queue handles keyed by sanitized queue name.
///
/// The first caller for a name ensures the queue exists and opens the handle;
/// concurrent callers for the same name wait on that single creation and then
/// share the resulting handle. A failed creation leaves the slot empty so the
/// next caller tries again.
pub struct QueueHandleCache {
    broker: Arc<dyn Broker>,
    handles: RwLock<HashMap<QueueName, HandleCell>>,
}

impl QueueHandleCache {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Return the cached handle for `queue`, creating queue and handle on first use
    pub async fn get_or_create(
        &self,
        queue: &QueueName,
    ) -> Result<Arc<dyn BrokerQueue>, QueueError> {
        let cell = self.cell_for(queue).await;

        let handle = cell
            .get_or_try_init(|| async {
                debug!(queue = %queue, "Opening broker queue handle");
                self.broker.ensure_queue(queue).await?;
                self.broker.open_queue(queue).await
            })
            .await?;

        Ok(Arc::clone(handle))
    }

    /// Get or insert the slot for a name (with double-check locking)
    async fn cell_for(&self, queue: &QueueName) -> HandleCell {
        // First check with read lock
        {
            let handles = self.handles.read().await;
            if let Some(cell) = handles.get(queue) {
                return Arc::clone(cell);
            }
        }

        let mut handles = self.handles.write().await;

        // Double-check: another task might have inserted it
        Arc::clone(handles.entry(queue.clone()).or_default())
    }

    /// Whether an opened handle is cached for `queue`
    pub async fn contains(&self, queue: &QueueName) -> bool {
        self.handles
            .read()
            .await
            .get(queue)
            .is_some_and(|cell| cell.initialized())
    }

    /// Number of opened handles
    pub async fn len(&self) -> usize {
        self.handles
            .read()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close and forget every cached handle. Close failures are logged, not
    /// returned, so shutdown always completes. Returns the number closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(QueueName, HandleCell)> = self.handles.write().await.drain().collect();

        let mut closed = 0;
        for (name, cell) in drained {
            if let Some(handle) = cell.get() {
                if let Err(e) = handle.close().await {
                    warn!(queue = %name, error = %e, "Failed to close broker queue handle");
                }
                closed += 1;
            }
        }

        if closed > 0 {
            debug!(closed = closed, "Closed broker queue handles");
        }
        closed
    }
}
