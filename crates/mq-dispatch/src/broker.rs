//! Broker adapter contract and the push-mode message pump.
//!
//! The dispatch layer is written against [`Broker`] and [`BrokerQueue`] only.
//! Each wire dialect lives in `providers` and is picked at composition time.

use crate::error::QueueError;
use crate::message::{LockToken, MessageId};
use crate::queue_names::{default_sanitize, QueueName};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;

/// Supported broker backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    InMemory,
    ServiceBus,
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InMemory => write!(f, "in_memory"),
            Self::ServiceBus => write!(f, "service_bus"),
        }
    }
}

/// A message delivered under a broker lock, waiting to be completed or abandoned
#[derive(Debug, Clone)]
pub struct BrokerDelivery {
    pub body: Bytes,
    pub lock_token: LockToken,
    pub message_id: Option<MessageId>,
    pub delivery_count: u32,
}

/// Options for attaching a push-mode consumer to a queue
#[derive(Debug, Clone)]
pub struct PushOptions {
    /// Maximum number of deliveries in flight at once
    pub max_concurrent: usize,
    /// How long each broker receive call waits before re-checking for shutdown
    pub receive_wait: Duration,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            receive_wait: Duration::from_millis(1000),
        }
    }
}

/// Callback invoked for every message a push subscription receives
#[async_trait]
pub trait DeliveryCallback: Send + Sync {
    async fn on_delivery(&self, delivery: BrokerDelivery) -> Result<(), QueueError>;
}

/// Opaque per-queue broker handle. Expensive to construct, so callers cache it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    /// Sanitized name of the queue this handle talks to
    fn name(&self) -> &QueueName;

    /// Send a serialized envelope
    async fn send(&self, body: Bytes, message_id: &MessageId) -> Result<(), QueueError>;

    /// Receive-and-delete. `None` waits indefinitely; returns `Ok(None)` when
    /// the timeout elapses without a message.
    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Bytes>, QueueError>;

    /// Peek-lock receive used by push subscriptions
    async fn receive_locked(&self, wait: Duration) -> Result<Option<BrokerDelivery>, QueueError>;

    /// Settle a locked delivery, removing it from the queue
    async fn complete(&self, lock_token: &LockToken) -> Result<(), QueueError>;

    /// Release a locked delivery so the broker redelivers it
    async fn abandon(&self, lock_token: &LockToken) -> Result<(), QueueError>;

    /// Release broker resources held by this handle
    async fn close(&self) -> Result<(), QueueError>;
}

/// Broker adapter used by the dispatch layer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    fn kind(&self) -> BrokerKind;

    /// Broker-specific queue name transform. Must be idempotent.
    fn sanitize_queue_name(&self, name: &str) -> String {
        default_sanitize(name)
    }

    /// Create the queue if it does not exist. Concurrent callers racing to
    /// create the same queue must all succeed.
    async fn ensure_queue(&self, queue: &QueueName) -> Result<(), QueueError>;

    /// Build a new handle for an existing queue
    async fn open_queue(&self, queue: &QueueName) -> Result<Arc<dyn BrokerQueue>, QueueError>;

    /// Attach a push consumer to a queue handle
    async fn register_push(
        &self,
        queue: Arc<dyn BrokerQueue>,
        callback: Arc<dyn DeliveryCallback>,
        options: PushOptions,
    ) -> Result<PushSubscription, QueueError> {
        Ok(spawn_message_pump(queue, callback, options))
    }
}

// ============================================================================
// Push subscription / message pump
// ============================================================================

/// Handle to a running push consumer
pub struct PushSubscription {
    queue: QueueName,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PushSubscription {
    pub fn new(queue: QueueName, shutdown: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            queue,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn is_active(&self) -> bool {
        !*self.shutdown.borrow()
    }

    /// Stop receiving and wait for in-flight deliveries to finish.
    /// Calling this more than once is a no-op.
    pub async fn detach(&self) {
        self.shutdown.send_replace(true);

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(queue = %self.queue, error = %e, "Message pump task failed");
            }
            debug!(queue = %self.queue, "Push subscription detached");
        }
    }
}

impl std::fmt::Debug for PushSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSubscription")
            .field("queue", &self.queue)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Spawn a pump that pulls locked deliveries and hands them to `callback`
pub fn spawn_message_pump(
    queue: Arc<dyn BrokerQueue>,
    callback: Arc<dyn DeliveryCallback>,
    options: PushOptions,
) -> PushSubscription {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let name = queue.name().clone();
    let task = tokio::spawn(run_message_pump(queue, callback, options, shutdown_rx));
    PushSubscription::new(name, shutdown_tx, task)
}

const MAX_BACKOFF: Duration = Duration::from_secs(5);

async fn run_message_pump(
    queue: Arc<dyn BrokerQueue>,
    callback: Arc<dyn DeliveryCallback>,
    options: PushOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_concurrent = options.max_concurrent.max(1);
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut consecutive_errors: u32 = 0;

    info!(
        queue = %queue.name(),
        max_concurrent = max_concurrent,
        "Message pump started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Wait for a free slot before asking the broker for more work
        let permit = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let received = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            received = queue.receive_locked(options.receive_wait) => received,
        };

        match received {
            Ok(Some(delivery)) => {
                consecutive_errors = 0;
                debug!(
                    queue = %queue.name(),
                    lock_token = %delivery.lock_token,
                    delivery_count = delivery.delivery_count,
                    "Delivery received"
                );

                let callback = Arc::clone(&callback);
                let queue_name = queue.name().clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = callback.on_delivery(delivery).await {
                        error!(queue = %queue_name, error = %e, "Delivery callback failed");
                    }
                });
            }
            Ok(None) => {}
            Err(e) => {
                consecutive_errors += 1;
                let backoff = std::cmp::min(
                    Duration::from_millis(100 * 2u64.pow(consecutive_errors.min(6))),
                    MAX_BACKOFF,
                );
                warn!(
                    queue = %queue.name(),
                    error = %e,
                    consecutive_errors = consecutive_errors,
                    backoff_ms = backoff.as_millis() as u64,
                    "Broker receive failed, backing off"
                );
                drop(permit);

                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        while let Some(result) = in_flight.try_join_next() {
            if let Err(e) = result {
                error!(queue = %queue.name(), error = %e, "Delivery task panicked");
            }
        }
    }

    while let Some(result) = in_flight.join_next().await {
        if let Err(e) = result {
            error!(queue = %queue.name(), error = %e, "Delivery task panicked");
        }
    }

    info!(queue = %queue.name(), "Message pump stopped");
}
