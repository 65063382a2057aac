//! In-memory broker implementation for testing and development.
//!
//! Queues live in process memory behind a single mutex. The broker supports:
//! - receive-and-delete for pull consumers
//! - peek-lock with lock tokens for push consumers, where abandon puts the
//!   message back at the head of the queue
//! - blocking receives woken by [`Notify`] instead of polling
//!
//! Counters for created queues and opened handles let tests assert on the
//! get-or-create behavior of callers.

use crate::broker::{Broker, BrokerDelivery, BrokerKind, BrokerQueue};
use crate::error::QueueError;
use crate::message::{LockToken, MessageId};
use crate::queue_names::QueueName;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

const PROVIDER_NAME: &str = "InMemory";

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message stored in the queue with delivery metadata
#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: Bytes,
    delivery_count: u32,
}

/// Internal state for a single queue
struct InMemoryQueue {
    /// Ready messages in FIFO order
    messages: VecDeque<StoredMessage>,
    /// Locked messages keyed by lock token
    in_flight: HashMap<String, StoredMessage>,
    notify: Arc<Notify>,
}

impl InMemoryQueue {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            in_flight: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Default)]
struct QueueStorage {
    queues: HashMap<QueueName, InMemoryQueue>,
}

impl QueueStorage {
    fn queue_mut(&mut self, name: &QueueName) -> Result<&mut InMemoryQueue, QueueError> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound {
                queue_name: name.to_string(),
            })
    }
}

type SharedStorage = Arc<Mutex<QueueStorage>>;

fn lock_storage(storage: &Mutex<QueueStorage>) -> Result<MutexGuard<'_, QueueStorage>, QueueError> {
    storage.lock().map_err(|_| QueueError::ProviderError {
        provider: PROVIDER_NAME.to_string(),
        code: "LockPoisoned".to_string(),
        message: "queue storage lock poisoned".to_string(),
    })
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// Process-local broker
#[derive(Default)]
pub struct InMemoryBroker {
    storage: SharedStorage,
    queues_created: AtomicUsize,
    handles_opened: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queues actually created by `ensure_queue`
    pub fn queues_created(&self) -> usize {
        self.queues_created.load(Ordering::SeqCst)
    }

    /// Number of handles built by `open_queue`
    pub fn handles_opened(&self) -> usize {
        self.handles_opened.load(Ordering::SeqCst)
    }

    pub fn queue_exists(&self, queue: &QueueName) -> bool {
        lock_storage(&self.storage)
            .map(|storage| storage.queues.contains_key(queue))
            .unwrap_or(false)
    }

    /// Ready (not locked) message count, zero for unknown queues
    pub fn message_count(&self, queue: &QueueName) -> usize {
        lock_storage(&self.storage)
            .ok()
            .and_then(|storage| storage.queues.get(queue).map(|q| q.messages.len()))
            .unwrap_or(0)
    }

    /// Locked, unsettled message count, zero for unknown queues
    pub fn in_flight_count(&self, queue: &QueueName) -> usize {
        lock_storage(&self.storage)
            .ok()
            .and_then(|storage| storage.queues.get(queue).map(|q| q.in_flight.len()))
            .unwrap_or(0)
    }

    /// Copies of the ready message bodies, head first
    pub fn peek_bodies(&self, queue: &QueueName) -> Vec<Bytes> {
        lock_storage(&self.storage)
            .ok()
            .and_then(|storage| {
                storage
                    .queues
                    .get(queue)
                    .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::InMemory
    }

    async fn ensure_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        let mut storage = lock_storage(&self.storage)?;
        if !storage.queues.contains_key(queue) {
            storage.queues.insert(queue.clone(), InMemoryQueue::new());
            self.queues_created.fetch_add(1, Ordering::SeqCst);
            debug!(queue = %queue, "Created in-memory queue");
        }
        Ok(())
    }

    async fn open_queue(&self, queue: &QueueName) -> Result<Arc<dyn BrokerQueue>, QueueError> {
        if !lock_storage(&self.storage)?.queues.contains_key(queue) {
            return Err(QueueError::QueueNotFound {
                queue_name: queue.to_string(),
            });
        }

        self.handles_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryQueueHandle {
            name: queue.clone(),
            storage: Arc::clone(&self.storage),
            closed: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// InMemoryQueueHandle
// ============================================================================

/// Handle to one in-memory queue
pub struct InMemoryQueueHandle {
    name: QueueName,
    storage: SharedStorage,
    closed: AtomicBool,
}

impl InMemoryQueueHandle {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::QueueClosed {
                queue_name: self.name.to_string(),
            });
        }
        Ok(())
    }

    /// Run `take` against the queue until it yields a value or the timeout
    /// elapses. `None` waits indefinitely.
    ///
    /// The wake-up future is registered before the queue is inspected, so a
    /// send or close racing with the check is never missed.
    async fn wait_for<R, F>(
        &self,
        timeout: Option<Duration>,
        mut take: F,
    ) -> Result<Option<R>, QueueError>
    where
        F: FnMut(&mut InMemoryQueue) -> Option<R> + Send,
        R: Send,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let notify = {
            let mut storage = lock_storage(&self.storage)?;
            Arc::clone(&storage.queue_mut(&self.name)?.notify)
        };

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            {
                let mut storage = lock_storage(&self.storage)?;
                let queue = storage.queue_mut(&self.name)?;
                if let Some(found) = take(queue) {
                    return Ok(Some(found));
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[async_trait]
impl BrokerQueue for InMemoryQueueHandle {
    fn name(&self) -> &QueueName {
        &self.name
    }

    async fn send(&self, body: Bytes, message_id: &MessageId) -> Result<(), QueueError> {
        self.ensure_open()?;

        let mut storage = lock_storage(&self.storage)?;
        let queue = storage.queue_mut(&self.name)?;
        queue.messages.push_back(StoredMessage {
            message_id: message_id.clone(),
            body,
            delivery_count: 0,
        });
        queue.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Bytes>, QueueError> {
        self.wait_for(timeout, |queue| queue.messages.pop_front().map(|m| m.body))
            .await
    }

    async fn receive_locked(&self, wait: Duration) -> Result<Option<BrokerDelivery>, QueueError> {
        self.wait_for(Some(wait), |queue| {
            let mut message = queue.messages.pop_front()?;
            message.delivery_count += 1;

            let lock_token = LockToken::new(uuid::Uuid::new_v4().to_string());
            let delivery = BrokerDelivery {
                body: message.body.clone(),
                lock_token: lock_token.clone(),
                message_id: Some(message.message_id.clone()),
                delivery_count: message.delivery_count,
            };
            queue.in_flight.insert(lock_token.as_str().to_string(), message);
            Some(delivery)
        })
        .await
    }

    async fn complete(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        let mut storage = lock_storage(&self.storage)?;
        let queue = storage.queue_mut(&self.name)?;
        queue
            .in_flight
            .remove(lock_token.as_str())
            .map(|_| ())
            .ok_or_else(|| QueueError::LockLost {
                lock_token: lock_token.to_string(),
            })
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        let mut storage = lock_storage(&self.storage)?;
        let queue = storage.queue_mut(&self.name)?;
        let message = queue
            .in_flight
            .remove(lock_token.as_str())
            .ok_or_else(|| QueueError::LockLost {
                lock_token: lock_token.to_string(),
            })?;
        queue.messages.push_front(message);
        queue.notify.notify_one();
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);

        // Wake blocked receivers so they observe the closed flag
        let storage = lock_storage(&self.storage)?;
        if let Some(queue) = storage.queues.get(&self.name) {
            queue.notify.notify_waiters();
        }
        Ok(())
    }
}
