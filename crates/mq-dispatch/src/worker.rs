//! Push-mode worker: decodes broker deliveries and dispatches them to handlers.

use crate::broker::{BrokerDelivery, BrokerQueue, DeliveryCallback};
use crate::client::QueueClient;
use crate::error::QueueError;
use crate::handler::{HandlerMap, HandlerOutcome};
use crate::message::{Envelope, MessageId};
use crate::queue_names::QueueName;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;

/// Observable worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Decoding,
    Dispatching,
    Completing,
    /// Last delivery failed to decode or dispatch. Cleared by the next delivery.
    Faulted,
}

/// What the worker does with the broker delivery once dispatch is over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Complete every delivery, even when decoding or dispatch failed.
    /// A poison message is dropped instead of blocking the queue.
    #[default]
    Always,
    /// Complete successful deliveries and abandon failed ones so the broker
    /// redelivers them. A delivery that keeps failing is moved to the
    /// dead-letter queue once it reaches the worker's max delivery count.
    OnSuccess,
}

/// Deliveries of one message before `OnSuccess` stops abandoning it
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// Broker callback bound to one queue
pub struct Worker {
    queue: Arc<dyn BrokerQueue>,
    handlers: Arc<HandlerMap>,
    client: QueueClient,
    policy: CompletionPolicy,
    dead_letter: Option<QueueName>,
    max_delivery_count: u32,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn BrokerQueue>,
        handlers: Arc<HandlerMap>,
        client: QueueClient,
        policy: CompletionPolicy,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            queue,
            handlers,
            client,
            policy,
            dead_letter: None,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            state,
        }
    }

    /// Where repeatedly failing deliveries go under `OnSuccess`, and after
    /// how many deliveries
    pub fn with_dead_letter(mut self, queue: QueueName, max_delivery_count: u32) -> Self {
        self.dead_letter = Some(queue);
        self.max_delivery_count = max_delivery_count.max(1);
        self
    }

    pub fn queue_name(&self) -> &QueueName {
        self.queue.name()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Decode, dispatch and settle one delivery.
    ///
    /// The delivery is always settled on the broker before this returns,
    /// whatever happened during dispatch, including a handler panic.
    pub async fn process_delivery(
        &self,
        delivery: BrokerDelivery,
    ) -> Result<HandlerOutcome, QueueError> {
        self.set_state(WorkerState::Decoding);

        let result = match AssertUnwindSafe(self.dispatch(&delivery)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(QueueError::HandlerPanicked {
                queue_name: self.queue.name().to_string(),
            }),
        };

        self.set_state(WorkerState::Completing);
        self.settle(&delivery, result.is_ok()).await;

        match &result {
            Ok(outcome) => {
                debug!(
                    queue = %self.queue.name(),
                    outcome = ?outcome,
                    "Delivery processed"
                );
                self.set_state(WorkerState::Idle);
            }
            Err(e) => {
                error!(
                    queue = %self.queue.name(),
                    lock_token = %delivery.lock_token,
                    error = %e,
                    "Failed to dispatch delivery"
                );
                self.set_state(WorkerState::Faulted);
            }
        }
        result
    }

    async fn dispatch(&self, delivery: &BrokerDelivery) -> Result<HandlerOutcome, QueueError> {
        let mut envelope = Envelope::decode(&delivery.body)?;
        envelope.set_receipt(
            self.queue.name().as_str(),
            Some(&delivery.lock_token),
            Some(delivery.delivery_count),
        );

        let handler = self.handlers.get(&envelope.body_type).ok_or_else(|| {
            QueueError::UnknownMessageType {
                type_name: envelope.body_type.clone(),
            }
        })?;

        self.set_state(WorkerState::Dispatching);
        debug!(
            queue = %self.queue.name(),
            message_id = %envelope.id,
            body_type = %envelope.body_type,
            "Dispatching message"
        );
        handler.process_message(&self.client, envelope).await
    }

    async fn settle(&self, delivery: &BrokerDelivery, succeeded: bool) {
        let mut abandon = !succeeded && self.policy == CompletionPolicy::OnSuccess;

        // Abandoned deliveries come straight back, so stop after the cap
        if abandon && delivery.delivery_count >= self.max_delivery_count {
            abandon = !self.dead_letter_delivery(delivery).await;
        }

        let result = if abandon {
            self.queue.abandon(&delivery.lock_token).await
        } else {
            self.queue.complete(&delivery.lock_token).await
        };

        if let Err(e) = result {
            warn!(
                queue = %self.queue.name(),
                lock_token = %delivery.lock_token,
                abandon = abandon,
                error = %e,
                "Failed to settle broker delivery"
            );
        }
    }

    /// Copy the raw delivery to the dead-letter queue. Returns false when the
    /// copy could not be made and the delivery should stay on the broker.
    async fn dead_letter_delivery(&self, delivery: &BrokerDelivery) -> bool {
        let Some(dead_letter) = &self.dead_letter else {
            error!(
                queue = %self.queue.name(),
                delivery_count = delivery.delivery_count,
                "Delivery exceeded max delivery count with no dead-letter queue, dropping it"
            );
            return true;
        };

        let message_id = delivery.message_id.clone().unwrap_or_else(MessageId::new);
        let sent = match self.client.producer().handles().get_or_create(dead_letter).await {
            Ok(queue) => queue.send(delivery.body.clone(), &message_id).await,
            Err(e) => Err(e),
        };

        match sent {
            Ok(()) => {
                warn!(
                    queue = %self.queue.name(),
                    dead_letter_queue = %dead_letter,
                    message_id = %message_id,
                    delivery_count = delivery.delivery_count,
                    "Delivery exceeded max delivery count, moved to dead-letter queue"
                );
                true
            }
            Err(e) => {
                error!(
                    queue = %self.queue.name(),
                    dead_letter_queue = %dead_letter,
                    error = %e,
                    "Failed to dead-letter delivery, abandoning it"
                );
                false
            }
        }
    }
}

#[async_trait]
impl DeliveryCallback for Worker {
    async fn on_delivery(&self, delivery: BrokerDelivery) -> Result<(), QueueError> {
        self.process_delivery(delivery).await.map(|_| ())
    }
}
