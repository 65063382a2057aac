//! Pull-mode queue client with ack/nak decisions.

use crate::error::QueueError;
use crate::message::{Envelope, ErrorInfo, MessageType};
use crate::producer::MessageProducer;
use crate::queue_names::{QueueName, QueueSuffix};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Pull-mode consumer and one-way sender.
///
/// Receiving is receive-and-delete, so `get` is also the acknowledgment
/// point for pulled messages. `nak` never uses broker-native requeue or
/// dead-lettering: it republishes through the producer.
#[derive(Debug, Clone)]
pub struct QueueClient {
    producer: MessageProducer,
}

impl QueueClient {
    pub fn new(producer: MessageProducer) -> Self {
        Self { producer }
    }

    pub fn producer(&self) -> &MessageProducer {
        &self.producer
    }

    /// Sanitize and validate a raw queue name
    pub fn queue_name(&self, raw: &str) -> Result<QueueName, QueueError> {
        Ok(self.producer.namer().parse(raw)?)
    }

    /// Wait up to `timeout` for the next envelope (forever when `None`).
    /// Returns `Ok(None)` when the timeout elapses.
    pub async fn get(
        &self,
        queue: &QueueName,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, QueueError> {
        let queue = self.queue_name(queue.as_str())?;
        let handle = self.producer.handles().get_or_create(&queue).await?;

        let Some(payload) = handle.receive(timeout).await? else {
            return Ok(None);
        };

        let mut envelope = self.create_message(&payload)?;
        envelope.set_receipt(queue.as_str(), None, None);
        debug!(queue = %queue, message_id = %envelope.id, "Received message");
        Ok(Some(envelope))
    }

    /// Acknowledge a pulled message. The receive already removed it from the
    /// broker, so there is nothing to send.
    pub async fn ack(&self, envelope: &Envelope) -> Result<(), QueueError> {
        debug!(message_id = %envelope.id, "Acknowledged message");
        Ok(())
    }

    /// Reject a message: republish it to its inbound queue when `requeue`,
    /// otherwise to its dead-letter queue.
    pub async fn nak(
        &self,
        mut envelope: Envelope,
        requeue: bool,
        error: Option<ErrorInfo>,
    ) -> Result<(), QueueError> {
        if let Some(error) = error {
            envelope.error = Some(error);
        }

        let suffix = if requeue {
            envelope.in_queue_suffix()
        } else {
            QueueSuffix::DeadLetter
        };
        let queue = self
            .producer
            .namer()
            .queue_name(&envelope.body_type, suffix)?;

        if requeue {
            debug!(queue = %queue, message_id = %envelope.id, "Requeueing message");
        } else {
            info!(
                queue = %queue,
                message_id = %envelope.id,
                retry_attempts = envelope.retry_attempts,
                "Moving message to dead-letter queue"
            );
        }

        self.producer.publish_to(&queue, envelope).await?;
        Ok(())
    }

    /// Publish an envelope to an explicit queue
    pub async fn notify(&self, queue: &QueueName, envelope: Envelope) -> Result<(), QueueError> {
        self.producer.publish_to(queue, envelope).await?;
        Ok(())
    }

    /// Send a typed message to its inbound queue without waiting for a reply
    pub async fn send_one_way<T: MessageType>(&self, body: &T) -> Result<Uuid, QueueError> {
        self.producer.publish(body).await
    }

    /// Send a typed message to an explicit queue
    pub async fn send_one_way_to<T: MessageType>(
        &self,
        queue: &QueueName,
        body: &T,
    ) -> Result<Uuid, QueueError> {
        self.producer.publish_to(queue, Envelope::new(body)?).await
    }

    /// Send every message in order, stopping at the first failure
    pub async fn send_all_one_way<'a, T, I>(&self, bodies: I) -> Result<Vec<Uuid>, QueueError>
    where
        T: MessageType,
        I: IntoIterator<Item = &'a T>,
    {
        let mut ids = Vec::new();
        for body in bodies {
            ids.push(self.send_one_way(body).await?);
        }
        Ok(ids)
    }

    /// Decode a raw broker payload into an envelope
    pub fn create_message(&self, payload: &[u8]) -> Result<Envelope, QueueError> {
        Ok(Envelope::decode(payload)?)
    }
}
