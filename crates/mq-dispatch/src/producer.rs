//! Message producer: resolves target queues and sends envelopes.

use crate::error::QueueError;
use crate::handles::QueueHandleCache;
use crate::message::{Envelope, MessageType};
use crate::queue_names::{QueueName, QueueNamer};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
#[path = "producer_tests.rs"]
mod tests;

/// Publishes envelopes to broker queues.
///
/// Queue handles come from the shared [`QueueHandleCache`], so the first
/// publish for a type creates its queue on the broker. Sends are not retried;
/// transport errors go straight back to the caller.
#[derive(Clone)]
pub struct MessageProducer {
    handles: Arc<QueueHandleCache>,
    namer: QueueNamer,
}

impl MessageProducer {
    pub fn new(handles: Arc<QueueHandleCache>, namer: QueueNamer) -> Self {
        Self { handles, namer }
    }

    pub fn namer(&self) -> &QueueNamer {
        &self.namer
    }

    pub fn handles(&self) -> &Arc<QueueHandleCache> {
        &self.handles
    }

    /// Wrap `body` in a new envelope and publish it to its type's inbound queue
    pub async fn publish<T: MessageType>(&self, body: &T) -> Result<Uuid, QueueError> {
        let envelope = Envelope::new(body)?;
        self.publish_envelope(envelope).await
    }

    /// Publish to the queue resolved from the envelope's type tag and priority
    pub async fn publish_envelope(&self, envelope: Envelope) -> Result<Uuid, QueueError> {
        let queue = self
            .namer
            .queue_name(&envelope.body_type, envelope.in_queue_suffix())?;
        self.publish_to(&queue, envelope).await
    }

    /// Publish to an explicit queue
    pub async fn publish_to(
        &self,
        queue: &QueueName,
        mut envelope: Envelope,
    ) -> Result<Uuid, QueueError> {
        let queue = self.namer.parse(queue.as_str())?;

        envelope.clear_receipt();
        let payload = envelope.encode()?;

        let handle = self.handles.get_or_create(&queue).await?;
        handle.send(payload, &envelope.message_id()).await?;

        debug!(
            queue = %queue,
            message_id = %envelope.id,
            body_type = %envelope.body_type,
            retry_attempts = envelope.retry_attempts,
            "Published message"
        );
        Ok(envelope.id)
    }
}

impl std::fmt::Debug for MessageProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProducer").finish_non_exhaustive()
    }
}
