//! Tests for the pull-mode queue client.

use super::*;
use crate::handles::QueueHandleCache;
use crate::providers::InMemoryBroker;
use crate::queue_names::QueueNamer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
}

impl MessageType for OrderPlaced {
    const TYPE_NAME: &'static str = "OrderPlaced";
}

fn client_with_broker() -> (QueueClient, Arc<InMemoryBroker>) {
    let broker = Arc::new(InMemoryBroker::new());
    let cache = Arc::new(QueueHandleCache::new(broker.clone()));
    let producer = MessageProducer::new(cache, QueueNamer::new());
    (QueueClient::new(producer), broker)
}

fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

// ============================================================================
// Receive Tests
// ============================================================================

mod receive_tests {
    use super::*;

    #[tokio::test]
    async fn test_get_returns_published_envelope_with_receipt() {
        // Arrange
        let (client, _broker) = client_with_broker();
        let id = client.send_one_way(&OrderPlaced { order_id: 9 }).await.unwrap();

        // Act
        let envelope = client
            .get(&queue("OrderPlaced.inq"), Some(Duration::from_millis(50)))
            .await
            .unwrap()
            .expect("message should be available");

        // Assert
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.source_queue(), Some("OrderPlaced.inq"));
        assert_eq!(
            envelope.decode_body::<OrderPlaced>().unwrap(),
            OrderPlaced { order_id: 9 }
        );
    }

    /// A timeout is "no message", not an error.
    #[tokio::test]
    async fn test_get_timeout_returns_none() {
        let (client, _broker) = client_with_broker();

        let result = client
            .get(&queue("Nothing.inq"), Some(Duration::from_millis(20)))
            .await
            .unwrap();

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_get_removes_message_so_ack_is_local() {
        let (client, broker) = client_with_broker();
        client.send_one_way(&OrderPlaced { order_id: 1 }).await.unwrap();

        let envelope = client
            .get(&queue("OrderPlaced.inq"), Some(Duration::from_millis(50)))
            .await
            .unwrap()
            .unwrap();
        client.ack(&envelope).await.unwrap();

        assert_eq!(broker.message_count(&queue("OrderPlaced.inq")), 0);
    }

    #[tokio::test]
    async fn test_create_message_rejects_garbage() {
        let (client, _broker) = client_with_broker();

        let result = client.create_message(b"{not an envelope");

        assert!(matches!(result, Err(QueueError::Serialization(_))));
    }
}

// ============================================================================
// Nak Tests
// ============================================================================

mod nak_tests {
    use super::*;

    #[tokio::test]
    async fn test_nak_requeue_republishes_unchanged_to_inbound() {
        let (client, broker) = client_with_broker();
        let original = Envelope::new(&OrderPlaced { order_id: 2 }).unwrap();
        let id = original.id;

        client.nak(original, true, None).await.unwrap();

        let bodies = broker.peek_bodies(&queue("OrderPlaced.inq"));
        assert_eq!(bodies.len(), 1);
        assert_eq!(Envelope::decode(&bodies[0]).unwrap().id, id);
    }

    #[tokio::test]
    async fn test_nak_requeue_keeps_priority_routing() {
        let (client, broker) = client_with_broker();
        let urgent = Envelope::new(&OrderPlaced { order_id: 3 })
            .unwrap()
            .with_priority(1);

        client.nak(urgent, true, None).await.unwrap();

        assert_eq!(broker.message_count(&queue("OrderPlaced.priorityq")), 1);
        assert_eq!(broker.message_count(&queue("OrderPlaced.inq")), 0);
    }

    #[tokio::test]
    async fn test_nak_without_requeue_goes_to_dead_letter() {
        let (client, broker) = client_with_broker();
        let envelope = Envelope::new(&OrderPlaced { order_id: 4 }).unwrap();

        client
            .nak(envelope, false, Some(ErrorInfo::new("HandlerError", "boom")))
            .await
            .unwrap();

        let bodies = broker.peek_bodies(&queue("OrderPlaced.dlq"));
        assert_eq!(bodies.len(), 1);
        let dead = Envelope::decode(&bodies[0]).unwrap();
        assert_eq!(dead.error.unwrap().message, "boom");
    }
}

// ============================================================================
// One-way Send Tests
// ============================================================================

mod send_tests {
    use super::*;

    #[tokio::test]
    async fn test_send_all_one_way_preserves_order() {
        let (client, broker) = client_with_broker();
        let orders: Vec<_> = (0..3).map(|order_id| OrderPlaced { order_id }).collect();

        let ids = client.send_all_one_way(&orders).await.unwrap();

        assert_eq!(ids.len(), 3);
        let received: Vec<u64> = broker
            .peek_bodies(&queue("OrderPlaced.inq"))
            .iter()
            .map(|b| {
                Envelope::decode(b)
                    .unwrap()
                    .decode_body::<OrderPlaced>()
                    .unwrap()
                    .order_id
            })
            .collect();
        assert_eq!(received, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_notify_and_send_to_explicit_queue() {
        let (client, broker) = client_with_broker();
        let target = client.queue_name("mq:Audit.inq").unwrap();

        client
            .notify(&target, Envelope::new(&OrderPlaced { order_id: 5 }).unwrap())
            .await
            .unwrap();
        client
            .send_one_way_to(&target, &OrderPlaced { order_id: 6 })
            .await
            .unwrap();

        assert_eq!(target.as_str(), "Audit.inq");
        assert_eq!(broker.message_count(&target), 2);
    }
}
