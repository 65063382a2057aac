//! End-to-end dispatch through a running server
//!
//! These tests verify:
//! - A published message reaches its handler exactly once
//! - Failing handlers requeue until the retry budget is spent, then dead-letter
//! - Broker deliveries are completed whatever the handler did
//! - Responses and custom exception handlers

mod common;

use common::{eventually, fast_settings, in_memory_server, queue, OrderAccepted, OrderPlaced};
use mq_dispatch::{
    BrokerQueue, Envelope, HandlerError, HandlerRegistration, Message, MessageId, RetryCount,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn counting<F>(calls: &Arc<AtomicUsize>, outcome: F) -> HandlerRegistration<OrderPlaced>
where
    F: Fn(&Message<OrderPlaced>) -> Result<Option<Envelope>, HandlerError> + Send + Sync + 'static,
{
    let calls = Arc::clone(calls);
    let outcome = Arc::new(outcome);
    HandlerRegistration::new(move |message: Message<OrderPlaced>| {
        let calls = Arc::clone(&calls);
        let outcome = Arc::clone(&outcome);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            outcome(&message)
        }
    })
}

/// Successful handler runs once and nothing is left on any queue.
#[tokio::test]
async fn test_order_placed_is_handled_exactly_once() {
    let (mut server, broker) = in_memory_server(&fast_settings());
    let calls = Arc::new(AtomicUsize::new(0));
    server
        .register_handler(counting(&calls, |_| Ok(None)).with_retry_count(RetryCount::new(2)))
        .unwrap();
    server.start().await.unwrap();

    server.producer().publish(&OrderPlaced::sample(1)).await.unwrap();

    let inbound = queue("OrderPlaced.inq");
    eventually("handler invoked", || calls.load(Ordering::SeqCst) == 1).await;
    eventually("delivery completed", || broker.in_flight_count(&inbound) == 0).await;
    server.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.message_count(&inbound), 0);
    assert_eq!(broker.message_count(&queue("OrderPlaced.dlq")), 0);
}

/// With retry count 2 a throwing handler runs three times, then the message
/// lands in the dead-letter queue with its error recorded.
#[tokio::test]
async fn test_throwing_handler_dead_letters_after_retries() {
    let (mut server, broker) = in_memory_server(&fast_settings());
    let calls = Arc::new(AtomicUsize::new(0));
    server
        .register_handler(counting(&calls, |_| Err(HandlerError::msg("payment service down"))))
        .unwrap();
    server.set_retry_count(2).unwrap();
    server.start().await.unwrap();

    let id = server.producer().publish(&OrderPlaced::sample(2)).await.unwrap();

    let dlq = queue("OrderPlaced.dlq");
    let inbound = queue("OrderPlaced.inq");
    eventually("message dead-lettered", || broker.message_count(&dlq) == 1).await;
    eventually("deliveries completed", || broker.in_flight_count(&inbound) == 0).await;
    server.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(broker.message_count(&inbound), 0);

    let dead = Envelope::decode(&broker.peek_bodies(&dlq)[0]).unwrap();
    assert_eq!(dead.id, id);
    assert_eq!(dead.retry_attempts, 2);
    let error = dead.error.expect("error info recorded");
    assert_eq!(error.error_code, "HandlerError");
    assert!(error.message.contains("payment service down"));

    let stats = &server.stats()[0];
    assert_eq!(stats.total_retries, 2);
    assert_eq!(stats.total_dead_lettered, 1);
}

#[tokio::test]
async fn test_unretryable_error_dead_letters_immediately() {
    let (mut server, broker) = in_memory_server(&fast_settings());
    let calls = Arc::new(AtomicUsize::new(0));
    server
        .register_handler(
            counting(&calls, |_| {
                Err(HandlerError::unretryable(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "order is corrupt",
                )))
            })
            .with_retry_count(RetryCount::new(5)),
        )
        .unwrap();
    server.start().await.unwrap();

    server.producer().publish(&OrderPlaced::sample(3)).await.unwrap();

    let dlq = queue("OrderPlaced.dlq");
    eventually("message dead-lettered", || broker.message_count(&dlq) == 1).await;
    server.stop().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// A registered exception handler replaces the default retry policy.
#[tokio::test]
async fn test_exception_handler_owns_failure_routing() {
    let (mut server, broker) = in_memory_server(&fast_settings());
    let handled = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&handled);
    server
        .register_handler(
            HandlerRegistration::new(|_m: Message<OrderPlaced>| async {
                Err(HandlerError::msg("rejected"))
            })
            .with_exception_handler(move |client, message, error| {
                let observed = Arc::clone(&observed);
                async move {
                    assert_eq!(error.to_string(), "rejected");
                    observed.fetch_add(1, Ordering::SeqCst);
                    client
                        .send_one_way(&OrderAccepted {
                            order_id: message.body().order_id,
                        })
                        .await
                        .map(|_| ())
                }
            }),
        )
        .unwrap();
    server.start().await.unwrap();

    server.producer().publish(&OrderPlaced::sample(4)).await.unwrap();

    let accepted = queue("OrderAccepted.inq");
    eventually("exception handler ran", || handled.load(Ordering::SeqCst) == 1).await;
    eventually("side message sent", || {
        broker.queue_exists(&accepted) && broker.message_count(&accepted) == 1
    })
    .await;
    server.stop().await;

    assert_eq!(broker.message_count(&queue("OrderPlaced.dlq")), 0);
}

/// A response with `reply_to` goes to that queue carrying the request id.
#[tokio::test]
async fn test_response_is_sent_to_reply_to_queue() {
    let (mut server, broker) = in_memory_server(&fast_settings());
    server
        .register_handler(HandlerRegistration::new(|m: Message<OrderPlaced>| async move {
            Envelope::new(&OrderAccepted {
                order_id: m.body().order_id,
            })
            .map(Some)
            .map_err(HandlerError::from)
        }))
        .unwrap();
    server.start().await.unwrap();

    let request = Envelope::new(&OrderPlaced::sample(5))
        .unwrap()
        .with_reply_to("mq:client-42.replies");
    let request_id = server.producer().publish_envelope(request).await.unwrap();

    let replies = queue("client-42.replies");
    eventually("reply delivered", || {
        broker.queue_exists(&replies) && broker.message_count(&replies) == 1
    })
    .await;
    server.stop().await;

    let reply = Envelope::decode(&broker.peek_bodies(&replies)[0]).unwrap();
    assert_eq!(reply.reply_id, Some(request_id));
    assert_eq!(reply.decode_body::<OrderAccepted>().unwrap().order_id, 5);
    assert!(!broker.queue_exists(&queue("OrderAccepted.inq")));
}

/// Undecodable payloads are completed so they cannot block the queue.
#[tokio::test]
async fn test_poison_message_is_completed() {
    let (mut server, broker) = in_memory_server(&fast_settings());
    let calls = Arc::new(AtomicUsize::new(0));
    server.register_handler(counting(&calls, |_| Ok(None))).unwrap();
    server.start().await.unwrap();

    let inbound = queue("OrderPlaced.inq");
    let handle = server.producer().handles().get_or_create(&inbound).await.unwrap();
    handle
        .send(bytes::Bytes::from_static(b"not an envelope"), &MessageId::new())
        .await
        .unwrap();
    server.producer().publish(&OrderPlaced::sample(6)).await.unwrap();

    eventually("good message handled", || calls.load(Ordering::SeqCst) == 1).await;
    eventually("queue drained", || {
        broker.message_count(&inbound) == 0 && broker.in_flight_count(&inbound) == 0
    })
    .await;
    server.stop().await;
}
