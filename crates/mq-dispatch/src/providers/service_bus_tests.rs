//! Tests for the Service Bus REST broker.

use super::*;
use wiremock::matchers::{header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CONNECTION_STRING: &str =
    "Endpoint=sb://test-ns.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0";

async fn broker_for(server: &MockServer) -> ServiceBusBroker {
    let config = ServiceBusConfig {
        operation_timeout_secs: 5,
        ..ServiceBusConfig::new(CONNECTION_STRING)
    };
    ServiceBusBroker::with_base_url(&config, Url::parse(&server.uri()).unwrap()).unwrap()
}

fn queue_name(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

async fn open(server: &MockServer, name: &str) -> Arc<dyn BrokerQueue> {
    broker_for(server).await.open_queue(&queue_name(name)).await.unwrap()
}

fn locked_response(
    body: &str,
    lock: &str,
    message_id: &str,
    delivery_count: u32,
) -> ResponseTemplate {
    ResponseTemplate::new(201)
        .insert_header(
            "BrokerProperties",
            format!(
                r#"{{"LockToken":"{}","MessageId":"{}","DeliveryCount":{},"SequenceNumber":11}}"#,
                lock, message_id, delivery_count
            ),
        )
        .set_body_string(body)
}

// ============================================================================
// Connection String Tests
// ============================================================================

mod connection_string_tests {
    use super::*;

    #[test]
    fn test_parse_valid_connection_string() {
        let parsed = ConnectionString::parse(CONNECTION_STRING).unwrap();

        assert_eq!(parsed.endpoint.as_str(), "https://test-ns.servicebus.windows.net/");
        assert_eq!(parsed.key_name, "RootManageSharedAccessKey");
    }

    #[test]
    fn test_parse_is_case_insensitive_and_keeps_padding() {
        let parsed = ConnectionString::parse(
            "endpoint=sb://ns.servicebus.windows.net;sharedaccesskeyname=send;sharedaccesskey=a2V5==;EntityPath=orders",
        )
        .unwrap();

        assert_eq!(parsed.key_name, "send");
        assert_eq!(parsed.key, "a2V5==");
        assert_eq!(parsed.endpoint.host_str(), Some("ns.servicebus.windows.net"));
    }

    #[test]
    fn test_parse_missing_key_fails() {
        let result = ConnectionString::parse("Endpoint=sb://ns/;SharedAccessKeyName=name");

        assert!(matches!(
            result,
            Err(ConfigurationError::Missing { ref key }) if key == "SharedAccessKey"
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        let result =
            ConnectionString::parse("Endpoint=amqp://ns/;SharedAccessKeyName=n;SharedAccessKey=k");

        assert!(matches!(result, Err(ConfigurationError::Invalid { .. })));
    }

    #[test]
    fn test_debug_redacts_key() {
        let parsed = ConnectionString::parse(CONNECTION_STRING).unwrap();

        let debug = format!("{:?}", parsed);

        assert!(!debug.contains("c2VjcmV0"));
        assert!(debug.contains("REDACTED"));
    }
}

// ============================================================================
// Shared Access Signature Tests
// ============================================================================

mod sas_tests {
    use super::*;

    #[test]
    fn test_token_layout() {
        let parsed = ConnectionString::parse(CONNECTION_STRING).unwrap();

        let token = parsed
            .sas_token_with_expiry(
                "https://test-ns.servicebus.windows.net/Orders.inq",
                1_700_000_000,
            )
            .unwrap();

        assert!(token.starts_with(
            "SharedAccessSignature sr=https%3A%2F%2Ftest-ns.servicebus.windows.net%2Forders.inq&sig="
        ));
        assert!(token.ends_with("&se=1700000000&skn=RootManageSharedAccessKey"));
    }

    /// Same inputs always sign to the same value; a different expiry changes it.
    #[test]
    fn test_signature_is_deterministic() {
        let parsed = ConnectionString::parse(CONNECTION_STRING).unwrap();
        let resource = "https://test-ns.servicebus.windows.net/orders.inq";

        let first = parsed.sas_token_with_expiry(resource, 100).unwrap();
        let second = parsed.sas_token_with_expiry(resource, 100).unwrap();
        let later = parsed.sas_token_with_expiry(resource, 200).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, later);
    }
}

// ============================================================================
// Queue Management Tests
// ============================================================================

mod ensure_queue_tests {
    use super::*;

    #[tokio::test]
    async fn test_existing_queue_is_not_recreated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders.inq"))
            .and(header_exists("authorization"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<entry><title>orders.inq</title></entry>"),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let broker = broker_for(&server).await;

        broker.ensure_queue(&queue_name("orders.inq")).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_queue_is_created_with_atom_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders.inq"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/orders.inq"))
            .and(header("content-type", ATOM_CONTENT_TYPE))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let broker = broker_for(&server).await;

        broker.ensure_queue(&queue_name("orders.inq")).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let put = requests.iter().find(|r| r.method.as_str() == "PUT").unwrap();
        let body = String::from_utf8(put.body.clone()).unwrap();
        assert!(body.contains("QueueDescription"));
    }

    /// An empty feed means the entity does not exist yet.
    #[tokio::test]
    async fn test_empty_feed_is_treated_as_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders.inq"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<feed></feed>"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/orders.inq"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let broker = broker_for(&server).await;

        broker.ensure_queue(&queue_name("orders.inq")).await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_on_create_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let broker = broker_for(&server).await;

        assert!(broker.ensure_queue(&queue_name("orders.inq")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_authentication_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let broker = broker_for(&server).await;

        let result = broker.ensure_queue(&queue_name("orders.inq")).await;

        assert!(matches!(result, Err(QueueError::AuthenticationFailed { .. })));
    }
}

// ============================================================================
// Send / Receive Tests
// ============================================================================

mod messaging_tests {
    use super::*;

    #[tokio::test]
    async fn test_send_posts_body_with_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders.inq/messages"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        let queue = open(&server, "orders.inq").await;
        let id: MessageId = "msg-1".parse().unwrap();

        queue.send(Bytes::from_static(b"{\"a\":1}"), &id).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let properties = requests[0].headers.get("BrokerProperties").unwrap().to_str().unwrap();
        assert_eq!(properties, r#"{"MessageId":"msg-1"}"#);
        assert_eq!(requests[0].body, b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_body_locally() {
        let server = MockServer::start().await;
        let queue = open(&server, "orders.inq").await;

        let result = queue
            .send(Bytes::from(vec![0u8; MAX_MESSAGE_SIZE + 1]), &MessageId::new())
            .await;

        assert!(matches!(result, Err(QueueError::MessageTooLarge { .. })));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_to_missing_queue_is_queue_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let queue = open(&server, "orders.inq").await;

        let result = queue.send(Bytes::from_static(b"x"), &MessageId::new()).await;

        assert!(matches!(
            result,
            Err(QueueError::QueueNotFound { ref queue_name }) if queue_name == "orders.inq"
        ));
    }

    #[tokio::test]
    async fn test_server_error_is_transient_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;
        let queue = open(&server, "orders.inq").await;

        let error = queue
            .send(Bytes::from_static(b"x"), &MessageId::new())
            .await
            .unwrap_err();

        assert!(matches!(error, QueueError::ProviderError { ref code, .. } if code == "503"));
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn test_receive_deletes_head() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/orders.inq/messages/head"))
            .and(query_param("timeout", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
            .mount(&server)
            .await;
        let queue = open(&server, "orders.inq").await;

        let body = queue
            .receive(Some(Duration::from_millis(1500)))
            .await
            .unwrap();

        assert_eq!(body, Some(Bytes::from_static(b"payload")));
    }

    #[tokio::test]
    async fn test_receive_no_content_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/orders.inq/messages/head"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        let queue = open(&server, "orders.inq").await;

        let body = queue.receive(Some(Duration::from_secs(1))).await.unwrap();

        assert!(body.is_none());
    }
}

// ============================================================================
// Peek-Lock Tests
// ============================================================================

mod peek_lock_tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_locked_reads_broker_properties() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders.inq/messages/head"))
            .respond_with(locked_response("payload", "lock-1", "msg-1", 3))
            .mount(&server)
            .await;
        let queue = open(&server, "orders.inq").await;

        let delivery = queue
            .receive_locked(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(delivery.body, Bytes::from_static(b"payload"));
        assert_eq!(delivery.lock_token.as_str(), "lock-1");
        assert_eq!(delivery.message_id.unwrap().as_str(), "msg-1");
        assert_eq!(delivery.delivery_count, 3);
    }

    #[tokio::test]
    async fn test_complete_deletes_locked_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders.inq/messages/head"))
            .respond_with(locked_response("payload", "lock-1", "msg-1", 1))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/orders.inq/messages/msg-1/lock-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let queue = open(&server, "orders.inq").await;
        let delivery = queue
            .receive_locked(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        queue.complete(&delivery.lock_token).await.unwrap();

        // The lock is forgotten once settled
        assert!(matches!(
            queue.complete(&delivery.lock_token).await,
            Err(QueueError::LockLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_abandon_puts_locked_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders.inq/messages/head"))
            .respond_with(locked_response("payload", "lock-2", "msg-2", 1))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/orders.inq/messages/msg-2/lock-2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let queue = open(&server, "orders.inq").await;
        let delivery = queue
            .receive_locked(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        queue.abandon(&delivery.lock_token).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_maps_to_lock_lost() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders.inq/messages/head"))
            .respond_with(locked_response("payload", "lock-3", "msg-3", 1))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/orders.inq/messages/msg-3/lock-3"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;
        let queue = open(&server, "orders.inq").await;
        let delivery = queue
            .receive_locked(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        let result = queue.complete(&delivery.lock_token).await;

        assert!(matches!(result, Err(QueueError::LockLost { .. })));
    }

    #[tokio::test]
    async fn test_missing_lock_token_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders.inq/messages/head"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("BrokerProperties", r#"{"MessageId":"msg-1"}"#)
                    .set_body_string("payload"),
            )
            .mount(&server)
            .await;
        let queue = open(&server, "orders.inq").await;

        let result = queue.receive_locked(Duration::from_secs(1)).await;

        assert!(matches!(
            result,
            Err(QueueError::ProviderError { ref code, .. }) if code == "MalformedResponse"
        ));
    }

    #[tokio::test]
    async fn test_closed_handle_rejects_operations() {
        let server = MockServer::start().await;
        let queue = open(&server, "orders.inq").await;

        queue.close().await.unwrap();
        queue.close().await.unwrap();

        assert!(matches!(
            queue.receive_locked(Duration::from_secs(1)).await,
            Err(QueueError::QueueClosed { .. })
        ));
        assert!(matches!(
            queue.send(Bytes::from_static(b"x"), &MessageId::new()).await,
            Err(QueueError::QueueClosed { .. })
        ));
    }
}
