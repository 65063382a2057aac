//! Common test utilities for mq-dispatch integration tests
//!
//! This module provides:
//! - Sample message types
//! - Server fixtures over the in-memory broker
//! - Polling helpers for asynchronous assertions

use mq_dispatch::{InMemoryBroker, MessageType, QueueName, Server, ServerSettings};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

// ============================================================================
// Message Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: u64,
    pub customer: String,
}

impl MessageType for OrderPlaced {
    const TYPE_NAME: &'static str = "OrderPlaced";
}

impl OrderPlaced {
    #[allow(dead_code)]
    pub fn sample(order_id: u64) -> Self {
        Self {
            order_id,
            customer: "contoso".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAccepted {
    pub order_id: u64,
}

impl MessageType for OrderAccepted {
    const TYPE_NAME: &'static str = "OrderAccepted";
}

// ============================================================================
// Fixtures
// ============================================================================

/// Settings with a short push receive wait so shutdown is quick
#[allow(dead_code)]
pub fn fast_settings() -> ServerSettings {
    ServerSettings {
        push_receive_wait_ms: 20,
        ..ServerSettings::default()
    }
}

/// Server over a fresh in-memory broker, still configuring
#[allow(dead_code)]
pub fn in_memory_server(settings: &ServerSettings) -> (Server, Arc<InMemoryBroker>) {
    let broker = Arc::new(InMemoryBroker::new());
    let server = Server::new(broker.clone(), settings).expect("valid server settings");
    (server, broker)
}

#[allow(dead_code)]
pub fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).expect("valid queue name")
}

/// Poll `condition` until it holds, failing the test after five seconds
#[allow(dead_code)]
pub async fn eventually<F: Fn() -> bool>(description: &str, condition: F) {
    let result = timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {}", description);
}
