//! # MQ Dispatch
//!
//! Broker-agnostic message queue dispatch. Application message types map onto
//! a fixed topology of four queues per type, handlers are registered per type,
//! and a server drives at-least-once delivery against a broker adapter.
//!
//! ```text
//! {type}.inq        inbound messages
//! {type}.priorityq  inbound messages with priority > 0
//! {type}.outq       outbound messages
//! {type}.dlq        dead letters
//! ```
//!
//! ## Module Organization
//!
//! - [`queue_names`] - Queue naming, sanitization and the four-queue topology
//! - [`message`] - Envelope wire format and typed message views
//! - [`broker`] - Broker adapter traits and the push-mode message pump
//! - [`providers`] - In-memory and Azure Service Bus brokers
//! - [`handles`] - Process-scoped get-or-create cache of broker queue handles
//! - [`producer`] - Publishing envelopes to resolved queues
//! - [`client`] - Pull-mode receive, ack and nak
//! - [`handler`] - Handler registration and the retry / dead-letter wrapper
//! - [`worker`] - Push-mode delivery processing
//! - [`server`] - Lifecycle orchestration
//! - [`config`] / [`observability`] - Settings loading and logging setup

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod handles;
pub mod message;
pub mod observability;
pub mod producer;
pub mod providers;
pub mod queue_names;
pub mod server;
pub mod worker;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// Re-export commonly used types at crate root for convenience
pub use broker::{
    Broker, BrokerDelivery, BrokerKind, BrokerQueue, DeliveryCallback, PushOptions,
    PushSubscription,
};
pub use client::QueueClient;
pub use config::{BrokerConfig, LoggingConfig, MqSettings, ServerSettings, ServiceBusConfig};
pub use error::{
    ConfigurationError, HandlerError, QueueError, SerializationError, ValidationError,
};
pub use handler::{
    HandlerOutcome, HandlerRegistration, HandlerStatsSnapshot, ResponsePolicy, RetryCount,
};
pub use handles::QueueHandleCache;
pub use message::{Envelope, ErrorInfo, LockToken, Message, MessageId, MessageType};
pub use observability::init_logging;
pub use producer::MessageProducer;
pub use providers::{create_broker, InMemoryBroker, ServiceBusBroker};
pub use queue_names::{QueueName, QueueNamer, QueueNames, QueueSuffix};
pub use server::{Server, ServerState};
pub use worker::{CompletionPolicy, Worker, WorkerState};
