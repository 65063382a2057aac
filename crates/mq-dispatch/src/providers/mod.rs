//! Broker implementations.
//!
//! This module contains concrete implementations of the [`Broker`] and
//! [`BrokerQueue`](crate::broker::BrokerQueue) traits for different backends.

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::error::QueueError;
use std::sync::Arc;
use tracing::info;

pub mod memory;
pub mod service_bus;

pub use memory::InMemoryBroker;
pub use service_bus::{ConnectionString, ServiceBusBroker, ServiceBusError};

/// Build the broker selected by configuration
pub fn create_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>, QueueError> {
    config.validate()?;

    let broker: Arc<dyn Broker> = match config {
        BrokerConfig::InMemory => Arc::new(InMemoryBroker::new()),
        BrokerConfig::ServiceBus(settings) => Arc::new(ServiceBusBroker::new(settings)?),
    };

    info!(broker = %broker.kind(), "Broker created");
    Ok(broker)
}
