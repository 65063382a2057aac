//! Dispatch server: owns the handler registry and drives worker lifecycle.
//!
//! ```text
//! Configuring --start()--> Running --stop()--> Stopped
//!      ^                                          |
//!      |                      start() (restart) <-+
//!   register_handler()
//! ```
//!
//! On start every registered type gets its four queues ensured on the broker
//! before any worker attaches. One worker is then attached to the type's
//! inbound queue and one to its priority queue, each receiving one delivery
//! at a time.

use crate::broker::{Broker, PushOptions, PushSubscription};
use crate::client::QueueClient;
use crate::config::{MqSettings, ServerSettings};
use crate::error::{ConfigurationError, QueueError};
use crate::handler::{
    HandlerContext, HandlerRegistration, HandlerRegistry, HandlerStatsSnapshot, RetryCount,
};
use crate::handles::QueueHandleCache;
use crate::message::{Envelope, MessageType};
use crate::producer::MessageProducer;
use crate::providers::create_broker;
use crate::queue_names::{QueueNamer, QueueNames, QueueSuffix};
use crate::worker::{CompletionPolicy, Worker};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;

/// Worker queues attached per registered type
const WORKER_SUFFIXES: [QueueSuffix; 2] = [QueueSuffix::In, QueueSuffix::Priority];

/// Server lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Configuring,
    Running,
    Stopped,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuring => write!(f, "configuring"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Orchestrates queue creation and push workers for registered handlers
pub struct Server {
    broker: Arc<dyn Broker>,
    namer: QueueNamer,
    handles: Arc<QueueHandleCache>,
    registry: HandlerRegistry,
    context: HandlerContext,
    completion_policy: CompletionPolicy,
    max_delivery_count: u32,
    receive_wait: Duration,
    state: ServerState,
    subscriptions: Vec<PushSubscription>,
    workers: Vec<Arc<Worker>>,
}

impl Server {
    /// Create a server in the `Configuring` state.
    ///
    /// The queue namer combines the configured prefix with the broker's
    /// sanitizer and is shared by everything the server creates.
    pub fn new(
        broker: Arc<dyn Broker>,
        settings: &ServerSettings,
    ) -> Result<Self, ConfigurationError> {
        settings.validate()?;

        let sanitizing_broker = Arc::clone(&broker);
        let namer = settings
            .namer()
            .with_sanitizer(Arc::new(move |name: &str| {
                sanitizing_broker.sanitize_queue_name(name)
            }));

        let context = HandlerContext {
            default_retry_count: settings.retry_count()?,
            responses: settings.response_policy(),
            request_filter: None,
            response_filter: None,
        };

        info!(
            broker = %broker.kind(),
            retry_count = context.default_retry_count.get(),
            completion_policy = ?settings.completion_policy,
            "Created dispatch server"
        );

        Ok(Self {
            handles: Arc::new(QueueHandleCache::new(Arc::clone(&broker))),
            broker,
            namer,
            registry: HandlerRegistry::new(),
            context,
            completion_policy: settings.completion_policy,
            max_delivery_count: settings.max_delivery_count,
            receive_wait: settings.push_receive_wait(),
            state: ServerState::Configuring,
            subscriptions: Vec::new(),
            workers: Vec::new(),
        })
    }

    /// Build the broker from configuration and create a server over it
    pub fn from_settings(settings: &MqSettings) -> Result<Self, QueueError> {
        let broker = create_broker(&settings.broker)?;
        Ok(Self::new(broker, &settings.server)?)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn namer(&self) -> &QueueNamer {
        &self.namer
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Register the handler for `T`. Only allowed while configuring.
    pub fn register_handler<T: MessageType>(
        &mut self,
        registration: HandlerRegistration<T>,
    ) -> Result<(), ConfigurationError> {
        if self.state != ServerState::Configuring {
            return Err(ConfigurationError::NotConfiguring {
                state: self.state.to_string(),
            });
        }

        self.registry.register(registration)?;
        debug!(message_type = T::TYPE_NAME, "Registered message handler");
        Ok(())
    }

    /// Default retry budget for handlers without their own. Applies from the
    /// next start.
    pub fn set_retry_count(&mut self, retry_count: i64) -> Result<(), ConfigurationError> {
        self.context.default_retry_count = RetryCount::try_from(retry_count)?;
        Ok(())
    }

    pub fn retry_count(&self) -> RetryCount {
        self.context.default_retry_count
    }

    pub fn set_request_filter<F>(&mut self, filter: F)
    where
        F: Fn(Envelope) -> Envelope + Send + Sync + 'static,
    {
        self.context.request_filter = Some(Arc::new(filter));
    }

    pub fn set_response_filter<F>(&mut self, filter: F)
    where
        F: Fn(Envelope) -> Envelope + Send + Sync + 'static,
    {
        self.context.response_filter = Some(Arc::new(filter));
    }

    /// Registered message types in registration order
    pub fn registered_types(&self) -> Vec<&'static str> {
        self.registry.registered_types()
    }

    // ------------------------------------------------------------------------
    // Components sharing the server's cache and namer
    // ------------------------------------------------------------------------

    pub fn producer(&self) -> MessageProducer {
        MessageProducer::new(Arc::clone(&self.handles), self.namer.clone())
    }

    pub fn queue_client(&self) -> QueueClient {
        QueueClient::new(self.producer())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Ensure every registered type's queues and attach workers.
    ///
    /// On failure anything attached so far is detached again and the server
    /// keeps its previous state.
    pub async fn start(&mut self) -> Result<(), QueueError> {
        if self.state == ServerState::Running {
            warn!("Server is already running, ignoring start");
            return Ok(());
        }

        info!(
            message_types = ?self.registry.registered_types(),
            "Starting dispatch server"
        );

        if let Err(e) = self.attach_workers().await {
            error!(error = %e, "Server start failed, detaching workers");
            self.detach_workers().await;
            self.handles.close_all().await;
            return Err(e);
        }

        self.state = ServerState::Running;
        info!(
            active_workers = self.subscriptions.len(),
            "Dispatch server running"
        );
        Ok(())
    }

    async fn attach_workers(&mut self) -> Result<(), QueueError> {
        let topologies = self
            .registry
            .registered_types()
            .into_iter()
            .map(|type_name| {
                QueueNames::for_type(&self.namer, type_name).map(|names| (type_name, names))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Every queue must exist before the first worker attaches
        for (type_name, names) in &topologies {
            for queue in names.all() {
                self.handles.get_or_create(queue).await?;
            }
            debug!(message_type = type_name, "Ensured queues");
        }

        let handlers = Arc::new(self.registry.build_handlers(&self.context));
        let client = self.queue_client();
        let options = PushOptions {
            max_concurrent: 1,
            receive_wait: self.receive_wait,
        };

        for (type_name, names) in &topologies {
            if let Some(concurrency) = self.registry.concurrency(type_name).filter(|&c| c > 1) {
                warn!(
                    message_type = type_name,
                    concurrency = concurrency,
                    "Workers process one message at a time per queue; requested concurrency ignored"
                );
            }

            for suffix in WORKER_SUFFIXES {
                let queue = self.handles.get_or_create(names.get(suffix)).await?;
                let worker = Arc::new(
                    Worker::new(
                        Arc::clone(&queue),
                        Arc::clone(&handlers),
                        client.clone(),
                        self.completion_policy,
                    )
                    .with_dead_letter(
                        names.get(QueueSuffix::DeadLetter).clone(),
                        self.max_delivery_count,
                    ),
                );

                let subscription = self
                    .broker
                    .register_push(queue, worker.clone(), options.clone())
                    .await?;

                info!(queue = %subscription.queue(), message_type = type_name, "Worker attached");
                self.subscriptions.push(subscription);
                self.workers.push(worker);
            }
        }
        Ok(())
    }

    async fn detach_workers(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.detach().await;
        }
        self.workers.clear();
    }

    /// Detach every worker and close every cached queue handle.
    ///
    /// Safe to call in any state and any number of times. Handles opened by
    /// the server's producers are closed even if the server never started.
    /// Only a running server moves to `Stopped`.
    pub async fn stop(&mut self) {
        let running = self.state == ServerState::Running;
        if running {
            info!(
                active_workers = self.subscriptions.len(),
                "Stopping dispatch server"
            );
        }

        self.detach_workers().await;
        let closed = self.handles.close_all().await;

        if running {
            self.state = ServerState::Stopped;
            info!(closed_handles = closed, "Dispatch server stopped");
        } else {
            debug!(
                state = %self.state,
                closed_handles = closed,
                "Server not running, closed cached handles"
            );
        }
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    /// Number of attached push subscriptions still receiving
    pub fn active_workers(&self) -> usize {
        self.subscriptions.iter().filter(|s| s.is_active()).count()
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn stats(&self) -> Vec<HandlerStatsSnapshot> {
        self.registry.stats()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("broker", &self.broker.kind())
            .field("state", &self.state)
            .field("registered_types", &self.registry.registered_types())
            .field("active_workers", &self.active_workers())
            .finish()
    }
}
