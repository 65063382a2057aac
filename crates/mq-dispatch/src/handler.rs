//! Handler registry and the typed handler wrapper.
//!
//! Application code registers one [`HandlerRegistration`] per message type.
//! At start the server turns each registration into a type-erased
//! [`MessageHandler`] that owns the retry, dead-letter and response
//! publishing policy for that type.

use crate::client::QueueClient;
use crate::error::{ConfigurationError, HandlerError, QueueError};
use crate::message::{Envelope, ErrorInfo, Message, MessageType};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;

// ============================================================================
// Retry count
// ============================================================================

/// Non-negative retry budget for a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCount(u32);

impl RetryCount {
    pub const fn new(count: u32) -> Self {
        Self(count)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for RetryCount {
    fn default() -> Self {
        Self(1)
    }
}

impl TryFrom<i64> for RetryCount {
    type Error = ConfigurationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < 0 {
            return Err(ConfigurationError::NegativeRetryCount { value });
        }
        u32::try_from(value)
            .map(Self)
            .map_err(|_| ConfigurationError::Invalid {
                message: format!("retry count {} is out of range (max {})", value, u32::MAX),
            })
    }
}

// ============================================================================
// Handler functions and registration
// ============================================================================

type ProcessFn<T> = Arc<
    dyn Fn(Message<T>) -> BoxFuture<'static, Result<Option<Envelope>, HandlerError>> + Send + Sync,
>;

type ExceptionFn<T> = Arc<
    dyn Fn(QueueClient, Message<T>, HandlerError) -> BoxFuture<'static, Result<(), QueueError>>
        + Send
        + Sync,
>;

/// Transform applied to every envelope before it is decoded
pub type RequestFilter = Arc<dyn Fn(Envelope) -> Envelope + Send + Sync>;

/// Transform applied to every response before it is published
pub type ResponseFilter = Arc<dyn Fn(Envelope) -> Envelope + Send + Sync>;

/// Per-type handler registration.
///
/// The process function returns an optional response envelope. A response is
/// published to the request's `reply_to` queue, or to the response type's
/// inbound queue when response publishing allows it.
pub struct HandlerRegistration<T: MessageType> {
    process: ProcessFn<T>,
    exception: Option<ExceptionFn<T>>,
    retry_count: Option<RetryCount>,
    concurrency: usize,
}

impl<T: MessageType> HandlerRegistration<T> {
    pub fn new<F, Fut>(process: F) -> Self
    where
        F: Fn(Message<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Envelope>, HandlerError>> + Send + 'static,
    {
        Self {
            process: Arc::new(move |message| process(message).boxed()),
            exception: None,
            retry_count: None,
            concurrency: 1,
        }
    }

    /// Replace the default retry / dead-letter policy for failures
    pub fn with_exception_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(QueueClient, Message<T>, HandlerError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
    {
        self.exception = Some(Arc::new(move |client, message, error| {
            handler(client, message, error).boxed()
        }));
        self
    }

    /// Override the server-wide retry count for this type
    pub fn with_retry_count(mut self, retry_count: RetryCount) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Settings shared by every handler built at server start
#[derive(Clone, Default)]
pub struct HandlerContext {
    pub default_retry_count: RetryCount,
    pub responses: ResponsePolicy,
    pub request_filter: Option<RequestFilter>,
    pub response_filter: Option<ResponseFilter>,
}

/// Controls publishing of responses that have no `reply_to`
#[derive(Debug, Clone, Default)]
pub struct ResponsePolicy {
    pub disabled: bool,
    /// When set, only these response types are published
    pub whitelist: Option<Vec<String>>,
}

impl ResponsePolicy {
    pub fn allows(&self, response_type: &str) -> bool {
        if self.disabled {
            return false;
        }
        self.whitelist
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == response_type))
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Live counters for one message type
#[derive(Debug, Default)]
pub struct HandlerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    normal_received: AtomicU64,
    priority_received: AtomicU64,
}

impl HandlerStats {
    pub fn snapshot(&self, message_type: &str) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            message_type: message_type.to_string(),
            total_messages_processed: self.processed.load(Ordering::Relaxed),
            total_messages_failed: self.failed.load(Ordering::Relaxed),
            total_retries: self.retries.load(Ordering::Relaxed),
            total_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            total_normal_messages_received: self.normal_received.load(Ordering::Relaxed),
            total_priority_messages_received: self.priority_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`HandlerStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerStatsSnapshot {
    pub message_type: String,
    pub total_messages_processed: u64,
    pub total_messages_failed: u64,
    pub total_retries: u64,
    pub total_dead_lettered: u64,
    pub total_normal_messages_received: u64,
    pub total_priority_messages_received: u64,
}

// ============================================================================
// Type-erased handler
// ============================================================================

/// What the handler wrapper did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Processed,
    Retried,
    DeadLettered,
    /// A registered exception handler took over
    ExceptionHandled,
}

/// Object-safe handler invoked by workers
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn message_type(&self) -> &'static str;

    async fn process_message(
        &self,
        client: &QueueClient,
        envelope: Envelope,
    ) -> Result<HandlerOutcome, QueueError>;

    fn stats(&self) -> HandlerStatsSnapshot;
}

/// Handlers built for one server run, keyed by type tag
pub type HandlerMap = HashMap<String, Arc<dyn MessageHandler>>;

/// Wraps a typed process function with the retry / dead-letter policy
pub struct TypedMessageHandler<T: MessageType> {
    process: ProcessFn<T>,
    exception: Option<ExceptionFn<T>>,
    retry_count: RetryCount,
    context: HandlerContext,
    stats: Arc<HandlerStats>,
}

impl<T: MessageType> TypedMessageHandler<T> {
    fn new(
        registration: &HandlerRegistration<T>,
        context: &HandlerContext,
        stats: Arc<HandlerStats>,
    ) -> Self {
        Self {
            process: Arc::clone(&registration.process),
            exception: registration.exception.clone(),
            retry_count: registration
                .retry_count
                .unwrap_or(context.default_retry_count),
            context: context.clone(),
            stats,
        }
    }

    pub fn retry_count(&self) -> RetryCount {
        self.retry_count
    }

    async fn publish_response(
        &self,
        client: &QueueClient,
        request: &Envelope,
        mut response: Envelope,
    ) -> Result<(), QueueError> {
        response.reply_id = Some(request.id);
        if let Some(filter) = &self.context.response_filter {
            response = filter(response);
        }

        if let Some(reply_to) = &request.reply_to {
            let queue = client.queue_name(reply_to)?;
            return client.notify(&queue, response).await;
        }

        if self.context.responses.allows(&response.body_type) {
            client.producer().publish_envelope(response).await?;
        } else {
            debug!(
                response_type = %response.body_type,
                "Response publishing not allowed for type, dropping response"
            );
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        client: &QueueClient,
        mut envelope: Envelope,
        error: HandlerError,
    ) -> Result<HandlerOutcome, QueueError> {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            message_type = T::TYPE_NAME,
            message_id = %envelope.id,
            retry_attempts = envelope.retry_attempts,
            error = %error,
            "Handler failed"
        );

        envelope.error = Some(ErrorInfo::new(error.error_code(), error.to_string()));

        if let Some(exception) = &self.exception {
            let message = Message::<T>::from_envelope(envelope)?;
            exception(client.clone(), message, error).await?;
            return Ok(HandlerOutcome::ExceptionHandled);
        }

        if error.is_retryable() && envelope.retry_attempts < self.retry_count.get() {
            envelope.retry_attempts += 1;
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            client.nak(envelope, true, None).await?;
            Ok(HandlerOutcome::Retried)
        } else {
            self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            client.nak(envelope, false, None).await?;
            Ok(HandlerOutcome::DeadLettered)
        }
    }
}

#[async_trait]
impl<T: MessageType> MessageHandler for TypedMessageHandler<T> {
    fn message_type(&self) -> &'static str {
        T::TYPE_NAME
    }

    async fn process_message(
        &self,
        client: &QueueClient,
        envelope: Envelope,
    ) -> Result<HandlerOutcome, QueueError> {
        let envelope = match &self.context.request_filter {
            Some(filter) => filter(envelope),
            None => envelope,
        };

        if envelope.priority > 0 {
            self.stats.priority_received.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.normal_received.fetch_add(1, Ordering::Relaxed);
        }

        let message = Message::<T>::from_envelope(envelope.clone())?;

        let result = match (self.process)(message).await {
            Ok(Some(response)) => self
                .publish_response(client, &envelope, response)
                .await
                .map_err(HandlerError::from),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    message_type = T::TYPE_NAME,
                    message_id = %envelope.id,
                    "Message processed"
                );
                HandlerOutcome::Processed
            }
            Err(error) => self.handle_failure(client, envelope.clone(), error).await?,
        };

        client.ack(&envelope).await?;
        Ok(outcome)
    }

    fn stats(&self) -> HandlerStatsSnapshot {
        self.stats.snapshot(T::TYPE_NAME)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registration with its message type erased
trait ErasedRegistration: Send + Sync {
    fn message_type(&self) -> &'static str;

    fn concurrency(&self) -> usize;

    fn build(&self, context: &HandlerContext, stats: Arc<HandlerStats>) -> Arc<dyn MessageHandler>;
}

impl<T: MessageType> ErasedRegistration for HandlerRegistration<T> {
    fn message_type(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn build(&self, context: &HandlerContext, stats: Arc<HandlerStats>) -> Arc<dyn MessageHandler> {
        Arc::new(TypedMessageHandler::new(self, context, stats))
    }
}

struct RegistryEntry {
    registration: Box<dyn ErasedRegistration>,
    stats: Arc<HandlerStats>,
}

/// Registry mapping message types to handler registrations, in registration order
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<RegistryEntry>,
    index: HashMap<&'static str, usize>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Fails without touching the existing registration
    /// when the type is already registered.
    pub fn register<T: MessageType>(
        &mut self,
        registration: HandlerRegistration<T>,
    ) -> Result<(), ConfigurationError> {
        if self.index.contains_key(T::TYPE_NAME) {
            return Err(ConfigurationError::DuplicateHandler {
                type_name: T::TYPE_NAME.to_string(),
            });
        }
        if registration.concurrency == 0 {
            return Err(ConfigurationError::InvalidConcurrency {
                type_name: T::TYPE_NAME.to_string(),
            });
        }

        self.index.insert(T::TYPE_NAME, self.entries.len());
        self.entries.push(RegistryEntry {
            registration: Box::new(registration),
            stats: Arc::new(HandlerStats::default()),
        });
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.index.contains_key(type_name)
    }

    /// Registered type names in registration order
    pub fn registered_types(&self) -> Vec<&'static str> {
        self.entries
            .iter()
            .map(|e| e.registration.message_type())
            .collect()
    }

    pub fn concurrency(&self, type_name: &str) -> Option<usize> {
        self.index
            .get(type_name)
            .map(|&i| self.entries[i].registration.concurrency())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build one handler per registration for a server run
    pub fn build_handlers(&self, context: &HandlerContext) -> HandlerMap {
        self.entries
            .iter()
            .map(|entry| {
                let handler = entry
                    .registration
                    .build(context, Arc::clone(&entry.stats));
                (entry.registration.message_type().to_string(), handler)
            })
            .collect()
    }

    pub fn stats(&self) -> Vec<HandlerStatsSnapshot> {
        self.entries
            .iter()
            .map(|e| e.stats.snapshot(e.registration.message_type()))
            .collect()
    }
}
