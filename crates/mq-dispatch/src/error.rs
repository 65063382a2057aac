//! Error types for queue dispatch operations.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all broker, producer and dispatch operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message lock lost or receipt expired: {lock_token}")]
    LockLost { lock_token: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("No handler registered for message type '{type_name}'")]
    UnknownMessageType { type_name: String },

    #[error("Queue handle for '{queue_name}' has been closed")]
    QueueClosed { queue_name: String },

    #[error("Handler panicked while processing a message from '{queue_name}'")]
    HandlerPanicked { queue_name: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and the caller may try again
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::LockLost { .. } => false,
            Self::Timeout { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::MessageTooLarge { .. } => false,
            Self::ProviderError { .. } => true, // Provider-specific errors are usually transient
            Self::UnknownMessageType { .. } => false,
            Self::QueueClosed { .. } => false,
            Self::HandlerPanicked { .. } => false,
            Self::Serialization(_) => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// Check if the error originates from decoding a delivered payload
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::Serialization(_) | Self::UnknownMessageType { .. }
        )
    }
}

/// Errors during envelope serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Envelope carries body type '{actual}' but '{expected}' was requested")]
    BodyTypeMismatch { expected: String, actual: String },

    #[error("Envelope is missing required field '{field}'")]
    MissingField { field: String },
}

/// Configuration errors. Always fatal and raised at the call that caused them.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Message handler has already been registered for type: {type_name}")]
    DuplicateHandler { type_name: String },

    #[error("Retry count must be zero or greater, got {value}")]
    NegativeRetryCount { value: i64 },

    #[error("Concurrency for '{type_name}' must be at least 1")]
    InvalidConcurrency { type_name: String },

    #[error("Handlers can only be registered before the server starts (current state: {state})")]
    NotConfiguring { state: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

// ============================================================================
// Handler errors
// ============================================================================

/// Failure raised by application processing code.
///
/// Wraps any [`std::error::Error`] so handlers can use `?` freely. Errors are
/// retryable unless built with [`HandlerError::unretryable`], in which case
/// the default exception policy sends the message straight to the dead-letter
/// queue.
pub struct HandlerError {
    source: anyhow::Error,
    retryable: bool,
}

impl HandlerError {
    pub fn new(error: anyhow::Error) -> Self {
        Self {
            source: error,
            retryable: true,
        }
    }

    /// Error that should not be retried regardless of the remaining retry budget
    pub fn unretryable(error: impl Into<anyhow::Error>) -> Self {
        Self {
            source: error.into(),
            retryable: false,
        }
    }

    /// Build a retryable error from a plain message
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self {
            source: anyhow::Error::msg(message),
            retryable: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Short type-ish code recorded on the envelope's error info
    pub fn error_code(&self) -> &'static str {
        if self.retryable {
            "HandlerError"
        } else {
            "UnretryableHandlerError"
        }
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.source
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self {
            source: error.into(),
            retryable: true,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("retryable", &self.retryable)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
