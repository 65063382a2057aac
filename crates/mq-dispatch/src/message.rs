//! Message envelope, typed message views and broker-level identifiers.

use crate::error::{SerializationError, ValidationError};
use crate::queue_names::QueueSuffix;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Receipt metadata key holding the broker lock token
pub const META_LOCK_TOKEN: &str = "lock_token";
/// Receipt metadata key holding the queue the envelope was received from
pub const META_SOURCE_QUEUE: &str = "source_queue";
/// Receipt metadata key holding the broker delivery count
pub const META_DELIVERY_COUNT: &str = "delivery_count";

// ============================================================================
// Broker Identifiers
// ============================================================================

/// Identifier handed to the broker alongside the payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque broker-issued receipt handle used to complete or abandon a delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// An application payload that can travel inside an [`Envelope`].
///
/// `TYPE_NAME` is the tag embedded in the envelope and the base of the
/// type's queue names, so it must be stable across deployments.
pub trait MessageType: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

/// Failure details recorded on an envelope by the handler wrapper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub error_code: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// The serialized unit of transport between producers, workers and the broker.
///
/// `id` is assigned once in the constructor and survives every encode/decode.
/// `meta` only ever holds receipt data attached by the worker or queue client
/// and is never written to the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub body_type: String,
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip)]
    pub meta: HashMap<String, String>,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        general_purpose::STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

impl Envelope {
    /// Wrap a typed value, tagging it with `T::TYPE_NAME`
    pub fn new<T: MessageType>(body: &T) -> Result<Self, SerializationError> {
        let payload = serde_json::to_vec(body)?;
        Ok(Self::from_raw(T::TYPE_NAME, Bytes::from(payload)))
    }

    /// Build an envelope around an already-serialized payload
    pub fn from_raw(body_type: impl Into<String>, body: Bytes) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            body_type: body_type.into(),
            body,
            priority: 0,
            retry_attempts: 0,
            reply_to: None,
            reply_id: None,
            error: None,
            meta: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Decode the payload, checking the embedded type tag first
    pub fn decode_body<T: MessageType>(&self) -> Result<T, SerializationError> {
        if self.body_type != T::TYPE_NAME {
            return Err(SerializationError::BodyTypeMismatch {
                expected: T::TYPE_NAME.to_string(),
                actual: self.body_type.clone(),
            });
        }

        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Serialize to the wire format. Receipt metadata is never included.
    pub fn encode(&self) -> Result<Bytes, SerializationError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a wire payload received from a broker
    pub fn decode(payload: &[u8]) -> Result<Self, SerializationError> {
        let envelope: Envelope = serde_json::from_slice(payload)?;
        if envelope.body_type.is_empty() {
            return Err(SerializationError::MissingField {
                field: "body_type".to_string(),
            });
        }

        Ok(envelope)
    }

    /// Inbound queue this envelope routes to: priority messages go to `.priorityq`
    pub fn in_queue_suffix(&self) -> QueueSuffix {
        if self.priority > 0 {
            QueueSuffix::Priority
        } else {
            QueueSuffix::In
        }
    }

    pub fn message_id(&self) -> MessageId {
        MessageId::from(self.id)
    }

    // ------------------------------------------------------------------------
    // Receipt metadata
    // ------------------------------------------------------------------------

    /// Attach receipt data. Only called on the receiving side.
    pub fn set_receipt(
        &mut self,
        source_queue: &str,
        lock_token: Option<&LockToken>,
        delivery_count: Option<u32>,
    ) {
        self.meta
            .insert(META_SOURCE_QUEUE.to_string(), source_queue.to_string());
        if let Some(token) = lock_token {
            self.meta
                .insert(META_LOCK_TOKEN.to_string(), token.as_str().to_string());
        }
        if let Some(count) = delivery_count {
            self.meta
                .insert(META_DELIVERY_COUNT.to_string(), count.to_string());
        }
    }

    pub fn clear_receipt(&mut self) {
        self.meta.clear();
    }

    pub fn lock_token(&self) -> Option<LockToken> {
        self.meta.get(META_LOCK_TOKEN).map(LockToken::new)
    }

    pub fn source_queue(&self) -> Option<&str> {
        self.meta.get(META_SOURCE_QUEUE).map(String::as_str)
    }

    pub fn delivery_count(&self) -> Option<u32> {
        self.meta
            .get(META_DELIVERY_COUNT)
            .and_then(|v| v.parse().ok())
    }
}

/// Typed view of an envelope handed to application handlers
#[derive(Debug, Clone)]
pub struct Message<T> {
    body: T,
    envelope: Envelope,
}

impl<T: MessageType> Message<T> {
    pub fn from_envelope(envelope: Envelope) -> Result<Self, SerializationError> {
        let body = envelope.decode_body::<T>()?;
        Ok(Self { body, envelope })
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }

    pub fn id(&self) -> Uuid {
        self.envelope.id
    }

    pub fn retry_attempts(&self) -> u32 {
        self.envelope.retry_attempts
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.envelope.reply_to.as_deref()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
