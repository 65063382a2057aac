//! Azure Service Bus broker speaking the REST dialect.
//!
//! Requests are authorized with shared-access-signature tokens derived from a
//! namespace connection string:
//!
//! ```text
//! Endpoint=sb://{ns}.servicebus.windows.net/;SharedAccessKeyName={name};SharedAccessKey={key}
//! ```
//!
//! ## Operations
//!
//! | Operation        | Request                                         |
//! |------------------|-------------------------------------------------|
//! | `ensure_queue`   | `GET {queue}`, then `PUT {queue}` (Atom entry)  |
//! | `send`           | `POST {queue}/messages`                         |
//! | `receive`        | `DELETE {queue}/messages/head?timeout=N`        |
//! | `receive_locked` | `POST {queue}/messages/head?timeout=N`          |
//! | `complete`       | `DELETE {queue}/messages/{id}/{lock}`           |
//! | `abandon`        | `PUT {queue}/messages/{id}/{lock}`              |

use crate::broker::{Broker, BrokerDelivery, BrokerKind, BrokerQueue};
use crate::config::ServiceBusConfig;
use crate::error::{ConfigurationError, QueueError};
use crate::message::{LockToken, MessageId};
use crate::queue_names::QueueName;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

#[cfg(test)]
#[path = "service_bus_tests.rs"]
mod tests;

type HmacSha256 = Hmac<Sha256>;

const PROVIDER_NAME: &str = "ServiceBus";
const API_VERSION: &str = "2021-05";
const BROKER_PROPERTIES_HEADER: &str = "BrokerProperties";
const ATOM_CONTENT_TYPE: &str = "application/atom+xml;type=entry;charset=utf-8";
/// Largest message accepted by the standard tier
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;
/// Upper bound for a single receive call when the caller waits indefinitely
const LONG_POLL: Duration = Duration::from_secs(55);

const QUEUE_DESCRIPTION: &str = concat!(
    r#"<entry xmlns="http://www.w3.org/2005/Atom">"#,
    r#"<content type="application/xml">"#,
    r#"<QueueDescription xmlns:i="http://www.w3.org/2001/XMLSchema-instance" "#,
    r#"xmlns="http://schemas.microsoft.com/netservices/2010/10/servicebus/connect" />"#,
    r#"</content></entry>"#
);

// ============================================================================
// Error Types
// ============================================================================

/// Service Bus specific errors
#[derive(Debug, Error)]
pub enum ServiceBusError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Message lock lost: {0}")]
    LockLost(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Message of {size} bytes rejected as too large")]
    MessageTooLarge { size: usize },

    #[error("Service Bus returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl ServiceBusError {
    /// Map Service Bus error to QueueError
    pub fn to_queue_error(self) -> QueueError {
        match self {
            Self::Authentication(message) => QueueError::AuthenticationFailed { message },
            Self::EntityNotFound(queue_name) => QueueError::QueueNotFound { queue_name },
            Self::LockLost(lock_token) => QueueError::LockLost { lock_token },
            Self::Network(message) => QueueError::ConnectionFailed { message },
            Self::Timeout(duration) => QueueError::Timeout { duration },
            Self::MessageTooLarge { size } => QueueError::MessageTooLarge {
                size,
                max_size: MAX_MESSAGE_SIZE,
            },
            Self::Service { status, message } => QueueError::ProviderError {
                provider: PROVIDER_NAME.to_string(),
                code: status.to_string(),
                message,
            },
            Self::MalformedResponse(message) => QueueError::ProviderError {
                provider: PROVIDER_NAME.to_string(),
                code: "MalformedResponse".to_string(),
                message,
            },
        }
    }

    fn from_transport(error: reqwest::Error, timeout: Duration) -> Self {
        if error.is_timeout() {
            Self::Timeout(timeout)
        } else if error.is_connect() {
            Self::Network(format!("Connection failed: {}", error))
        } else {
            Self::Network(format!("HTTP request failed: {}", error))
        }
    }

    /// Classify a non-success status. `entity` names the queue or lock the
    /// request addressed.
    fn from_status(status: StatusCode, entity: &str, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Self::Authentication(format!("{} ({})", body, status))
            }
            StatusCode::NOT_FOUND => Self::EntityNotFound(entity.to_string()),
            StatusCode::GONE => Self::LockLost(entity.to_string()),
            _ => Self::Service {
                status: status.as_u16(),
                message: body,
            },
        }
    }
}

impl From<ServiceBusError> for QueueError {
    fn from(error: ServiceBusError) -> Self {
        error.to_queue_error()
    }
}

// ============================================================================
// Connection String / Shared Access Signature
// ============================================================================

/// Parsed namespace connection string
#[derive(Clone)]
pub struct ConnectionString {
    /// HTTPS form of the `sb://` namespace endpoint
    pub endpoint: Url,
    pub key_name: String,
    key: String,
}

impl ConnectionString {
    pub fn parse(connection_string: &str) -> Result<Self, ConfigurationError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;

        for part in connection_string
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            let Some((name, value)) = part.split_once('=') else {
                return Err(ConfigurationError::Invalid {
                    message: format!(
                        "connection string segment '{}' is not a key=value pair",
                        part
                    ),
                });
            };
            match name.to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.to_string()),
                "sharedaccesskeyname" => key_name = Some(value.to_string()),
                "sharedaccesskey" => key = Some(value.to_string()),
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| ConfigurationError::Missing {
            key: "Endpoint".to_string(),
        })?;
        let key_name = key_name.ok_or_else(|| ConfigurationError::Missing {
            key: "SharedAccessKeyName".to_string(),
        })?;
        let key = key.ok_or_else(|| ConfigurationError::Missing {
            key: "SharedAccessKey".to_string(),
        })?;

        let host = endpoint
            .strip_prefix("sb://")
            .or_else(|| endpoint.strip_prefix("https://"))
            .ok_or_else(|| ConfigurationError::Invalid {
                message: format!("endpoint '{}' must use the sb:// scheme", endpoint),
            })?;
        let host = host.trim_end_matches('/');
        if host.is_empty() {
            return Err(ConfigurationError::Invalid {
                message: "endpoint has no host".to_string(),
            });
        }

        let endpoint = Url::parse(&format!("https://{}/", host)).map_err(|e| {
            ConfigurationError::Invalid {
                message: format!("endpoint '{}' is not a valid URL: {}", host, e),
            }
        })?;

        Ok(Self {
            endpoint,
            key_name,
            key,
        })
    }

    /// Build a `SharedAccessSignature` authorization value for `resource`
    /// that expires `ttl` from now.
    pub fn sas_token(&self, resource: &str, ttl: Duration) -> Result<String, ConfigurationError> {
        let expiry = Utc::now().timestamp() + ttl.as_secs() as i64;
        self.sas_token_with_expiry(resource, expiry)
    }

    fn sas_token_with_expiry(
        &self,
        resource: &str,
        expiry: i64,
    ) -> Result<String, ConfigurationError> {
        let encoded_resource = urlencoding::encode(&resource.to_lowercase()).into_owned();
        let string_to_sign = format!("{}\n{}", encoded_resource, expiry);

        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes()).map_err(|e| {
            ConfigurationError::Invalid {
                message: format!("shared access key is unusable: {}", e),
            }
        })?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_resource,
            urlencoding::encode(&signature),
            expiry,
            self.key_name
        ))
    }
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint.as_str())
            .field("key_name", &self.key_name)
            .field("key", &"<REDACTED>")
            .finish()
    }
}

/// Subset of the `BrokerProperties` header this adapter reads and writes
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BrokerProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lock_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delivery_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_number: Option<i64>,
}

// ============================================================================
// REST Client
// ============================================================================

/// Signed HTTP access to one namespace, shared by the broker and its handles
struct ServiceBusRest {
    http: HttpClient,
    base_url: Url,
    credentials: ConnectionString,
    token_ttl: Duration,
    operation_timeout: Duration,
}

impl ServiceBusRest {
    fn entity_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ServiceBusError> {
        let url = self.entity_url(path);
        let token = self
            .credentials
            .sas_token(&url, self.token_ttl)
            .map_err(|e| ServiceBusError::Authentication(e.to_string()))?;

        Ok(self
            .http
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, token))
    }

    async fn send(
        &self,
        request: RequestBuilder,
        timeout: Duration,
    ) -> Result<Response, ServiceBusError> {
        request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ServiceBusError::from_transport(e, timeout))
    }
}

/// Seconds to pass as the `timeout` query parameter, rounded up
fn timeout_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

async fn error_body(response: Response) -> String {
    response.text().await.unwrap_or_default()
}

// ============================================================================
// Service Bus Broker
// ============================================================================

/// Broker backed by an Azure Service Bus namespace
pub struct ServiceBusBroker {
    rest: Arc<ServiceBusRest>,
}

impl ServiceBusBroker {
    /// Create a broker for the namespace named in the connection string
    pub fn new(config: &ServiceBusConfig) -> Result<Self, QueueError> {
        let credentials = ConnectionString::parse(&config.connection_string)?;
        let base_url = credentials.endpoint.clone();
        Self::with_base_url(config, base_url)
    }

    /// Create a broker that sends requests to `base_url` instead of the
    /// namespace endpoint. Tokens are still signed with the configured key.
    pub fn with_base_url(config: &ServiceBusConfig, base_url: Url) -> Result<Self, QueueError> {
        config.validate()?;
        let credentials = ConnectionString::parse(&config.connection_string)?;

        let http = HttpClient::builder()
            .timeout(config.operation_timeout())
            .build()
            .map_err(|e| QueueError::Configuration(ConfigurationError::Invalid {
                message: format!("failed to build HTTP client: {}", e),
            }))?;

        info!(
            endpoint = %credentials.endpoint,
            base_url = %base_url,
            key_name = %credentials.key_name,
            "Created Service Bus broker"
        );

        Ok(Self {
            rest: Arc::new(ServiceBusRest {
                http,
                base_url,
                credentials,
                token_ttl: Duration::from_secs(config.token_ttl_secs),
                operation_timeout: config.operation_timeout(),
            }),
        })
    }

    async fn queue_exists(&self, queue: &QueueName) -> Result<bool, ServiceBusError> {
        let request = self
            .rest
            .request(Method::GET, queue.as_str())?
            .query(&[("api-version", API_VERSION)]);
        let response = self.rest.send(request, self.rest.operation_timeout).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(ServiceBusError::from_status(
                status,
                queue.as_str(),
                error_body(response).await,
            ));
        }

        // A missing entity can also come back as an empty feed
        let body = error_body(response).await;
        Ok(body.contains("<entry"))
    }

    async fn create_queue(&self, queue: &QueueName) -> Result<(), ServiceBusError> {
        let request = self
            .rest
            .request(Method::PUT, queue.as_str())?
            .query(&[("api-version", API_VERSION)])
            .header(reqwest::header::CONTENT_TYPE, ATOM_CONTENT_TYPE)
            .body(QUEUE_DESCRIPTION);
        let response = self.rest.send(request, self.rest.operation_timeout).await?;

        match response.status() {
            status if status.is_success() => {
                info!(queue = %queue, "Created Service Bus queue");
                Ok(())
            }
            StatusCode::CONFLICT => {
                debug!(queue = %queue, "Queue was created concurrently");
                Ok(())
            }
            status => Err(ServiceBusError::from_status(
                status,
                queue.as_str(),
                error_body(response).await,
            )),
        }
    }
}

impl std::fmt::Debug for ServiceBusBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBusBroker")
            .field("base_url", &self.rest.base_url.as_str())
            .field("credentials", &self.rest.credentials)
            .finish()
    }
}

#[async_trait]
impl Broker for ServiceBusBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::ServiceBus
    }

    #[instrument(skip(self, queue), fields(queue = %queue))]
    async fn ensure_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        if self.queue_exists(queue).await? {
            return Ok(());
        }
        self.create_queue(queue).await?;
        Ok(())
    }

    async fn open_queue(&self, queue: &QueueName) -> Result<Arc<dyn BrokerQueue>, QueueError> {
        debug!(queue = %queue, "Opening Service Bus queue handle");
        Ok(Arc::new(ServiceBusQueue {
            name: queue.clone(),
            rest: Arc::clone(&self.rest),
            locks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// Service Bus Queue Handle
// ============================================================================

/// Handle for one Service Bus queue
pub struct ServiceBusQueue {
    name: QueueName,
    rest: Arc<ServiceBusRest>,
    /// Lock token -> message id, needed to address settle requests
    locks: Mutex<HashMap<String, String>>,
    closed: AtomicBool,
}

impl ServiceBusQueue {
    fn check_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::QueueClosed {
                queue_name: self.name.to_string(),
            });
        }
        Ok(())
    }

    fn messages_path(&self) -> String {
        format!("{}/messages", self.name)
    }

    /// Remove a tracked lock and return the message id it belongs to
    fn take_lock(&self, lock_token: &LockToken) -> Result<String, QueueError> {
        let mut locks = self.locks.lock().map_err(|_| QueueError::ProviderError {
            provider: PROVIDER_NAME.to_string(),
            code: "LockPoisoned".to_string(),
            message: "lock table mutex poisoned".to_string(),
        })?;
        locks
            .remove(lock_token.as_str())
            .ok_or_else(|| QueueError::LockLost {
                lock_token: lock_token.to_string(),
            })
    }

    fn track_lock(&self, lock_token: &str, message_id: &str) -> Result<(), QueueError> {
        let mut locks = self.locks.lock().map_err(|_| QueueError::ProviderError {
            provider: PROVIDER_NAME.to_string(),
            code: "LockPoisoned".to_string(),
            message: "lock table mutex poisoned".to_string(),
        })?;
        locks.insert(lock_token.to_string(), message_id.to_string());
        Ok(())
    }

    /// One `messages/head` call. Returns the response when a message arrived.
    async fn head(
        &self,
        method: Method,
        wait: Duration,
    ) -> Result<Option<Response>, ServiceBusError> {
        let path = format!("{}/head", self.messages_path());
        let request = self
            .rest
            .request(method, &path)?
            .query(&[("timeout", timeout_secs(wait))]);
        let response = self
            .rest
            .send(request, wait + self.rest.operation_timeout)
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => Err(ServiceBusError::from_status(
                status,
                self.name.as_str(),
                error_body(response).await,
            )),
        }
    }

    async fn settle(&self, method: Method, lock_token: &LockToken) -> Result<(), QueueError> {
        self.check_open()?;
        let message_id = self.take_lock(lock_token)?;
        let path = format!(
            "{}/{}/{}",
            self.messages_path(),
            urlencoding::encode(&message_id),
            urlencoding::encode(lock_token.as_str())
        );

        let request = self.rest.request(method.clone(), &path)?;
        let response = self.rest.send(request, self.rest.operation_timeout).await?;

        let status = response.status();
        if status.is_success() {
            debug!(
                queue = %self.name,
                lock_token = %lock_token,
                method = %method,
                "Settled delivery"
            );
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(QueueError::LockLost {
                lock_token: lock_token.to_string(),
            });
        }
        let message = error_body(response).await;
        Err(ServiceBusError::from_status(status, self.name.as_str(), message).into())
    }
}

#[async_trait]
impl BrokerQueue for ServiceBusQueue {
    fn name(&self) -> &QueueName {
        &self.name
    }

    async fn send(&self, body: Bytes, message_id: &MessageId) -> Result<(), QueueError> {
        self.check_open()?;
        let size = body.len();
        if size > MAX_MESSAGE_SIZE {
            return Err(ServiceBusError::MessageTooLarge { size }.into());
        }

        let properties = serde_json::to_string(&BrokerProperties {
            message_id: Some(message_id.to_string()),
            ..BrokerProperties::default()
        })
        .map_err(crate::error::SerializationError::from)?;

        let request = self
            .rest
            .request(Method::POST, &self.messages_path())?
            .header(BROKER_PROPERTIES_HEADER, properties)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        let response = self.rest.send(request, self.rest.operation_timeout).await?;

        match response.status() {
            status if status.is_success() => {
                debug!(queue = %self.name, message_id = %message_id, size = size, "Sent message");
                Ok(())
            }
            StatusCode::PAYLOAD_TOO_LARGE => Err(ServiceBusError::MessageTooLarge { size }.into()),
            status => Err(ServiceBusError::from_status(
                status,
                self.name.as_str(),
                error_body(response).await,
            )
            .into()),
        }
    }

    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Bytes>, QueueError> {
        self.check_open()?;
        loop {
            let wait = timeout.unwrap_or(LONG_POLL);
            if let Some(response) = self.head(Method::DELETE, wait).await? {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| ServiceBusError::from_transport(e, self.rest.operation_timeout))?;
                return Ok(Some(body));
            }
            if timeout.is_some() {
                return Ok(None);
            }
            self.check_open()?;
        }
    }

    async fn receive_locked(&self, wait: Duration) -> Result<Option<BrokerDelivery>, QueueError> {
        self.check_open()?;
        let Some(response) = self.head(Method::POST, wait).await? else {
            return Ok(None);
        };

        let header = response
            .headers()
            .get(BROKER_PROPERTIES_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceBusError::MalformedResponse(
                    "peek-lock response has no BrokerProperties".to_string(),
                )
            })?;
        let properties: BrokerProperties = serde_json::from_str(&header).map_err(|e| {
            ServiceBusError::MalformedResponse(format!("invalid BrokerProperties: {}", e))
        })?;

        let lock_token = properties.lock_token.ok_or_else(|| {
            ServiceBusError::MalformedResponse("BrokerProperties has no LockToken".to_string())
        })?;
        let message_id = properties.message_id.ok_or_else(|| {
            ServiceBusError::MalformedResponse("BrokerProperties has no MessageId".to_string())
        })?;

        let body = response
            .bytes()
            .await
            .map_err(|e| ServiceBusError::from_transport(e, self.rest.operation_timeout))?;

        self.track_lock(&lock_token, &message_id)?;

        Ok(Some(BrokerDelivery {
            body,
            lock_token: LockToken::new(lock_token),
            message_id: message_id.parse().ok(),
            delivery_count: properties.delivery_count.unwrap_or(1),
        }))
    }

    async fn complete(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.settle(Method::DELETE, lock_token).await
    }

    async fn abandon(&self, lock_token: &LockToken) -> Result<(), QueueError> {
        self.settle(Method::PUT, lock_token).await
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let pending = self.locks.lock().map(|l| l.len()).unwrap_or(0);
            if pending > 0 {
                warn!(
                    queue = %self.name,
                    pending_locks = pending,
                    "Closing handle with unsettled deliveries"
                );
            }
            debug!(queue = %self.name, "Closed Service Bus queue handle");
        }
        Ok(())
    }
}
