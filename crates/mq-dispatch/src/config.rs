//! Layered configuration for the dispatch server, broker and logging.
//!
//! Sources, later overriding earlier:
//!  1. `config/mq-dispatch.yaml` (optional)
//!  2. An explicit file passed to [`MqSettings::load`] (required when given)
//!  3. Environment variables prefixed `MQ__`, e.g. `MQ__SERVER__RETRY_COUNT=3`
//!
//! Every field has a default, so an empty environment yields a working
//! in-memory setup.

use crate::error::ConfigurationError;
use crate::handler::{ResponsePolicy, RetryCount};
use crate::providers::service_bus::ConnectionString;
use crate::queue_names::{QueueNamer, QueueSuffix};
use crate::worker::{CompletionPolicy, DEFAULT_MAX_DELIVERY_COUNT};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

const DEFAULT_CONFIG_FILE: &str = "config/mq-dispatch";
const ENV_PREFIX: &str = "MQ";

/// Root settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MqSettings {
    pub server: ServerSettings,
    pub broker: BrokerConfig,
    pub logging: LoggingConfig,
}

impl MqSettings {
    /// Load and validate settings from files and the environment
    pub fn load(explicit_path: Option<&str>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder().add_source(
            config::File::with_name(DEFAULT_CONFIG_FILE)
                .required(false)
                .format(config::FileFormat::Yaml),
        );

        if let Some(path) = explicit_path.filter(|p| !p.is_empty()) {
            builder = builder.add_source(config::File::with_name(path).required(true));
            info!(path = %path, "Loading configuration from explicit path");
        }

        let settings: MqSettings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.server.validate()?;
        self.broker.validate()?;
        Ok(())
    }
}

/// Server behavior settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Retry budget for handlers that do not set their own
    pub retry_count: i64,
    /// Prepended to every resolved queue name
    pub queue_prefix: String,
    pub completion_policy: CompletionPolicy,
    /// Deliveries of one message before `on_success` dead-letters it
    pub max_delivery_count: u32,
    /// How long one push-mode receive call waits before checking for shutdown
    pub push_receive_wait_ms: u64,
    pub disable_publishing_responses: bool,
    pub publish_responses_whitelist: Option<Vec<String>>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            retry_count: 1,
            queue_prefix: String::new(),
            completion_policy: CompletionPolicy::Always,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            push_receive_wait_ms: 1000,
            disable_publishing_responses: false,
            publish_responses_whitelist: None,
        }
    }
}

impl ServerSettings {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.retry_count()?;

        if self.push_receive_wait_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "server.push_receive_wait_ms must be greater than zero".to_string(),
            });
        }

        if self.max_delivery_count == 0 {
            return Err(ConfigurationError::Invalid {
                message: "server.max_delivery_count must be greater than zero".to_string(),
            });
        }

        if !self.queue_prefix.is_empty() {
            let sample = self.namer().queue_name("Sample", QueueSuffix::In);
            if let Err(e) = sample {
                return Err(ConfigurationError::Invalid {
                    message: format!(
                        "server.queue_prefix '{}' is not usable: {}",
                        self.queue_prefix, e
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn retry_count(&self) -> Result<RetryCount, ConfigurationError> {
        RetryCount::try_from(self.retry_count)
    }

    pub fn push_receive_wait(&self) -> Duration {
        Duration::from_millis(self.push_receive_wait_ms)
    }

    pub fn response_policy(&self) -> ResponsePolicy {
        ResponsePolicy {
            disabled: self.disable_publishing_responses,
            whitelist: self.publish_responses_whitelist.clone(),
        }
    }

    /// Namer using the configured prefix and the default sanitizer
    pub fn namer(&self) -> QueueNamer {
        QueueNamer::with_prefix(self.queue_prefix.clone())
    }
}

/// Broker selection, tagged by `type`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerConfig {
    #[default]
    InMemory,
    ServiceBus(ServiceBusConfig),
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::InMemory => Ok(()),
            Self::ServiceBus(config) => config.validate(),
        }
    }
}

/// Azure Service Bus REST settings
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceBusConfig {
    /// `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...`
    pub connection_string: String,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Lifetime of generated shared-access-signature tokens
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

fn default_operation_timeout_secs() -> u64 {
    60
}

fn default_token_ttl_secs() -> u64 {
    3600
}

impl ServiceBusConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            operation_timeout_secs: default_operation_timeout_secs(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.connection_string.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "broker.connection_string".to_string(),
            });
        }
        ConnectionString::parse(&self.connection_string)?;

        if self.operation_timeout_secs == 0 || self.token_ttl_secs == 0 {
            return Err(ConfigurationError::Invalid {
                message: "service bus timeouts must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl std::fmt::Debug for ServiceBusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let endpoint = ConnectionString::parse(&self.connection_string)
            .map(|c| c.endpoint.to_string())
            .unwrap_or_else(|_| "<invalid>".to_string());
        f.debug_struct("ServiceBusConfig")
            .field("endpoint", &endpoint)
            .field("connection_string", &"<REDACTED>")
            .field("operation_timeout_secs", &self.operation_timeout_secs)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}
