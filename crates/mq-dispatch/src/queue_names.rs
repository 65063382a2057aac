//! Queue naming: the fixed four-queue topology per message type, the
//! pluggable resolution strategy and broker-specific sanitization.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Legacy prefix some deployments still put in front of queue names
pub const LEGACY_QUEUE_PREFIX: &str = "mq:";

/// Maximum queue name length accepted by every supported broker
pub const MAX_QUEUE_NAME_LENGTH: usize = 260;

/// The four queues every registered message type owns.
///
/// The suffixes are a wire convention shared with broker-side tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueSuffix {
    In,
    Out,
    Priority,
    DeadLetter,
}

impl QueueSuffix {
    pub const ALL: [QueueSuffix; 4] = [Self::In, Self::Out, Self::Priority, Self::DeadLetter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => ".inq",
            Self::Out => ".outq",
            Self::Priority => ".priorityq",
            Self::DeadLetter => ".dlq",
        }
    }
}

impl fmt::Display for QueueSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/')
}

/// Default broker sanitizer.
///
/// Strips the legacy `mq:` prefix and replaces every disallowed character
/// with `.`. The output contains no `:` so a second pass changes nothing.
pub fn default_sanitize(name: &str) -> String {
    let stripped = name.strip_prefix(LEGACY_QUEUE_PREFIX).unwrap_or(name);
    stripped
        .chars()
        .map(|c| if is_allowed_char(c) { c } else { '.' })
        .collect()
}

// ============================================================================
// Queue Name
// ============================================================================

/// Validated, sanitized queue name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > MAX_QUEUE_NAME_LENGTH {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: format!("must be 1-{} characters", MAX_QUEUE_NAME_LENGTH),
            });
        }

        if !name.chars().all(is_allowed_char) {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, '.', '_', '-' and '/' allowed".to_string(),
            });
        }

        let starts_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
        let ends_ok = name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
        if !starts_ok || !ends_ok {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "must start and end with an alphanumeric character".to_string(),
            });
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

// ============================================================================
// Queue Namer
// ============================================================================

/// Resolution strategy mapping a type name and suffix to a raw queue name
pub type ResolveFn = Arc<dyn Fn(&str, QueueSuffix) -> String + Send + Sync>;

/// Broker-specific name transform. Must be idempotent.
pub type SanitizeFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Deterministic mapping from message type names to queue names.
///
/// One namer is built per server and shared by every producer, queue client
/// and worker it creates, so a name is always sanitized the same way on both
/// sides of the broker.
#[derive(Clone)]
pub struct QueueNamer {
    resolver: ResolveFn,
    sanitizer: SanitizeFn,
}

impl QueueNamer {
    /// Namer using `{typeName}{suffix}` and [`default_sanitize`]
    pub fn new() -> Self {
        Self::with_prefix("")
    }

    /// Namer using `{prefix}{typeName}{suffix}`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            resolver: Arc::new(move |type_name, suffix| {
                format!("{}{}{}", prefix, type_name, suffix.as_str())
            }),
            sanitizer: Arc::new(default_sanitize),
        }
    }

    /// Replace the resolution strategy
    pub fn with_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str, QueueSuffix) -> String + Send + Sync + 'static,
    {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Replace the sanitizer, typically with the broker's own rule
    pub fn with_sanitizer(mut self, sanitizer: SanitizeFn) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Raw resolved name, before sanitization
    pub fn resolve(&self, type_name: &str, suffix: QueueSuffix) -> String {
        (self.resolver)(type_name, suffix)
    }

    pub fn sanitize(&self, name: &str) -> String {
        (self.sanitizer)(name)
    }

    /// Resolve, sanitize and validate the queue name for a type
    pub fn queue_name(
        &self,
        type_name: &str,
        suffix: QueueSuffix,
    ) -> Result<QueueName, ValidationError> {
        self.parse(&self.resolve(type_name, suffix))
    }

    /// Sanitize and validate an externally supplied name (e.g. a reply-to queue)
    pub fn parse(&self, raw: &str) -> Result<QueueName, ValidationError> {
        QueueName::new(self.sanitize(raw))
    }
}

impl Default for QueueNamer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueueNamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueNamer").finish_non_exhaustive()
    }
}

/// The resolved four-queue topology of one message type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub in_queue: QueueName,
    pub out_queue: QueueName,
    pub priority_queue: QueueName,
    pub dead_letter_queue: QueueName,
}

impl QueueNames {
    pub fn for_type(namer: &QueueNamer, type_name: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            in_queue: namer.queue_name(type_name, QueueSuffix::In)?,
            out_queue: namer.queue_name(type_name, QueueSuffix::Out)?,
            priority_queue: namer.queue_name(type_name, QueueSuffix::Priority)?,
            dead_letter_queue: namer.queue_name(type_name, QueueSuffix::DeadLetter)?,
        })
    }

    pub fn get(&self, suffix: QueueSuffix) -> &QueueName {
        match suffix {
            QueueSuffix::In => &self.in_queue,
            QueueSuffix::Out => &self.out_queue,
            QueueSuffix::Priority => &self.priority_queue,
            QueueSuffix::DeadLetter => &self.dead_letter_queue,
        }
    }

    pub fn all(&self) -> [&QueueName; 4] {
        [
            &self.in_queue,
            &self.out_queue,
            &self.priority_queue,
            &self.dead_letter_queue,
        ]
    }
}

#[cfg(test)]
#[path = "queue_names_tests.rs"]
mod tests;
