//! Messaging configuration

use crate::messaging::envelope::{MessagePriority, QoSLevel};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serialize a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Broker backend type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerBackend {
    /// In-process broker, nothing leaves the process
    #[default]
    InMemory,
    /// NATS - lightweight, high-performance messaging
    Nats,
}

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URLs
    pub servers: Vec<String>,

    /// Connection name
    pub connection_name: String,

    /// Maximum reconnect attempts
    pub max_reconnects: Option<usize>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Ping interval in seconds
    pub ping_interval_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            connection_name: "reliable-messaging".to_string(),
            max_reconnects: Some(10),
            connect_timeout_ms: 5000,
            ping_interval_secs: 60,
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,

    pub nats: NatsConfig,

    /// Startup connection supervision
    pub connect_retry: RetryPolicy,
}

impl BrokerConfig {
    pub fn validate(&self) -> MessagingResult<()> {
        if self.backend == BrokerBackend::Nats && self.nats.servers.is_empty() {
            return Err(MessagingError::Configuration(
                "broker.nats.servers must list at least one server".to_string(),
            ));
        }
        self.connect_retry.validate()
    }
}

/// Where a producer sends messages it finally gave up on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
}

/// Producer configuration. Immutable once the producer is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// QoS used by plain `send`
    pub default_qos: QoSLevel,

    /// Priority used when a message carries none
    pub default_priority: MessagePriority,

    /// Exchange used when send options name none
    pub default_exchange: String,

    /// Retries of a guaranteed-delivery publish after the first attempt
    pub max_retries: u32,

    #[serde(rename = "retry_delay_ms", with = "duration_ms")]
    pub retry_delay: Duration,

    /// How long a guaranteed-delivery publish waits for the broker confirm
    #[serde(rename = "confirm_timeout_ms", with = "duration_ms")]
    pub confirm_timeout: Duration,

    pub dead_letter: DeadLetterConfig,

    pub enable_metrics: bool,

    /// Largest chunk sent in one go by `send_batch`
    pub batch_size: usize,

    #[serde(rename = "batch_timeout_ms", with = "duration_ms")]
    pub batch_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            default_qos: QoSLevel::AtLeastOnce,
            default_priority: MessagePriority::Normal,
            default_exchange: "default".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            confirm_timeout: Duration::from_secs(5),
            dead_letter: DeadLetterConfig::default(),
            enable_metrics: true,
            batch_size: 100,
            batch_timeout: Duration::from_millis(5000),
        }
    }
}

impl ProducerConfig {
    /// Create a new builder for ProducerConfig
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> MessagingResult<()> {
        if self.default_exchange.is_empty() {
            return Err(MessagingError::Configuration(
                "default_exchange cannot be empty".to_string(),
            ));
        }

        if self.batch_size == 0 {
            return Err(MessagingError::Configuration(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.batch_timeout.is_zero() {
            return Err(MessagingError::Configuration(
                "batch_timeout must be greater than 0".to_string(),
            ));
        }

        if self.confirm_timeout.is_zero() {
            return Err(MessagingError::Configuration(
                "confirm_timeout must be greater than 0".to_string(),
            ));
        }

        if self.dead_letter.enabled && self.dead_letter.exchange.is_none() {
            return Err(MessagingError::Configuration(
                "dead_letter.exchange is required when dead-lettering is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Backoff between guaranteed-delivery publish attempts
    pub fn publish_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries + 1,
            initial_delay: self.retry_delay,
            multiplier: 2.0,
            max_delay: self.retry_delay.saturating_mul(8),
        }
    }
}

/// Builder for ProducerConfig with fluent API
#[derive(Debug, Clone, Default)]
pub struct ProducerConfigBuilder {
    default_qos: Option<QoSLevel>,
    default_priority: Option<MessagePriority>,
    default_exchange: Option<String>,
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
    confirm_timeout: Option<Duration>,
    dead_letter: Option<DeadLetterConfig>,
    enable_metrics: Option<bool>,
    batch_size: Option<usize>,
    batch_timeout: Option<Duration>,
}

impl ProducerConfigBuilder {
    pub fn default_qos(mut self, qos: QoSLevel) -> Self {
        self.default_qos = Some(qos);
        self
    }

    pub fn default_priority(mut self, priority: MessagePriority) -> Self {
        self.default_priority = Some(priority);
        self
    }

    pub fn default_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.default_exchange = Some(exchange.into());
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = Some(timeout);
        self
    }

    /// Enable producer-side dead-lettering to the given exchange
    pub fn dead_letter(mut self, exchange: impl Into<String>, routing_key: Option<String>) -> Self {
        self.dead_letter = Some(DeadLetterConfig {
            enabled: true,
            exchange: Some(exchange.into()),
            routing_key,
        });
        self
    }

    pub fn enable_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = Some(enabled);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    /// Build the configuration
    pub fn build(self) -> MessagingResult<ProducerConfig> {
        let default = ProducerConfig::default();

        let config = ProducerConfig {
            default_qos: self.default_qos.unwrap_or(default.default_qos),
            default_priority: self.default_priority.unwrap_or(default.default_priority),
            default_exchange: self.default_exchange.unwrap_or(default.default_exchange),
            max_retries: self.max_retries.unwrap_or(default.max_retries),
            retry_delay: self.retry_delay.unwrap_or(default.retry_delay),
            confirm_timeout: self.confirm_timeout.unwrap_or(default.confirm_timeout),
            dead_letter: self.dead_letter.unwrap_or(default.dead_letter),
            enable_metrics: self.enable_metrics.unwrap_or(default.enable_metrics),
            batch_size: self.batch_size.unwrap_or(default.batch_size),
            batch_timeout: self.batch_timeout.unwrap_or(default.batch_timeout),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Per-send routing options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    /// Fail when no queue is bound for the routing key
    pub mandatory: bool,
    pub immediate: bool,
    pub persistent: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            exchange: None,
            routing_key: None,
            mandatory: false,
            immediate: false,
            persistent: true,
        }
    }
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Options for `send_batch`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOptions {
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    /// Publish concurrently instead of one after another
    pub parallel: bool,
    /// All messages or none; requires transport support
    pub transaction: bool,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn transaction(mut self, transaction: bool) -> Self {
        self.transaction = transaction;
        self
    }

    pub(crate) fn as_send_options(&self) -> SendOptions {
        SendOptions {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            ..SendOptions::default()
        }
    }
}

/// Consumer runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Deliveries of one message before it is dead-lettered
    pub max_retries: u32,

    /// Backoff applied when a handler asks for a retry without a delay
    pub retry_backoff: RetryPolicy,

    /// How long a processed message id is remembered
    #[serde(rename = "dedup_window_ms", with = "duration_ms")]
    pub dedup_window: Duration,

    pub dedup_capacity: u64,

    /// Deduplicate every message, not only exactly-once ones
    pub always_deduplicate: bool,

    /// Record consumer-side Prometheus metrics
    pub enable_metrics: bool,

    pub notification_enabled: bool,
    pub audit_enabled: bool,
    pub crm_sync_enabled: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: RetryPolicy::default(),
            dedup_window: Duration::from_secs(600),
            dedup_capacity: 100_000,
            always_deduplicate: false,
            enable_metrics: true,
            notification_enabled: true,
            audit_enabled: true,
            crm_sync_enabled: true,
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> MessagingResult<()> {
        if self.max_retries == 0 {
            return Err(MessagingError::Configuration(
                "consumers.max_retries must be greater than 0".to_string(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(MessagingError::Configuration(
                "consumers.dedup_capacity must be greater than 0".to_string(),
            ));
        }
        self.retry_backoff.validate()
    }
}
