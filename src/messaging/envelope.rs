//! Message envelope and metadata shared by producers and consumers

use crate::messaging::error::MessagingError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use strum::{Display, EnumString};

/// Broker-level header value; headers only carry primitives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl HeaderValue {
    /// Borrow the value as a string if it is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(value) => Some(value),
            _ => None,
        }
    }

    /// Interpret the value as an integer, parsing strings when needed
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(value) => Some(*value),
            HeaderValue::Float(value) => Some(*value as i64),
            HeaderValue::String(value) => value.parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(value) => write!(f, "{}", value),
            HeaderValue::Int(value) => write!(f, "{}", value),
            HeaderValue::Float(value) => write!(f, "{}", value),
            HeaderValue::String(value) => write!(f, "{}", value),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Header map attached to a message
pub type Headers = BTreeMap<String, HeaderValue>;

/// Message priority levels. Ordering is part of the contract.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
    Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    /// Numeric priority as carried on the wire
    pub fn as_u8(&self) -> u8 {
        match self {
            MessagePriority::Low => 0,
            MessagePriority::Normal => 1,
            MessagePriority::High => 2,
            MessagePriority::Critical => 3,
        }
    }

    /// Inverse of [`MessagePriority::as_u8`], clamping unknown values to `Critical`
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => MessagePriority::Low,
            1 => MessagePriority::Normal,
            2 => MessagePriority::High,
            _ => MessagePriority::Critical,
        }
    }
}

/// Delivery guarantee requested for a send
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum QoSLevel {
    /// Fire and forget
    AtMostOnce,
    /// Guaranteed delivery, may duplicate
    #[default]
    AtLeastOnce,
    /// Guaranteed delivery, duplicates removed by consumer-side deduplication on `message_id`
    ExactlyOnce,
}

impl QoSLevel {
    /// Whether the publish must be confirmed by the broker
    pub fn requires_confirmation(&self) -> bool {
        !matches!(self, QoSLevel::AtMostOnce)
    }
}

/// Message metadata for tracking and observability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Idempotency key; generated once per logical send when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    /// Ties related messages and operations together
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Originating component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Generate a fresh message identifier
pub fn generate_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A unit of work to be published
#[derive(Debug, Clone, PartialEq)]
pub struct BaseMessage<T> {
    pub body: T,
    pub headers: Headers,
    pub metadata: MessageMetadata,
    pub priority: Option<MessagePriority>,
    /// Defer visibility to consumers
    pub delay: Option<Duration>,
    /// Expire the message after this long since send
    pub ttl: Option<Duration>,
}

impl<T> BaseMessage<T> {
    /// Create a new message around a payload
    pub fn new(body: T) -> Self {
        Self {
            body,
            headers: Headers::new(),
            metadata: MessageMetadata::default(),
            priority: None,
            delay: None,
            ttl: None,
        }
    }

    /// Set the idempotency key explicitly
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.metadata.message_id = Some(message_id.into());
        self
    }

    /// Create with correlation ID
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.metadata.user_id = Some(user_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.metadata.session_id = Some(session_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.metadata.version = Some(version.into());
        self
    }

    /// Add a custom header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Return the message id, assigning one if the message has none yet.
    ///
    /// Calling this before a retry loop guarantees every attempt of the same
    /// logical send carries the same id.
    pub fn ensure_message_id(&mut self) -> String {
        self.metadata
            .message_id
            .get_or_insert_with(generate_message_id)
            .clone()
    }
}

/// Opaque handle to a raw delivery, needed for manual acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    /// Broker-assigned tag, unique per transport instance
    pub delivery_tag: u64,
    /// Queue the delivery came from
    pub queue: String,
    /// Whether the broker has delivered this message before
    pub redelivered: bool,
}

/// Inbound projection of a delivered message
#[derive(Debug, Clone)]
pub struct ConsumerMessage<T> {
    pub body: T,
    pub headers: Headers,
    pub metadata: MessageMetadata,
    /// 1-based delivery attempt, derived from the retry-count header
    pub attempt: u32,
    pub delivery: DeliveryHandle,
}

impl<T> ConsumerMessage<T> {
    /// Message id, if the producer stamped one
    pub fn message_id(&self) -> Option<&str> {
        self.metadata.message_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.correlation_id.as_deref()
    }
}

/// Outcome a consumer handler returns
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerResult {
    pub success: bool,
    #[serde(serialize_with = "error_message", skip_serializing_if = "Option::is_none")]
    pub error: Option<MessagingError>,
    /// Ask the runtime to requeue the message
    pub retry: bool,
    /// Backoff hint for the requeue
    #[serde(
        rename = "retryDelayMs",
        serialize_with = "optional_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_delay: Option<Duration>,
    /// Route to the dead-letter path regardless of remaining retry budget
    pub dead_letter: bool,
}

impl ConsumerResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// Failure without a disposition; the runtime asks `handle_error` to classify it
    pub fn failure(error: MessagingError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn retry(error: MessagingError, retry_delay: Option<Duration>) -> Self {
        Self {
            success: false,
            error: Some(error),
            retry: true,
            retry_delay,
            dead_letter: false,
        }
    }

    pub fn dead_letter(error: MessagingError) -> Self {
        Self {
            success: false,
            error: Some(error),
            retry: false,
            retry_delay: None,
            dead_letter: true,
        }
    }

    /// Whether the result already carries a retry or dead-letter decision
    pub fn has_disposition(&self) -> bool {
        self.retry || self.dead_letter
    }
}

fn error_message<S: serde::Serializer>(
    error: &Option<MessagingError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_str(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

fn optional_millis<S: serde::Serializer>(
    delay: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match delay {
        Some(delay) => serializer.serialize_u64(delay.as_millis() as u64),
        None => serializer.serialize_none(),
    }
}

/// Result of a single send
#[derive(Debug, Clone)]
pub struct SendResult {
    pub message_id: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub error: Option<MessagingError>,
    pub delivery_tag: Option<String>,
    pub correlation_id: Option<String>,
}

impl SendResult {
    pub fn sent(
        message_id: String,
        correlation_id: Option<String>,
        delivery_tag: Option<String>,
    ) -> Self {
        Self {
            message_id,
            success: true,
            timestamp: Utc::now(),
            error: None,
            delivery_tag,
            correlation_id,
        }
    }

    pub fn failed(message_id: String, correlation_id: Option<String>, error: MessagingError) -> Self {
        Self {
            message_id,
            success: false,
            timestamp: Utc::now(),
            error: Some(error),
            delivery_tag: None,
            correlation_id,
        }
    }
}

/// Result of a batch send
#[derive(Debug, Clone, Default)]
pub struct BatchSendResult {
    pub successful: Vec<SendResult>,
    pub failed: Vec<SendResult>,
    /// Always `successful.len() + failed.len()`
    pub total_processed: usize,
    pub duration: Duration,
}

impl BatchSendResult {
    /// Split a list of results into successes and failures, keeping input order within each
    pub fn from_results(results: Vec<SendResult>, duration: Duration) -> Self {
        let total_processed = results.len();
        let (successful, failed) = results.into_iter().partition(|result| result.success);
        Self {
            successful,
            failed,
            total_processed,
            duration,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Low < MessagePriority::Normal);
        assert!(MessagePriority::Normal < MessagePriority::High);
        assert!(MessagePriority::High < MessagePriority::Critical);
        assert_eq!(MessagePriority::from_u8(MessagePriority::High.as_u8()), MessagePriority::High);
        assert_eq!("critical".parse::<MessagePriority>().unwrap(), MessagePriority::Critical);
    }

    #[test]
    fn test_qos_default_and_parse() {
        assert_eq!(QoSLevel::default(), QoSLevel::AtLeastOnce);
        assert_eq!("exactly-once".parse::<QoSLevel>().unwrap(), QoSLevel::ExactlyOnce);
        assert!(!QoSLevel::AtMostOnce.requires_confirmation());
    }

    #[test]
    fn test_ensure_message_id_is_stable() {
        let mut message = BaseMessage::new("payload").with_correlation_id("corr-1");
        let first = message.ensure_message_id();
        let second = message.ensure_message_id();
        assert_eq!(first, second);
        assert_eq!(message.metadata.correlation_id.as_deref(), Some("corr-1"));

        let mut explicit = BaseMessage::new(1).with_message_id("msg-42");
        assert_eq!(explicit.ensure_message_id(), "msg-42");
    }

    #[test]
    fn test_batch_accounting() {
        let results = vec![
            SendResult::sent("a".into(), None, None),
            SendResult::failed("b".into(), None, MessagingError::PublishFailed("x".into())),
            SendResult::sent("c".into(), None, None),
        ];
        let batch = BatchSendResult::from_results(results, Duration::from_millis(3));
        assert_eq!(batch.successful.len(), 2);
        assert_eq!(batch.failed.len(), 1);
        assert_eq!(batch.total_processed, 3);
        assert_eq!(batch.successful[0].message_id, "a");
        assert_eq!(batch.successful[1].message_id, "c");
        assert!(!batch.all_succeeded());
    }

    #[test]
    fn test_consumer_result_serializes_error_as_message() {
        let result = ConsumerResult::retry(
            MessagingError::transient("smtp unavailable"),
            Some(Duration::from_millis(1500)),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["retry"], true);
        assert_eq!(json["retryDelayMs"], 1500);
        assert_eq!(json["error"], "Handler failed: smtp unavailable");

        let json = serde_json::to_value(ConsumerResult::success()).unwrap();
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_header_values() {
        let message = BaseMessage::new(())
            .with_header("content-type", "application/json")
            .with_header("attempts", 3i64)
            .with_header("urgent", true);
        assert_eq!(message.headers["content-type"].as_str(), Some("application/json"));
        assert_eq!(message.headers["attempts"].as_i64(), Some(3));
        assert_eq!(message.headers["urgent"].to_string(), "true");
    }
}
