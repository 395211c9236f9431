//! Broker connection abstraction
//!
//! The core only needs a narrow view of the broker: publish to a destination,
//! subscribe to a queue, acknowledge deliveries and a couple of administrative
//! queries. Connection lifecycle and topology declaration live behind this
//! trait so tests can substitute the in-memory broker.

use crate::messaging::envelope::{DeliveryHandle, HeaderValue, Headers, MessageMetadata, MessagePriority};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::topology::Topology;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_SOURCE: &str = "x-source";
pub const HEADER_SESSION_ID: &str = "x-session-id";
pub const HEADER_VERSION: &str = "x-version";
pub const HEADER_PRODUCER_ID: &str = "x-producer-id";
pub const HEADER_DELAY: &str = "x-delay";
pub const HEADER_EXPIRATION: &str = "expiration";
pub const HEADER_QOS: &str = "x-qos";
pub const HEADER_IDEMPOTENCY_KEY: &str = "x-idempotency-key";
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
pub const HEADER_DEATH_REASON: &str = "x-death-reason";
pub const HEADER_ORIGINAL_QUEUE: &str = "x-original-queue";
pub const HEADER_ORIGINAL_EXCHANGE: &str = "x-original-exchange";

/// Connection state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Connecting,
    Error,
}

/// What the transport can do natively
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportCapabilities {
    /// Delayed visibility is enforced by the broker
    pub native_delay: bool,
    /// Message expiration is enforced by the broker
    pub native_ttl: bool,
    /// Multi-message atomic publish
    pub transactions: bool,
    /// Queue depth and purge are available
    pub queue_introspection: bool,
}

/// Transport-level message properties.
///
/// Identity fields live here; application routing hints travel as headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub priority: MessagePriority,
    pub persistent: bool,
    /// Milliseconds after `timestamp` at which the message expires
    pub expiration_ms: Option<u64>,
    /// Milliseconds after `timestamp` before the message becomes visible
    pub delay_ms: Option<u64>,
    pub content_type: String,
}

impl MessageProperties {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            correlation_id: None,
            timestamp: Utc::now(),
            priority: MessagePriority::Normal,
            persistent: true,
            expiration_ms: None,
            delay_ms: None,
            content_type: "application/json".to_string(),
        }
    }

    /// Whether the message has outlived its expiration at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiration_ms {
            Some(ttl) => elapsed_ms(self.timestamp, now) >= ttl,
            None => false,
        }
    }

    /// Earliest instant at which consumers may see the message
    pub fn visible_at(&self) -> DateTime<Utc> {
        match self.delay_ms {
            Some(delay) => self.timestamp + chrono::Duration::milliseconds(delay as i64),
            None => self.timestamp,
        }
    }
}

fn elapsed_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - since).num_milliseconds().max(0) as u64
}

/// A message ready to be handed to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub headers: Headers,
    pub payload: serde_json::Value,
    /// Fail if no queue is bound for the routing key
    pub mandatory: bool,
    pub immediate: bool,
    /// Wait for the broker to confirm the publish
    pub confirm: bool,
}

/// Broker acknowledgement of a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirm {
    pub delivery_tag: u64,
    /// Queues the message was routed to, when the transport knows
    pub routed_to: Vec<String>,
}

/// A message handed to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub headers: Headers,
    pub payload: serde_json::Value,
}

impl Delivery {
    /// How many times the message has been requeued
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(HEADER_RETRY_COUNT)
            .and_then(HeaderValue::as_i64)
            .map(|count| count.max(0) as u32)
            .unwrap_or(0)
    }

    fn header_string(&self, name: &str) -> Option<String> {
        self.headers.get(name).map(|value| value.to_string())
    }

    /// Rebuild the metadata the producer stamped on the message
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            message_id: Some(self.properties.message_id.clone()),
            correlation_id: self.properties.correlation_id.clone(),
            timestamp: Some(self.properties.timestamp),
            user_id: self.header_string(HEADER_USER_ID),
            session_id: self.header_string(HEADER_SESSION_ID),
            source: self.header_string(HEADER_SOURCE),
            version: self.header_string(HEADER_VERSION),
        }
    }

    /// Fill delay and expiration from the `x-delay` and `expiration` headers
    /// when the transport did not carry them as properties
    pub fn apply_timing_headers(&mut self) {
        let from_header = |name: &str| {
            self.headers
                .get(name)
                .and_then(HeaderValue::as_i64)
                .map(|ms| ms.max(0) as u64)
        };
        let delay = from_header(HEADER_DELAY);
        let expiration = from_header(HEADER_EXPIRATION);

        if self.properties.delay_ms.is_none() {
            self.properties.delay_ms = delay;
        }
        if self.properties.expiration_ms.is_none() {
            self.properties.expiration_ms = expiration;
        }
    }

    /// Whether the producer asked for exactly-once processing
    pub fn requires_deduplication(&self) -> bool {
        self.headers.contains_key(HEADER_IDEMPOTENCY_KEY)
    }

    /// Copy of this delivery as an outbound message to the given destination.
    ///
    /// Properties (including message id and original timestamp) are preserved.
    pub fn republish_to(&self, exchange: &str, routing_key: &str) -> OutboundMessage {
        OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: self.properties.clone(),
            headers: self.headers.clone(),
            payload: self.payload.clone(),
            mandatory: false,
            immediate: false,
            confirm: true,
        }
    }
}

/// Stream of deliveries for one queue subscription
#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery; `None` once the subscription has ended
    async fn next(&mut self) -> Option<Delivery>;
}

/// Narrow broker connection interface
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name used in logs and metric labels
    fn name(&self) -> &str;

    fn capabilities(&self) -> TransportCapabilities;

    /// Topology this transport was declared with
    fn topology(&self) -> &Topology;

    fn status(&self) -> ConnectionStatus;

    /// Establish (or re-establish) the connection
    async fn connect(&self) -> MessagingResult<()>;

    /// Publish a single message
    async fn publish(&self, message: OutboundMessage) -> MessagingResult<PublishConfirm>;

    /// Publish all messages or none
    async fn publish_atomic(
        &self,
        _messages: Vec<OutboundMessage>,
    ) -> MessagingResult<Vec<PublishConfirm>> {
        Err(MessagingError::Unsupported(format!(
            "transport '{}' has no atomic multi-message publish",
            self.name()
        )))
    }

    /// Start consuming from a queue
    async fn subscribe(&self, queue: &str) -> MessagingResult<Box<dyn DeliveryStream>>;

    /// Acknowledge a delivery so it is not redelivered
    async fn ack(&self, handle: &DeliveryHandle) -> MessagingResult<()>;

    /// Messages waiting in a queue; `None` when the transport cannot tell
    async fn pending_messages(&self, queue: &str) -> MessagingResult<Option<u64>>;

    /// Drop all waiting messages; returns the purged count, `None` when unsupported
    async fn purge(&self, queue: &str) -> MessagingResult<Option<u64>>;

    /// Release the connection. Later publishes must fail fast.
    async fn close(&self) -> MessagingResult<()>;
}
