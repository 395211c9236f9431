//! Reliable message production and consumption
//!
//! This module provides a broker-agnostic layer for publishing domain events
//! with delivery guarantees and consuming them with explicit retry and
//! dead-letter semantics.
//!
//! # Features
//!
//! - **QoS**: at-most-once, at-least-once and exactly-once (consumer-side dedup)
//! - **Batching**: sequential, parallel or transactional batches with a timeout
//! - **Delayed and expiring messages**: native on the in-memory broker, enforced by the consumer runtime elsewhere
//! - **Confirmation**: publish and wait for the broker with a deadline
//! - **Dead Letter Queues**: failed and expired messages are parked, never lost silently
//! - **Validation**: strict whitelist validation of inbound payloads
//! - **Metrics Integration**: Prometheus metrics for monitoring
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐      ┌──────────────────────────────────┐
//! │      BrokerProducer      │      │            Dispatcher            │
//! ├──────────────────────────┤      ├──────────────────────────────────┤
//! │ - send / send_batch      │      │ - ValidationPipe                 │
//! │ - send_with_confirmation │      │ - LoggingInterceptor             │
//! │ - send_with_qos          │      │ - Deduplicator                   │
//! │ - send_delayed / ttl     │      │ - requeue / dead-letter          │
//! └──────────────────────────┘      └──────────────────────────────────┘
//!              │                                     │
//!              ▼                                     ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         Transport trait                             │
//! └─────────────────────────────────────────────────────────────────────┘
//!              │                                     │
//!              ▼                                     ▼
//! ┌──────────────────────────┐      ┌──────────────────────────────────┐
//! │    InMemoryTransport     │      │          NatsTransport           │
//! ├──────────────────────────┤      ├──────────────────────────────────┤
//! │ - topic routing, DLX     │      │ - subject per binding            │
//! │ - native delay and TTL   │      │ - queue groups                   │
//! │ - atomic batches         │      │ - flush as confirm               │
//! └──────────────────────────┘      └──────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use reliable_messaging::logging::TracingLogSink;
//! use reliable_messaging::messaging::{
//!     BaseMessage, BrokerProducer, InMemoryTransport, MessageProducer, ProducerConfig,
//!     SendOptions, Transport,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = InMemoryTransport::with_default_topology()?;
//!     transport.connect().await?;
//!
//!     let producer = BrokerProducer::new(
//!         Arc::new(transport),
//!         ProducerConfig::default(),
//!         Arc::new(TracingLogSink::new()),
//!     )?;
//!
//!     let message = BaseMessage::new(serde_json::json!({
//!         "type": "user-welcome",
//!         "userId": "u-1",
//!         "email": "ana@example.com"
//!     }));
//!     let result = producer
//!         .send("email.notifications", message, SendOptions::new().exchange("notifications"))
//!         .await;
//!     assert!(result.success);
//!
//!     Ok(())
//! }
//! ```

mod config;
mod consumer;
pub mod consumers;
mod dedup;
mod dispatcher;
mod envelope;
mod error;
mod interceptor;
mod memory;
mod metrics;
mod nats;
mod producer;
mod retry;
mod topology;
mod transport;
mod validation;

pub use config::{
    duration_ms, BatchOptions, BrokerBackend, BrokerConfig, ConsumerConfig, DeadLetterConfig,
    NatsConfig, ProducerConfig, ProducerConfigBuilder, SendOptions,
};
pub use consumer::{default_disposition, ConsumerMetrics, ConsumerMetricsSnapshot, MessageConsumer};
pub use dedup::Deduplicator;
pub use dispatcher::{
    reasons, ConsumerHealth, ConsumerRegistry, DeliveryOutcome, Dispatcher, DispatcherHandle,
};
pub use envelope::{
    generate_message_id, BaseMessage, BatchSendResult, ConsumerMessage, ConsumerResult,
    DeliveryHandle, HeaderValue, Headers, MessageMetadata, MessagePriority, QoSLevel, SendResult,
};
pub use error::{MessagingError, MessagingResult};
pub use interceptor::LoggingInterceptor;
pub use memory::InMemoryTransport;
pub use metrics::{init_messaging_metrics, render_metrics, MESSAGING_METRICS};
pub use nats::{subject_filter, subject_for, NatsTransport};
pub use producer::{
    BrokerProducer, Confirmation, ListenerId, MessageProducer, ProducerEvent, ProducerEventKind,
    ProducerHealth, ProducerListener, ProducerMetricsSnapshot,
};
pub use retry::{connect_with_retry, RetryPolicy};
pub use topology::{routing_key_matches, BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec, Topology};
pub use transport::{
    ConnectionStatus, Delivery, DeliveryStream, MessageProperties, OutboundMessage,
    PublishConfirm, Transport, TransportCapabilities, HEADER_DEATH_REASON, HEADER_DELAY,
    HEADER_EXPIRATION, HEADER_IDEMPOTENCY_KEY, HEADER_ORIGINAL_EXCHANGE, HEADER_ORIGINAL_QUEUE,
    HEADER_PRODUCER_ID, HEADER_QOS, HEADER_RETRY_COUNT, HEADER_SESSION_ID, HEADER_SOURCE,
    HEADER_USER_ID, HEADER_VERSION,
};
pub use validation::{
    check_shape, FieldKind, FieldSpec, FieldViolation, MessageContract, ValidationFailure,
    ValidationPipe, VALIDATION_FAILED_MESSAGE,
};
