//! Consumer runtime
//!
//! Consumers are registered once in a [`ConsumerRegistry`], which is checked
//! against the declared topology before anything is subscribed. The
//! [`Dispatcher`] then runs every delivery through the same steps:
//!
//! ```text
//! Received ─► expired? ─────────────────────────────► dead-letter (Expired)
//!    │
//!    ├─► delayed? ──wait──► expired? ──────────────► dead-letter (Expired)
//!    │
//!    ├─► duplicate? ────────────────────────────────► ack (Duplicate)
//!    │
//!    ├─► validate ──✗──────────────────────────────► dead-letter (Rejected)
//!    │      │
//!    │      ▼
//!    └─► process ──ok──────────────────────────────► ack (Acknowledged)
//!           │
//!           ✗──► handle_error ──retry, budget left──► requeue (Requeued)
//!                       │
//!                       └──────────────────────────► dead-letter (Rejected)
//! ```
//!
//! Every delivery runs in its own task. Deduplicated ids are claimed before
//! validation and released again whenever the delivery is requeued or
//! dead-lettered.

use crate::logging::{LogEntry, LogSink};
use crate::messaging::config::ConsumerConfig;
use crate::messaging::consumer::{ConsumerMetricsSnapshot, MessageConsumer};
use crate::messaging::dedup::Deduplicator;
use crate::messaging::envelope::{ConsumerMessage, ConsumerResult};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::interceptor::LoggingInterceptor;
use crate::messaging::metrics::{MessagingMetrics, MESSAGING_METRICS};
use crate::messaging::topology::Topology;
use crate::messaging::transport::{
    Delivery, Transport, HEADER_DEATH_REASON, HEADER_ORIGINAL_EXCHANGE, HEADER_ORIGINAL_QUEUE,
    HEADER_DELAY, HEADER_EXPIRATION, HEADER_RETRY_COUNT,
};
use crate::messaging::validation::{MessageContract, ValidationPipe};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Death reasons stamped on dead-lettered messages
pub mod reasons {
    pub const EXPIRED: &str = "expired";
    pub const VALIDATION_FAILED: &str = "validation-failed";
    pub const RETRIES_EXHAUSTED: &str = "retries-exhausted";
    pub const REJECTED: &str = "rejected";
}

/// Final state of one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Processed and acknowledged
    Acknowledged,
    /// Republished for another attempt with the given 1-based attempt number
    Requeued { attempt: u32 },
    /// Dead-lettered, or dropped when the queue has no dead-letter exchange
    Rejected { reason: String },
    /// Already processed within the dedup window
    Duplicate,
    /// TTL elapsed before a consumer saw it
    Expired,
    /// Left unacknowledged because the broker refused a follow-up publish
    Unacknowledged { error: String },
}

/// Health of one registered consumer
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerHealth {
    pub id: String,
    pub queue: String,
    pub family: String,
    pub is_healthy: bool,
    pub metrics: ConsumerMetricsSnapshot,
}

#[async_trait]
trait RegisteredConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn queue_name(&self) -> &str;
    fn family(&self) -> &'static str;
    async fn is_healthy(&self) -> bool;
    fn metrics(&self) -> ConsumerMetricsSnapshot;
    async fn handle(&self, runtime: &Runtime, delivery: Delivery) -> DeliveryOutcome;
}

struct Registration<C> {
    consumer: Arc<C>,
    class_name: &'static str,
}

/// Explicit table of the consumers a process runs
#[derive(Default, Clone)]
pub struct ConsumerRegistry {
    consumers: Vec<Arc<dyn RegisteredConsumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: MessageConsumer>(mut self, consumer: Arc<C>) -> Self {
        let type_name = std::any::type_name::<C>();
        let class_name = type_name.rsplit("::").next().unwrap_or(type_name);
        self.consumers.push(Arc::new(Registration {
            consumer,
            class_name,
        }));
        self
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Consumer ids in registration order
    pub fn ids(&self) -> Vec<String> {
        self.consumers
            .iter()
            .map(|consumer| consumer.id().to_string())
            .collect()
    }

    /// Ids must be unique, each queue declared and owned by one consumer
    pub fn validate(&self, topology: &Topology) -> MessagingResult<()> {
        let mut ids = HashSet::new();
        let mut queues = HashSet::new();

        for consumer in &self.consumers {
            if !ids.insert(consumer.id()) {
                return Err(MessagingError::Configuration(format!(
                    "consumer id '{}' is registered twice",
                    consumer.id()
                )));
            }
            if topology.queue(consumer.queue_name()).is_none() {
                return Err(MessagingError::Configuration(format!(
                    "consumer '{}' reads from undeclared queue '{}'",
                    consumer.id(),
                    consumer.queue_name()
                )));
            }
            if !queues.insert(consumer.queue_name()) {
                return Err(MessagingError::Configuration(format!(
                    "queue '{}' has more than one consumer",
                    consumer.queue_name()
                )));
            }
        }
        Ok(())
    }

    fn for_queue(&self, queue: &str) -> Option<Arc<dyn RegisteredConsumer>> {
        self.consumers
            .iter()
            .find(|consumer| consumer.queue_name() == queue)
            .cloned()
    }
}

/// Shared state every delivery task needs
struct Runtime {
    transport: Arc<dyn Transport>,
    config: ConsumerConfig,
    dedup: Deduplicator,
    pipe: ValidationPipe,
    interceptor: LoggingInterceptor,
    log: Arc<dyn LogSink>,
}

impl Runtime {
    fn metrics(&self) -> Option<&'static MessagingMetrics> {
        self.config.enable_metrics.then(|| &*MESSAGING_METRICS)
    }

    /// Drop the dedup claim so the next delivery of this id is processed
    async fn release(&self, delivery: &Delivery) {
        if self.deduplicates(delivery) {
            self.dedup.forget(&delivery.properties.message_id).await;
        }
    }

    /// Dead-letter the delivery when its TTL has run out
    async fn expire_if_due(&self, delivery: &Delivery) -> Option<DeliveryOutcome> {
        if !delivery.properties.is_expired_at(Utc::now()) {
            return None;
        }
        debug!(
            message_id = %delivery.properties.message_id,
            queue = %delivery.handle.queue,
            "Delivery expired before processing"
        );
        Some(match self.dead_letter(delivery, reasons::EXPIRED).await {
            DeliveryOutcome::Rejected { .. } => DeliveryOutcome::Expired,
            other => other,
        })
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), DeliveryOutcome> {
        self.transport.ack(&delivery.handle).await.map_err(|e| {
            error!(
                message_id = %delivery.properties.message_id,
                queue = %delivery.handle.queue,
                error = %e,
                "Failed to acknowledge delivery"
            );
            DeliveryOutcome::Unacknowledged {
                error: e.to_string(),
            }
        })
    }

    /// Republish to the same queue with a bumped retry count, then ack the original
    async fn requeue(
        &self,
        delivery: &Delivery,
        consumer_id: &str,
        attempt: u32,
        delay: Duration,
    ) -> DeliveryOutcome {
        let queue = delivery.handle.queue.as_str();
        let mut retry = delivery.republish_to("", queue);
        retry
            .headers
            .insert(HEADER_RETRY_COUNT.to_string(), attempt.into());

        // Delay is measured from the original send timestamp
        let elapsed = (Utc::now() - delivery.properties.timestamp)
            .num_milliseconds()
            .max(0) as u64;
        retry.properties.delay_ms = Some(elapsed + delay.as_millis() as u64);

        if let Err(e) = self.transport.publish(retry).await {
            error!(
                message_id = %delivery.properties.message_id,
                queue = %queue,
                error = %e,
                "Failed to requeue message, leaving it unacknowledged"
            );
            return DeliveryOutcome::Unacknowledged {
                error: e.to_string(),
            };
        }
        if let Err(outcome) = self.ack(delivery).await {
            return outcome;
        }

        if let Some(metrics) = self.metrics() {
            metrics
                .messages_retried
                .with_label_values(&[queue, consumer_id])
                .inc();
        }
        self.log.warn(
            LogEntry::new(format!(
                "Message {} requeued for attempt {}",
                delivery.properties.message_id,
                attempt + 1
            ))
            .context("Dispatcher.requeue")
            .correlation_id(delivery.properties.correlation_id.clone())
            .param("queueName", queue)
            .param("consumerId", consumer_id)
            .param("delayMs", delay.as_millis() as u64),
        );
        DeliveryOutcome::Requeued {
            attempt: attempt + 1,
        }
    }

    /// Route to the queue's dead-letter exchange, or drop when it has none
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> DeliveryOutcome {
        let queue = delivery.handle.queue.as_str();
        let spec = self.transport.topology().queue(queue);
        let dead_letter_exchange = spec.and_then(|spec| spec.dead_letter_exchange.clone());

        let Some(exchange) = dead_letter_exchange else {
            warn!(
                message_id = %delivery.properties.message_id,
                queue = %queue,
                reason = reason,
                "Queue has no dead-letter exchange, dropping message"
            );
            if let Err(outcome) = self.ack(delivery).await {
                return outcome;
            }
            if let Some(metrics) = self.metrics() {
                metrics
                    .messages_rejected
                    .with_label_values(&[queue, reason])
                    .inc();
            }
            return DeliveryOutcome::Rejected {
                reason: reason.to_string(),
            };
        };

        let routing_key = spec
            .and_then(|spec| spec.dead_letter_routing_key.clone())
            .unwrap_or_else(|| delivery.routing_key.clone());
        let mut parked = delivery.republish_to(&exchange, &routing_key);
        parked
            .headers
            .insert(HEADER_DEATH_REASON.to_string(), reason.into());
        parked
            .headers
            .insert(HEADER_ORIGINAL_QUEUE.to_string(), queue.into());
        parked.headers.insert(
            HEADER_ORIGINAL_EXCHANGE.to_string(),
            delivery.exchange.as_str().into(),
        );
        parked
            .headers
            .insert(HEADER_RETRY_COUNT.to_string(), delivery.retry_count().into());
        parked.properties.expiration_ms = None;
        parked.properties.delay_ms = None;
        parked.headers.remove(HEADER_EXPIRATION);
        parked.headers.remove(HEADER_DELAY);

        if let Err(e) = self.transport.publish(parked).await {
            error!(
                message_id = %delivery.properties.message_id,
                queue = %queue,
                dead_letter_exchange = %exchange,
                error = %e,
                "Failed to dead-letter message, leaving it unacknowledged"
            );
            return DeliveryOutcome::Unacknowledged {
                error: e.to_string(),
            };
        }
        if let Err(outcome) = self.ack(delivery).await {
            return outcome;
        }

        if let Some(metrics) = self.metrics() {
            metrics
                .messages_dead_lettered
                .with_label_values(&[queue, reason])
                .inc();
        }
        self.log.warn(
            LogEntry::new(format!(
                "Message {} sent to dead-letter exchange {}",
                delivery.properties.message_id, exchange
            ))
            .context("Dispatcher.dead_letter")
            .correlation_id(delivery.properties.correlation_id.clone())
            .param("queueName", queue)
            .param("reason", reason)
            .param("retryCount", delivery.retry_count()),
        );
        DeliveryOutcome::Rejected {
            reason: reason.to_string(),
        }
    }

    fn deduplicates(&self, delivery: &Delivery) -> bool {
        self.config.always_deduplicate || delivery.requires_deduplication()
    }
}

#[async_trait]
impl<C: MessageConsumer> RegisteredConsumer for Registration<C> {
    fn id(&self) -> &str {
        self.consumer.id()
    }

    fn queue_name(&self) -> &str {
        self.consumer.queue_name()
    }

    fn family(&self) -> &'static str {
        C::Message::FAMILY
    }

    async fn is_healthy(&self) -> bool {
        self.consumer.is_healthy().await
    }

    fn metrics(&self) -> ConsumerMetricsSnapshot {
        self.consumer.metrics()
    }

    async fn handle(&self, runtime: &Runtime, mut delivery: Delivery) -> DeliveryOutcome {
        let consumer = &self.consumer;
        delivery.apply_timing_headers();
        let queue = delivery.handle.queue.clone();
        let message_id = delivery.properties.message_id.clone();

        if let Some(outcome) = runtime.expire_if_due(&delivery).await {
            return outcome;
        }

        // Transports without native delay hand messages over early
        if !runtime.transport.capabilities().native_delay {
            let wait = (delivery.properties.visible_at() - Utc::now()).to_std();
            if let Ok(wait) = wait {
                debug!(message_id = %message_id, wait_ms = wait.as_millis() as u64, "Deferring delayed delivery");
                tokio::time::sleep(wait).await;
                if let Some(outcome) = runtime.expire_if_due(&delivery).await {
                    return outcome;
                }
            }
        }

        if runtime.deduplicates(&delivery) && !runtime.dedup.claim(&message_id).await {
            debug!(message_id = %message_id, queue = %queue, "Skipping duplicate delivery");
            if let Err(outcome) = runtime.ack(&delivery).await {
                return outcome;
            }
            if let Some(metrics) = runtime.metrics() {
                metrics.duplicates_skipped.with_label_values(&[&queue]).inc();
            }
            return DeliveryOutcome::Duplicate;
        }

        let body: C::Message = match runtime.pipe.transform(&delivery.payload) {
            Ok(body) => body,
            Err(failure) => {
                runtime.log.warn(
                    LogEntry::new(format!("Message {} failed validation", message_id))
                        .context(format!("{}.validate", self.class_name))
                        .correlation_id(delivery.properties.correlation_id.clone())
                        .param("queueName", &queue)
                        .param("family", C::Message::FAMILY)
                        .param("errors", &failure.errors),
                );
                runtime.release(&delivery).await;
                return runtime
                    .dead_letter(&delivery, reasons::VALIDATION_FAILED)
                    .await;
            }
        };

        let attempt = delivery.retry_count() + 1;
        let message = ConsumerMessage {
            body,
            headers: delivery.headers.clone(),
            metadata: delivery.metadata(),
            attempt,
            delivery: delivery.handle.clone(),
        };

        let started = Instant::now();
        let processed = runtime
            .interceptor
            .intercept(self.class_name, "process", consumer.process(&message))
            .await;
        if let Some(metrics) = runtime.metrics() {
            metrics
                .processing_duration
                .with_label_values(&[&queue, consumer.id()])
                .observe(started.elapsed().as_secs_f64());
        }

        let disposition = match processed {
            Ok(result) if result.success => {
                if let Err(outcome) = runtime.ack(&delivery).await {
                    return outcome;
                }
                if let Some(metrics) = runtime.metrics() {
                    metrics
                        .messages_consumed
                        .with_label_values(&[&queue, consumer.id()])
                        .inc();
                }
                return DeliveryOutcome::Acknowledged;
            }
            Ok(result) if result.has_disposition() => result,
            Ok(result) => {
                let error = result.error.unwrap_or_else(|| {
                    MessagingError::permanent("handler reported failure without an error")
                });
                consumer.handle_error(&error, &message).await
            }
            Err(error) => consumer.handle_error(&error, &message).await,
        };

        let error_kind = disposition
            .error
            .as_ref()
            .map(MessagingError::kind)
            .unwrap_or("handler");
        if let Some(metrics) = runtime.metrics() {
            metrics
                .consume_failures
                .with_label_values(&[&queue, consumer.id(), error_kind])
                .inc();
        }

        settle(runtime, &delivery, consumer.id(), attempt, disposition).await
    }
}

/// Apply the disposition `handle_error` chose
async fn settle(
    runtime: &Runtime,
    delivery: &Delivery,
    consumer_id: &str,
    attempt: u32,
    disposition: ConsumerResult,
) -> DeliveryOutcome {
    if disposition.success {
        if let Err(outcome) = runtime.ack(delivery).await {
            return outcome;
        }
        return DeliveryOutcome::Acknowledged;
    }

    runtime.release(delivery).await;
    if disposition.retry && !disposition.dead_letter {
        if attempt < runtime.config.max_retries {
            let delay = disposition
                .retry_delay
                .unwrap_or_else(|| runtime.config.retry_backoff.delay_for(attempt));
            return runtime.requeue(delivery, consumer_id, attempt, delay).await;
        }
        return runtime
            .dead_letter(delivery, reasons::RETRIES_EXHAUSTED)
            .await;
    }

    runtime.dead_letter(delivery, reasons::REJECTED).await
}

/// Runs registered consumers against a transport
#[derive(Clone)]
pub struct Dispatcher {
    runtime: Arc<Runtime>,
    registry: ConsumerRegistry,
}

impl Dispatcher {
    /// Validate the registry against the transport's topology and build the runtime
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: ConsumerRegistry,
        config: ConsumerConfig,
        log: Arc<dyn LogSink>,
    ) -> MessagingResult<Self> {
        config.validate()?;
        registry.validate(transport.topology())?;

        let dedup = Deduplicator::new(config.dedup_window, config.dedup_capacity);
        Ok(Self {
            runtime: Arc::new(Runtime {
                transport,
                config,
                dedup,
                pipe: ValidationPipe::new(),
                interceptor: LoggingInterceptor::new(log.clone()),
                log,
            }),
            registry,
        })
    }

    pub fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    /// Run one delivery through validation, processing and settlement
    pub async fn handle_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        match self.registry.for_queue(&delivery.handle.queue) {
            Some(consumer) => consumer.handle(&self.runtime, delivery).await,
            None => {
                warn!(
                    queue = %delivery.handle.queue,
                    message_id = %delivery.properties.message_id,
                    "No consumer registered for queue"
                );
                DeliveryOutcome::Unacknowledged {
                    error: format!("no consumer for queue '{}'", delivery.handle.queue),
                }
            }
        }
    }

    /// Subscribe every registered consumer and start pumping deliveries
    pub async fn start(&self) -> MessagingResult<DispatcherHandle> {
        let (shutdown, watcher) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.registry.len());

        for consumer in &self.registry.consumers {
            let queue = consumer.queue_name().to_string();
            let mut stream = self.runtime.transport.subscribe(&queue).await?;
            let dispatcher = self.clone();
            let mut watcher = watcher.clone();

            info!(consumer_id = %consumer.id(), queue = %queue, "Consumer started");
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = watcher.changed() => {
                            if changed.is_err() || *watcher.borrow() {
                                break;
                            }
                        }
                        next = stream.next() => {
                            let Some(delivery) = next else {
                                debug!(queue = %queue, "Delivery stream ended");
                                break;
                            };
                            let dispatcher = dispatcher.clone();
                            tokio::spawn(async move {
                                dispatcher.handle_delivery(delivery).await;
                            });
                        }
                    }
                }
            }));
        }

        Ok(DispatcherHandle { shutdown, tasks })
    }

    /// Health of every registered consumer
    pub async fn consumer_health(&self) -> Vec<ConsumerHealth> {
        let mut health = Vec::with_capacity(self.registry.len());
        for consumer in &self.registry.consumers {
            health.push(ConsumerHealth {
                id: consumer.id().to_string(),
                queue: consumer.queue_name().to_string(),
                family: consumer.family().to_string(),
                is_healthy: consumer.is_healthy().await,
                metrics: consumer.metrics(),
            });
        }
        health
    }
}

/// Stops the subscription loops started by [`Dispatcher::start`]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stop pulling deliveries. Deliveries already dispatched finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Consumer loop ended abnormally");
            }
        }
        info!("Consumers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogSink;
    use crate::messaging::consumer::{default_disposition, ConsumerMetrics};
    use crate::messaging::memory::InMemoryTransport;
    use crate::messaging::retry::RetryPolicy;
    use crate::messaging::transport::{
        ConnectionStatus, DeliveryStream, MessageProperties, OutboundMessage,
        PublishConfirm, TransportCapabilities, HEADER_IDEMPOTENCY_KEY,
    };
    use crate::messaging::validation::{FieldKind, FieldSpec};
    use crate::messaging::envelope::{DeliveryHandle, Headers};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use validator::Validate;

    const PING_SHAPE: &[FieldSpec] = &[FieldSpec::required("name", FieldKind::String)];

    #[derive(Debug, Clone, Serialize, Deserialize, Validate)]
    struct Ping {
        name: String,
    }

    impl MessageContract for Ping {
        const FAMILY: &'static str = "ping";

        fn shape() -> &'static [FieldSpec] {
            PING_SHAPE
        }
    }

    /// Fails the first `failures` calls with a transient error
    struct FlakyConsumer {
        queue: String,
        failures: u32,
        latency: Duration,
        calls: AtomicU32,
        metrics: ConsumerMetrics,
    }

    impl FlakyConsumer {
        fn new(queue: &str, failures: u32) -> Self {
            Self {
                queue: queue.to_string(),
                failures,
                latency: Duration::ZERO,
                calls: AtomicU32::new(0),
                metrics: ConsumerMetrics::new(),
            }
        }

        fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }
    }

    #[async_trait]
    impl MessageConsumer for FlakyConsumer {
        type Message = Ping;

        fn id(&self) -> &str {
            "flaky-consumer"
        }

        fn queue_name(&self) -> &str {
            &self.queue
        }

        async fn process(&self, _message: &ConsumerMessage<Ping>) -> MessagingResult<ConsumerResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if call <= self.failures {
                return Err(MessagingError::transient("downstream busy"));
            }
            self.metrics.record_processed(Duration::from_millis(1));
            Ok(ConsumerResult::success())
        }

        async fn handle_error(
            &self,
            error: &MessagingError,
            _message: &ConsumerMessage<Ping>,
        ) -> ConsumerResult {
            self.metrics.record_failed();
            let disposition = default_disposition(error);
            if disposition.retry {
                self.metrics.record_retried();
            }
            disposition
        }

        fn metrics(&self) -> ConsumerMetricsSnapshot {
            self.metrics.snapshot()
        }
    }

    fn consumer_config() -> ConsumerConfig {
        ConsumerConfig {
            max_retries: 3,
            retry_backoff: RetryPolicy::fixed(3, Duration::from_millis(1)),
            ..ConsumerConfig::default()
        }
    }

    async fn setup(consumer: Arc<FlakyConsumer>) -> (Dispatcher, InMemoryTransport) {
        setup_with(consumer, consumer_config()).await
    }

    async fn setup_with(
        consumer: Arc<FlakyConsumer>,
        config: ConsumerConfig,
    ) -> (Dispatcher, InMemoryTransport) {
        let transport = InMemoryTransport::with_default_topology().unwrap();
        transport.connect().await.unwrap();
        let registry = ConsumerRegistry::new().register(consumer);
        let dispatcher = Dispatcher::new(
            Arc::new(transport.clone()),
            registry,
            config,
            Arc::new(MemoryLogSink::new()),
        )
        .unwrap();
        (dispatcher, transport)
    }

    /// In-memory broker that leaves delay and TTL to the consumer side
    struct DeferredTransport {
        inner: InMemoryTransport,
    }

    #[async_trait]
    impl Transport for DeferredTransport {
        fn name(&self) -> &str {
            "deferred"
        }

        fn capabilities(&self) -> TransportCapabilities {
            TransportCapabilities {
                native_delay: false,
                native_ttl: false,
                ..self.inner.capabilities()
            }
        }

        fn topology(&self) -> &Topology {
            self.inner.topology()
        }

        fn status(&self) -> ConnectionStatus {
            self.inner.status()
        }

        async fn connect(&self) -> MessagingResult<()> {
            self.inner.connect().await
        }

        async fn publish(&self, message: OutboundMessage) -> MessagingResult<PublishConfirm> {
            self.inner.publish(message).await
        }

        async fn subscribe(&self, queue: &str) -> MessagingResult<Box<dyn DeliveryStream>> {
            self.inner.subscribe(queue).await
        }

        async fn ack(&self, handle: &DeliveryHandle) -> MessagingResult<()> {
            self.inner.ack(handle).await
        }

        async fn pending_messages(&self, queue: &str) -> MessagingResult<Option<u64>> {
            self.inner.pending_messages(queue).await
        }

        async fn purge(&self, queue: &str) -> MessagingResult<Option<u64>> {
            self.inner.purge(queue).await
        }

        async fn close(&self) -> MessagingResult<()> {
            self.inner.close().await
        }
    }

    fn outbound(queue: &str, id: &str, payload: serde_json::Value) -> OutboundMessage {
        OutboundMessage {
            exchange: String::new(),
            routing_key: queue.to_string(),
            properties: MessageProperties::new(id),
            headers: Headers::new(),
            payload,
            mandatory: true,
            immediate: false,
            confirm: true,
        }
    }

    async fn next(transport: &InMemoryTransport, queue: &str) -> Delivery {
        let mut stream = transport.subscribe(queue).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_is_acknowledged() {
        let consumer = Arc::new(FlakyConsumer::new("crm.sync", 0));
        let (dispatcher, transport) = setup(consumer.clone()).await;
        transport
            .publish(outbound("crm.sync", "m1", json!({"name": "a"})))
            .await
            .unwrap();

        let delivery = next(&transport, "crm.sync").await;
        assert_eq!(dispatcher.handle_delivery(delivery).await, DeliveryOutcome::Acknowledged);
        assert_eq!(transport.unacked_count("crm.sync"), 0);
        assert_eq!(consumer.metrics().total_processed, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_requeued_then_succeeds() {
        let consumer = Arc::new(FlakyConsumer::new("crm.sync", 1));
        let (dispatcher, transport) = setup(consumer.clone()).await;
        transport
            .publish(outbound("crm.sync", "m1", json!({"name": "a"})))
            .await
            .unwrap();

        let first = next(&transport, "crm.sync").await;
        assert_eq!(
            dispatcher.handle_delivery(first).await,
            DeliveryOutcome::Requeued { attempt: 2 }
        );

        let second = next(&transport, "crm.sync").await;
        assert_eq!(second.properties.message_id, "m1");
        assert_eq!(second.retry_count(), 1);
        assert_eq!(dispatcher.handle_delivery(second).await, DeliveryOutcome::Acknowledged);
        assert_eq!(consumer.metrics().total_retried, 1);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_dead_lettered_without_processing() {
        let consumer = Arc::new(FlakyConsumer::new("crm.sync", 0));
        let (dispatcher, transport) = setup(consumer.clone()).await;
        transport
            .publish(outbound("crm.sync", "m1", json!({"name": "a", "extra": 1})))
            .await
            .unwrap();

        let delivery = next(&transport, "crm.sync").await;
        assert_eq!(
            dispatcher.handle_delivery(delivery).await,
            DeliveryOutcome::Rejected {
                reason: reasons::VALIDATION_FAILED.to_string()
            }
        );
        assert_eq!(consumer.calls.load(Ordering::SeqCst), 0);

        let parked = transport.peek("crm.sync.dlq");
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].headers[HEADER_DEATH_REASON].as_str(), Some("validation-failed"));
        assert_eq!(parked[0].headers[HEADER_ORIGINAL_QUEUE].as_str(), Some("crm.sync"));
    }

    #[tokio::test]
    async fn test_exactly_once_duplicates_are_skipped() {
        let consumer = Arc::new(FlakyConsumer::new("crm.sync", 0));
        let (dispatcher, transport) = setup(consumer.clone()).await;
        for _ in 0..2 {
            let mut message = outbound("crm.sync", "same-id", json!({"name": "a"}));
            message
                .headers
                .insert(HEADER_IDEMPOTENCY_KEY.to_string(), "same-id".into());
            transport.publish(message).await.unwrap();
        }

        let first = next(&transport, "crm.sync").await;
        assert_eq!(dispatcher.handle_delivery(first).await, DeliveryOutcome::Acknowledged);
        let second = next(&transport, "crm.sync").await;
        assert_eq!(dispatcher.handle_delivery(second).await, DeliveryOutcome::Duplicate);
        assert_eq!(consumer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_reach_handler_once() {
        let consumer =
            Arc::new(FlakyConsumer::new("crm.sync", 0).with_latency(Duration::from_millis(50)));
        let (dispatcher, transport) = setup(consumer.clone()).await;
        for _ in 0..2 {
            let mut message = outbound("crm.sync", "same-id", json!({"name": "a"}));
            message
                .headers
                .insert(HEADER_IDEMPOTENCY_KEY.to_string(), "same-id".into());
            transport.publish(message).await.unwrap();
        }

        let first = next(&transport, "crm.sync").await;
        let second = next(&transport, "crm.sync").await;
        let (a, b) = tokio::join!(
            dispatcher.handle_delivery(first),
            dispatcher.handle_delivery(second)
        );

        let mut outcomes = vec![a, b];
        outcomes.sort_by_key(|outcome| outcome != &DeliveryOutcome::Acknowledged);
        assert_eq!(
            outcomes,
            vec![DeliveryOutcome::Acknowledged, DeliveryOutcome::Duplicate]
        );
        assert_eq!(consumer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.unacked_count("crm.sync"), 0);
    }

    #[tokio::test]
    async fn test_requeued_exactly_once_message_is_processed_again() {
        let consumer = Arc::new(FlakyConsumer::new("crm.sync", 1));
        let (dispatcher, transport) = setup(consumer.clone()).await;
        let mut message = outbound("crm.sync", "retry-me", json!({"name": "a"}));
        message
            .headers
            .insert(HEADER_IDEMPOTENCY_KEY.to_string(), "retry-me".into());
        transport.publish(message).await.unwrap();

        let first = next(&transport, "crm.sync").await;
        assert_eq!(
            dispatcher.handle_delivery(first).await,
            DeliveryOutcome::Requeued { attempt: 2 }
        );
        let second = next(&transport, "crm.sync").await;
        assert_eq!(dispatcher.handle_delivery(second).await, DeliveryOutcome::Acknowledged);
        assert_eq!(consumer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ttl_elapsing_during_deferred_delay_dead_letters() {
        let inner = InMemoryTransport::with_default_topology().unwrap();
        inner.connect().await.unwrap();
        let consumer = Arc::new(FlakyConsumer::new("crm.sync", 0));
        let dispatcher = Dispatcher::new(
            Arc::new(DeferredTransport {
                inner: inner.clone(),
            }),
            ConsumerRegistry::new().register(consumer.clone()),
            consumer_config(),
            Arc::new(MemoryLogSink::new()),
        )
        .unwrap();
        inner
            .publish(outbound("crm.sync", "m1", json!({"name": "a"})))
            .await
            .unwrap();

        let mut delivery = next(&inner, "crm.sync").await;
        delivery.properties.timestamp = Utc::now();
        delivery.properties.delay_ms = Some(100);
        delivery.properties.expiration_ms = Some(50);

        let started = Instant::now();
        assert_eq!(dispatcher.handle_delivery(delivery).await, DeliveryOutcome::Expired);
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(consumer.calls.load(Ordering::SeqCst), 0);

        let parked = inner.peek("crm.sync.dlq");
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].headers[HEADER_DEATH_REASON].as_str(), Some("expired"));
    }

    #[tokio::test]
    async fn test_expiration_header_is_enforced_without_property() {
        let consumer = Arc::new(FlakyConsumer::new("crm.sync", 0));
        let (dispatcher, transport) = setup(consumer.clone()).await;
        transport
            .publish(outbound("crm.sync", "m1", json!({"name": "a"})))
            .await
            .unwrap();

        let mut delivery = next(&transport, "crm.sync").await;
        delivery.properties.timestamp = Utc::now() - chrono::Duration::seconds(1);
        delivery.properties.expiration_ms = None;
        delivery
            .headers
            .insert(HEADER_EXPIRATION.to_string(), "10".to_string().into());

        assert_eq!(dispatcher.handle_delivery(delivery).await, DeliveryOutcome::Expired);
        assert_eq!(consumer.calls.load(Ordering::SeqCst), 0);
        let parked = transport.peek("crm.sync.dlq");
        assert!(!parked[0].headers.contains_key(HEADER_EXPIRATION));
    }

    #[tokio::test]
    async fn test_metrics_disabled_leaves_counters_untouched() {
        let consumer = Arc::new(FlakyConsumer::new("audit.events", 0));
        let config = ConsumerConfig {
            enable_metrics: false,
            ..consumer_config()
        };
        let (dispatcher, transport) = setup_with(consumer.clone(), config).await;
        let consumed = MESSAGING_METRICS
            .messages_consumed
            .with_label_values(&["audit.events", "flaky-consumer"]);
        let before = consumed.get();

        transport
            .publish(outbound("audit.events", "m1", json!({"name": "a"})))
            .await
            .unwrap();
        let delivery = next(&transport, "audit.events").await;
        assert_eq!(dispatcher.handle_delivery(delivery).await, DeliveryOutcome::Acknowledged);

        assert_eq!(consumer.metrics().total_processed, 1);
        assert_eq!(consumed.get(), before);
    }

    #[tokio::test]
    async fn test_expired_delivery_never_reaches_handler() {
        let consumer = Arc::new(FlakyConsumer::new("crm.sync", 0));
        let (dispatcher, transport) = setup(consumer.clone()).await;
        transport
            .publish(outbound("crm.sync", "m1", json!({"name": "a"})))
            .await
            .unwrap();

        let mut delivery = next(&transport, "crm.sync").await;
        delivery.properties.expiration_ms = Some(1);
        delivery.properties.timestamp = Utc::now() - chrono::Duration::seconds(1);

        assert_eq!(dispatcher.handle_delivery(delivery).await, DeliveryOutcome::Expired);
        assert_eq!(consumer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.peek("crm.sync.dlq").len(), 1);
    }

    #[test]
    fn test_registry_rejects_undeclared_queue_and_duplicates() {
        let topology = Topology::default_topology();

        let registry =
            ConsumerRegistry::new().register(Arc::new(FlakyConsumer::new("no.such.queue", 0)));
        assert!(registry.validate(&topology).is_err());

        let registry = ConsumerRegistry::new()
            .register(Arc::new(FlakyConsumer::new("crm.sync", 0)))
            .register(Arc::new(FlakyConsumer::new("audit.events", 0)));
        assert!(registry.validate(&topology).is_err());

        let registry =
            ConsumerRegistry::new().register(Arc::new(FlakyConsumer::new("crm.sync", 0)));
        assert!(registry.validate(&topology).is_ok());
        assert_eq!(registry.ids(), vec!["flaky-consumer".to_string()]);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let consumer = Arc::new(FlakyConsumer::new("crm.sync", 0));
        let (dispatcher, transport) = setup(consumer.clone()).await;
        let handle = dispatcher.start().await.unwrap();

        transport
            .publish(outbound("crm.sync", "m1", json!({"name": "a"})))
            .await
            .unwrap();

        let processed = tokio::time::timeout(Duration::from_secs(2), async {
            while consumer.metrics().total_processed == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(processed.is_ok());

        handle.shutdown().await;
        let health = dispatcher.consumer_health().await;
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].family, "ping");
        assert!(health[0].is_healthy);
    }
}
