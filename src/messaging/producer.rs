//! Message producer contract and its broker-backed implementation
//!
//! [`BrokerProducer`] turns [`BaseMessage`]s into transport publishes. It never
//! lets a transport failure escape as `Err`: every send resolves to a
//! [`SendResult`], and every batch to a [`BatchSendResult`] whose counts add up.

use crate::logging::{LogEntry, LogSink};
use crate::messaging::config::{duration_ms, BatchOptions, ProducerConfig, SendOptions};
use crate::messaging::envelope::{BaseMessage, BatchSendResult, QoSLevel, SendResult};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::metrics::MESSAGING_METRICS;
use crate::messaging::transport::{
    ConnectionStatus, MessageProperties, OutboundMessage, PublishConfirm, Transport,
    HEADER_DEATH_REASON, HEADER_DELAY, HEADER_EXPIRATION, HEADER_IDEMPOTENCY_KEY,
    HEADER_ORIGINAL_QUEUE, HEADER_PRODUCER_ID, HEADER_QOS, HEADER_SESSION_ID, HEADER_SOURCE,
    HEADER_USER_ID, HEADER_VERSION,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use strum::Display;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Handle returned by [`MessageProducer::on`]
pub type ListenerId = u64;

/// Callback registered for producer events
pub type ProducerListener = Arc<dyn Fn(&ProducerEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ProducerEventKind {
    Connected,
    Disconnected,
    Error,
    MessageSent,
    MessageFailed,
}

/// Lifecycle and delivery events emitted by a producer
#[derive(Debug, Clone)]
pub enum ProducerEvent {
    Connected,
    Disconnected,
    Error(MessagingError),
    MessageSent(SendResult),
    MessageFailed(SendResult),
}

impl ProducerEvent {
    pub fn kind(&self) -> ProducerEventKind {
        match self {
            ProducerEvent::Connected => ProducerEventKind::Connected,
            ProducerEvent::Disconnected => ProducerEventKind::Disconnected,
            ProducerEvent::Error(_) => ProducerEventKind::Error,
            ProducerEvent::MessageSent(_) => ProducerEventKind::MessageSent,
            ProducerEvent::MessageFailed(_) => ProducerEventKind::MessageFailed,
        }
    }
}

/// Point-in-time copy of producer counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProducerMetricsSnapshot {
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_batched: u64,
    #[serde(rename = "average_latency_ms", with = "duration_ms")]
    pub average_latency: Duration,
    #[serde(rename = "uptime_ms", with = "duration_ms")]
    pub uptime: Duration,
    /// Destinations this producer has delivered to, sorted
    pub queues: Vec<String>,
}

/// Producer health, recomputed on every call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProducerHealth {
    pub is_healthy: bool,
    pub connection_status: ConnectionStatus,
    /// Publishes of this producer still waiting on the broker
    pub pending_messages: u64,
    pub last_error: Option<String>,
    #[serde(rename = "uptime_ms", with = "duration_ms")]
    pub uptime: Duration,
}

/// Single-value future for [`MessageProducer::send_with_confirmation`].
///
/// Resolves to a failed result with a timeout error when the broker does not
/// confirm in time. Dropping it stops waiting but does not undo the publish.
pub struct Confirmation {
    receiver: oneshot::Receiver<SendResult>,
    message_id: String,
    correlation_id: Option<String>,
}

impl Confirmation {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl Future for Confirmation {
    type Output = SendResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(SendResult::failed(
                self.message_id.clone(),
                self.correlation_id.clone(),
                MessagingError::Closed("confirmation task ended without a result".to_string()),
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Message producer contract
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Unique producer identifier
    fn id(&self) -> &str;

    fn config(&self) -> &ProducerConfig;

    /// Publish once at the default QoS
    async fn send<T: Serialize + Send + Sync>(
        &self,
        queue: &str,
        message: BaseMessage<T>,
        options: SendOptions,
    ) -> SendResult;

    /// Publish many messages; `successful + failed == total_processed` always holds
    async fn send_batch<T: Serialize + Send + Sync>(
        &self,
        queue: &str,
        messages: Vec<BaseMessage<T>>,
        options: BatchOptions,
    ) -> BatchSendResult;

    /// Publish and wait for the broker confirm, at most `timeout`
    fn send_with_confirmation<T: Serialize + Send + Sync>(
        &self,
        queue: &str,
        message: BaseMessage<T>,
        timeout: Duration,
    ) -> Confirmation;

    /// Publish with an explicit delivery guarantee
    async fn send_with_qos<T: Serialize + Send + Sync>(
        &self,
        queue: &str,
        message: BaseMessage<T>,
        qos: QoSLevel,
    ) -> SendResult;

    /// Publish so the message becomes visible only after `delay`
    async fn send_delayed<T: Serialize + Send + Sync>(
        &self,
        queue: &str,
        message: BaseMessage<T>,
        delay: Duration,
        options: SendOptions,
    ) -> SendResult;

    /// Publish so the message expires `ttl` after send
    async fn send_with_ttl<T: Serialize + Send + Sync>(
        &self,
        queue: &str,
        message: BaseMessage<T>,
        ttl: Duration,
    ) -> SendResult;

    /// Messages waiting in a queue, 0 when the transport cannot tell
    async fn pending_messages(&self, queue: &str) -> u64;

    /// Drop waiting messages, returning how many were removed
    async fn purge_queue(&self, queue: &str) -> u64;

    fn metrics(&self) -> ProducerMetricsSnapshot;

    async fn health(&self) -> ProducerHealth;

    async fn close(&self) -> MessagingResult<()>;

    async fn reconnect(&self) -> MessagingResult<()>;

    fn on(&self, kind: ProducerEventKind, listener: ProducerListener) -> ListenerId;

    /// Remove a listener; returns whether it was registered
    fn off(&self, id: ListenerId) -> bool;
}

struct ProducerInner {
    id: String,
    config: ProducerConfig,
    transport: Arc<dyn Transport>,
    log: Arc<dyn LogSink>,
    started_at: Instant,
    total_sent: AtomicU64,
    total_failed: AtomicU64,
    total_batched: AtomicU64,
    latency_micros: AtomicU64,
    latency_samples: AtomicU64,
    queues: DashSet<String>,
    in_flight: AtomicU64,
    last_error: RwLock<Option<String>>,
    closed: AtomicBool,
    listeners: DashMap<ListenerId, (ProducerEventKind, ProducerListener)>,
    next_listener: AtomicU64,
}

/// Counts a publish as in flight until dropped
struct InFlightGuard<'a> {
    counter: &'a AtomicU64,
}

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Producer publishing through a [`Transport`]
#[derive(Clone)]
pub struct BrokerProducer {
    inner: Arc<ProducerInner>,
}

impl BrokerProducer {
    /// Create a producer over an already declared transport
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ProducerConfig,
        log: Arc<dyn LogSink>,
    ) -> MessagingResult<Self> {
        config.validate()?;

        let id = format!("producer-{}", uuid::Uuid::new_v4().simple());
        Ok(Self {
            inner: Arc::new(ProducerInner {
                id,
                config,
                transport,
                log,
                started_at: Instant::now(),
                total_sent: AtomicU64::new(0),
                total_failed: AtomicU64::new(0),
                total_batched: AtomicU64::new(0),
                latency_micros: AtomicU64::new(0),
                latency_samples: AtomicU64::new(0),
                queues: DashSet::new(),
                in_flight: AtomicU64::new(0),
                last_error: RwLock::new(None),
                closed: AtomicBool::new(false),
                listeners: DashMap::new(),
                next_listener: AtomicU64::new(0),
            }),
        })
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }

    fn emit(&self, event: ProducerEvent) {
        let kind = event.kind();
        let listeners: Vec<ProducerListener> = self
            .inner
            .listeners
            .iter()
            .filter(|entry| entry.value().0 == kind)
            .map(|entry| entry.value().1.clone())
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }

    /// Convert a message into its wire form. Assigns the message id if missing.
    fn build_outbound<T: Serialize>(
        &self,
        queue: &str,
        message: &mut BaseMessage<T>,
        options: &SendOptions,
        qos: QoSLevel,
    ) -> MessagingResult<OutboundMessage> {
        let config = &self.inner.config;
        let capabilities = self.inner.transport.capabilities();
        let message_id = message.ensure_message_id();

        let mut properties = MessageProperties::new(message_id.clone());
        properties.correlation_id = message.metadata.correlation_id.clone();
        properties.timestamp = Utc::now();
        properties.priority = message.priority.unwrap_or(config.default_priority);
        properties.persistent = options.persistent && qos != QoSLevel::AtMostOnce;
        properties.expiration_ms = message.ttl.map(|ttl| ttl.as_millis() as u64);
        properties.delay_ms = message.delay.map(|delay| delay.as_millis() as u64);

        let mut headers = message.headers.clone();
        let metadata = &message.metadata;
        for (name, value) in [
            (HEADER_USER_ID, &metadata.user_id),
            (HEADER_SOURCE, &metadata.source),
            (HEADER_SESSION_ID, &metadata.session_id),
            (HEADER_VERSION, &metadata.version),
        ] {
            if let Some(value) = value {
                headers.insert(name.to_string(), value.as_str().into());
            }
        }
        headers.insert(HEADER_PRODUCER_ID.to_string(), self.inner.id.as_str().into());

        if !capabilities.native_delay {
            if let Some(delay) = properties.delay_ms {
                headers.insert(HEADER_DELAY.to_string(), (delay as i64).into());
            }
        }
        if !capabilities.native_ttl {
            if let Some(ttl) = properties.expiration_ms {
                headers.insert(HEADER_EXPIRATION.to_string(), ttl.to_string().into());
            }
        }
        if qos == QoSLevel::ExactlyOnce {
            headers.insert(HEADER_QOS.to_string(), qos.to_string().into());
            headers.insert(HEADER_IDEMPOTENCY_KEY.to_string(), message_id.as_str().into());
        }

        Ok(OutboundMessage {
            exchange: options
                .exchange
                .clone()
                .unwrap_or_else(|| config.default_exchange.clone()),
            routing_key: options
                .routing_key
                .clone()
                .unwrap_or_else(|| queue.to_string()),
            properties,
            headers,
            payload: serde_json::to_value(&message.body)?,
            mandatory: options.mandatory,
            immediate: options.immediate,
            confirm: qos.requires_confirmation(),
        })
    }

    fn ensure_open(&self) -> MessagingResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed(format!(
                "producer {} is closed",
                self.inner.id
            )));
        }
        Ok(())
    }

    /// One publish attempt, bounded by the confirm timeout when confirming
    async fn attempt(&self, outbound: &OutboundMessage) -> MessagingResult<PublishConfirm> {
        self.ensure_open()?;
        let _guard = InFlightGuard::new(&self.inner.in_flight);
        let publish = self.inner.transport.publish(outbound.clone());
        if outbound.confirm {
            tokio::time::timeout(self.inner.config.confirm_timeout, publish)
                .await
                .map_err(|_| {
                    MessagingError::Timeout(format!(
                        "broker did not confirm message {} within {}ms",
                        outbound.properties.message_id,
                        self.inner.config.confirm_timeout.as_millis()
                    ))
                })?
        } else {
            publish.await
        }
    }

    fn record_success(
        &self,
        queue: &str,
        outbound: &OutboundMessage,
        confirm: PublishConfirm,
        latency: Duration,
    ) -> SendResult {
        let inner = &self.inner;
        inner.total_sent.fetch_add(1, Ordering::Relaxed);
        inner
            .latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner.queues.insert(queue.to_string());

        if inner.config.enable_metrics {
            MESSAGING_METRICS
                .messages_published
                .with_label_values(&[&outbound.exchange, inner.transport.name()])
                .inc();
            MESSAGING_METRICS
                .publish_latency
                .with_label_values(&[&outbound.exchange, inner.transport.name()])
                .observe(latency.as_secs_f64());
        }

        let message_id = outbound.properties.message_id.clone();
        inner.log.debug(
            LogEntry::new(format!(
                "Message sent successfully: {} to exchange '{}' with routing key '{}'",
                message_id, outbound.exchange, outbound.routing_key
            ))
            .context("BrokerProducer.send")
            .correlation_id(outbound.properties.correlation_id.clone())
            .param("messageId", &message_id)
            .param("exchange", &outbound.exchange)
            .param("routingKey", &outbound.routing_key)
            .param("queueName", queue)
            .param("routedTo", &confirm.routed_to),
        );

        let result = SendResult::sent(
            message_id,
            outbound.properties.correlation_id.clone(),
            Some(confirm.delivery_tag.to_string()),
        );
        self.emit(ProducerEvent::MessageSent(result.clone()));
        result
    }

    fn record_failure(
        &self,
        queue: &str,
        message_id: String,
        correlation_id: Option<String>,
        exchange: &str,
        error: MessagingError,
    ) -> SendResult {
        let inner = &self.inner;
        inner.total_failed.fetch_add(1, Ordering::Relaxed);
        *inner.last_error.write() = Some(error.to_string());

        if inner.config.enable_metrics {
            MESSAGING_METRICS
                .publish_failures
                .with_label_values(&[exchange, inner.transport.name(), error.kind()])
                .inc();
        }

        inner.log.error(
            LogEntry::new(format!("Failed to send message {} to {}", message_id, queue))
                .context("BrokerProducer.send")
                .correlation_id(correlation_id.clone())
                .param("messageId", &message_id)
                .param("queueName", queue)
                .param("exchange", exchange)
                .param("error", error.to_string()),
        );

        let result = SendResult::failed(message_id, correlation_id, error.clone());
        self.emit(ProducerEvent::Error(error));
        self.emit(ProducerEvent::MessageFailed(result.clone()));
        result
    }

    /// Publish once and account for the outcome
    async fn publish_once(&self, queue: &str, outbound: OutboundMessage) -> SendResult {
        let started = Instant::now();
        match self.attempt(&outbound).await {
            Ok(confirm) => self.record_success(queue, &outbound, confirm, started.elapsed()),
            Err(e) => self.record_failure(
                queue,
                outbound.properties.message_id.clone(),
                outbound.properties.correlation_id.clone(),
                &outbound.exchange,
                e,
            ),
        }
    }

    /// Publish with retries on transient failures, reusing the message id
    async fn publish_guaranteed(&self, queue: &str, outbound: OutboundMessage) -> SendResult {
        let policy = self.inner.config.publish_retry_policy();
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            match self.attempt(&outbound).await {
                Ok(confirm) => {
                    return self.record_success(queue, &outbound, confirm, started.elapsed())
                }
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        message_id = %outbound.properties.message_id,
                        queue = %queue,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    if self.inner.config.enable_metrics {
                        MESSAGING_METRICS
                            .publish_retries
                            .with_label_values(&[&outbound.exchange, self.inner.transport.name()])
                            .inc();
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.dead_letter(queue, &outbound, &e).await;
                    return self.record_failure(
                        queue,
                        outbound.properties.message_id.clone(),
                        outbound.properties.correlation_id.clone(),
                        &outbound.exchange,
                        e,
                    );
                }
            }
        }
    }

    /// Park a message the producer gave up on, when configured to
    async fn dead_letter(&self, queue: &str, outbound: &OutboundMessage, error: &MessagingError) {
        let dead_letter = &self.inner.config.dead_letter;
        let Some(ref exchange) = dead_letter.exchange else {
            return;
        };
        if !dead_letter.enabled || matches!(error, MessagingError::Closed(_)) {
            return;
        }

        let mut parked = outbound.clone();
        parked.exchange = exchange.clone();
        parked.routing_key = dead_letter
            .routing_key
            .clone()
            .unwrap_or_else(|| outbound.routing_key.clone());
        parked.mandatory = false;
        parked
            .headers
            .insert(HEADER_DEATH_REASON.to_string(), "publish-failed".into());
        parked
            .headers
            .insert(HEADER_ORIGINAL_QUEUE.to_string(), queue.into());

        if let Err(e) = self.attempt(&parked).await {
            warn!(
                message_id = %outbound.properties.message_id,
                dead_letter_exchange = %exchange,
                error = %e,
                "Failed to dead-letter unpublishable message"
            );
        }
    }

    fn fail_all<T>(
        &self,
        queue: &str,
        exchange: &str,
        messages: &mut [BaseMessage<T>],
        error: MessagingError,
    ) -> Vec<SendResult> {
        messages
            .iter_mut()
            .map(|message| {
                let message_id = message.ensure_message_id();
                self.record_failure(
                    queue,
                    message_id,
                    message.metadata.correlation_id.clone(),
                    exchange,
                    error.clone(),
                )
            })
            .collect()
    }

    async fn send_prepared<T: Serialize>(
        &self,
        queue: &str,
        mut message: BaseMessage<T>,
        options: &SendOptions,
        deadline: tokio::time::Instant,
    ) -> SendResult {
        let qos = self.inner.config.default_qos;
        let outbound = match self.build_outbound(queue, &mut message, options, qos) {
            Ok(outbound) => outbound,
            Err(e) => {
                return self.record_failure(
                    queue,
                    message.ensure_message_id(),
                    message.metadata.correlation_id.clone(),
                    options.exchange.as_deref().unwrap_or(&self.inner.config.default_exchange),
                    e,
                )
            }
        };

        let message_id = outbound.properties.message_id.clone();
        let correlation_id = outbound.properties.correlation_id.clone();
        let exchange = outbound.exchange.clone();
        match tokio::time::timeout_at(deadline, self.publish_once(queue, outbound)).await {
            Ok(result) => result,
            Err(_) => self.record_failure(
                queue,
                message_id,
                correlation_id,
                &exchange,
                MessagingError::Timeout("batch timeout elapsed before the message was sent".to_string()),
            ),
        }
    }

    async fn send_transactional<T: Serialize>(
        &self,
        queue: &str,
        mut messages: Vec<BaseMessage<T>>,
        options: &BatchOptions,
    ) -> Vec<SendResult> {
        let config = &self.inner.config;
        let send_options = options.as_send_options();
        let exchange = send_options
            .exchange
            .clone()
            .unwrap_or_else(|| config.default_exchange.clone());

        if !self.inner.transport.capabilities().transactions {
            warn!(
                queue = %queue,
                transport = %self.inner.transport.name(),
                "Transactional batch requested but transport has no atomic publish"
            );
            let error = MessagingError::Unsupported(format!(
                "transport '{}' does not support transactional batches",
                self.inner.transport.name()
            ));
            return self.fail_all(queue, &exchange, &mut messages, error);
        }

        if messages.len() > config.batch_size {
            warn!(
                queue = %queue,
                size = messages.len(),
                batch_size = config.batch_size,
                "Transactional batch exceeds batch_size"
            );
            let error = MessagingError::Unsupported(format!(
                "transactional batch of {} messages exceeds batch_size {}",
                messages.len(),
                config.batch_size
            ));
            return self.fail_all(queue, &exchange, &mut messages, error);
        }

        if let Err(e) = self.ensure_open() {
            return self.fail_all(queue, &exchange, &mut messages, e);
        }

        let built: MessagingResult<Vec<OutboundMessage>> = messages
            .iter_mut()
            .map(|message| self.build_outbound(queue, message, &send_options, config.default_qos))
            .collect();
        let outbounds = match built {
            Ok(outbounds) => outbounds,
            Err(e) => return self.fail_all(queue, &exchange, &mut messages, e),
        };

        let started = Instant::now();
        let publish = {
            let _guard = InFlightGuard::new(&self.inner.in_flight);
            tokio::time::timeout(
                config.batch_timeout,
                self.inner.transport.publish_atomic(outbounds.clone()),
            )
            .await
        };

        match publish {
            Ok(Ok(confirms)) => {
                let latency = started.elapsed();
                outbounds
                    .iter()
                    .zip(confirms)
                    .map(|(outbound, confirm)| self.record_success(queue, outbound, confirm, latency))
                    .collect()
            }
            Ok(Err(e)) => self.fail_all(queue, &exchange, &mut messages, e),
            Err(_) => self.fail_all(
                queue,
                &exchange,
                &mut messages,
                MessagingError::Timeout("transactional batch was not confirmed in time".to_string()),
            ),
        }
    }
}

#[async_trait]
impl MessageProducer for BrokerProducer {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn config(&self) -> &ProducerConfig {
        &self.inner.config
    }

    async fn send<T: Serialize + Send + Sync>(
        &self,
        queue: &str,
        mut message: BaseMessage<T>,
        options: SendOptions,
    ) -> SendResult {
        let qos = self.inner.config.default_qos;
        match self.build_outbound(queue, &mut message, &options, qos) {
            Ok(outbound) => self.publish_once(queue, outbound).await,
            Err(e) => self.record_failure(
                queue,
                message.ensure_message_id(),
                message.metadata.correlation_id.clone(),
                options.exchange.as_deref().unwrap_or(&self.inner.config.default_exchange),
                e,
            ),
        }
    }

    async fn send_batch<T: Serialize + Send + Sync>(
        &self,
        queue: &str,
        messages: Vec<BaseMessage<T>>,
        options: BatchOptions,
    ) -> BatchSendResult {
        let started = Instant::now();
        let total = messages.len();

        let results = if options.transaction {
            self.send_transactional(queue, messages, &options).await
        } else {
            let send_options = options.as_send_options();
            let deadline = tokio::time::Instant::now() + self.inner.config.batch_timeout;
            let mut results = Vec::with_capacity(total);
            let mut remaining = messages.into_iter();

            loop {
                let chunk: Vec<BaseMessage<T>> =
                    remaining.by_ref().take(self.inner.config.batch_size).collect();
                if chunk.is_empty() {
                    break;
                }

                if options.parallel {
                    let sends = chunk
                        .into_iter()
                        .map(|message| self.send_prepared(queue, message, &send_options, deadline));
                    results.extend(futures::future::join_all(sends).await);
                } else {
                    for message in chunk {
                        results.push(
                            self.send_prepared(queue, message, &send_options, deadline)
                                .await,
                        );
                    }
                }
            }
            results
        };

        self.inner
            .total_batched
            .fetch_add(total as u64, Ordering::Relaxed);

        let batch = BatchSendResult::from_results(results, started.elapsed());
        debug!(
            queue = %queue,
            total = batch.total_processed,
            successful = batch.successful.len(),
            failed = batch.failed.len(),
            "Batch send finished"
        );
        batch
    }

    fn send_with_confirmation<T: Serialize + Send + Sync>(
        &self,
        queue: &str,
        mut message: BaseMessage<T>,
        timeout: Duration,
    ) -> Confirmation {
        let (sender, receiver) = oneshot::channel();
        let message_id = message.ensure_message_id();
        let correlation_id = message.metadata.correlation_id.clone();
        let confirmation = Confirmation {
            receiver,
            message_id: message_id.clone(),
            correlation_id: correlation_id.clone(),
        };

        let options = SendOptions::default();
        let outbound = match self.build_outbound(queue, &mut message, &options, QoSLevel::AtLeastOnce) {
            Ok(outbound) => outbound,
            Err(e) => {
                let result = self.record_failure(
                    queue,
                    message_id,
                    correlation_id,
                    &self.inner.config.default_exchange,
                    e,
                );
                let _ = sender.send(result);
                return confirmation;
            }
        };

        let producer = self.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            let started = Instant::now();
            let attempt = async {
                if let Err(e) = producer.ensure_open() {
                    return Err(e);
                }
                let _guard = InFlightGuard::new(&producer.inner.in_flight);
                producer.inner.transport.publish(outbound.clone()).await
            };

            let result = match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(confirm)) => {
                    producer.record_success(&queue, &outbound, confirm, started.elapsed())
                }
                Ok(Err(e)) => producer.record_failure(
                    &queue,
                    message_id,
                    correlation_id,
                    &outbound.exchange,
                    e,
                ),
                Err(_) => producer.record_failure(
                    &queue,
                    message_id,
                    correlation_id,
                    &outbound.exchange,
                    MessagingError::Timeout(format!(
                        "no broker confirmation within {}ms",
                        timeout.as_millis()
                    )),
                ),
            };
            let _ = sender.send(result);
        });

        confirmation
    }

    async fn send_with_qos<T: Serialize + Send + Sync>(
        &self,
        queue: &str,
        mut message: BaseMessage<T>,
        qos: QoSLevel,
    ) -> SendResult {
        let options = SendOptions::default();
        let outbound = match self.build_outbound(queue, &mut message, &options, qos) {
            Ok(outbound) => outbound,
            Err(e) => {
                return self.record_failure(
                    queue,
                    message.ensure_message_id(),
                    message.metadata.correlation_id.clone(),
                    &self.inner.config.default_exchange,
                    e,
                )
            }
        };

        match qos {
            QoSLevel::AtMostOnce => self.publish_once(queue, outbound).await,
            QoSLevel::AtLeastOnce | QoSLevel::ExactlyOnce => {
                self.publish_guaranteed(queue, outbound).await
            }
        }
    }

    async fn send_delayed<T: Serialize + Send + Sync>(
        &self,
        queue: &str,
        message: BaseMessage<T>,
        delay: Duration,
        options: SendOptions,
    ) -> SendResult {
        let result = self.send(queue, message.with_delay(delay), options).await;
        if result.success {
            self.inner.log.debug(
                LogEntry::new(format!(
                    "Delayed message sent successfully: {} to {} (delay: {}ms)",
                    result.message_id,
                    queue,
                    delay.as_millis()
                ))
                .context("BrokerProducer.send_delayed"),
            );
        }
        result
    }

    async fn send_with_ttl<T: Serialize + Send + Sync>(
        &self,
        queue: &str,
        message: BaseMessage<T>,
        ttl: Duration,
    ) -> SendResult {
        self.send(queue, message.with_ttl(ttl), SendOptions::default())
            .await
    }

    async fn pending_messages(&self, queue: &str) -> u64 {
        match self.inner.transport.pending_messages(queue).await {
            Ok(Some(count)) => count,
            Ok(None) => {
                debug!(queue = %queue, transport = %self.inner.transport.name(), "Pending count unavailable");
                0
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "Failed to read pending count");
                0
            }
        }
    }

    async fn purge_queue(&self, queue: &str) -> u64 {
        match self.inner.transport.purge(queue).await {
            Ok(Some(purged)) => {
                self.inner.log.info(
                    LogEntry::new(format!("Purged {} messages from queue {}", purged, queue))
                        .context("BrokerProducer.purge_queue")
                        .param("queueName", queue)
                        .param("purged", purged),
                );
                purged
            }
            Ok(None) => {
                debug!(queue = %queue, transport = %self.inner.transport.name(), "Purge unavailable");
                0
            }
            Err(e) => {
                self.inner.log.error(
                    LogEntry::new(format!("Failed to purge queue {}", queue))
                        .context("BrokerProducer.purge_queue")
                        .param("queueName", queue)
                        .param("error", e.to_string()),
                );
                0
            }
        }
    }

    fn metrics(&self) -> ProducerMetricsSnapshot {
        let inner = &self.inner;
        let samples = inner.latency_samples.load(Ordering::Relaxed);
        let average_latency = if samples == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(inner.latency_micros.load(Ordering::Relaxed) / samples)
        };
        let mut queues: Vec<String> = inner.queues.iter().map(|queue| queue.clone()).collect();
        queues.sort();

        ProducerMetricsSnapshot {
            total_sent: inner.total_sent.load(Ordering::Relaxed),
            total_failed: inner.total_failed.load(Ordering::Relaxed),
            total_batched: inner.total_batched.load(Ordering::Relaxed),
            average_latency,
            uptime: inner.started_at.elapsed(),
            queues,
        }
    }

    async fn health(&self) -> ProducerHealth {
        let connection_status = self.inner.transport.status();
        let closed = self.inner.closed.load(Ordering::SeqCst);
        ProducerHealth {
            is_healthy: connection_status == ConnectionStatus::Connected && !closed,
            connection_status,
            pending_messages: self.inner.in_flight.load(Ordering::SeqCst),
            last_error: self.inner.last_error.read().clone(),
            uptime: self.inner.started_at.elapsed(),
        }
    }

    async fn close(&self) -> MessagingResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.inner.transport.close().await;
        match &result {
            Ok(()) => self.inner.log.info(
                LogEntry::new(format!("Producer {} closed", self.inner.id))
                    .context("BrokerProducer.close")
                    .param("producerId", &self.inner.id),
            ),
            Err(e) => self.inner.log.error(
                LogEntry::new(format!("Error closing producer {}", self.inner.id))
                    .context("BrokerProducer.close")
                    .param("producerId", &self.inner.id)
                    .param("error", e.to_string()),
            ),
        }
        self.emit(ProducerEvent::Disconnected);
        result
    }

    async fn reconnect(&self) -> MessagingResult<()> {
        if let Err(e) = self.inner.transport.connect().await {
            *self.inner.last_error.write() = Some(e.to_string());
            self.emit(ProducerEvent::Error(e.clone()));
            return Err(e);
        }

        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.log.info(
            LogEntry::new(format!("Producer {} reconnected", self.inner.id))
                .context("BrokerProducer.reconnect")
                .param("producerId", &self.inner.id),
        );
        self.emit(ProducerEvent::Connected);
        Ok(())
    }

    fn on(&self, kind: ProducerEventKind, listener: ProducerListener) -> ListenerId {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.listeners.insert(id, (kind, listener));
        debug!(producer_id = %self.inner.id, event = %kind, listener_id = id, "Event listener added");
        id
    }

    fn off(&self, id: ListenerId) -> bool {
        let removed = self.inner.listeners.remove(&id).is_some();
        debug!(producer_id = %self.inner.id, listener_id = id, removed = removed, "Event listener removed");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogSink;
    use crate::messaging::memory::InMemoryTransport;
    use crate::messaging::transport::DeliveryStream;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn setup(config: ProducerConfig) -> (BrokerProducer, InMemoryTransport, MemoryLogSink) {
        let transport = InMemoryTransport::with_default_topology().unwrap();
        transport.connect().await.unwrap();
        let log = MemoryLogSink::new();
        let producer =
            BrokerProducer::new(Arc::new(transport.clone()), config, Arc::new(log.clone())).unwrap();
        (producer, transport, log)
    }

    fn audit(id: &str) -> BaseMessage<serde_json::Value> {
        BaseMessage::new(json!({"type": "security-event", "userId": id, "action": "login"}))
    }

    #[tokio::test]
    async fn test_send_stamps_headers_and_properties() {
        let (producer, transport, _) = setup(ProducerConfig::default()).await;
        let message = audit("u1")
            .with_user_id("u1")
            .with_source("user-service")
            .with_correlation_id("corr-1");

        let result = producer
            .send("audit.events", message, SendOptions::new().exchange("audit"))
            .await;
        assert!(result.success);
        assert_eq!(result.correlation_id.as_deref(), Some("corr-1"));

        let queued = transport.peek("audit.events");
        assert_eq!(queued.len(), 1);
        let delivery = &queued[0];
        assert_eq!(delivery.properties.message_id, result.message_id);
        assert_eq!(delivery.headers[HEADER_USER_ID].as_str(), Some("u1"));
        assert_eq!(delivery.headers[HEADER_SOURCE].as_str(), Some("user-service"));
        assert_eq!(delivery.headers[HEADER_PRODUCER_ID].as_str(), Some(producer.id()));
        assert_eq!(delivery.routing_key, "audit.events");

        let metrics = producer.metrics();
        assert_eq!(metrics.total_sent, 1);
        assert_eq!(metrics.queues, vec!["audit.events".to_string()]);
    }

    #[tokio::test]
    async fn test_default_exchange_routes_to_default_queue() {
        let (producer, transport, _) = setup(ProducerConfig::default()).await;
        let result = producer.send("anything", audit("u1"), SendOptions::new()).await;
        assert!(result.success);
        assert_eq!(transport.peek("default.queue").len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_raised() {
        let (producer, transport, log) = setup(ProducerConfig::default()).await;
        transport.fail_routing_key("audit.events");

        let result = producer
            .send("audit.events", audit("u1"), SendOptions::new().exchange("audit"))
            .await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(MessagingError::PublishFailed(_))));
        assert_eq!(producer.metrics().total_failed, 1);
        assert_eq!(log.find("Failed to send message").len(), 1);
        assert!(producer.health().await.last_error.is_some());
    }

    #[tokio::test]
    async fn test_qos_retries_reuse_message_id() {
        let config = ProducerConfig::builder()
            .max_retries(2)
            .retry_delay(Duration::from_millis(1))
            .build()
            .unwrap();
        let (producer, transport, _) = setup(config).await;
        transport.fail_routing_key("audit.events");

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        producer.on(
            ProducerEventKind::MessageFailed,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let message = audit("u1").with_message_id("fixed-id");
        let result = producer
            .send_with_qos("audit.events", message, QoSLevel::AtLeastOnce)
            .await;
        assert!(!result.success);
        assert_eq!(result.message_id, "fixed-id");
        // Three attempts, one logical failure
        assert_eq!(producer.metrics().total_failed, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exactly_once_adds_idempotency_key() {
        let (producer, transport, _) = setup(ProducerConfig::default()).await;
        let result = producer
            .send_with_qos("default.queue", audit("u1"), QoSLevel::ExactlyOnce)
            .await;
        assert!(result.success);

        let delivery = &transport.peek("default.queue")[0];
        assert_eq!(delivery.headers[HEADER_QOS].as_str(), Some("exactly-once"));
        assert_eq!(
            delivery.headers[HEADER_IDEMPOTENCY_KEY].as_str(),
            Some(result.message_id.as_str())
        );
        assert!(delivery.properties.persistent);
    }

    #[tokio::test]
    async fn test_at_most_once_is_not_persistent() {
        let (producer, transport, _) = setup(ProducerConfig::default()).await;
        producer
            .send_with_qos("default.queue", audit("u1"), QoSLevel::AtMostOnce)
            .await;
        assert!(!transport.peek("default.queue")[0].properties.persistent);
    }

    #[tokio::test]
    async fn test_parallel_batch_keeps_input_order() {
        let (producer, _, _) = setup(ProducerConfig::builder().batch_size(2).build().unwrap()).await;
        let messages: Vec<_> = (0..5)
            .map(|i| audit("u").with_message_id(format!("m{}", i)))
            .collect();

        let batch = producer
            .send_batch("default.queue", messages, BatchOptions::new().parallel(true))
            .await;
        assert_eq!(batch.total_processed, 5);
        let ids: Vec<&str> = batch.successful.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(producer.metrics().total_batched, 5);
    }

    #[tokio::test]
    async fn test_transactional_batch() {
        let (producer, transport, _) = setup(ProducerConfig::default()).await;
        transport.fail_message("m1");
        let messages: Vec<_> = (0..3)
            .map(|i| audit("u").with_message_id(format!("m{}", i)))
            .collect();

        let batch = producer
            .send_batch("default.queue", messages, BatchOptions::new().transaction(true))
            .await;
        assert_eq!(batch.failed.len(), 3);
        assert_eq!(transport.pending_messages("default.queue").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_oversized_transaction_is_rejected() {
        let (producer, _, _) = setup(ProducerConfig::builder().batch_size(2).build().unwrap()).await;
        let messages: Vec<_> = (0..3).map(|_| audit("u")).collect();
        let batch = producer
            .send_batch("default.queue", messages, BatchOptions::new().transaction(true))
            .await;
        assert_eq!(batch.failed.len(), 3);
        assert!(matches!(batch.failed[0].error, Some(MessagingError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_close_fails_fast_and_reconnect_reopens() {
        let (producer, _, _) = setup(ProducerConfig::default()).await;
        producer.close().await.unwrap();

        let result = producer.send("default.queue", audit("u"), SendOptions::new()).await;
        assert!(matches!(result.error, Some(MessagingError::Closed(_))));
        assert!(!producer.health().await.is_healthy);

        producer.reconnect().await.unwrap();
        let result = producer.send("default.queue", audit("u"), SendOptions::new()).await;
        assert!(result.success);
        assert!(producer.health().await.is_healthy);
    }

    #[tokio::test]
    async fn test_listener_off() {
        let (producer, _, _) = setup(ProducerConfig::default()).await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = producer.on(
            ProducerEventKind::MessageSent,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        producer.send("default.queue", audit("u"), SendOptions::new()).await;
        assert!(producer.off(id));
        assert!(!producer.off(id));
        producer.send("default.queue", audit("u"), SendOptions::new()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delay_and_ttl_become_properties() {
        let (producer, transport, _) = setup(ProducerConfig::default()).await;
        producer
            .send_with_ttl("default.queue", audit("u"), Duration::from_secs(30))
            .await;
        producer
            .send_delayed("default.queue", audit("u"), Duration::from_millis(20), SendOptions::new())
            .await;

        let queued = transport.peek("default.queue");
        assert_eq!(queued[0].properties.expiration_ms, Some(30_000));
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[1].properties.delay_ms, Some(20));

        let mut stream = transport.subscribe("default.queue").await.unwrap();
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_some());
    }

    #[tokio::test]
    async fn test_pending_and_purge() {
        let (producer, _, _) = setup(ProducerConfig::default()).await;
        producer.send("default.queue", audit("u"), SendOptions::new()).await;
        producer.send("default.queue", audit("u"), SendOptions::new()).await;
        assert_eq!(producer.pending_messages("default.queue").await, 2);
        assert_eq!(producer.purge_queue("default.queue").await, 2);
        assert_eq!(producer.pending_messages("default.queue").await, 0);
        assert_eq!(producer.pending_messages("no.such.queue").await, 0);
    }
}
