//! In-process broker
//!
//! Implements exchange routing, per-queue ordering, delayed visibility,
//! per-message and per-queue expiry, dead-letter exchanges, manual
//! acknowledgement and atomic multi-message publish entirely in memory.
//! Used as the reference transport and as the substitute broker in tests.

use crate::messaging::envelope::{DeliveryHandle, Headers};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::topology::{QueueSpec, Topology};
use crate::messaging::transport::{
    ConnectionStatus, Delivery, DeliveryStream, MessageProperties, OutboundMessage,
    PublishConfirm, Transport, TransportCapabilities, HEADER_DEATH_REASON,
    HEADER_ORIGINAL_EXCHANGE, HEADER_ORIGINAL_QUEUE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Upper bound on how long an idle subscriber sleeps before re-checking its queue
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct StoredMessage {
    delivery_tag: u64,
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    headers: Headers,
    payload: serde_json::Value,
    enqueued_at: DateTime<Utc>,
    redelivered: bool,
}

impl StoredMessage {
    fn is_expired(&self, queue_ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        if self.properties.is_expired_at(now) {
            return true;
        }
        match queue_ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()) {
            Some(ttl) => now - self.enqueued_at >= ttl,
            None => false,
        }
    }

    fn into_delivery(self, queue: &str) -> Delivery {
        Delivery {
            handle: DeliveryHandle {
                delivery_tag: self.delivery_tag,
                queue: queue.to_string(),
                redelivered: self.redelivered,
            },
            exchange: self.exchange,
            routing_key: self.routing_key,
            properties: self.properties,
            headers: self.headers,
            payload: self.payload,
        }
    }
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

struct BrokerState {
    status: ConnectionStatus,
    queues: HashMap<String, QueueState>,
}

enum QueuePoll {
    Ready(Delivery),
    /// Nothing visible; carries the earliest future visibility time if any
    Idle(Option<DateTime<Utc>>),
    Closed,
}

struct Inner {
    name: String,
    topology: Topology,
    state: Mutex<BrokerState>,
    next_delivery_tag: AtomicU64,
    next_publish_seq: AtomicU64,
    failing_messages: DashSet<String>,
    failing_routing_keys: DashSet<String>,
    stall_confirms: AtomicBool,
    failing_connects: AtomicU32,
}

impl Inner {
    fn tag(&self) -> u64 {
        self.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Resolve destination queues without mutating anything
    fn plan(&self, state: &BrokerState, message: &OutboundMessage) -> MessagingResult<Vec<String>> {
        if state.status != ConnectionStatus::Connected {
            return Err(MessagingError::Closed(format!(
                "transport '{}' is not connected",
                self.name
            )));
        }

        if self.failing_messages.contains(&message.properties.message_id)
            || self.failing_routing_keys.contains(&message.routing_key)
        {
            return Err(MessagingError::PublishFailed(format!(
                "destination '{}' on exchange '{}' is unreachable",
                message.routing_key, message.exchange
            )));
        }

        let queues = if message.exchange.is_empty() {
            // Nameless exchange delivers straight to the queue named by the routing key
            if state.queues.contains_key(&message.routing_key) {
                vec![message.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            if self.topology.exchange(&message.exchange).is_none() {
                return Err(MessagingError::PublishFailed(format!(
                    "exchange '{}' is not declared",
                    message.exchange
                )));
            }
            self.topology.route(&message.exchange, &message.routing_key)
        };

        if queues.is_empty() && message.mandatory {
            return Err(MessagingError::Unroutable {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
            });
        }

        Ok(queues)
    }

    fn commit(&self, state: &mut BrokerState, message: OutboundMessage, queues: Vec<String>) -> PublishConfirm {
        let now = Utc::now();
        if queues.is_empty() {
            debug!(
                message_id = %message.properties.message_id,
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "Dropping unroutable message"
            );
        }

        for queue in &queues {
            let stored = StoredMessage {
                delivery_tag: self.tag(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                properties: message.properties.clone(),
                headers: message.headers.clone(),
                payload: message.payload.clone(),
                enqueued_at: now,
                redelivered: false,
            };
            enqueue(state, queue, stored);
        }

        PublishConfirm {
            delivery_tag: self.next_publish_seq.fetch_add(1, Ordering::Relaxed) + 1,
            routed_to: queues,
        }
    }

    /// Move expired messages out of a queue, dead-lettering where configured
    fn sweep_expired(&self, state: &mut BrokerState, queue: &str, now: DateTime<Utc>) {
        let (expired, spec) = {
            let Some(queue_state) = state.queues.get_mut(queue) else {
                return;
            };
            let ttl = queue_state.spec.message_ttl;
            let mut expired = Vec::new();
            queue_state.ready.retain(|message| {
                if message.is_expired(ttl, now) {
                    expired.push(message.clone());
                    false
                } else {
                    true
                }
            });
            (expired, queue_state.spec.clone())
        };

        for message in expired {
            self.dead_letter(state, &spec, message, "expired");
        }
    }

    fn dead_letter(&self, state: &mut BrokerState, spec: &QueueSpec, mut message: StoredMessage, reason: &str) {
        let Some(ref dlx) = spec.dead_letter_exchange else {
            warn!(
                message_id = %message.properties.message_id,
                queue = %spec.name,
                reason = reason,
                "Discarding message from queue without dead-letter exchange"
            );
            return;
        };

        let routing_key = spec
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| message.routing_key.clone());

        message
            .headers
            .insert(HEADER_DEATH_REASON.to_string(), reason.into());
        message
            .headers
            .insert(HEADER_ORIGINAL_QUEUE.to_string(), spec.name.as_str().into());
        message.headers.insert(
            HEADER_ORIGINAL_EXCHANGE.to_string(),
            message.exchange.as_str().into(),
        );
        message.properties.expiration_ms = None;
        message.exchange = dlx.clone();
        message.routing_key = routing_key.clone();
        message.enqueued_at = Utc::now();

        let targets = self.topology.route(dlx, &routing_key);
        if targets.is_empty() {
            warn!(
                message_id = %message.properties.message_id,
                dead_letter_exchange = %dlx,
                "Dead-letter exchange has no bound queue, message discarded"
            );
            return;
        }

        debug!(
            message_id = %message.properties.message_id,
            queue = %spec.name,
            dead_letter_exchange = %dlx,
            reason = reason,
            "Dead-lettered message"
        );
        for target in targets {
            let mut copy = message.clone();
            copy.delivery_tag = self.tag();
            enqueue(state, &target, copy);
        }
    }

    fn poll(&self, queue: &str) -> QueuePoll {
        let mut state = self.state.lock();
        if state.status != ConnectionStatus::Connected {
            return QueuePoll::Closed;
        }

        let now = Utc::now();
        self.sweep_expired(&mut state, queue, now);

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return QueuePoll::Closed;
        };

        // Highest priority among visible messages, FIFO within a priority
        let mut chosen: Option<usize> = None;
        let mut next_visible: Option<DateTime<Utc>> = None;
        for (index, message) in queue_state.ready.iter().enumerate() {
            let visible_at = message.properties.visible_at();
            if visible_at > now {
                next_visible = Some(next_visible.map_or(visible_at, |at| at.min(visible_at)));
                continue;
            }
            match chosen {
                Some(current)
                    if queue_state.ready[current].properties.priority
                        >= message.properties.priority => {}
                _ => chosen = Some(index),
            }
        }

        match chosen.and_then(|index| queue_state.ready.remove(index)) {
            Some(message) => {
                queue_state
                    .unacked
                    .insert(message.delivery_tag, message.clone());
                QueuePoll::Ready(message.into_delivery(queue))
            }
            None => QueuePoll::Idle(next_visible),
        }
    }
}

fn enqueue(state: &mut BrokerState, queue: &str, message: StoredMessage) {
    if let Some(queue_state) = state.queues.get_mut(queue) {
        queue_state.ready.push_back(message);
        queue_state.notify.notify_one();
    }
}

/// Broker kept entirely in process memory
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    /// Create a broker with the given topology declared. Starts disconnected.
    pub fn new(topology: Topology) -> MessagingResult<Self> {
        topology.validate()?;

        let queues = topology
            .queues
            .iter()
            .map(|spec| (spec.name.clone(), QueueState::new(spec.clone())))
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                name: "in-memory".to_string(),
                topology,
                state: Mutex::new(BrokerState {
                    status: ConnectionStatus::Disconnected,
                    queues,
                }),
                next_delivery_tag: AtomicU64::new(0),
                next_publish_seq: AtomicU64::new(0),
                failing_messages: DashSet::new(),
                failing_routing_keys: DashSet::new(),
                stall_confirms: AtomicBool::new(false),
                failing_connects: AtomicU32::new(0),
            }),
        })
    }

    /// Broker declared with [`Topology::default_topology`]
    pub fn with_default_topology() -> MessagingResult<Self> {
        Self::new(Topology::default_topology())
    }

    /// Make publishes of this message id fail as if the destination were unreachable
    pub fn fail_message(&self, message_id: impl Into<String>) {
        self.inner.failing_messages.insert(message_id.into());
    }

    /// Make every publish with this routing key fail
    pub fn fail_routing_key(&self, routing_key: impl Into<String>) {
        self.inner.failing_routing_keys.insert(routing_key.into());
    }

    /// Fail the next `attempts` connection attempts
    pub fn fail_next_connects(&self, attempts: u32) {
        self.inner.failing_connects.store(attempts, Ordering::SeqCst);
    }

    /// Accept publishes but never confirm them
    pub fn stall_confirms(&self, stall: bool) {
        self.inner.stall_confirms.store(stall, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.inner.failing_messages.clear();
        self.inner.failing_routing_keys.clear();
        self.inner.stall_confirms.store(false, Ordering::SeqCst);
        self.inner.failing_connects.store(0, Ordering::SeqCst);
    }

    /// Non-consuming view of the messages waiting in a queue
    pub fn peek(&self, queue: &str) -> Vec<Delivery> {
        let mut state = self.inner.state.lock();
        self.inner.sweep_expired(&mut state, queue, Utc::now());
        state
            .queues
            .get(queue)
            .map(|queue_state| {
                queue_state
                    .ready
                    .iter()
                    .cloned()
                    .map(|message| message.into_delivery(queue))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliveries handed out but not yet acknowledged
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|queue_state| queue_state.unacked.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            native_delay: true,
            native_ttl: true,
            transactions: true,
            queue_introspection: true,
        }
    }

    fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    async fn connect(&self) -> MessagingResult<()> {
        let mut state = self.inner.state.lock();

        let remaining = self.inner.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner
                .failing_connects
                .store(remaining - 1, Ordering::SeqCst);
            state.status = ConnectionStatus::Error;
            return Err(MessagingError::ConnectionFailed(
                "in-memory broker refused the connection".to_string(),
            ));
        }

        if state.status != ConnectionStatus::Connected {
            state.status = ConnectionStatus::Connected;
            info!(transport = %self.inner.name, queues = state.queues.len(), "Connected to broker");
        }
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> MessagingResult<PublishConfirm> {
        let wants_confirm = message.confirm;
        let confirm = {
            let mut state = self.inner.state.lock();
            let queues = self.inner.plan(&state, &message)?;
            self.inner.commit(&mut state, message, queues)
        };

        if wants_confirm && self.inner.stall_confirms.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        Ok(confirm)
    }

    async fn publish_atomic(
        &self,
        messages: Vec<OutboundMessage>,
    ) -> MessagingResult<Vec<PublishConfirm>> {
        let mut state = self.inner.state.lock();

        let mut planned = Vec::with_capacity(messages.len());
        for message in &messages {
            planned.push(self.inner.plan(&state, message)?);
        }

        Ok(messages
            .into_iter()
            .zip(planned)
            .map(|(message, queues)| self.inner.commit(&mut state, message, queues))
            .collect())
    }

    async fn subscribe(&self, queue: &str) -> MessagingResult<Box<dyn DeliveryStream>> {
        let state = self.inner.state.lock();
        if state.status != ConnectionStatus::Connected {
            return Err(MessagingError::SubscribeFailed(format!(
                "transport '{}' is not connected",
                self.inner.name
            )));
        }
        let notify = state
            .queues
            .get(queue)
            .map(|queue_state| queue_state.notify.clone())
            .ok_or_else(|| {
                MessagingError::SubscribeFailed(format!("queue '{}' is not declared", queue))
            })?;

        debug!(queue = %queue, "Subscribed to in-memory queue");
        Ok(Box::new(MemoryDeliveryStream {
            inner: self.inner.clone(),
            queue: queue.to_string(),
            notify,
        }))
    }

    async fn ack(&self, handle: &DeliveryHandle) -> MessagingResult<()> {
        let mut state = self.inner.state.lock();
        let removed = state
            .queues
            .get_mut(&handle.queue)
            .and_then(|queue_state| queue_state.unacked.remove(&handle.delivery_tag));
        if removed.is_none() {
            debug!(
                queue = %handle.queue,
                delivery_tag = handle.delivery_tag,
                "Ack for unknown delivery tag ignored"
            );
        }
        Ok(())
    }

    async fn pending_messages(&self, queue: &str) -> MessagingResult<Option<u64>> {
        let mut state = self.inner.state.lock();
        self.inner.sweep_expired(&mut state, queue, Utc::now());
        Ok(state
            .queues
            .get(queue)
            .map(|queue_state| queue_state.ready.len() as u64))
    }

    async fn purge(&self, queue: &str) -> MessagingResult<Option<u64>> {
        let mut state = self.inner.state.lock();
        Ok(state.queues.get_mut(queue).map(|queue_state| {
            let purged = queue_state.ready.len() as u64;
            queue_state.ready.clear();
            purged
        }))
    }

    async fn close(&self) -> MessagingResult<()> {
        let mut state = self.inner.state.lock();
        state.status = ConnectionStatus::Disconnected;

        // Unacknowledged deliveries go back to the head of their queue
        for queue_state in state.queues.values_mut() {
            let mut returned: Vec<StoredMessage> = queue_state.unacked.drain().map(|(_, m)| m).collect();
            returned.sort_by_key(|message| std::cmp::Reverse(message.delivery_tag));
            for mut message in returned {
                message.redelivered = true;
                queue_state.ready.push_front(message);
            }
            queue_state.notify.notify_waiters();
        }

        info!(transport = %self.inner.name, "Broker connection closed");
        Ok(())
    }
}

struct MemoryDeliveryStream {
    inner: Arc<Inner>,
    queue: String,
    notify: Arc<Notify>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let wait = match self.inner.poll(&self.queue) {
                QueuePoll::Ready(delivery) => return Some(delivery),
                QueuePoll::Closed => return None,
                QueuePoll::Idle(Some(visible_at)) => (visible_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(IDLE_POLL),
                QueuePoll::Idle(None) => IDLE_POLL,
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::topology::ExchangeSpec;
    use serde_json::json;

    fn outbound(exchange: &str, routing_key: &str, id: &str) -> OutboundMessage {
        OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: MessageProperties::new(id),
            headers: Headers::new(),
            payload: json!({"id": id}),
            mandatory: false,
            immediate: false,
            confirm: true,
        }
    }

    async fn connected() -> InMemoryTransport {
        let transport = InMemoryTransport::with_default_topology().unwrap();
        transport.connect().await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_topic_routing_and_delivery() {
        let transport = connected().await;
        let confirm = transport
            .publish(outbound("notifications", "email.welcome", "m1"))
            .await
            .unwrap();
        assert_eq!(confirm.routed_to, vec!["email.notifications".to_string()]);

        let mut stream = transport.subscribe("email.notifications").await.unwrap();
        let delivery = stream.next().await.unwrap();
        assert_eq!(delivery.properties.message_id, "m1");
        assert_eq!(transport.unacked_count("email.notifications"), 1);

        transport.ack(&delivery.handle).await.unwrap();
        assert_eq!(transport.unacked_count("email.notifications"), 0);
    }

    #[tokio::test]
    async fn test_mandatory_unroutable() {
        let transport = connected().await;
        let mut message = outbound("notifications", "sms.welcome", "m1");
        message.mandatory = true;
        let err = transport.publish(message).await.unwrap_err();
        assert!(matches!(err, MessagingError::Unroutable { .. }));

        let confirm = transport
            .publish(outbound("notifications", "sms.welcome", "m2"))
            .await
            .unwrap();
        assert!(confirm.routed_to.is_empty());
    }

    #[tokio::test]
    async fn test_expired_message_is_dead_lettered() {
        let transport = connected().await;
        let mut message = outbound("notifications", "email.notifications", "m1");
        message.properties.expiration_ms = Some(10);
        transport.publish(message).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(
            transport.pending_messages("email.notifications").await.unwrap(),
            Some(0)
        );
        let dead = transport.peek("email.notifications.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].headers[HEADER_DEATH_REASON].as_str(), Some("expired"));
        assert_eq!(
            dead[0].headers[HEADER_ORIGINAL_QUEUE].as_str(),
            Some("email.notifications")
        );
    }

    #[tokio::test]
    async fn test_delayed_visibility() {
        let transport = connected().await;
        let mut message = outbound("", "default.queue", "late");
        message.properties.delay_ms = Some(40);
        transport.publish(message).await.unwrap();
        transport
            .publish(outbound("", "default.queue", "now"))
            .await
            .unwrap();

        let mut stream = transport.subscribe("default.queue").await.unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.properties.message_id, "now");
        let second = stream.next().await.unwrap();
        assert_eq!(second.properties.message_id, "late");
    }

    #[tokio::test]
    async fn test_atomic_publish_is_all_or_nothing() {
        let transport = connected().await;
        transport.fail_message("m2");
        let batch = vec![
            outbound("", "default.queue", "m1"),
            outbound("", "default.queue", "m2"),
        ];
        assert!(transport.publish_atomic(batch).await.is_err());
        assert_eq!(transport.pending_messages("default.queue").await.unwrap(), Some(0));

        transport.clear_faults();
        let batch = vec![
            outbound("", "default.queue", "m1"),
            outbound("", "default.queue", "m2"),
        ];
        assert_eq!(transport.publish_atomic(batch).await.unwrap().len(), 2);
        assert_eq!(transport.purge("default.queue").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_close_fails_fast_and_requeues_unacked() {
        let transport = connected().await;
        transport
            .publish(outbound("", "default.queue", "m1"))
            .await
            .unwrap();
        let mut stream = transport.subscribe("default.queue").await.unwrap();
        stream.next().await.unwrap();

        transport.close().await.unwrap();
        assert!(stream.next().await.is_none());
        let err = transport
            .publish(outbound("", "default.queue", "m2"))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Closed(_)));

        transport.connect().await.unwrap();
        let redelivered = transport.peek("default.queue");
        assert_eq!(redelivered.len(), 1);
        assert!(redelivered[0].handle.redelivered);
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let topology = Topology::new()
            .with_exchange(ExchangeSpec::direct("jobs"))
            .with_queue(QueueSpec::durable("work"))
            .with_binding("work", "jobs", "work");
        let transport = InMemoryTransport::new(topology).unwrap();
        transport.connect().await.unwrap();

        transport.publish(outbound("jobs", "work", "low")).await.unwrap();
        let mut urgent = outbound("jobs", "work", "urgent");
        urgent.properties.priority = crate::messaging::envelope::MessagePriority::Critical;
        transport.publish(urgent).await.unwrap();

        let mut stream = transport.subscribe("work").await.unwrap();
        assert_eq!(stream.next().await.unwrap().properties.message_id, "urgent");
        assert_eq!(stream.next().await.unwrap().properties.message_id, "low");
    }

    #[tokio::test]
    async fn test_refused_connects() {
        let transport = InMemoryTransport::with_default_topology().unwrap();
        transport.fail_next_connects(1);
        assert!(transport.connect().await.is_err());
        assert_eq!(transport.status(), ConnectionStatus::Error);
        transport.connect().await.unwrap();
        assert_eq!(transport.status(), ConnectionStatus::Connected);
    }
}
