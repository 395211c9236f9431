//! NATS transport
//!
//! Core NATS has no exchanges or queues, so the declared topology is mapped
//! onto subjects: a publish to `exchange` with `routing_key` goes to subject
//! `exchange.routing_key`, and subscribing to a queue subscribes to one
//! subject per binding inside a queue group named after the queue. Delay,
//! expiry and acknowledgement are not enforced by the server.

use crate::messaging::config::NatsConfig;
use crate::messaging::envelope::{DeliveryHandle, Headers};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::metrics::MESSAGING_METRICS;
use crate::messaging::topology::Topology;
use crate::messaging::transport::{
    ConnectionStatus, Delivery, DeliveryStream, MessageProperties, OutboundMessage,
    PublishConfirm, Transport, TransportCapabilities,
};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::SelectAll;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Subject prefix for messages addressed straight to a queue
const DIRECT_PREFIX: &str = "queue";

/// What travels in a NATS message payload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEnvelope {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    headers: Headers,
    payload: serde_json::Value,
}

/// Subject a publish to `exchange` with `routing_key` lands on
pub fn subject_for(exchange: &str, routing_key: &str) -> String {
    if exchange.is_empty() {
        format!("{}.{}", DIRECT_PREFIX, routing_key)
    } else {
        format!("{}.{}", exchange, routing_key)
    }
}

/// Translate a binding pattern into a NATS subject filter.
///
/// `*` is the same in both; `#` becomes `>` in tail position and `*` elsewhere.
pub fn subject_filter(exchange: &str, pattern: &str) -> String {
    let words: Vec<&str> = pattern.split('.').collect();
    let last = words.len() - 1;
    let translated: Vec<&str> = words
        .iter()
        .enumerate()
        .map(|(index, word)| match *word {
            "#" if index == last => ">",
            "#" => "*",
            other => other,
        })
        .collect();
    format!("{}.{}", exchange, translated.join("."))
}

/// Transport over a core NATS connection
pub struct NatsTransport {
    config: NatsConfig,
    topology: Topology,
    client: RwLock<Option<Client>>,
    status: RwLock<ConnectionStatus>,
    next_tag: Arc<AtomicU64>,
}

impl NatsTransport {
    /// Create a transport; nothing is dialed until [`Transport::connect`]
    pub fn new(config: NatsConfig, topology: Topology) -> MessagingResult<Self> {
        if config.servers.is_empty() {
            return Err(MessagingError::Configuration(
                "at least one NATS server is required".to_string(),
            ));
        }
        topology.validate()?;

        Ok(Self {
            config,
            topology,
            client: RwLock::new(None),
            status: RwLock::new(ConnectionStatus::Disconnected),
            next_tag: Arc::new(AtomicU64::new(0)),
        })
    }

    fn client(&self) -> MessagingResult<Client> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| MessagingError::Closed("NATS connection is not open".to_string()))
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
        let gauge = MESSAGING_METRICS.active_connections.with_label_values(&["nats"]);
        if status == ConnectionStatus::Connected {
            gauge.set(1.0);
        } else {
            gauge.set(0.0);
        }
    }

    /// Subjects a subscriber of `queue` must listen on
    fn subjects_for_queue(&self, queue: &str) -> Vec<String> {
        let mut subjects = vec![subject_for("", queue)];
        for binding in self.topology.bindings_for_queue(queue) {
            let subject = subject_filter(&binding.exchange, &binding.pattern);
            if !subjects.contains(&subject) {
                subjects.push(subject);
            }
        }
        subjects
    }
}

#[async_trait]
impl Transport for NatsTransport {
    fn name(&self) -> &str {
        "nats"
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::default()
    }

    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    async fn connect(&self) -> MessagingResult<()> {
        if self.client.read().is_some() {
            return Ok(());
        }

        self.set_status(ConnectionStatus::Connecting);
        let servers = self.config.servers.join(",");
        let connected = async_nats::ConnectOptions::new()
            .name(&self.config.connection_name)
            .connection_timeout(Duration::from_millis(self.config.connect_timeout_ms))
            .ping_interval(Duration::from_secs(self.config.ping_interval_secs))
            .max_reconnects(self.config.max_reconnects)
            .connect(servers.as_str())
            .await;

        match connected {
            Ok(client) => {
                *self.client.write() = Some(client);
                self.set_status(ConnectionStatus::Connected);
                info!(servers = %servers, "Connected to NATS");
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnectionStatus::Error);
                Err(MessagingError::ConnectionFailed(format!(
                    "NATS connection failed: {}",
                    e
                )))
            }
        }
    }

    async fn publish(&self, message: OutboundMessage) -> MessagingResult<PublishConfirm> {
        let client = self.client()?;

        let routed_to = if message.exchange.is_empty() {
            self.topology
                .queue(&message.routing_key)
                .map(|queue| vec![queue.name.clone()])
                .unwrap_or_default()
        } else {
            if self.topology.exchange(&message.exchange).is_none() {
                return Err(MessagingError::PublishFailed(format!(
                    "exchange '{}' is not declared",
                    message.exchange
                )));
            }
            self.topology.route(&message.exchange, &message.routing_key)
        };
        if routed_to.is_empty() && message.mandatory {
            return Err(MessagingError::Unroutable {
                exchange: message.exchange,
                routing_key: message.routing_key,
            });
        }

        let subject = subject_for(&message.exchange, &message.routing_key);
        let confirm = message.confirm;
        let envelope = WireEnvelope {
            exchange: message.exchange,
            routing_key: message.routing_key,
            properties: message.properties,
            headers: message.headers,
            payload: message.payload,
        };
        let payload = serde_json::to_vec(&envelope)?;

        client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| MessagingError::PublishFailed(format!("NATS publish failed: {}", e)))?;

        // Core NATS has no per-message confirm; a flush proves the server has the bytes
        if confirm {
            client
                .flush()
                .await
                .map_err(|e| MessagingError::PublishFailed(format!("NATS flush failed: {}", e)))?;
        }

        debug!(subject = %subject, message_id = %envelope.properties.message_id, "Published to NATS");
        Ok(PublishConfirm {
            delivery_tag: self.next_tag.fetch_add(1, Ordering::Relaxed) + 1,
            routed_to,
        })
    }

    async fn subscribe(&self, queue: &str) -> MessagingResult<Box<dyn DeliveryStream>> {
        let client = self.client()?;
        if self.topology.queue(queue).is_none() {
            return Err(MessagingError::SubscribeFailed(format!(
                "queue '{}' is not declared",
                queue
            )));
        }

        let mut subscribers = SelectAll::new();
        for subject in self.subjects_for_queue(queue) {
            let subscriber = client
                .queue_subscribe(subject.clone(), queue.to_string())
                .await
                .map_err(|e| {
                    MessagingError::SubscribeFailed(format!("NATS subscribe failed: {}", e))
                })?;
            debug!(subject = %subject, queue = %queue, "Subscribed to NATS subject");
            subscribers.push(subscriber);
        }

        Ok(Box::new(NatsDeliveryStream {
            subscribers,
            queue: queue.to_string(),
            next_tag: self.next_tag.clone(),
        }))
    }

    async fn ack(&self, _handle: &DeliveryHandle) -> MessagingResult<()> {
        // Core NATS delivers at most once; there is nothing to acknowledge
        Ok(())
    }

    async fn pending_messages(&self, _queue: &str) -> MessagingResult<Option<u64>> {
        Ok(None)
    }

    async fn purge(&self, _queue: &str) -> MessagingResult<Option<u64>> {
        Ok(None)
    }

    async fn close(&self) -> MessagingResult<()> {
        let client = self.client.write().take();
        if let Some(client) = client {
            if let Err(e) = client.flush().await {
                warn!(error = %e, "Failed to flush NATS connection before close");
            }
        }
        self.set_status(ConnectionStatus::Disconnected);
        info!("NATS connection closed");
        Ok(())
    }
}

struct NatsDeliveryStream {
    subscribers: SelectAll<async_nats::Subscriber>,
    queue: String,
    next_tag: Arc<AtomicU64>,
}

#[async_trait]
impl DeliveryStream for NatsDeliveryStream {
    async fn next(&mut self) -> Option<Delivery> {
        while let Some(message) = self.subscribers.next().await {
            let envelope: WireEnvelope = match serde_json::from_slice(&message.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Dropping undecodable NATS message");
                    continue;
                }
            };

            return Some(Delivery {
                handle: DeliveryHandle {
                    delivery_tag: self.next_tag.fetch_add(1, Ordering::Relaxed) + 1,
                    queue: self.queue.clone(),
                    redelivered: false,
                },
                exchange: envelope.exchange,
                routing_key: envelope.routing_key,
                properties: envelope.properties,
                headers: envelope.headers,
                payload: envelope.payload,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_mapping() {
        assert_eq!(subject_for("audit", "audit.events"), "audit.audit.events");
        assert_eq!(subject_for("", "crm.sync"), "queue.crm.sync");
    }

    #[test]
    fn test_filter_translation() {
        assert_eq!(subject_filter("notifications", "email.*"), "notifications.email.*");
        assert_eq!(subject_filter("default", "#"), "default.>");
        assert_eq!(subject_filter("events", "#.created"), "events.*.created");
    }

    #[test]
    fn test_queue_subjects_follow_bindings() {
        let transport =
            NatsTransport::new(NatsConfig::default(), Topology::default_topology()).unwrap();
        let subjects = transport.subjects_for_queue("email.notifications");
        assert_eq!(
            subjects,
            vec![
                "queue.email.notifications".to_string(),
                "notifications.email.notifications".to_string(),
                "notifications.email.*".to_string(),
            ]
        );
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
        assert!(!transport.capabilities().native_delay);
    }

    #[test]
    fn test_requires_a_server() {
        let config = NatsConfig {
            servers: Vec::new(),
            ..NatsConfig::default()
        };
        assert!(NatsTransport::new(config, Topology::default_topology()).is_err());
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_fails_fast() {
        let transport =
            NatsTransport::new(NatsConfig::default(), Topology::default_topology()).unwrap();
        let err = transport.subscribe("crm.sync").await.err().unwrap();
        assert!(matches!(err, MessagingError::Closed(_)));
    }
}
