//! Broker topology: exchanges, queues and bindings
//!
//! The topology is declared once at startup and handed to the transport. Routing
//! follows AMQP topic semantics: routing keys are dot-separated words, `*`
//! matches exactly one word and `#` matches zero or more words.

use crate::messaging::error::{MessagingError, MessagingResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use strum::Display;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Exchange routing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExchangeKind {
    /// Pattern match on routing key
    Topic,
    /// Exact routing key match
    Direct,
    /// Every bound queue receives every message
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
        }
    }

    pub fn transient(mut self) -> Self {
        self.durable = false;
        self.auto_delete = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    /// Exchange that receives rejected or expired messages
    pub dead_letter_exchange: Option<String>,
    /// Routing key override for dead-lettered messages; original key is kept when `None`
    pub dead_letter_routing_key: Option<String>,
    /// Queue-level message TTL
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
        }
    }

    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            durable: false,
            auto_delete: true,
            ..Self::durable(name)
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_dead_letter_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub pattern: String,
}

/// Declared exchanges, queues and bindings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exchange(mut self, exchange: ExchangeSpec) -> Self {
        self.exchanges.push(exchange);
        self
    }

    pub fn with_queue(mut self, queue: QueueSpec) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_binding(
        mut self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        self.bindings.push(BindingSpec {
            queue: queue.into(),
            exchange: exchange.into(),
            pattern: pattern.into(),
        });
        self
    }

    pub fn exchange(&self, name: &str) -> Option<&ExchangeSpec> {
        self.exchanges.iter().find(|exchange| exchange.name == name)
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|queue| queue.name == name)
    }

    pub fn bindings_for_queue<'a>(&'a self, queue: &'a str) -> impl Iterator<Item = &'a BindingSpec> {
        self.bindings.iter().filter(move |binding| binding.queue == queue)
    }

    /// Queues that receive a message published to `exchange` with `routing_key`.
    ///
    /// Each queue appears once even when several of its bindings match.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        let Some(spec) = self.exchange(exchange) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        self.bindings
            .iter()
            .filter(|binding| binding.exchange == exchange)
            .filter(|binding| routing_key_matches(spec.kind, &binding.pattern, routing_key))
            .filter(|binding| seen.insert(binding.queue.as_str()))
            .map(|binding| binding.queue.clone())
            .collect()
    }

    /// Check that every reference in the topology resolves
    pub fn validate(&self) -> MessagingResult<()> {
        let mut names = HashSet::new();
        for exchange in &self.exchanges {
            if exchange.name.is_empty() {
                return Err(MessagingError::Configuration(
                    "exchange name cannot be empty".to_string(),
                ));
            }
            if !names.insert(exchange.name.as_str()) {
                return Err(MessagingError::Configuration(format!(
                    "exchange '{}' declared more than once",
                    exchange.name
                )));
            }
        }

        let mut names = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(MessagingError::Configuration(
                    "queue name cannot be empty".to_string(),
                ));
            }
            if !names.insert(queue.name.as_str()) {
                return Err(MessagingError::Configuration(format!(
                    "queue '{}' declared more than once",
                    queue.name
                )));
            }
            if let Some(ref dlx) = queue.dead_letter_exchange {
                if self.exchange(dlx).is_none() {
                    return Err(MessagingError::Configuration(format!(
                        "queue '{}' references unknown dead-letter exchange '{}'",
                        queue.name, dlx
                    )));
                }
            }
        }

        for binding in &self.bindings {
            if self.exchange(&binding.exchange).is_none() {
                return Err(MessagingError::Configuration(format!(
                    "binding for queue '{}' references unknown exchange '{}'",
                    binding.queue, binding.exchange
                )));
            }
            if self.queue(&binding.queue).is_none() {
                return Err(MessagingError::Configuration(format!(
                    "binding on exchange '{}' references unknown queue '{}'",
                    binding.exchange, binding.queue
                )));
            }
        }

        Ok(())
    }

    /// Topology used by the user service deployment
    pub fn default_topology() -> Self {
        Topology::new()
            .with_exchange(ExchangeSpec::topic("notifications"))
            .with_exchange(ExchangeSpec::topic("audit"))
            .with_exchange(ExchangeSpec::topic("integration"))
            .with_exchange(ExchangeSpec::topic("analytics"))
            .with_exchange(ExchangeSpec::direct("health").transient())
            .with_exchange(ExchangeSpec::topic("default"))
            .with_exchange(ExchangeSpec::topic("notifications.dlx"))
            .with_exchange(ExchangeSpec::topic("integration.dlx"))
            .with_exchange(ExchangeSpec::topic("analytics.dlx"))
            .with_exchange(ExchangeSpec::topic("audit.dlx"))
            .with_queue(
                QueueSpec::durable("email.notifications")
                    .with_dead_letter_exchange("notifications.dlx")
                    .with_message_ttl(DAY),
            )
            .with_queue(
                QueueSpec::durable("audit.events")
                    .with_dead_letter_exchange("audit.dlx")
                    .with_message_ttl(7 * DAY),
            )
            .with_queue(QueueSpec::durable("crm.sync").with_dead_letter_exchange("integration.dlx"))
            .with_queue(
                QueueSpec::durable("risk.analysis").with_dead_letter_exchange("analytics.dlx"),
            )
            .with_queue(QueueSpec::transient("health.test.queue"))
            .with_queue(QueueSpec::durable("default.queue"))
            .with_queue(QueueSpec::durable("email.notifications.dlq").with_message_ttl(30 * DAY))
            .with_queue(QueueSpec::durable("crm.sync.dlq").with_message_ttl(30 * DAY))
            .with_queue(QueueSpec::durable("risk.analysis.dlq").with_message_ttl(30 * DAY))
            .with_queue(QueueSpec::durable("audit.events.dlq").with_message_ttl(30 * DAY))
            .with_binding("email.notifications", "notifications", "email.notifications")
            .with_binding("email.notifications", "notifications", "email.*")
            .with_binding("audit.events", "audit", "audit.events")
            .with_binding("audit.events", "audit", "audit.*")
            .with_binding("crm.sync", "integration", "crm.sync")
            .with_binding("crm.sync", "integration", "integration.*")
            .with_binding("risk.analysis", "analytics", "analytics.risk.analysis")
            .with_binding("risk.analysis", "analytics", "analytics.*")
            .with_binding("health.test.queue", "health", "health.test")
            .with_binding("default.queue", "default", "#")
            .with_binding("email.notifications.dlq", "notifications.dlx", "#")
            .with_binding("crm.sync.dlq", "integration.dlx", "#")
            .with_binding("risk.analysis.dlq", "analytics.dlx", "#")
            .with_binding("audit.events.dlq", "audit.dlx", "#")
    }
}

/// Whether `routing_key` matches a binding `pattern` under the exchange's rules
pub fn routing_key_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = pattern.split('.').collect();
            let key: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &key)
        }
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| topic_matches(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&segment, key_rest)) => {
                (word == "*" || word == segment) && topic_matches(rest, key_rest)
            }
            None => false,
        },
    }
}
