//! Audit and security events

use crate::logging::{LogEntry, LogSink};
use crate::messaging::consumer::{ConsumerMetrics, ConsumerMetricsSnapshot, MessageConsumer};
use crate::messaging::envelope::{ConsumerMessage, ConsumerResult};
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::validation::{FieldKind, FieldSpec, MessageContract};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use strum::{Display, EnumString};
use validator::Validate;

pub const AUDIT_EVENT_TYPES: &[&str] = &[
    "user-created-audit",
    "user-updated-audit",
    "user-deleted-audit",
    "security-event",
];

const SHAPE: &[FieldSpec] = &[
    FieldSpec::required("type", FieldKind::Enum(AUDIT_EVENT_TYPES)),
    FieldSpec::required("userId", FieldKind::String),
    FieldSpec::required("action", FieldKind::String),
    FieldSpec::optional("email", FieldKind::String),
    FieldSpec::optional("createdAt", FieldKind::String),
    FieldSpec::optional("ipAddress", FieldKind::String),
    FieldSpec::optional("userAgent", FieldKind::String),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AuditEventType {
    UserCreatedAudit,
    UserUpdatedAudit,
    UserDeletedAudit,
    SecurityEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AuditEventMessage {
    #[serde(rename = "type")]
    pub kind: AuditEventType,

    /// Actor of the audited action
    #[validate(length(min = 1))]
    pub user_id: String,

    #[validate(length(min = 1))]
    pub action: String,

    #[validate(email)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl MessageContract for AuditEventMessage {
    const FAMILY: &'static str = "audit";

    fn shape() -> &'static [FieldSpec] {
        SHAPE
    }
}

/// Durable home for audit records
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record(&self, event: &AuditEventMessage) -> MessagingResult<()>;
}

/// Store that writes audit records to the log
pub struct LoggingAuditStore {
    log: Arc<dyn LogSink>,
}

impl LoggingAuditStore {
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl AuditStore for LoggingAuditStore {
    async fn record(&self, event: &AuditEventMessage) -> MessagingResult<()> {
        self.log.info(
            LogEntry::new(format!(
                "Auditing {}: {} - {} - {}",
                event.kind,
                event.user_id,
                event.email.as_deref().unwrap_or("-"),
                event.action
            ))
            .context("LoggingAuditStore.record")
            .param("ipAddress", &event.ip_address)
            .param("userAgent", &event.user_agent)
            .param("createdAt", &event.created_at),
        );
        Ok(())
    }
}

/// Consumes `audit.events`
pub struct AuditEventConsumer {
    store: Arc<dyn AuditStore>,
    log: Arc<dyn LogSink>,
    metrics: ConsumerMetrics,
}

impl AuditEventConsumer {
    pub const ID: &'static str = "audit-event-consumer";
    pub const QUEUE: &'static str = "audit.events";

    pub fn new(store: Arc<dyn AuditStore>, log: Arc<dyn LogSink>) -> Self {
        Self {
            store,
            log,
            metrics: ConsumerMetrics::new(),
        }
    }
}

#[async_trait]
impl MessageConsumer for AuditEventConsumer {
    type Message = AuditEventMessage;

    fn id(&self) -> &str {
        Self::ID
    }

    fn queue_name(&self) -> &str {
        Self::QUEUE
    }

    async fn process(
        &self,
        message: &ConsumerMessage<AuditEventMessage>,
    ) -> MessagingResult<ConsumerResult> {
        let started = Instant::now();
        self.log.info(
            LogEntry::new("Processing audit event")
                .context("AuditEventConsumer.process")
                .correlation_id(message.correlation_id())
                .param("body", &message.body),
        );

        self.store.record(&message.body).await?;

        self.metrics.record_processed(started.elapsed());
        Ok(ConsumerResult::success())
    }

    async fn handle_error(
        &self,
        error: &MessagingError,
        message: &ConsumerMessage<AuditEventMessage>,
    ) -> ConsumerResult {
        super::handle_failure(
            &self.metrics,
            self.log.as_ref(),
            "AuditEventConsumer.handle_error",
            error,
            message,
        )
    }

    fn metrics(&self) -> ConsumerMetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogSink;
    use crate::messaging::validation::ValidationPipe;
    use serde_json::json;

    #[test]
    fn test_action_is_required() {
        let failure = ValidationPipe::new()
            .transform::<AuditEventMessage>(&json!({"type": "security-event", "userId": "u1"}))
            .unwrap_err();
        assert!(failure.violation("action").unwrap().constraints.contains_key("isDefined"));
    }

    #[tokio::test]
    async fn test_records_event() {
        let log = MemoryLogSink::new();
        let store = LoggingAuditStore::new(Arc::new(log.clone()));
        let event: AuditEventMessage = ValidationPipe::new()
            .transform(&json!({
                "type": "user-created-audit",
                "userId": "u1",
                "action": "create",
                "email": "ana@example.com"
            }))
            .unwrap();

        store.record(&event).await.unwrap();
        assert_eq!(
            log.find("Auditing user-created-audit: u1 - ana@example.com - create").len(),
            1
        );
    }
}
